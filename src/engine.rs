//! Reachability probe for the local container engine.
//!
//! Labels with a `docker://` scheme run their jobs in containers, so the
//! engine must answer before the runner starts polling for work.

use std::time::Duration;

use crate::error::EngineError;

/// Check that the engine at `host` accepts connections.
///
/// `host` uses the `DOCKER_HOST` syntax: `unix:///path/to/socket` or
/// `tcp://host:port`.
pub async fn probe(host: &str, timeout: Duration) -> Result<(), EngineError> {
    let target = if let Some(path) = host.strip_prefix("unix://") {
        Target::Unix(path)
    } else if let Some(addr) = host.strip_prefix("tcp://") {
        Target::Tcp(addr)
    } else {
        return Err(EngineError::UnsupportedHost(host.to_string()));
    };

    let attempt = async {
        match target {
            Target::Unix(path) => connect_unix(path).await,
            Target::Tcp(addr) => tokio::net::TcpStream::connect(addr).await.map(drop),
        }
    };

    let reason = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => {
            tracing::debug!(host, "Container engine reachable");
            return Ok(());
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no answer within {timeout:?}"),
    };
    Err(EngineError::Unreachable {
        endpoint: host.to_string(),
        reason,
    })
}

enum Target<'a> {
    Unix(&'a str),
    Tcp(&'a str),
}

#[cfg(unix)]
async fn connect_unix(path: &str) -> std::io::Result<()> {
    tokio::net::UnixStream::connect(path).await.map(drop)
}

#[cfg(not(unix))]
async fn connect_unix(_path: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unix sockets are not available on this platform",
    ))
}
