//! Connection session to the coordination server.
//!
//! The session owns the only transport. Reads go through a sliding
//! deadline and a consecutive-failure counter; writes go through
//! `write_message`, which is the single writer for the connection.

pub mod transport;
pub mod websocket;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SessionPolicy;
use crate::error::{Error, TransportError};
use crate::protocol::Message;

pub use transport::{CLOSE_NORMAL, CloseInfo, Connector, Frame, Transport};
pub use websocket::WsConnector;

/// Upper bound on the closing handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why `read_next` did not return a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    /// The peer closed normally. Not counted.
    GracefulClose,
    /// The connection ended without a normal close.
    AbnormalClose(Option<u16>),
    /// No frame arrived within the read window. The session stays up.
    Timeout,
    Io(String),
    NotConnected,
    /// The failure threshold was exceeded and the session torn down.
    Stalled { failures: u32 },
}

impl ReadFailure {
    fn is_counted(&self) -> bool {
        !matches!(self, Self::GracefulClose | Self::NotConnected)
    }

    fn ends_connection(&self) -> bool {
        matches!(self, Self::GracefulClose | Self::AbnormalClose(_))
    }
}

impl fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GracefulClose => write!(f, "connection closed by server"),
            Self::AbnormalClose(Some(code)) => write!(f, "connection closed abnormally (code {code})"),
            Self::AbnormalClose(None) => write!(f, "connection dropped"),
            Self::Timeout => write!(f, "read timed out"),
            Self::Io(e) => write!(f, "read failed: {e}"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Stalled { failures } => {
                write!(f, "session stalled after {failures} consecutive read failures")
            }
        }
    }
}

/// The runner's connection to the server.
pub struct Session {
    connector: Arc<dyn Connector>,
    policy: SessionPolicy,
    transport: Option<Box<dyn Transport>>,
    session_id: Option<Uuid>,
    consecutive_failures: u32,
    /// Kept across calls so that a read abandoned mid-wait resumes the
    /// same window instead of starting a fresh one.
    read_deadline: Option<Instant>,
}

impl Session {
    pub fn new(connector: Arc<dyn Connector>, policy: SessionPolicy) -> Self {
        Self {
            connector,
            policy,
            transport: None,
            session_id: None,
            consecutive_failures: 0,
            read_deadline: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    /// Open a new connection. A no-op when already connected.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let transport = self.connector.connect().await?;
        let session_id = Uuid::new_v4();
        tracing::info!(
            endpoint = %self.connector.endpoint(),
            session_id = %session_id,
            "Connected to server"
        );
        self.transport = Some(transport);
        self.session_id = Some(session_id);
        self.consecutive_failures = 0;
        self.read_deadline = None;
        Ok(())
    }

    /// Wait for the next message payload.
    ///
    /// Control frames are consumed here and push the read deadline forward.
    pub async fn read_next(&mut self) -> Result<Vec<u8>, ReadFailure> {
        let result = self.recv_payload().await;
        let failure = match result {
            Ok(payload) => {
                self.consecutive_failures = 0;
                self.read_deadline = None;
                return Ok(payload);
            }
            Err(failure) => failure,
        };

        if failure.ends_connection() {
            tracing::info!(session_id = ?self.session_id, reason = %failure, "Session ended");
            self.teardown();
        }
        if failure.is_counted() {
            self.consecutive_failures += 1;
            tracing::debug!(
                failures = self.consecutive_failures,
                reason = %failure,
                "Read failure"
            );
            if self.consecutive_failures > self.policy.max_read_failures {
                let failures = self.consecutive_failures;
                tracing::warn!(failures, "Read failure threshold exceeded, resetting session");
                self.teardown();
                self.consecutive_failures = 0;
                return Err(ReadFailure::Stalled { failures });
            }
        }
        Err(failure)
    }

    async fn recv_payload(&mut self) -> Result<Vec<u8>, ReadFailure> {
        let window = self.policy.read_timeout;
        let Some(transport) = self.transport.as_mut() else {
            return Err(ReadFailure::NotConnected);
        };
        let mut deadline = *self
            .read_deadline
            .get_or_insert_with(|| Instant::now() + window);

        loop {
            let next = match tokio::time::timeout_at(deadline, transport.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    self.read_deadline = None;
                    return Err(ReadFailure::Timeout);
                }
            };
            let frame = match next {
                None => return Err(ReadFailure::AbnormalClose(None)),
                Some(Ok(frame)) => frame,
                Some(Err(TransportError::Closed)) => return Err(ReadFailure::GracefulClose),
                Some(Err(TransportError::Reset)) => return Err(ReadFailure::AbnormalClose(None)),
                Some(Err(e)) => return Err(ReadFailure::Io(e.to_string())),
            };
            match frame {
                Frame::Text(text) => return Ok(text.into_bytes()),
                Frame::Binary(bytes) => return Ok(bytes),
                Frame::Ping | Frame::Pong => {
                    deadline = Instant::now() + window;
                    self.read_deadline = Some(deadline);
                    tracing::trace!("Keepalive received");
                }
                Frame::Close(None) => return Err(ReadFailure::GracefulClose),
                Frame::Close(Some(info)) if info.code == CLOSE_NORMAL => {
                    return Err(ReadFailure::GracefulClose);
                }
                Frame::Close(Some(info)) => {
                    return Err(ReadFailure::AbnormalClose(Some(info.code)));
                }
            }
        }
    }

    /// Encode and send one message.
    ///
    /// A send failure tears the connection down.
    pub async fn write_message(&mut self, msg: &Message) -> Result<(), Error> {
        let text = msg.encode()?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(TransportError::NotConnected.into());
        };
        if let Err(e) = transport.send_text(text).await {
            tracing::warn!(error = %e, kind = %msg.kind, "Write failed, dropping connection");
            self.teardown();
            return Err(e.into());
        }
        tracing::debug!(kind = %msg.kind, build_uuid = %msg.build_uuid, "Sent message");
        Ok(())
    }

    /// Send a keepalive ping.
    pub async fn heartbeat(&mut self) -> Result<(), TransportError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        if let Err(e) = transport.send_ping().await {
            self.teardown();
            return Err(e);
        }
        Ok(())
    }

    /// Close handshake, best effort. Always ends disconnected.
    pub async fn close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await {
            Ok(Ok(())) => tracing::info!(session_id = ?self.session_id, "Session closed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Close handshake failed"),
            Err(_) => tracing::warn!("Close handshake timed out"),
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.transport = None;
        self.session_id = None;
        self.read_deadline = None;
    }
}
