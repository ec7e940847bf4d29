//! WebSocket binding of the transport seam.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{Connector as TlsConnector, MaybeTlsStream, WebSocketStream};

use crate::config::SessionPolicy;
use crate::error::TransportError;
use crate::session::transport::{CloseInfo, Connector, Frame, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the coordination server over `ws://` or `wss://`.
pub struct WsConnector {
    url: String,
    token: Option<SecretString>,
    timeout: Duration,
    /// Accept any server certificate on `wss://`.
    insecure: bool,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout: Duration::from_secs(10),
            insecure: false,
        }
    }

    pub fn from_policy(policy: &SessionPolicy) -> Self {
        if policy.insecure {
            tracing::warn!("Server certificate verification is disabled");
        }
        Self {
            url: policy.server_url.clone(),
            token: policy.token.clone(),
            timeout: policy.connect_timeout,
            insecure: policy.insecure,
        }
    }

    fn tls_connector(&self) -> Result<Option<TlsConnector>, TransportError> {
        if !self.insecure {
            return Ok(None);
        }
        let config = insecure_tls_config().map_err(|e| self.connect_error(e))?;
        Ok(Some(TlsConnector::Rustls(config)))
    }

    fn connect_error(&self, reason: impl ToString) -> TransportError {
        TransportError::Connect {
            endpoint: self.url.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| self.connect_error(e))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| self.connect_error(e))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let tls = self.tls_connector()?;
        let handshake =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, tls);
        let (stream, response) = tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                endpoint: self.url.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| self.connect_error(e))?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");

        Ok(Box::new(WsTransport { stream }))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// An open WebSocket connection.
pub struct WsTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(classify)
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Ping(Default::default()))
            .await
            .map_err(classify)
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(classify(e))),
            };
            let frame = match msg {
                WsMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
                WsMessage::Binary(bytes) => Frame::Binary(bytes.to_vec()),
                WsMessage::Ping(_) => Frame::Ping,
                WsMessage::Pong(_) => Frame::Pong,
                WsMessage::Close(close) => Frame::Close(close.map(|c| CloseInfo {
                    code: u16::from(c.code),
                    reason: c.reason.as_str().to_owned(),
                })),
                // Raw frames never surface when reading.
                WsMessage::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "runner shutting down".into(),
        };
        self.stream.close(Some(frame)).await.map_err(classify)
    }
}

/// Client TLS settings that skip certificate and hostname checks.
/// Handshake signatures are still verified.
fn insecure_tls_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Map a tungstenite error onto the transport taxonomy.
fn classify(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => TransportError::Reset,
        tungstenite::Error::Io(e) => match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportError::Reset,
            _ => TransportError::Io(e.to_string()),
        },
        other => TransportError::Io(other.to_string()),
    }
}
