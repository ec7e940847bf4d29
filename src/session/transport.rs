//! Transport seam between the session and the concrete connection.

use async_trait::async_trait;

use crate::error::TransportError;

/// Close status carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// Normal closure status code.
pub const CLOSE_NORMAL: u16 = 1000;

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close(Option<CloseInfo>),
}

/// A connected duplex message channel.
///
/// `recv` must be cancellation safe: dropping its future before it
/// resolves loses no frame.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Next frame, or `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Start the closing handshake.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports to a fixed endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;

    fn endpoint(&self) -> &str;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport for driving the session and daemon in tests.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;

    /// Test-side handle to one mock connection.
    pub struct Peer {
        pub inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
        pub outbound: mpsc::UnboundedReceiver<Frame>,
    }

    impl Peer {
        pub fn send_text(&self, text: impl Into<String>) {
            let _ = self.inbound.send(Ok(Frame::Text(text.into())));
        }

        pub fn send(&self, frame: Frame) {
            let _ = self.inbound.send(Ok(frame));
        }

        pub fn fail(&self, err: TransportError) {
            let _ = self.inbound.send(Err(err));
        }

        /// Next text frame written by the runner, skipping pings.
        pub async fn next_text(&mut self) -> Option<String> {
            loop {
                match self.outbound.recv().await? {
                    Frame::Text(text) => return Some(text),
                    Frame::Ping => continue,
                    other => panic!("unexpected outbound frame {other:?}"),
                }
            }
        }
    }

    pub struct MockTransport {
        inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
        outbound: mpsc::UnboundedSender<Frame>,
        closed: bool,
    }

    /// Create a connected transport and its test-side peer.
    pub fn pair() -> (MockTransport, Peer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = MockTransport {
            inbound: in_rx,
            outbound: out_tx,
            closed: false,
        };
        let peer = Peer {
            inbound: in_tx,
            outbound: out_rx,
        };
        (transport, peer)
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            self.outbound
                .send(Frame::Text(text))
                .map_err(|_| TransportError::Send("peer gone".to_string()))
        }

        async fn send_ping(&mut self) -> Result<(), TransportError> {
            self.outbound
                .send(Frame::Ping)
                .map_err(|_| TransportError::Send("peer gone".to_string()))
        }

        async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
            self.inbound.recv().await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed = true;
            self.outbound
                .send(Frame::Close(Some(CloseInfo {
                    code: CLOSE_NORMAL,
                    reason: String::new(),
                })))
                .map_err(|_| TransportError::Send("peer gone".to_string()))
        }
    }

    /// Connector that hands out scripted transports in order and refuses
    /// once the script runs out.
    #[derive(Clone, Default)]
    pub struct MockConnector {
        queue: Arc<Mutex<VecDeque<MockTransport>>>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue one successful connection, returning its peer.
        pub fn accept_next(&self) -> Peer {
            let (transport, peer) = pair();
            self.queue.lock().unwrap().push_back(transport);
            peer
        }

        /// Instants at which `connect` was called.
        pub fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
            self.attempts.lock().unwrap().push(Instant::now());
            match self.queue.lock().unwrap().pop_front() {
                Some(transport) => Ok(Box::new(transport)),
                None => Err(TransportError::Connect {
                    endpoint: self.endpoint().to_string(),
                    reason: "connection refused".to_string(),
                }),
            }
        }

        fn endpoint(&self) -> &str {
            "mock://server"
        }
    }
}
