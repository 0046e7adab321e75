//! One persistent, bidirectional message channel to the server.
//!
//! Sends may come from any task of the cohort; receives are single-consumer
//! (the router). State moves strictly forward: `Open → Closing → Closed`.

use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::envelope::{Inbound, Outbound};
use super::SessionError;

/// Bound on the close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// Default bound on one outbound message, queueing on the sink included.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub type MessageSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Outcome of one bounded receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Envelope(Inbound),
    Timeout,
    Closed,
}

pub struct ConnectionHandle {
    sink: Mutex<MessageSink>,
    stream: Mutex<MessageStream>,
    state: AtomicU8,
    closed: CancellationToken,
    send_timeout: Duration,
}

impl ConnectionHandle {
    /// Wraps an already established transport.
    pub fn from_parts(sink: MessageSink, stream: MessageStream) -> Self {
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            state: AtomicU8::new(ConnectionState::Open as u8),
            closed: CancellationToken::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// A peer that stops draining the socket closes the connection after `timeout`.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn from_websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (write, read) = ws.split();
        Self::from_parts(Box::pin(write), Box::pin(read))
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Resolves once the connection has reached `Closed`.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Moves the state forward; never backwards.
    fn advance(&self, to: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.fetch_max(to as u8, Ordering::AcqRel));
        if to == ConnectionState::Closed && previous != ConnectionState::Closed {
            log::debug!("Connection closed");
            self.closed.cancel();
        }
    }

    /// Serializes and sends one envelope. Safe for concurrent callers.
    ///
    /// Waiting for the sink and writing to it share one `send_timeout`; on
    /// expiry the connection is marked `Closed`.
    pub async fn send(&self, envelope: &Outbound) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::ConnectionClosed(format!(
                "cannot send {} on a {:?} connection",
                envelope.kind(),
                self.state()
            )));
        }

        let json = serde_json::to_string(envelope)
            .map_err(|e| SessionError::ProtocolViolation(format!("unserializable {}: {}", envelope.kind(), e)))?;

        let sent = tokio::time::timeout(self.send_timeout, async {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Text(json.into())).await
        })
        .await;

        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.advance(ConnectionState::Closed);
                Err(SessionError::ConnectionClosed(e.to_string()))
            }
            Err(_) => {
                log::warn!("Sending {} stalled for {:?}, dropping connection", envelope.kind(), self.send_timeout);
                self.advance(ConnectionState::Closed);
                Err(SessionError::ConnectionClosed(format!(
                    "send of {} timed out after {:?}",
                    envelope.kind(),
                    self.send_timeout
                )))
            }
        }
    }

    /// Waits up to `timeout` for the next envelope.
    ///
    /// Transport-level ping/pong frames are consumed silently. Text that is not
    /// a valid envelope yields `ProtocolViolation`; the connection stays usable.
    pub async fn receive(&self, timeout: Duration) -> Result<Incoming, SessionError> {
        if self.state() == ConnectionState::Closed {
            return Ok(Incoming::Closed);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut stream = self.stream.lock().await;

        loop {
            let next = match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => return Ok(Incoming::Timeout),
                Ok(next) => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Inbound>(text.as_str())
                        .map(Incoming::Envelope)
                        .map_err(|e| SessionError::ProtocolViolation(format!("{}: {}", e, text.as_str())));
                }
                Some(Ok(Message::Binary(bin))) => {
                    return Err(SessionError::ProtocolViolation(format!(
                        "unexpected binary message ({} bytes)",
                        bin.len()
                    )));
                }
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Server closed the connection: {:?}", frame);
                    self.advance(ConnectionState::Closed);
                    return Ok(Incoming::Closed);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::warn!("Transport error: {}", e);
                    self.advance(ConnectionState::Closed);
                    return Ok(Incoming::Closed);
                }
                None => {
                    self.advance(ConnectionState::Closed);
                    return Ok(Incoming::Closed);
                }
            }
        }
    }

    /// Waits for the server's `connected` message.
    pub async fn await_confirmation(&self, timeout: Duration) -> Result<(), SessionError> {
        match self.receive(timeout).await? {
            Incoming::Envelope(Inbound::Connected { message }) => {
                log::info!("Connection confirmed{}", message.map(|m| format!(": {}", m)).unwrap_or_default());
                Ok(())
            }
            Incoming::Envelope(other) => Err(SessionError::ProtocolViolation(format!(
                "expected connected, received {}",
                other.kind()
            ))),
            Incoming::Timeout => Err(SessionError::ConnectTimeout),
            Incoming::Closed => Err(SessionError::ConnectionClosed(
                "closed before confirmation".to_string(),
            )),
        }
    }

    /// Closes the transport. Idempotent.
    pub async fn close(&self) {
        let previous = ConnectionState::from_u8(
            self.state
                .fetch_max(ConnectionState::Closing as u8, Ordering::AcqRel),
        );
        if previous == ConnectionState::Open {
            let graceful = tokio::time::timeout(CLOSE_GRACE, async {
                let mut sink = self.sink.lock().await;
                sink.close().await
            })
            .await;
            match graceful {
                Ok(Ok(())) => log::debug!("Connection closed gracefully"),
                Ok(Err(e)) => log::debug!("Close handshake failed: {}", e),
                Err(_) => log::debug!("Close handshake timed out"),
            }
        }
        self.advance(ConnectionState::Closed);
    }
}
