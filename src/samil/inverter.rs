use crate::prelude::*;
use crate::error::Error;
use crate::samil::frame::{Frame, FrameCodec, Request};
use crate::samil::reading::{self, Reading};

use {
    bytes::{Bytes, BytesMut},
    futures::{SinkExt, StreamExt},
    std::{fmt, net::SocketAddr, sync::Arc, time::Duration},
    tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    tokio::sync::Mutex,
    tokio_util::{codec::Framed, sync::CancellationToken},
};

/// Idle time after which a keep-alive request is sent.
pub const KEEP_ALIVE: Duration = Duration::from_millis(1000);

/// Anything a session can talk over: a `TcpStream` in production, an
/// in-memory duplex in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub keep_alive: Duration,
    /// `None` waits for a response forever, like the inverter firmware expects.
    pub response_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keep_alive: KEEP_ALIVE,
            response_timeout: None,
        }
    }
}

impl From<&config::Inverter> for SessionOptions {
    fn from(inverter: &config::Inverter) -> Self {
        Self {
            keep_alive: inverter.keep_alive(),
            response_timeout: inverter.response_timeout(),
        }
    }
}

// ModelInfo {{{
/// Undecoded answer to a model info request. The layout of this response is
/// not known, so header and payload are handed out as they came.
#[derive(Clone, PartialEq, Eq)]
pub struct ModelInfo {
    header: Bytes,
    payload: Bytes,
}

impl ModelInfo {
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl From<Frame> for ModelInfo {
    fn from(frame: Frame) -> Self {
        Self {
            header: frame.header().clone(),
            payload: frame.payload().clone(),
        }
    }
}

impl fmt::Display for ModelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "header=[{}] payload=[{}]",
            Utils::hex(&self.header),
            Utils::hex(&self.payload)
        )
    }
}

impl fmt::Debug for ModelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelInfo({})", self)
    }
} // }}}

// Heartbeat {{{
// Only ever armed or suspended while holding the session lock.
enum Heartbeat {
    Armed(CancellationToken),
    Suspended,
}

impl Heartbeat {
    fn suspend(&mut self) {
        if let Heartbeat::Armed(token) = std::mem::replace(self, Heartbeat::Suspended) {
            token.cancel();
        }
    }
} // }}}

struct Session<T> {
    // None once the connection is torn down
    framed: Option<Framed<T, FrameCodec>>,
    heartbeat: Heartbeat,
}

struct Shared<T> {
    addr: SocketAddr,
    options: SessionOptions,
    closed: CancellationToken,
    session: Mutex<Session<T>>,
}

/// A live connection to one inverter.
///
/// Cloning gives another handle on the same connection. Requests from any
/// number of tasks are serialized on the session lock; while the connection
/// sits idle a keep-alive values request is sent every
/// [`SessionOptions::keep_alive`].
///
/// A request that was sent is always read to its answer, even when the
/// caller drops the future; wrap calls in `tokio::time::timeout` freely.
pub struct Inverter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Inverter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> Inverter<T> {
    /// Wraps a connected transport and arms the first keep-alive. Must be
    /// called from within a tokio runtime.
    pub fn new(transport: T, addr: SocketAddr, options: SessionOptions) -> Self {
        let shared = Arc::new(Shared {
            addr,
            options,
            closed: CancellationToken::new(),
            session: Mutex::new(Session {
                framed: Some(Framed::new(transport, FrameCodec)),
                heartbeat: Heartbeat::Suspended,
            }),
        });

        // nobody else can hold the lock yet
        if let Ok(mut session) = shared.session.try_lock() {
            session.heartbeat = Self::arm(&shared);
        }

        Self { shared }
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Requests model information. The response is returned undecoded.
    pub async fn request_model_info(&self) -> Result<ModelInfo, Error> {
        let frame = self.exchange(Request::ModelInfo).await?;
        let info = ModelInfo::from(frame);
        info!("inverter {}: model info: {}", self, info);
        Ok(info)
    }

    /// Requests the current values.
    pub async fn request_values(&self) -> Result<Reading, Error> {
        let frame = self.exchange(Request::Values).await?;
        let reading = reading::interpret(frame.payload())?;
        debug!("inverter {}: current values: {:?}", self, reading);
        Ok(reading)
    }

    pub async fn heartbeat_armed(&self) -> bool {
        matches!(
            self.shared.session.lock().await.heartbeat,
            Heartbeat::Armed(_)
        )
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Shuts the connection down. A request blocked on a read fails with
    /// [`Error::ConnectionClosed`], as does every later request.
    pub async fn close(&self) -> Result<(), Error> {
        self.shared.closed.cancel();

        let mut session = self.shared.session.lock().await;
        session.heartbeat.suspend();

        if let Some(framed) = session.framed.take() {
            let mut stream = framed.into_inner();
            stream.shutdown().await?;
            info!("inverter {}: connection closed", self);
        }

        Ok(())
    }

    fn arm(shared: &Arc<Shared<T>>) -> Heartbeat {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = Arc::downgrade(shared);
        let interval = shared.options.keep_alive;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            // a fired heartbeat still queues on the lock behind any caller
            if let Some(shared) = weak.upgrade() {
                Inverter { shared }.keep_alive().await;
            }
        });

        Heartbeat::Armed(token)
    }

    async fn keep_alive(&self) {
        debug!("inverter {}: keep alive", self);

        match self.request_values().await {
            Ok(reading) => debug!("inverter {}: keep alive values: {:?}", self, reading),
            Err(Error::ConnectionClosed) => debug!("inverter {}: keep alive after close", self),
            Err(e) => warn!("inverter {}: error in keep alive: {}", self, e),
        }
    }

    // Runs in its own task so a caller that stops waiting does not leave the
    // answer unread on the stream or the heartbeat suspended.
    async fn exchange(&self, request: Request) -> Result<Frame, Error> {
        let inverter = self.clone();
        match tokio::spawn(async move { inverter.locked_exchange(request).await }).await {
            Ok(result) => result,
            Err(e) => {
                warn!("inverter {}: {:?} request task failed: {}", self, request, e);
                Err(Error::ConnectionClosed)
            }
        }
    }

    async fn locked_exchange(&self, request: Request) -> Result<Frame, Error> {
        let mut session = self.shared.session.lock().await;
        session.heartbeat.suspend();

        let result = self.transact(&mut session, request).await;

        // only I/O failures drop the stream here, close() shuts it down otherwise
        if let Err(e @ (Error::Transport(_) | Error::Timeout(_))) = &result {
            if session.framed.take().is_some() {
                error!("inverter {}: {}, dropping connection", self, e);
            }
        }

        if session.framed.is_some() && !self.is_closed() {
            session.heartbeat = Self::arm(&self.shared);
        }

        result
    }

    async fn transact(&self, session: &mut Session<T>, request: Request) -> Result<Frame, Error> {
        let closed = &self.shared.closed;
        let response_timeout = self.shared.options.response_timeout;

        let framed = match session.framed.as_mut() {
            Some(framed) if !closed.is_cancelled() => framed,
            _ => return Err(Error::ConnectionClosed),
        };

        debug!("inverter {}: TX {:?} {}", self, request, Utils::hex(request.bytes()));
        tokio::select! {
            _ = closed.cancelled() => return Err(Error::ConnectionClosed),
            sent = framed.send(request) => sent?,
        }

        loop {
            let raw = tokio::select! {
                _ = closed.cancelled() => return Err(Error::ConnectionClosed),
                raw = Self::read_frame(framed, response_timeout) => raw?,
            };

            let frame = match Frame::decode(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("inverter {}: {}, waiting for a new one", self, e);
                    continue;
                }
            };

            if !frame.checksum_ok() {
                warn!("inverter {}: checksum mismatch in {:?}", self, frame);
            }

            if let Some(expected) = request.response_id() {
                if frame.message_id() != expected {
                    let e = Error::UnexpectedFrame {
                        expected,
                        actual: frame.message_id(),
                    };
                    info!("inverter {}: {}, waiting for a new one", self, e);
                    continue;
                }
            }

            debug!("inverter {}: RX {:?}", self, frame);
            return Ok(frame);
        }
    }

    async fn read_frame(
        framed: &mut Framed<T, FrameCodec>,
        response_timeout: Option<Duration>,
    ) -> Result<BytesMut, Error> {
        let next = match response_timeout {
            Some(limit) => tokio::time::timeout(limit, framed.next())
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => framed.next().await,
        };

        match next {
            Some(raw) => Ok(raw?),
            None => Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by inverter",
            ))),
        }
    }
}

impl<T> fmt::Display for Inverter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shared.addr.ip())
    }
}

impl<T> fmt::Debug for Inverter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inverter({})", self.shared.addr)
    }
}
