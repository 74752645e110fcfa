use crate::prelude::*;
use crate::error::Error;
use crate::samil::frame::Request;
use crate::samil::inverter::{Inverter, SessionOptions};

use {
    net2::TcpStreamExt,
    std::{
        fmt,
        net::SocketAddr,
        sync::{Arc, Mutex},
        time::Duration,
    },
    tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket},
    tokio_util::sync::CancellationToken,
};

pub const ADVERTISEMENT_PORT: u16 = 60000;
pub const LISTEN_PORT: u16 = 60001;

const TCP_KEEPALIVE_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Searching,
    Found,
    Closed,
}

// Sockets and state shared with every handle.
struct Shared {
    sockets: Option<(Arc<TcpListener>, Arc<UdpSocket>)>,
    state: State,
}

/// Closes the listener from another task. A pending search fails with
/// [`Error::Cancelled`].
#[derive(Clone)]
pub struct ListenerHandle {
    token: CancellationToken,
    shared: Arc<Mutex<Shared>>,
}

impl ListenerHandle {
    /// Releases both sockets. A search in progress drops its references as
    /// soon as it returns.
    pub fn close(&self) {
        self.token.cancel();
        if let Ok(mut shared) = self.shared.lock() {
            shared.sockets = None;
            shared.state = State::Closed;
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerHandle(cancelled={})", self.token.is_cancelled())
    }
}

/// Finds inverters on the local network.
///
/// Inverters do not listen for connections themselves; they connect back to
/// whoever broadcasts an advertisement. So the listener keeps broadcasting
/// until one of them turns up on the TCP socket.
pub struct InverterListener {
    discovery: config::Discovery,
    options: SessionOptions,
    nodelay: bool,
    handle: ListenerHandle,
}

impl InverterListener {
    pub async fn bind(
        discovery: config::Discovery,
        inverter: &config::Inverter,
    ) -> Result<Self, Error> {
        let listen_addr = discovery.listen_addr();
        debug!("binding TCP socket to {}", listen_addr);
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(listen_addr)?;
        let server = socket.listen(5)?;

        let interface_ip = discovery.interface_ip();
        debug!("binding UDP socket to {}:0", interface_ip);
        let broadcast = UdpSocket::bind((interface_ip, 0)).await?;
        broadcast.set_broadcast(true)?;

        Ok(Self {
            discovery,
            options: SessionOptions::from(inverter),
            nodelay: inverter.use_tcp_nodelay(),
            handle: ListenerHandle {
                token: CancellationToken::new(),
                shared: Arc::new(Mutex::new(Shared {
                    sockets: Some((Arc::new(server), Arc::new(broadcast))),
                    state: State::Idle,
                })),
            },
        })
    }

    pub fn state(&self) -> State {
        self.handle
            .shared
            .lock()
            .map(|shared| shared.state)
            .unwrap_or(State::Closed)
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Address the TCP socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        match self.sockets() {
            Some((server, _)) => Ok(server.local_addr()?),
            None => Err(Error::Cancelled),
        }
    }

    /// Connects to the first inverter that answers an advertisement.
    ///
    /// Blocks until an inverter connects; there is no overall timeout. Call
    /// again to connect to the next inverter. Fails with [`Error::Cancelled`]
    /// once the listener is closed.
    pub async fn connect(&mut self) -> Result<Inverter<TcpStream>, Error> {
        let result = self.search().await;

        match result {
            Ok((stream, addr)) => {
                self.set_state(State::Found);
                info!("Connected with inverter on address {}", addr);
                Ok(Inverter::new(self.configure(stream)?, addr, self.options))
            }
            Err(e) => {
                if matches!(e, Error::Cancelled) {
                    info!("inverter search cancelled");
                }
                self.close();
                Err(e)
            }
        }
    }

    /// Releases both sockets. Any later `connect` fails with
    /// [`Error::Cancelled`].
    pub fn close(&mut self) {
        self.handle.close();
    }

    fn sockets(&self) -> Option<(Arc<TcpListener>, Arc<UdpSocket>)> {
        self.handle
            .shared
            .lock()
            .ok()
            .and_then(|shared| shared.sockets.clone())
    }

    // a closed listener stays closed
    fn set_state(&self, state: State) {
        if let Ok(mut shared) = self.handle.shared.lock() {
            if shared.state != State::Closed {
                shared.state = state;
            }
        }
    }

    async fn search(&self) -> Result<(TcpStream, SocketAddr), Error> {
        let token = self.handle.token.clone();
        let (server, broadcast) = match self.sockets() {
            Some(sockets) if !token.is_cancelled() => sockets,
            _ => return Err(Error::Cancelled),
        };
        self.set_state(State::Searching);

        let target = self.discovery.advertisement_target();
        let accept_timeout = self.discovery.accept_timeout();
        let warn_after = self.discovery.warn_after();

        info!("Searching for an inverter in the network");
        let mut tries = 0;
        loop {
            if tries == warn_after && tries > 0 {
                warn!("Connecting to inverter is taking a long time, is it reachable?");
            }

            debug!("Broadcasting server existence to {}", target);
            if let Err(e) = broadcast.send_to(Request::Advertisement.bytes(), target).await {
                warn!("Failed to broadcast advertisement to {}: {}", target, e);
            }

            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                accepted = tokio::time::timeout(accept_timeout, server.accept()) => match accepted {
                    Ok(Ok((stream, addr))) => return Ok((stream, addr)),
                    Ok(Err(e)) => return Err(Error::Transport(e)),
                    Err(_) => tries += 1,
                },
            }
        }
    }

    fn configure(&self, stream: TcpStream) -> Result<TcpStream, Error> {
        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
            warn!("Failed to set TCP keepalive: {}", e);
        }

        let stream = TcpStream::from_std(std_stream)?;
        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        Ok(stream)
    }
}
