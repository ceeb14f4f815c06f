use super::destination::Destination;
use crate::config::{EffectivePoolConfig, TlsTrust};
use crate::error::{FailureKind, HttpError};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

/// A connection the pool can hold while it is not in use.
pub trait Poolable: Send + 'static {
    /// Whether the underlying channel can still carry a request.
    ///
    /// Connections reporting `false` are destroyed instead of being reused.
    fn is_open(&self) -> bool;
}

/// Establishes new connections for the pool.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    type Connection: Poolable;

    /// Open a new connection to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Transport`] classified by [`FailureKind`] when
    /// resolution, TCP connect or the handshakes fail.
    async fn connect(&self, destination: &Destination) -> Result<Self::Connection, HttpError>;
}

/// Socket options applied to every outbound TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm (default: true)
    pub nodelay: bool,
    /// Allow reuse of local addresses in `TIME_WAIT` (default: true)
    pub reuse_address: bool,
    /// `SO_LINGER` on close (default: 6 seconds)
    pub linger: Option<Duration>,
    /// TCP keep-alive (default: true)
    pub keepalive: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            reuse_address: true,
            linger: Some(Duration::from_secs(6)),
            keepalive: true,
        }
    }
}

impl SocketOptions {
    fn socket_for(&self, addr: &SocketAddr) -> std::io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(self.reuse_address)?;
        socket.set_keepalive(self.keepalive)?;
        socket.set_nodelay(self.nodelay)?;
        socket.set_linger(self.linger)?;
        Ok(socket)
    }
}

/// HTTP/1.1 connection over plain TCP or TLS.
///
/// Dropping the connection aborts its background driver task, which closes
/// the socket.
pub struct HttpConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
}

impl HttpConnection {
    /// Send a request and wait for the response head.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the connection is closed or the exchange
    /// fails before a response head is received.
    pub async fn send_request(
        &mut self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, HttpError> {
        self.sender.ready().await?;
        Ok(self.sender.send_request(req).await?)
    }
}

impl Poolable for HttpConnection {
    fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.driver.is_finished()
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Connector backed by tokio sockets, tokio-rustls and hyper's HTTP/1.1
/// client connection.
#[derive(Clone)]
pub struct HyperConnector {
    tls: TlsConnector,
    socket: SocketOptions,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl HyperConnector {
    /// Create a connector.
    ///
    /// `connect_timeout` bounds name resolution and the TCP connect; `handshake_timeout` bounds
    /// the TLS handshake (the read timeout is a natural choice).
    #[must_use]
    pub fn new(
        tls: Arc<rustls::ClientConfig>,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            tls: TlsConnector::from(tls),
            socket: SocketOptions::default(),
            connect_timeout,
            handshake_timeout,
        }
    }

    /// Connector using the timeouts of `config`; the read timeout bounds the
    /// TLS handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration cannot be built.
    pub fn for_config(config: &EffectivePoolConfig, trust: TlsTrust) -> Result<Self, HttpError> {
        let tls = crate::tls::client_config(trust)?;
        Ok(Self::new(
            Arc::new(tls),
            config.connect_timeout,
            config.read_timeout,
        ))
    }

    /// Override the socket options
    #[must_use]
    pub fn with_socket_options(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    async fn resolve(destination: &Destination) -> Result<Vec<SocketAddr>, HttpError> {
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((destination.host(), destination.port()))
                .await
                .map_err(|e| HttpError::transport(FailureKind::UnknownHost, e))?
                .collect();

        if addrs.is_empty() {
            return Err(HttpError::transport(
                FailureKind::UnknownHost,
                format!("no addresses found for {}", destination.host()),
            ));
        }
        Ok(addrs)
    }

    /// Resolve `destination` and open a TCP stream, both within the connect
    /// timeout.
    async fn connect_tcp(&self, destination: &Destination) -> Result<TcpStream, HttpError> {
        let attempt = async {
            let addrs = Self::resolve(destination).await?;
            let mut last_err = None;
            for addr in &addrs {
                let socket = self
                    .socket
                    .socket_for(addr)
                    .map_err(|e| HttpError::transport(FailureKind::Io, e))?;
                match socket.connect(*addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        tracing::trace!(addr = %addr, error = %e, "TCP connect attempt failed");
                        last_err = Some(e);
                    }
                }
            }
            let err = last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address to connect to")
            });
            Err(HttpError::transport(FailureKind::Io, err))
        };

        tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| {
                HttpError::transport(
                    FailureKind::ConnectTimeout,
                    format!("connect timed out after {:?}", self.connect_timeout),
                )
            })?
    }

    async fn handshake<T>(io: T, destination: &Destination) -> Result<HttpConnection, HttpError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;

        let destination = destination.to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::trace!(destination = %destination, error = %e, "connection closed");
            }
        });

        Ok(HttpConnection { sender, driver })
    }
}

#[async_trait]
impl Connect for HyperConnector {
    type Connection = HttpConnection;

    async fn connect(&self, destination: &Destination) -> Result<HttpConnection, HttpError> {
        let stream = self.connect_tcp(destination).await?;

        if !destination.is_tls() {
            return Self::handshake(stream, destination).await;
        }

        let server_name = ServerName::try_from(destination.host().to_owned())
            .map_err(|e| HttpError::transport(FailureKind::Tls, e))?;

        let tls_stream = tokio::time::timeout(
            self.handshake_timeout,
            self.tls.connect(server_name, stream),
        )
        .await
        .map_err(|_| {
            HttpError::transport(
                FailureKind::Interrupted,
                format!("TLS handshake timed out after {:?}", self.handshake_timeout),
            )
        })?
        .map_err(|e| HttpError::transport(FailureKind::TlsHandshake, e))?;

        Self::handshake(tls_stream, destination).await
    }
}
