//! Connection establishment seam.
//!
//! The pool does not speak the wire protocol. It asks a [`Connector`] for an
//! established, authenticated transport and manages its lifecycle from there.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::address::{ServerAddress, ServiceId};
use crate::error::ConnectError;

/// A byte stream to a server.
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

/// Result of a successful establishment.
pub struct Established {
    /// The connected, handshaken stream.
    pub transport: Box<dyn Transport>,
    /// Service reported by a load balancer during the handshake.
    pub service_id: Option<ServiceId>,
}

impl Established {
    /// Wrap a transport without a service id.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
            service_id: None,
        }
    }

    /// Attach the service id reported during the handshake.
    #[must_use]
    pub fn with_service_id(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("service_id", &self.service_id)
            .finish_non_exhaustive()
    }
}

/// Creates new physical connections to a server.
///
/// Implementations perform the network connect and the handshake. The pool
/// bounds every call with its connect timeout and never retries a failure.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open and handshake a new connection to `address`.
    async fn connect(&self, address: &ServerAddress) -> Result<Established, ConnectError>;
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for std::sync::Arc<T> {
    async fn connect(&self, address: &ServerAddress) -> Result<Established, ConnectError> {
        (**self).connect(address).await
    }
}

/// Plain TCP establishment without a handshake.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    /// Create a connector with `TCP_NODELAY` enabled.
    #[must_use]
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Enable or disable `TCP_NODELAY`.
    #[must_use]
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &ServerAddress) -> Result<Established, ConnectError> {
        let stream = TcpStream::connect((address.host(), address.port())).await?;
        stream.set_nodelay(self.nodelay)?;

        tracing::trace!(
            host = %address.host(),
            port = address.port(),
            local = ?stream.local_addr().ok(),
            "tcp connection established"
        );

        Ok(Established::new(stream))
    }
}
