//! The public TLS listener.
//!
//! Every connection is TLS terminated here. The SNI server name picks its destination: a name
//! whose first label is a token goes to that token's contract instance, anything else goes to
//! the host's own control plane.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    manager::InstanceManager,
    token::{Destination, Token, TokenMatcher},
    HostError, HostResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a client has to finish the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Accepts connections on the public port and dispatches them by server name.
pub struct Router {
    acceptor: TlsAcceptor,
    matcher: TokenMatcher,
    manager: Arc<InstanceManager>,
    control_plane: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Router {
    /// Creates a router that sends non-contract traffic to `control_plane`.
    pub fn new(
        acceptor: TlsAcceptor,
        matcher: TokenMatcher,
        manager: Arc<InstanceManager>,
        control_plane: SocketAddr,
    ) -> Self {
        Self {
            acceptor,
            matcher,
            manager,
            control_plane,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Accepts connections on `listener` until [`Router::shutdown`] is called.
    ///
    /// Each connection is handled on its own task, so a slow handshake never holds up the
    /// accept loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> HostResult<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "router listening");

        loop {
            let (tcp, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            let router = self.clone();
            self.tracker.spawn(async move {
                tokio::select! {
                    _ = router.shutdown.cancelled() => {}
                    _ = router.handle_connection(tcp, peer) => {}
                }
            });
        }

        tracing::info!(addr = %local_addr, "router stopped accepting");
        Ok(())
    }

    /// Terminates TLS on `tcp` and dispatches the decrypted stream.
    pub async fn handle_connection(&self, tcp: TcpStream, peer: SocketAddr) {
        let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(tcp)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "tls handshake failed");
                return;
            }
            Err(_) => {
                tracing::debug!(peer = %peer, "tls handshake timed out");
                return;
            }
        };

        let server_name = stream.get_ref().1.server_name().map(str::to_owned);
        self.on_secure_connection(stream, server_name.as_deref())
            .await;
    }

    /// Dispatches a decrypted stream by the server name the client asked for.
    pub async fn on_secure_connection<S>(&self, stream: S, server_name: Option<&str>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        match self.matcher.classify(server_name) {
            Destination::Contract(token) => self.route_to_contract(token, stream).await,
            Destination::Host => {
                tracing::debug!(server_name, "forwarding to control plane");
                self.proxy_to_control_plane(stream).await
            }
        }
    }

    /// Stops accepting, closes every connection in flight, and waits for their tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn route_to_contract<S>(&self, token: Token, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        match self.manager.route(token.clone(), stream).await {
            Ok(_) => {}
            Err(e @ (HostError::TokenNotFound(_) | HostError::InsufficientBalance(_))) => {
                tracing::info!(token = %token, error = %e, "refused contract connection");
            }
            Err(e) => {
                tracing::warn!(token = %token, error = %e, "contract connection failed");
            }
        }
    }

    async fn proxy_to_control_plane<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut upstream = match TcpStream::connect(self.control_plane).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(addr = %self.control_plane, error = %e, "control plane unreachable");
                let _ = stream.shutdown().await;
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
            Ok((to_host, to_client)) => {
                tracing::trace!(to_host, to_client, "control plane connection closed");
            }
            Err(e) => {
                tracing::debug!(error = %e, "control plane connection error");
            }
        }

        let _ = stream.shutdown().await;
        let _ = upstream.shutdown().await;
    }
}
