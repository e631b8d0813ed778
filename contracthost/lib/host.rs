//! Wiring of the public router, the instance manager and the control plane into one host.

use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, task::JoinHandle};

use crate::{
    config::HostConfig,
    control::{ControlPlane, ControlState},
    ledger::BalanceLedger,
    manager::{InstanceManager, ManagerConfig},
    router::Router,
    sandbox::SandboxEngine,
    tls, HostError, HostResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A running contract host.
pub struct Host {
    addr: SocketAddr,
    router: Arc<Router>,
    manager: Arc<InstanceManager>,
    control: ControlPlane,
    serving: JoinHandle<HostResult<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Host {
    /// Loads the TLS material, starts the control plane on a loopback port and begins accepting
    /// on the public port.
    ///
    /// Any failure here is fatal: nothing is left running when an error is returned.
    pub async fn start(
        config: &HostConfig,
        ledger: Arc<dyn BalanceLedger>,
        engine: Arc<dyn SandboxEngine>,
    ) -> HostResult<Self> {
        let acceptor = tls::create_tls_acceptor(config.get_tls())?;
        let matcher = config.token_matcher()?;

        let bind = SocketAddr::new(*config.get_bind_addr(), *config.get_port());
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| HostError::ListenerFailure(format!("failed to bind {}: {}", bind, e)))?;
        let addr = listener.local_addr()?;

        let manager = Arc::new(InstanceManager::new(
            ManagerConfig::from(config),
            ledger.clone(),
            engine,
        ));
        let control = ControlPlane::start(ControlState::new(
            ledger,
            manager.clone(),
            matcher.clone(),
            *config.get_dev_funding(),
        ))
        .await?;

        let router = Arc::new(Router::new(
            acceptor,
            matcher,
            manager.clone(),
            control.addr(),
        ));
        let serving = tokio::spawn(router.clone().serve(listener));

        tracing::info!(
            addr = %addr,
            control_plane = %control.addr(),
            dev_funding = *config.get_dev_funding(),
            "contract host started"
        );

        Ok(Self {
            addr,
            router,
            manager,
            control,
            serving,
        })
    }

    /// Returns the address of the public TLS port.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the loopback address of the control plane.
    pub fn control_plane_addr(&self) -> SocketAddr {
        self.control.addr()
    }

    /// Returns the instance manager.
    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Stops accepting, closes every connection, tears down every instance and stops the
    /// control plane, in that order.
    pub async fn shutdown(self) -> HostResult<()> {
        tracing::info!(addr = %self.addr, "shutting down contract host");

        self.router.shutdown().await;
        self.serving.await??;
        self.manager.shutdown().await;
        self.control.shutdown().await?;

        tracing::info!("contract host stopped");
        Ok(())
    }
}
