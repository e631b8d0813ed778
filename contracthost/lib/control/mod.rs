//! The internal control plane.
//!
//! A small plaintext HTTP service bound to an ephemeral loopback port. It is never exposed
//! directly: the router forwards every connection whose server name is not a token here.
//!
//! Routes:
//! - `GET /health`
//! - `GET /token/{token}`: balance and live instance snapshot
//! - `POST /token/{token}/fund?amount=N`: only with development funding enabled

mod handlers;
mod routes;
mod types;

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{ledger::BalanceLedger, manager::InstanceManager, token::TokenMatcher, HostResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use routes::create_router;
pub use types::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Shared state of the control plane handlers.
#[derive(Clone)]
pub struct ControlState {
    ledger: Arc<dyn BalanceLedger>,
    manager: Arc<InstanceManager>,
    matcher: Arc<TokenMatcher>,
    dev_funding: bool,
}

/// A running control plane.
pub struct ControlPlane {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<HostResult<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ControlState {
    /// Creates the handler state.
    pub fn new(
        ledger: Arc<dyn BalanceLedger>,
        manager: Arc<InstanceManager>,
        matcher: TokenMatcher,
        dev_funding: bool,
    ) -> Self {
        Self {
            ledger,
            manager,
            matcher: Arc::new(matcher),
            dev_funding,
        }
    }
}

impl ControlPlane {
    /// Binds an ephemeral loopback port and starts serving on it.
    pub async fn start(state: ControlState) -> HostResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let app = create_router(state);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await?;
            HostResult::Ok(())
        });

        tracing::info!(addr = %addr, "control plane listening");
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    /// Returns the loopback address the control plane listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops serving and waits for in-flight requests to finish.
    pub async fn shutdown(self) -> HostResult<()> {
        self.shutdown.cancel();
        self.handle.await?
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::{
        ledger::{ContractRef, MemoryLedger},
        manager::ManagerConfig,
        sandbox::{SandboxEngine, StartedSandbox},
        token::Token,
        HostError,
    };

    const TOKEN: &str = "ggav6r6m3kbintgwk5iimtdvo46byw4qvslpczzziji4ckvwqk4a";
    const UNKNOWN: &str = "vnvltu27qorpwd5vgx4wufbyuqesbm42immlvnrd6ht45mnwkkoa";

    struct NoEngine;

    #[async_trait]
    impl SandboxEngine for NoEngine {
        async fn start(&self, _: &ContractRef, token: &Token) -> HostResult<StartedSandbox> {
            Err(HostError::SandboxStartFailed(token.to_string()))
        }
    }

    async fn start(dev_funding: bool) -> (ControlPlane, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.register(TOKEN.parse().unwrap(), ContractRef::new("deadbeef"), 40);

        let manager = Arc::new(InstanceManager::new(
            ManagerConfig::default(),
            ledger.clone(),
            Arc::new(NoEngine),
        ));
        let state = ControlState::new(ledger.clone(), manager, TokenMatcher::default(), dev_funding);
        (ControlPlane::start(state).await.unwrap(), ledger)
    }

    async fn request(addr: SocketAddr, method: &str, path: &str) -> (u16, serde_json::Value) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap();
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body)
            .unwrap_or_default();
        let json = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[test_log::test(tokio::test)]
    async fn test_health() {
        let (control, _) = start(false).await;
        let (status, body) = request(control.addr(), "GET", "/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["live_instances"], 0);
        control.shutdown().await.unwrap();
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_requests_are_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let (control, _) = start(false).await;
        let (status, _) = request(control.addr(), "GET", "/health").await;
        assert_eq!(status, 200);
        control.shutdown().await.unwrap();

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("uri=/health"), "{logs}");
        assert!(logs.contains("status=200"), "{logs}");
    }

    #[test_log::test(tokio::test)]
    async fn test_token_lookup() {
        let (control, _) = start(false).await;

        let (status, body) = request(control.addr(), "GET", &format!("/token/{TOKEN}")).await;
        assert_eq!(status, 200);
        assert_eq!(body["token"], TOKEN);
        assert_eq!(body["balance"], 40);
        assert!(body["instance"].is_null());

        let (status, _) = request(control.addr(), "GET", &format!("/token/{UNKNOWN}")).await;
        assert_eq!(status, 404);

        let (status, _) = request(control.addr(), "GET", "/token/NOT_A_TOKEN").await;
        assert_eq!(status, 400);

        let (status, _) = request(control.addr(), "GET", "/token/localhost").await;
        assert_eq!(status, 400);

        control.shutdown().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_funding_requires_dev_mode() {
        let (control, ledger) = start(false).await;
        let (status, _) = request(control.addr(), "POST", &format!("/token/{TOKEN}/fund")).await;
        assert_eq!(status, 404);
        assert_eq!(
            ledger.get_balance(&TOKEN.parse().unwrap()).await.unwrap(),
            40
        );
        control.shutdown().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_funding_credits_balance() {
        let (control, ledger) = start(true).await;

        let (status, body) = request(control.addr(), "POST", &format!("/token/{TOKEN}/fund")).await;
        assert_eq!(status, 200);
        assert_eq!(body["balance"], 1040);

        let (status, body) =
            request(control.addr(), "POST", &format!("/token/{TOKEN}/fund?amount=5")).await;
        assert_eq!(status, 200);
        assert_eq!(body["balance"], 1045);
        assert_eq!(
            ledger.get_balance(&TOKEN.parse().unwrap()).await.unwrap(),
            1045
        );

        control.shutdown().await.unwrap();
    }
}
