//! The instance manager.
//!
//! The manager owns every live contract instance. It starts an instance on the first
//! connection for a token, pipes each connection into it, meters its compute time against the
//! token's balance on a fixed tick, and tears it down when the balance runs out, the instance
//! goes idle, the sandbox dies, or the host shuts down.
//!
//! At most one instance is live per token at any time. Creation for a token is serialized by
//! that token's lock in the [`InstanceRegistry`]; piping is not serialized, so any number of
//! connections may share an instance.

mod instance;
mod pipe;
mod registry;

use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::{
        HostConfig, DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MILLISECONDS_PER_COMPUTE_UNIT,
        DEFAULT_POLL_INTERVAL_MS,
    },
    ledger::BalanceLedger,
    sandbox::{SandboxEngine, SandboxStream, StartedSandbox},
    token::Token,
    HostError, HostResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use instance::*;
pub use pipe::Transferred;
pub use registry::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Metering and lifecycle settings of the instance manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// The metering tick period.
    pub poll_interval: Duration,

    /// Milliseconds of wall-clock time per compute unit charged.
    pub milliseconds_per_compute_unit: u64,

    /// How long an instance may go without traffic before it is torn down.
    pub idle_timeout: Duration,
}

/// Owns the live contract instances and the connections piped into them.
pub struct InstanceManager {
    config: ManagerConfig,
    ledger: Arc<dyn BalanceLedger>,
    engine: Arc<dyn SandboxEngine>,
    registry: Arc<InstanceRegistry>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InstanceManager {
    /// Creates a manager with an empty registry.
    pub fn new(
        config: ManagerConfig,
        ledger: Arc<dyn BalanceLedger>,
        engine: Arc<dyn SandboxEngine>,
    ) -> Self {
        Self {
            config,
            ledger,
            engine,
            registry: Arc::new(InstanceRegistry::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Returns the registry of live instances.
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Pipes `stream` into the instance for `token`, starting one if none is live.
    ///
    /// Returns once the stream is closed by either side or the instance is terminated. Errors
    /// before piping starts (`TokenNotFound`, `InsufficientBalance`, `SandboxStartFailed`)
    /// leave no instance behind; `stream` is shut down without a payload in that case.
    pub async fn route<S>(&self, token: Token, mut stream: S) -> HostResult<Transferred>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (instance, sandbox_stream) = match self.attach(&token).await {
            Ok(attached) => attached,
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };
        let _guard = instance.stream_opened();
        instance.touch();

        tracing::debug!(token = %token, streams = instance.active_streams(), "piping connection");
        let transferred = pipe::splice(stream, sandbox_stream, &instance).await;
        tracing::debug!(
            token = %token,
            to_sandbox = transferred.to_sandbox,
            to_client = transferred.to_client,
            "connection closed"
        );

        Ok(transferred)
    }

    /// Returns a live instance for `token` and a fresh stream into it.
    ///
    /// An instance that terminates while the stream is being opened is replaced once.
    async fn attach(&self, token: &Token) -> HostResult<(Arc<Instance>, SandboxStream)> {
        let mut replaced = false;
        loop {
            let instance = self.get_or_create(token).await?;
            let opened = instance.sandbox().open_stream().await;

            if instance.is_terminated() && !replaced {
                tracing::debug!(
                    token = %token,
                    reason = ?instance.termination_reason(),
                    "instance terminated while attaching, replacing it"
                );
                replaced = true;
                continue;
            }

            return opened.map(|sandbox_stream| (instance, sandbox_stream));
        }
    }

    /// Returns the live instance for `token`, starting one if needed.
    pub async fn get_or_create(&self, token: &Token) -> HostResult<Arc<Instance>> {
        let lock = self.registry.creation_lock(token);
        let result = {
            let _creation = lock.lock().await;
            self.create_locked(token).await
        };

        drop(lock);
        self.registry.prune(token);
        result
    }

    async fn create_locked(&self, token: &Token) -> HostResult<Arc<Instance>> {
        if let Some(instance) = self.registry.get(token) {
            if !instance.is_terminated() {
                return Ok(instance);
            }
        }

        if self.shutdown.is_cancelled() {
            return Err(HostError::InstanceTerminated(format!(
                "host is shutting down, refusing to start {}",
                token
            )));
        }

        let balance = self.ledger.get_balance(token).await?;
        if balance == 0 {
            return Err(HostError::InsufficientBalance(token.to_string()));
        }

        let contract = self.ledger.contract_ref(token).await?;
        let StartedSandbox { sandbox, exited } = self
            .engine
            .start(&contract, token)
            .await
            .map_err(|e| match e {
                HostError::SandboxStartFailed(_) => e,
                other => HostError::SandboxStartFailed(other.to_string()),
            })?;

        let instance = Arc::new(Instance::new(
            token.clone(),
            sandbox,
            self.shutdown.child_token(),
        ));
        self.registry.insert(instance.clone());

        self.tracker.spawn(instance::run(
            instance.clone(),
            exited,
            self.ledger.clone(),
            self.registry.clone(),
            self.config,
        ));

        tracing::info!(token = %token, contract = %contract, balance, "started instance");
        Ok(instance)
    }

    /// Returns a snapshot of the live instance for `token`.
    pub fn instance(&self, token: &Token) -> Option<InstanceInfo> {
        self.registry
            .get(token)
            .filter(|instance| !instance.is_terminated())
            .map(|instance| instance.info())
    }

    /// Returns the number of live instances.
    pub fn live_count(&self) -> usize {
        self.registry.len()
    }

    /// Terminates the live instance for `token`. Returns false if there was none to terminate.
    pub fn terminate(&self, token: &Token) -> bool {
        self.registry
            .get(token)
            .is_some_and(|instance| instance.terminate(TerminationReason::Shutdown))
    }

    /// Terminates every instance, closes every piped stream, and waits for teardown.
    pub async fn shutdown(&self) {
        let instances = self.registry.all();
        tracing::info!(live = instances.len(), "shutting down instance manager");

        for instance in instances {
            instance.terminate(TerminationReason::Shutdown);
        }

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            milliseconds_per_compute_unit: DEFAULT_MILLISECONDS_PER_COMPUTE_UNIT,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
        }
    }
}

impl From<&HostConfig> for ManagerConfig {
    fn from(config: &HostConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            milliseconds_per_compute_unit: *config.get_milliseconds_per_compute_unit(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
