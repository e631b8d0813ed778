use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    net::UnixStream,
    process::{Child, Command},
    sync::oneshot,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::SandboxConfig, ledger::ContractRef, token::Token, HostError, HostResult,
};

use super::{Sandbox, SandboxEngine, SandboxExit, SandboxStream, StartedSandbox};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The environment variable telling the contract which token it serves.
pub const CONTRACT_TOKEN_ENV_VAR: &str = "CONTRACT_TOKEN";

/// The environment variable telling the contract where to accept streams.
pub const CONTRACT_SOCKET_ENV_VAR: &str = "CONTRACT_SOCKET";

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An engine that runs each contract as a child process.
///
/// The child runs in `<contracts_dir>/<contract hash>` and is expected to listen on the Unix
/// socket named by `CONTRACT_SOCKET`. Each client connection becomes one connection to that
/// socket.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: SandboxConfig,
}

/// A contract running as a supervised child process.
#[derive(Debug)]
pub struct ProcessSandbox {
    /// The token the process serves.
    token: Token,

    /// The socket the process accepts streams on.
    socket_path: PathBuf,

    /// Until this instant, a refused connection means the process is still starting.
    startup_deadline: Instant,

    /// Cancelled to kill the process.
    kill: CancellationToken,

    /// Cancelled once the process is gone, however it stopped.
    gone: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessEngine {
    /// Creates a new engine.
    pub fn new(config: SandboxConfig) -> HostResult<Self> {
        if config.get_command().is_empty() {
            return Err(HostError::InvalidConfig(
                "sandbox.command must be set".to_string(),
            ));
        }

        Ok(Self { config })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxEngine for ProcessEngine {
    async fn start(&self, contract: &ContractRef, token: &Token) -> HostResult<StartedSandbox> {
        contract.validate()?;
        let contract_dir = self.config.get_contracts_dir().join(contract.as_str());
        if !fs::try_exists(&contract_dir).await.unwrap_or(false) {
            return Err(HostError::SandboxStartFailed(format!(
                "contract {} is not staged at {}",
                contract,
                contract_dir.display()
            )));
        }

        let runtime_dir = self.config.get_runtime_dir();
        fs::create_dir_all(runtime_dir).await.map_err(|e| {
            HostError::SandboxStartFailed(format!(
                "failed to create runtime dir {}: {}",
                runtime_dir.display(),
                e
            ))
        })?;

        let socket_path = runtime_dir.join(format!("{}.sock", Uuid::new_v4().simple()));

        let mut child = Command::new(self.config.get_command())
            .args(self.config.get_args())
            .current_dir(&contract_dir)
            .env(CONTRACT_TOKEN_ENV_VAR, token.as_str())
            .env(CONTRACT_SOCKET_ENV_VAR, &socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HostError::SandboxStartFailed(format!(
                    "failed to spawn {}: {}",
                    self.config.get_command(),
                    e
                ))
            })?;

        tracing::info!(
            token = %token,
            contract = %contract,
            pid = ?child.id(),
            socket = %socket_path.display(),
            "started sandbox process"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, token.clone(), "stdout"));
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, token.clone(), "stderr"));
        }

        let kill = CancellationToken::new();
        let gone = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            kill.clone(),
            gone.clone(),
            exit_tx,
            socket_path.clone(),
            token.clone(),
        ));

        let sandbox = ProcessSandbox {
            token: token.clone(),
            socket_path,
            startup_deadline: Instant::now() + self.config.startup_timeout(),
            kill,
            gone,
        };

        Ok(StartedSandbox {
            sandbox: Arc::new(sandbox),
            exited: exit_rx,
        })
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn open_stream(&self) -> HostResult<SandboxStream> {
        loop {
            if self.kill.is_cancelled() {
                return Err(HostError::InstanceTerminated(self.token.to_string()));
            }

            if self.gone.is_cancelled() {
                return Err(HostError::SandboxCrashed(self.token.to_string()));
            }

            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => return Ok(Box::new(stream)),
                Err(e) if Instant::now() < self.startup_deadline => {
                    tracing::trace!(token = %self.token, error = %e, "sandbox not accepting yet");
                    time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(HostError::SandboxStartFailed(format!(
                        "sandbox for {} is not accepting streams: {}",
                        self.token, e
                    )));
                }
            }
        }
    }

    async fn terminate(&self) -> HostResult<()> {
        if !self.kill.is_cancelled() {
            tracing::debug!(token = %self.token, "terminating sandbox process");
            self.kill.cancel();
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Waits for the child to exit or to be killed, then reports how it stopped.
async fn supervise(
    mut child: Child,
    kill: CancellationToken,
    gone: CancellationToken,
    exit_tx: oneshot::Sender<SandboxExit>,
    socket_path: PathBuf,
    token: Token,
) {
    let exit = tokio::select! {
        _ = kill.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(token = %token, error = %e, "failed to kill sandbox process");
            }
            SandboxExit::Exited { code: None }
        }
        status = child.wait() => {
            match status {
                Ok(status) => {
                    tracing::info!(token = %token, %status, "sandbox process exited");
                    SandboxExit::Exited { code: status.code() }
                }
                Err(e) => {
                    tracing::error!(token = %token, error = %e, "error waiting for sandbox process");
                    SandboxExit::Failed { error: e.to_string() }
                }
            }
        }
    };

    if let Err(e) = fs::remove_file(&socket_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %socket_path.display(), error = %e, "failed to remove sandbox socket");
        }
    }

    gone.cancel();
    let _ = exit_tx.send(exit);
}

/// Forwards a child output stream to the log, line by line.
async fn forward_output(output: impl AsyncRead + Unpin, token: Token, stream: &'static str) {
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(token = %token, stream, "{}", line);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
