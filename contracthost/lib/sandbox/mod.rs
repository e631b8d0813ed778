//! The sandbox engine interface.
//!
//! An engine turns a staged contract into a running instance. The instance manager only needs
//! three things from it: a fresh duplex stream per client connection, a way to stop it, and a
//! notification when it stops on its own.

mod process;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::oneshot,
};

use crate::{ledger::ContractRef, token::Token, HostResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use process::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A bidirectional byte stream into a running sandbox.
pub trait SandboxIo: AsyncRead + AsyncWrite + Send + Unpin {}

/// A boxed stream into a running sandbox.
pub type SandboxStream = Box<dyn SandboxIo>;

/// How a sandbox stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxExit {
    /// The sandbox process exited, with its exit code if it had one.
    Exited {
        /// The exit code of the process.
        code: Option<i32>,
    },

    /// The sandbox could not be waited on.
    Failed {
        /// The error that occurred.
        error: String,
    },
}

/// A sandbox that has just been started.
pub struct StartedSandbox {
    /// Control over the running sandbox.
    pub sandbox: Arc<dyn Sandbox>,

    /// Resolves once when the sandbox stops, whatever the cause.
    pub exited: oneshot::Receiver<SandboxExit>,
}

/// A running contract instance.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Opens a new stream into the instance for one client connection.
    async fn open_stream(&self) -> HostResult<SandboxStream>;

    /// Stops the instance. Calling this more than once has no further effect.
    async fn terminate(&self) -> HostResult<()>;
}

/// Starts contract instances.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Starts an instance of `contract` on behalf of `token`.
    ///
    /// Fails with [`HostError::SandboxStartFailed`](crate::HostError::SandboxStartFailed).
    async fn start(&self, contract: &ContractRef, token: &Token) -> HostResult<StartedSandbox>;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T> SandboxIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}
