//! `contracthost` fronts a single TLS port and routes each connection by its SNI server name.
//!
//! # Overview
//!
//! A client that puts a contract token in the first label of the server name, e.g.
//! `<token>.host.example`, is piped into a sandboxed instance of that token's contract. The
//! instance is started on the first connection, shared by every later connection for the same
//! token, and metered for wall-clock compute time against the token's prepaid balance. It is
//! torn down when the balance runs out or it goes idle. Every other connection is forwarded to
//! the host's own control plane on a loopback port.
//!
//! # Architecture
//!
//! - **Router**: TLS termination, SNI classification and dispatch
//! - **Manager**: per-token instance lifecycle, metering and stream piping
//! - **Ledger**: token balances and the contracts they name
//! - **Sandbox**: the engine that runs contract instances
//! - **Control**: the internal plaintext control plane
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use contracthost::{
//!     config::HostConfig,
//!     host::Host,
//!     ledger::SqliteLedger,
//!     sandbox::ProcessEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HostConfig::load(None).await?;
//!     let ledger = Arc::new(SqliteLedger::open(config.get_database_path()).await?);
//!     let engine = Arc::new(ProcessEngine::new(config.get_sandbox().clone())?);
//!
//!     let host = Host::start(&config, ledger, engine).await?;
//!     tokio::signal::ctrl_c().await?;
//!     host.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Configuration types, defaults and loading
//! - [`control`] - Internal control plane
//! - [`host`] - Wiring of all components into a running host
//! - [`ledger`] - Balance ledger adapter
//! - [`manager`] - Instance manager
//! - [`router`] - Public TLS listener
//! - [`sandbox`] - Sandbox engine interface
//! - [`tls`] - TLS material loading
//! - [`token`] - Tokens and SNI classification

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod control;
pub mod host;
pub mod ledger;
pub mod manager;
pub mod router;
pub mod sandbox;
pub mod tls;
pub mod token;

pub use error::*;
