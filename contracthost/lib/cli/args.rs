use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::{styles, TokenSeed};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// contracthost - routes TLS connections to metered contract sandboxes by SNI
#[derive(Debug, Parser)]
#[command(name = "contracthost", author, about, version, styles=styles::styles())]
pub struct ContracthostArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<ContracthostSubcommand>,

    /// Path to the TOML configuration file; falls back to $CONTRACTHOST_CONFIG
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum ContracthostSubcommand {
    /// Serve contracts on the public TLS port
    #[command(name = "serve")]
    Serve {
        /// Override the public port; 0 picks a free one
        #[arg(short, long)]
        port: Option<u16>,

        /// Keep balances in memory instead of the ledger database
        #[arg(long)]
        ephemeral: bool,

        /// Seed the in-memory ledger with a token; may be repeated
        #[arg(
            long = "token",
            value_name = "TOKEN:CONTRACT:BALANCE",
            requires = "ephemeral"
        )]
        tokens: Vec<TokenSeed>,
    },

    /// Manage tokens in the ledger database
    #[command(name = "token")]
    Token {
        /// Action to perform
        #[command(subcommand)]
        action: TokenAction,
    },
}

/// Actions for the token subcommand
#[derive(Debug, Subcommand)]
pub enum TokenAction {
    /// Register a token for a staged contract
    #[command(name = "add")]
    Add {
        /// The token
        token: String,

        /// Hash of the staged contract the token names
        #[arg(long)]
        contract: String,

        /// Opening balance in compute units
        #[arg(long, default_value_t = 0)]
        balance: u64,
    },

    /// Add compute units to a token's balance
    #[command(name = "fund")]
    Fund {
        /// The token
        token: String,

        /// Units to add
        #[arg(long, default_value_t = crate::config::DEFAULT_FUNDING_AMOUNT)]
        amount: u64,
    },

    /// Show a token's contract and balance
    #[command(name = "show")]
    Show {
        /// The token
        token: String,
    },
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
