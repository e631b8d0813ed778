use std::sync::Arc;

use clap::{CommandFactory, Parser};
use contracthost::{
    cli::{AnsiStyles, ContracthostArgs, ContracthostSubcommand, TokenAction, TokenSeed},
    config::HostConfig,
    host::Host,
    ledger::{BalanceLedger, ContractRef, MemoryLedger, SqliteLedger},
    sandbox::ProcessEngine,
    token::Token,
    HostResult,
};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> HostResult<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ContracthostArgs::parse();
    match args.subcommand {
        Some(ContracthostSubcommand::Serve {
            port,
            ephemeral,
            tokens,
        }) => {
            let mut config = HostConfig::load(args.config.as_deref()).await?;
            if let Some(port) = port {
                config = config.with_port(port);
            }
            serve(config, ephemeral, tokens).await?;
        }
        Some(ContracthostSubcommand::Token { action }) => {
            let config = HostConfig::load(args.config.as_deref()).await?;
            token(config, action).await?;
        }
        None => {
            ContracthostArgs::command().print_help()?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

async fn serve(config: HostConfig, ephemeral: bool, seeds: Vec<TokenSeed>) -> HostResult<()> {
    let ledger: Arc<dyn BalanceLedger> = if ephemeral {
        tracing::warn!("using an in-memory ledger, balances will not survive a restart");
        let matcher = config.token_matcher()?;
        let ledger = MemoryLedger::new();
        for seed in &seeds {
            seed.register(&ledger, &matcher)?;
        }
        Arc::new(ledger)
    } else {
        Arc::new(SqliteLedger::open(config.get_database_path()).await?)
    };
    let engine = Arc::new(ProcessEngine::new(config.get_sandbox().clone())?);

    let host = Host::start(&config, ledger, engine).await?;
    shutdown_signal().await?;
    host.shutdown().await
}

async fn token(config: HostConfig, action: TokenAction) -> HostResult<()> {
    let matcher = config.token_matcher()?;
    let ledger = SqliteLedger::open(config.get_database_path()).await?;

    match action {
        TokenAction::Add {
            token,
            contract,
            balance,
        } => {
            let token = matcher.parse(&token)?;
            let contract: ContractRef = contract.parse()?;
            ledger.register_token(&token, &contract, balance).await?;
            println!("{} {}", "registered".header(), token.literal());
        }
        TokenAction::Fund { token, amount } => {
            let token = matcher.parse(&token)?;
            let balance = ledger.credit(&token, amount).await?;
            print_balance(&token, balance);
        }
        TokenAction::Show { token } => {
            let token = matcher.parse(&token)?;
            let contract = ledger.contract_ref(&token).await?;
            let balance = ledger.get_balance(&token).await?;
            println!("{} {}", "contract".header(), contract.as_str().literal());
            print_balance(&token, balance);
        }
    }

    Ok(())
}

fn print_balance(token: &Token, balance: u64) {
    let line = format!("{} {}", token.literal(), balance);
    if balance == 0 {
        println!("{} {}", "balance".header(), line.error());
    } else {
        println!("{} {}", "balance".header(), line);
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() -> HostResult<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    tracing::info!("received shutdown signal");
    Ok(())
}
