use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a contracthost-related operation.
pub type HostResult<T> = Result<T, HostError>;

/// An error that occurred while routing, metering or supervising contract instances.
#[derive(pretty_error_debug::Debug, Error)]
pub enum HostError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A contract reference is not a plain content hash.
    #[error("invalid contract reference: {0}")]
    InvalidContractRef(String),

    /// A `TOKEN:CONTRACT:BALANCE` seed could not be parsed.
    #[error("invalid token seed: {0}")]
    InvalidTokenSeed(String),

    /// The ledger has no record of the token.
    #[error("token not found: {0}")]
    TokenNotFound(String),

    /// The token's balance cannot pay for any compute.
    #[error("insufficient balance for token: {0}")]
    InsufficientBalance(String),

    /// The sandbox engine could not start an instance.
    #[error("sandbox start failed: {0}")]
    SandboxStartFailed(String),

    /// The sandbox process exited while it was still expected to serve.
    #[error("sandbox crashed: {0}")]
    SandboxCrashed(String),

    /// The instance was terminated before the operation could complete.
    #[error("instance terminated: {0}")]
    InstanceTerminated(String),

    /// The listener or its TLS material could not be set up.
    #[error("listener failure: {0}")]
    ListenerFailure(String),

    /// A string does not have the token format.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An error that occurred while parsing the configuration file.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// An error that occurred during a database operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error that occurred while running database migrations.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error that occurred while compiling the token pattern.
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}
