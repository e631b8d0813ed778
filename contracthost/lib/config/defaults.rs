use std::{net::IpAddr, path::PathBuf, sync::LazyLock};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default public TLS port.
pub const DEFAULT_PORT: u16 = 2633;

/// The default period of the metering tick in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// The default billing rate: milliseconds of wall-clock time per compute unit.
pub const DEFAULT_MILLISECONDS_PER_COMPUTE_UNIT: u64 = 100;

/// The default time an instance may go without any byte transferred before it is torn down.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// The default time a freshly started sandbox has to accept its first stream.
pub const DEFAULT_SANDBOX_STARTUP_TIMEOUT_MS: u64 = 10_000;

/// The default token format: 32 random bytes in unpadded lowercase base32.
///
/// The fixed length keeps ordinary host names such as `localhost` off the contract path.
pub const DEFAULT_TOKEN_PATTERN: &str = "^[a-z2-7]{52}$";

/// The amount credited by the development funding route when none is given.
pub const DEFAULT_FUNDING_AMOUNT: u64 = 1000;

/// The environment variable holding the path to the configuration file.
pub const CONFIG_PATH_ENV_VAR: &str = "CONTRACTHOST_CONFIG";

/// The default address the public listener binds to.
pub static DEFAULT_BIND_ADDR: LazyLock<IpAddr> =
    LazyLock::new(|| IpAddr::from([0, 0, 0, 0]));

/// The default location of the balance ledger database.
pub static DEFAULT_DATABASE_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("contracthost.db"));

/// The default directory holding staged contracts, one sub directory per contract hash.
pub static DEFAULT_CONTRACTS_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("contracts"));

/// The default directory for sandbox sockets.
pub static DEFAULT_RUNTIME_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| std::env::temp_dir().join("contracthost"));
