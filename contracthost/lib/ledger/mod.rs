//! The balance ledger adapter.
//!
//! The ledger maps each token to a prepaid compute balance and to the contract it names. The
//! instance manager is its only debitor; funding happens elsewhere and only ever increments.
//! Every implementation must clamp charges to the available balance and apply them atomically
//! with respect to concurrent charges and credits for the same token.

mod memory;
mod sqlite;

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{token::Token, HostError, HostResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use memory::*;
pub use sqlite::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The largest balance a ledger holds. Credits saturate here.
///
/// This is the largest SQLite INTEGER, so every ledger agrees on it.
pub const MAX_BALANCE: u64 = i64::MAX as u64;

const MAX_CONTRACT_REF_LEN: usize = 128;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The outcome of a charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    /// The amount actually taken, never more than the balance held before the charge.
    pub charged: u64,

    /// The balance left after the charge.
    pub remaining: u64,
}

/// A reference to the staged contract a token names.
///
/// The hash doubles as a directory name under the contracts directory, so a valid reference
/// is 1 to 128 ASCII letters or digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractRef(String);

/// A durable store of token balances.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Returns the balance held by `token`.
    ///
    /// Fails with [`HostError::TokenNotFound`](crate::HostError::TokenNotFound) when the
    /// ledger has no record of it.
    async fn get_balance(&self, token: &Token) -> HostResult<u64>;

    /// Takes up to `amount` from the balance of `token`, clamping at zero.
    async fn try_charge(&self, token: &Token, amount: u64) -> HostResult<Charge>;

    /// Adds `amount` to the balance of `token` and returns the new balance, saturating at
    /// [`MAX_BALANCE`].
    async fn credit(&self, token: &Token, amount: u64) -> HostResult<u64>;

    /// Returns the contract `token` names.
    async fn contract_ref(&self, token: &Token) -> HostResult<ContractRef>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Charge {
    /// Computes the clamped outcome of charging `amount` against `balance`.
    pub fn clamped(balance: u64, amount: u64) -> Self {
        let charged = balance.min(amount);
        Self {
            charged,
            remaining: balance - charged,
        }
    }

    /// Returns true if the balance could not cover the full amount or is now empty.
    pub fn exhausted(&self, requested: u64) -> bool {
        self.charged < requested || self.remaining == 0
    }
}

impl ContractRef {
    /// Creates a contract reference from its hash.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Returns the contract hash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fails with [`HostError::InvalidContractRef`] unless the hash is safe to use as a path
    /// component.
    pub fn validate(&self) -> HostResult<()> {
        let valid = !self.0.is_empty()
            && self.0.len() <= MAX_CONTRACT_REF_LEN
            && self.0.bytes().all(|b| b.is_ascii_alphanumeric());

        if valid {
            Ok(())
        } else {
            Err(HostError::InvalidContractRef(self.0.clone()))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for ContractRef {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let contract = Self::new(s);
        contract.validate()?;
        Ok(contract)
    }
}

impl Display for ContractRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
