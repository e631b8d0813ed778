use std::{fmt, str::FromStr};

use crate::{
    ledger::{ContractRef, MemoryLedger},
    token::{Token, TokenMatcher},
    HostError, HostResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A token to register in an in-memory ledger at startup.
///
/// ## Format
/// `TOKEN:CONTRACT:BALANCE`, e.g. `<token>:c0ffee:1000`. The token is checked against the
/// configured token pattern when the seed is registered, not when it is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSeed {
    /// The token, not yet validated.
    pub token: String,

    /// The contract the token names.
    pub contract: ContractRef,

    /// The opening balance in compute units.
    pub balance: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TokenSeed {
    /// Validates the token with `matcher` and records it in `ledger`.
    pub fn register(&self, ledger: &MemoryLedger, matcher: &TokenMatcher) -> HostResult<Token> {
        let token = matcher.parse(&self.token)?;
        ledger.register(token.clone(), self.contract.clone(), self.balance);
        tracing::info!(token = %token, contract = %self.contract, balance = self.balance, "seeded token");
        Ok(token)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for TokenSeed {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HostError::InvalidTokenSeed(s.to_string());

        let mut parts = s.split(':');
        let (Some(token), Some(contract), Some(balance), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        if token.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            token: token.to_string(),
            contract: contract.parse()?,
            balance: balance.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for TokenSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.token, self.contract, self.balance)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
