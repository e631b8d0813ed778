use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use crate::{token::Token, HostError, HostResult};

use super::{BalanceLedger, Charge, ContractRef, MAX_BALANCE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-process ledger. Balances do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    accounts: Mutex<HashMap<Token, Account>>,
}

#[derive(Debug)]
struct Account {
    contract: ContractRef,
    balance: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `token` as naming `contract` with an opening balance.
    pub fn register(&self, token: Token, contract: ContractRef, balance: u64) {
        let balance = balance.min(MAX_BALANCE);
        self.accounts()
            .insert(token, Account { contract, balance });
    }

    /// Drops the record of `token`.
    pub fn revoke(&self, token: &Token) {
        self.accounts().remove(token);
    }

    fn accounts(&self) -> MutexGuard<'_, HashMap<Token, Account>> {
        self.accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BalanceLedger for MemoryLedger {
    async fn get_balance(&self, token: &Token) -> HostResult<u64> {
        self.accounts()
            .get(token)
            .map(|account| account.balance)
            .ok_or_else(|| HostError::TokenNotFound(token.to_string()))
    }

    async fn try_charge(&self, token: &Token, amount: u64) -> HostResult<Charge> {
        let mut accounts = self.accounts();
        let account = accounts
            .get_mut(token)
            .ok_or_else(|| HostError::TokenNotFound(token.to_string()))?;

        let charge = Charge::clamped(account.balance, amount);
        account.balance = charge.remaining;
        Ok(charge)
    }

    async fn credit(&self, token: &Token, amount: u64) -> HostResult<u64> {
        let mut accounts = self.accounts();
        let account = accounts
            .get_mut(token)
            .ok_or_else(|| HostError::TokenNotFound(token.to_string()))?;

        account.balance = account.balance.saturating_add(amount).min(MAX_BALANCE);
        Ok(account.balance)
    }

    async fn contract_ref(&self, token: &Token) -> HostResult<ContractRef> {
        self.accounts()
            .get(token)
            .map(|account| account.contract.clone())
            .ok_or_else(|| HostError::TokenNotFound(token.to_string()))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
