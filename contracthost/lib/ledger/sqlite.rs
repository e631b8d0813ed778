use std::{path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::fs;

use crate::{token::Token, HostError, HostResult};

use super::{BalanceLedger, Charge, ContractRef, MAX_BALANCE};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the ledger database
pub static LEDGER_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/ledger/migrations");

const MAX_CONNECTIONS: u32 = 5;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A ledger persisted in SQLite.
///
/// Charges are a single `UPDATE ... RETURNING` statement, so concurrent charges and credits
/// for the same balance serialize in the database.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: Pool<Sqlite>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SqliteLedger {
    /// Opens the ledger at `db_path`, creating the file and running migrations as needed.
    pub async fn open(db_path: impl AsRef<Path>) -> HostResult<Self> {
        let db_path = db_path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        LEDGER_DB_MIGRATOR.run(&pool).await?;
        tracing::debug!(path = %db_path.display(), "ledger database ready");

        Ok(Self { pool })
    }

    /// Records `token` as naming `contract`, with a fresh balance.
    ///
    /// The contract record is shared with any other token naming the same hash.
    pub async fn register_token(
        &self,
        token: &Token,
        contract: &ContractRef,
        initial_balance: u64,
    ) -> HostResult<()> {
        contract.validate()?;
        let mut tx = self.pool.begin().await?;

        let contract_id = sqlx::query(
            r#"
            INSERT INTO contracts (hash)
            VALUES (?)
            ON CONFLICT(hash) DO UPDATE SET hash = excluded.hash
            RETURNING id
            "#,
        )
        .bind(contract.as_str())
        .fetch_one(&mut *tx)
        .await?
        .try_get::<i64, _>("id")?;

        let balance_id = sqlx::query(
            r#"
            INSERT INTO balances (balance)
            VALUES (?)
            RETURNING id
            "#,
        )
        .bind(to_sql_amount(initial_balance))
        .fetch_one(&mut *tx)
        .await?
        .try_get::<i64, _>("id")?;

        sqlx::query(
            r#"
            INSERT INTO tokens (token, contract_id, balance_id)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(token.as_str())
        .bind(contract_id)
        .bind(balance_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(token = %token, contract = %contract, initial_balance, "registered token");

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BalanceLedger for SqliteLedger {
    async fn get_balance(&self, token: &Token) -> HostResult<u64> {
        let record = sqlx::query(
            r#"
            SELECT b.balance
            FROM tokens t
            JOIN balances b ON b.id = t.balance_id
            WHERE t.token = ?
            "#,
        )
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HostError::TokenNotFound(token.to_string()))?;

        Ok(from_sql_amount(record.try_get("balance")?))
    }

    async fn try_charge(&self, token: &Token, amount: u64) -> HostResult<Charge> {
        // SET expressions all read the row as it was before the update.
        let record = sqlx::query(
            r#"
            UPDATE balances
            SET last_charge = MIN(balance, ?1),
                balance = balance - MIN(balance, ?1),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = (SELECT balance_id FROM tokens WHERE token = ?2)
            RETURNING balance, last_charge
            "#,
        )
        .bind(to_sql_amount(amount))
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HostError::TokenNotFound(token.to_string()))?;

        Ok(Charge {
            charged: from_sql_amount(record.try_get("last_charge")?),
            remaining: from_sql_amount(record.try_get("balance")?),
        })
    }

    async fn credit(&self, token: &Token, amount: u64) -> HostResult<u64> {
        // Saturates at the largest INTEGER; an overflowing sum would be stored as REAL.
        let record = sqlx::query(
            r#"
            UPDATE balances
            SET balance = MIN(balance, 9223372036854775807 - ?1) + ?1,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = (SELECT balance_id FROM tokens WHERE token = ?2)
            RETURNING balance
            "#,
        )
        .bind(to_sql_amount(amount))
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HostError::TokenNotFound(token.to_string()))?;

        Ok(from_sql_amount(record.try_get("balance")?))
    }

    async fn contract_ref(&self, token: &Token) -> HostResult<ContractRef> {
        let record = sqlx::query(
            r#"
            SELECT c.hash
            FROM tokens t
            JOIN contracts c ON c.id = t.contract_id
            WHERE t.token = ?
            "#,
        )
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HostError::TokenNotFound(token.to_string()))?;

        Ok(ContractRef::new(record.try_get::<String, _>("hash")?))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn to_sql_amount(amount: u64) -> i64 {
    i64::try_from(amount.min(MAX_BALANCE)).unwrap_or(i64::MAX)
}

fn from_sql_amount(amount: i64) -> u64 {
    u64::try_from(amount).unwrap_or_default()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;

    fn token(value: &str) -> Token {
        Token::new_unchecked(value)
    }

    #[tokio::test]
    async fn test_open_creates_tables() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let ledger = SqliteLedger::open(temp_dir.path().join("nested/ledger.db")).await?;

        let tables = sqlx::query("SELECT name FROM sqlite_master WHERE type='table'")
            .fetch_all(&ledger.pool)
            .await?;

        let table_names: Vec<String> = tables
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        for table in ["contracts", "balances", "tokens"] {
            assert!(
                table_names.contains(&table.to_string()),
                "{} table not found",
                table
            );
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_charge_clamps_at_zero() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let ledger = SqliteLedger::open(temp_dir.path().join("ledger.db")).await?;
        let t = token("abcd1234");
        ledger
            .register_token(&t, &ContractRef::new("c0ffee"), 5)
            .await?;

        assert_eq!(ledger.get_balance(&t).await?, 5);
        assert_eq!(
            ledger.try_charge(&t, 3).await?,
            Charge {
                charged: 3,
                remaining: 2
            }
        );
        assert_eq!(
            ledger.try_charge(&t, 3).await?,
            Charge {
                charged: 2,
                remaining: 0
            }
        );
        assert_eq!(
            ledger.try_charge(&t, 3).await?,
            Charge {
                charged: 0,
                remaining: 0
            }
        );
        assert_eq!(ledger.get_balance(&t).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_credit_and_contract_ref() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let ledger = SqliteLedger::open(temp_dir.path().join("ledger.db")).await?;
        let first = token("abcd1234");
        let second = token("efgh5678");
        let contract = ContractRef::new("c0ffee");
        ledger.register_token(&first, &contract, 0).await?;
        ledger.register_token(&second, &contract, 7).await?;

        assert_eq!(ledger.credit(&first, 1000).await?, 1000);
        assert_eq!(ledger.get_balance(&first).await?, 1000);
        assert_eq!(ledger.get_balance(&second).await?, 7);
        assert_eq!(ledger.contract_ref(&first).await?, contract);
        assert_eq!(ledger.contract_ref(&second).await?, contract);

        Ok(())
    }

    #[tokio::test]
    async fn test_credit_saturates_at_max_balance() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let ledger = SqliteLedger::open(temp_dir.path().join("ledger.db")).await?;
        let t = token("abcd1234");
        ledger
            .register_token(&t, &ContractRef::new("c0ffee"), 5)
            .await?;

        assert_eq!(ledger.credit(&t, u64::MAX).await?, MAX_BALANCE);
        assert_eq!(ledger.credit(&t, u64::MAX).await?, MAX_BALANCE);
        assert_eq!(ledger.credit(&t, 1).await?, MAX_BALANCE);
        assert_eq!(ledger.get_balance(&t).await?, MAX_BALANCE);
        assert_eq!(
            ledger.try_charge(&t, 5).await?,
            Charge {
                charged: 5,
                remaining: MAX_BALANCE - 5
            }
        );
        assert_eq!(ledger.credit(&t, 2).await?, MAX_BALANCE - 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_register_clamps_opening_balance() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let ledger = SqliteLedger::open(temp_dir.path().join("ledger.db")).await?;
        let t = token("abcd1234");
        ledger
            .register_token(&t, &ContractRef::new("c0ffee"), u64::MAX)
            .await?;

        assert_eq!(ledger.get_balance(&t).await?, MAX_BALANCE);

        Ok(())
    }

    #[tokio::test]
    async fn test_register_rejects_path_like_contract() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let ledger = SqliteLedger::open(temp_dir.path().join("ledger.db")).await?;
        let t = token("abcd1234");

        assert!(matches!(
            ledger
                .register_token(&t, &ContractRef::new("../../x"), 10)
                .await,
            Err(HostError::InvalidContractRef(_))
        ));
        assert!(matches!(
            ledger.get_balance(&t).await,
            Err(HostError::TokenNotFound(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_token() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let ledger = SqliteLedger::open(temp_dir.path().join("ledger.db")).await?;
        let t = token("missing1");

        assert!(matches!(
            ledger.get_balance(&t).await,
            Err(HostError::TokenNotFound(_))
        ));
        assert!(matches!(
            ledger.try_charge(&t, 1).await,
            Err(HostError::TokenNotFound(_))
        ));
        assert!(matches!(
            ledger.credit(&t, 1).await,
            Err(HostError::TokenNotFound(_))
        ));
        assert!(matches!(
            ledger.contract_ref(&t).await,
            Err(HostError::TokenNotFound(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_charges_never_overdraw() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let ledger = Arc::new(SqliteLedger::open(temp_dir.path().join("ledger.db")).await?);
        let t = token("abcd1234");
        ledger
            .register_token(&t, &ContractRef::new("c0ffee"), 30)
            .await?;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                let t = t.clone();
                tokio::spawn(async move { ledger.try_charge(&t, 3).await })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            total += handle.await??.charged;
        }

        assert_eq!(total, 30);
        assert_eq!(ledger.get_balance(&t).await?, 0);

        Ok(())
    }
}
