use super::models::*;
use super::store::{deadline_secs, IncomeStore, IncomeTransaction};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;
use sqlx::{prelude::FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use std::time::Duration;

const INCOME_COLUMNS: &str = "id, sender_node, subtask_id, payer_address, value_expected, \
     value_received, transaction_ref, accepted_ts, settled_ts, overdue, created_at";

/// PostgreSQL-backed ledger store
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct IncomeRow {
    id: i64,
    sender_node: String,
    subtask_id: String,
    payer_address: String,
    value_expected: BigDecimal,
    value_received: BigDecimal,
    transaction_ref: Option<String>,
    accepted_ts: Option<i64>,
    settled_ts: Option<i64>,
    overdue: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<IncomeRow> for Income {
    type Error = AppError;

    fn try_from(row: IncomeRow) -> AppResult<Self> {
        Ok(Income {
            id: row.id,
            sender_node: row.sender_node,
            subtask_id: row.subtask_id,
            payer_address: row.payer_address,
            value_expected: from_numeric(&row.value_expected)?,
            value_received: from_numeric(&row.value_received)?,
            transaction_ref: row.transaction_ref,
            accepted_ts: row.accepted_ts,
            settled_ts: row.settled_ts,
            overdue: row.overdue,
            created_ts: row.created_at,
        })
    }
}

fn from_numeric(value: &BigDecimal) -> AppResult<u128> {
    value
        .with_scale(0)
        .to_string()
        .parse()
        .map_err(|_| AppError::Internal(format!("Amount out of range: {}", value)))
}

fn to_numeric(value: u128) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| AppError::Internal(format!("Amount conversion failed: {}", e)))
}

fn into_incomes(rows: Vec<IncomeRow>) -> AppResult<Vec<Income>> {
    rows.into_iter().map(Income::try_from).collect()
}

#[async_trait]
impl IncomeStore for LedgerRepository {
    async fn begin(&self) -> AppResult<Box<dyn IncomeTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgIncomeTransaction { tx: Some(tx) }))
    }

    async fn list_all(&self) -> AppResult<Vec<Income>> {
        // TODO: pagination once the income listing grows past a few thousand rows
        let rows = sqlx::query_as::<_, IncomeRow>(&format!(
            "SELECT {} FROM incomes ORDER BY created_at DESC, id DESC",
            INCOME_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        into_incomes(rows)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// One database transaction; selected rows stay locked until commit or drop
struct PgIncomeTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgIncomeTransaction {
    fn tx(&mut self) -> AppResult<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| AppError::Internal("transaction used after commit".to_string()))
    }
}

#[async_trait]
impl IncomeTransaction for PgIncomeTransaction {
    async fn insert(&mut self, income: NewIncome) -> AppResult<Income> {
        let value_expected = to_numeric(income.value_expected)?;
        let tx = self.tx()?;
        let row = sqlx::query_as::<_, IncomeRow>(&format!(
            r#"
            INSERT INTO incomes (sender_node, subtask_id, payer_address, value_expected)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            INCOME_COLUMNS
        ))
        .bind(&income.sender_node)
        .bind(&income.subtask_id)
        .bind(&income.payer_address)
        .bind(value_expected)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            AppError::from_insert(
                e,
                format!(
                    "income for subtask {} from payer {} already exists",
                    income.subtask_id, income.payer_address
                ),
            )
        })?;

        row.try_into()
    }

    async fn by_payer_and_window(
        &mut self,
        payer_address: &str,
        closure_time: i64,
    ) -> AppResult<Vec<Income>> {
        let tx = self.tx()?;
        let rows = sqlx::query_as::<_, IncomeRow>(&format!(
            r#"
            SELECT {}
            FROM incomes
            WHERE payer_address = $1
              AND accepted_ts IS NOT NULL
              AND accepted_ts <= $2
              AND transaction_ref IS NULL
              AND settled_ts IS NULL
            ORDER BY created_at ASC, id ASC
            FOR UPDATE
            "#,
            INCOME_COLUMNS
        ))
        .bind(payer_address)
        .bind(closure_time)
        .fetch_all(&mut **tx)
        .await?;

        into_incomes(rows)
    }

    async fn by_payer_and_subtask(
        &mut self,
        payer_address: &str,
        subtask_id: &str,
    ) -> AppResult<Option<Income>> {
        let tx = self.tx()?;
        let row = sqlx::query_as::<_, IncomeRow>(&format!(
            r#"
            SELECT {}
            FROM incomes
            WHERE payer_address = $1 AND subtask_id = $2
            FOR UPDATE
            "#,
            INCOME_COLUMNS
        ))
        .bind(payer_address)
        .bind(subtask_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Income::try_from).transpose()
    }

    async fn by_sender_and_subtask(
        &mut self,
        sender_node: &str,
        subtask_id: &str,
    ) -> AppResult<Option<Income>> {
        let tx = self.tx()?;
        let row = sqlx::query_as::<_, IncomeRow>(&format!(
            r#"
            SELECT {}
            FROM incomes
            WHERE sender_node = $1 AND subtask_id = $2
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE
            "#,
            INCOME_COLUMNS
        ))
        .bind(sender_node)
        .bind(subtask_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Income::try_from).transpose()
    }

    async fn pending_by_sender_and_subtask(
        &mut self,
        sender_node: &str,
        subtask_id: &str,
    ) -> AppResult<Option<Income>> {
        let tx = self.tx()?;
        let row = sqlx::query_as::<_, IncomeRow>(&format!(
            r#"
            SELECT {}
            FROM incomes
            WHERE sender_node = $1
              AND subtask_id = $2
              AND accepted_ts IS NULL
              AND overdue = FALSE
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE
            "#,
            INCOME_COLUMNS
        ))
        .bind(sender_node)
        .bind(subtask_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Income::try_from).transpose()
    }

    async fn pending_overdue_candidates(
        &mut self,
        now: DateTime<Utc>,
        deadline: Duration,
    ) -> AppResult<Vec<Income>> {
        let accepted_deadline = now.timestamp().saturating_sub(deadline_secs(deadline));
        let created_deadline = chrono::Duration::from_std(deadline)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or_default();

        let tx = self.tx()?;
        let rows = sqlx::query_as::<_, IncomeRow>(&format!(
            r#"
            SELECT {}
            FROM incomes
            WHERE overdue = FALSE
              AND transaction_ref IS NULL
              AND (
                (accepted_ts IS NOT NULL AND accepted_ts < $1)
                OR (accepted_ts IS NULL AND created_at < $2)
              )
            ORDER BY created_at ASC, id ASC
            FOR UPDATE
            "#,
            INCOME_COLUMNS
        ))
        .bind(accepted_deadline)
        .bind(created_deadline)
        .fetch_all(&mut **tx)
        .await?;

        into_incomes(rows)
    }

    async fn save(&mut self, income: &Income) -> AppResult<()> {
        let value_expected = to_numeric(income.value_expected)?;
        let value_received = to_numeric(income.value_received)?;
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            UPDATE incomes
            SET value_expected = $2,
                value_received = $3,
                transaction_ref = $4,
                accepted_ts = $5,
                settled_ts = $6,
                overdue = $7
            WHERE id = $1
            "#,
        )
        .bind(income.id)
        .bind(value_expected)
        .bind(value_received)
        .bind(&income.transaction_ref)
        .bind(income.accepted_ts)
        .bind(income.settled_ts)
        .bind(income.overdue)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Internal(format!(
                "income {} vanished inside its transaction",
                income.id
            )));
        }

        Ok(())
    }

    async fn delete(&mut self, id: i64) -> AppResult<()> {
        let tx = self.tx()?;
        sqlx::query("DELETE FROM incomes WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| AppError::Internal("transaction already committed".to_string()))?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversion_keeps_full_precision() {
        let wei = 1_000_000_000_000_000_000_000_000u128;
        let numeric = to_numeric(wei).unwrap();
        assert_eq!(from_numeric(&numeric).unwrap(), wei);
        assert_eq!(from_numeric(&to_numeric(u128::MAX).unwrap()).unwrap(), u128::MAX);
    }

    #[test]
    fn test_negative_numeric_is_rejected() {
        let negative = BigDecimal::from_str("-5").unwrap();
        assert!(from_numeric(&negative).is_err());
    }
}
