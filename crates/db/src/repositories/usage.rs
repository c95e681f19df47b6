use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::Row;

use boardwright_core::budget::{
    ceiling_decision, spend_window_start, BudgetDecision, BudgetGate, UsageRecord, UsageSink,
};
use boardwright_core::domain::task::{TaskId, UserId};

use super::{to_i64, RepositoryError};
use crate::DbPool;

/// Usage ledger backed by `usage_record`. Doubles as the budget gate: a user is denied once
/// their spend in the current calendar month reaches the ceiling.
pub struct SqlUsageLedger {
    pool: DbPool,
    ceiling_usd: Option<Decimal>,
}

impl SqlUsageLedger {
    pub fn new(pool: DbPool, ceiling_usd: Option<Decimal>) -> Self {
        Self { pool, ceiling_usd }
    }

    pub async fn insert(&self, record: &UsageRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO usage_record (
                id, task_id, user_id, model, input_tokens, output_tokens, cost_usd, recorded_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.task_id.0)
        .bind(&record.user_id.0)
        .bind(&record.model)
        .bind(to_i64("input_tokens", record.input_tokens)?)
        .bind(to_i64("output_tokens", record.output_tokens)?)
        .bind(record.cost_usd.to_string())
        .bind(record.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn spent_since(
        &self,
        user_id: &UserId,
        since: chrono::DateTime<Utc>,
    ) -> Result<Decimal, RepositoryError> {
        let rows = sqlx::query(
            "SELECT cost_usd FROM usage_record WHERE user_id = ? AND recorded_at >= ?",
        )
        .bind(&user_id.0)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().try_fold(Decimal::ZERO, |total, row| {
            let raw = row.try_get::<String, _>("cost_usd")?;
            let cost = Decimal::from_str(&raw).map_err(|error| {
                RepositoryError::Decode(format!("invalid cost_usd `{raw}`: {error}"))
            })?;
            Ok(total + cost)
        })
    }
}

#[async_trait]
impl UsageSink for SqlUsageLedger {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        self.insert(&record).await.context("failed to persist usage record")
    }
}

#[async_trait]
impl BudgetGate for SqlUsageLedger {
    async fn check(&self, user_id: &UserId, _task_id: &TaskId) -> anyhow::Result<BudgetDecision> {
        if self.ceiling_usd.is_none() {
            return Ok(BudgetDecision::Allow);
        }

        let spent = self
            .spent_since(user_id, spend_window_start(Utc::now()))
            .await
            .context("failed to load monthly spend")?;
        Ok(ceiling_decision(spent, self.ceiling_usd))
    }
}
