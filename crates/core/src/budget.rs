use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::task::{TaskId, UserId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BudgetDecision {
    Allow,
    Deny { reason: String },
}

/// Pre-call authorization for one model invocation.
#[async_trait]
pub trait BudgetGate: Send + Sync {
    async fn check(&self, user_id: &UserId, task_id: &TaskId) -> Result<BudgetDecision>;
}

/// Receives one record per model call. Delivery of alerts is someone else's concern.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Decimal,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        task_id: TaskId,
        user_id: UserId,
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            user_id,
            model: model.into(),
            input_tokens,
            output_tokens,
            cost_usd,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UnlimitedBudget;

#[async_trait]
impl BudgetGate for UnlimitedBudget {
    async fn check(&self, _user_id: &UserId, _task_id: &TaskId) -> Result<BudgetDecision> {
        Ok(BudgetDecision::Allow)
    }
}

/// Start of the calendar month containing `now`, which is the spend window for ceilings.
pub fn spend_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0).single().unwrap_or(now)
}

pub fn ceiling_decision(spent: Decimal, ceiling: Option<Decimal>) -> BudgetDecision {
    match ceiling {
        Some(ceiling) if spent >= ceiling => BudgetDecision::Deny {
            reason: format!(
                "monthly AI budget exhausted: spent ${} of ${} ceiling",
                spent.round_dp(4),
                ceiling.round_dp(2)
            ),
        },
        _ => BudgetDecision::Allow,
    }
}

#[derive(Clone, Default)]
pub struct InMemoryUsageLedger {
    records: Arc<Mutex<Vec<UsageRecord>>>,
    ceiling_usd: Option<Decimal>,
}

impl InMemoryUsageLedger {
    pub fn with_ceiling(ceiling_usd: Decimal) -> Self {
        Self { records: Arc::default(), ceiling_usd: Some(ceiling_usd) }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn spent_by(&self, user_id: &UserId, since: DateTime<Utc>) -> Decimal {
        self.records()
            .iter()
            .filter(|record| &record.user_id == user_id && record.recorded_at >= since)
            .map(|record| record.cost_usd)
            .sum()
    }
}

#[async_trait]
impl UsageSink for InMemoryUsageLedger {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
        Ok(())
    }
}

#[async_trait]
impl BudgetGate for InMemoryUsageLedger {
    async fn check(&self, user_id: &UserId, _task_id: &TaskId) -> Result<BudgetDecision> {
        let spent = self.spent_by(user_id, spend_window_start(Utc::now()));
        Ok(ceiling_decision(spent, self.ceiling_usd))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{
        ceiling_decision, spend_window_start, BudgetDecision, BudgetGate, InMemoryUsageLedger,
        UsageRecord, UsageSink,
    };
    use crate::domain::task::{TaskId, UserId};

    #[tokio::test]
    async fn ledger_denies_once_ceiling_is_reached() {
        let ledger = InMemoryUsageLedger::with_ceiling(Decimal::new(50, 2));
        let user = UserId("user-1".to_string());
        let task = TaskId("task-1".to_string());

        assert_eq!(ledger.check(&user, &task).await.expect("check"), BudgetDecision::Allow);

        ledger
            .record(UsageRecord::new(
                task.clone(),
                user.clone(),
                "claude-sonnet",
                10_000,
                2_000,
                Decimal::new(60, 2),
            ))
            .await
            .expect("record usage");

        let decision = ledger.check(&user, &task).await.expect("check");
        assert!(matches!(
            decision,
            BudgetDecision::Deny { ref reason } if reason.contains("exhausted")
        ));

        let other_user = UserId("user-2".to_string());
        assert_eq!(ledger.check(&other_user, &task).await.expect("check"), BudgetDecision::Allow);
    }

    #[test]
    fn no_ceiling_always_allows() {
        assert_eq!(ceiling_decision(Decimal::new(1_000_000, 0), None), BudgetDecision::Allow);
    }

    #[test]
    fn spend_window_starts_at_first_of_month() {
        let now = Utc.with_ymd_and_hms(2026, 3, 17, 15, 4, 5).single().expect("valid date");
        let start = spend_window_start(now);

        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("valid date"));
    }
}
