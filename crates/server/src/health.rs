use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use boardwright_db::DbPool;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone)]
struct HealthChecks {
    db_pool: DbPool,
    model: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    Ready,
    Degraded,
}

#[derive(Debug, Serialize)]
pub struct Check {
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: Readiness,
    pub model: String,
    pub checks: BTreeMap<&'static str, Check>,
    pub checked_at: DateTime<Utc>,
}

pub fn router(db_pool: DbPool, model: impl Into<String>) -> Router {
    let checks = HealthChecks { db_pool, model: model.into() };
    Router::new().route("/health", get(health)).with_state(checks)
}

/// 200 when the pool answers and the schema is migrated, 503 otherwise.
async fn health(State(checks): State<HealthChecks>) -> (StatusCode, Json<HealthReport>) {
    let report = checks.run().await;
    let code = match report.status {
        Readiness::Ready => StatusCode::OK,
        Readiness::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

impl HealthChecks {
    async fn run(&self) -> HealthReport {
        let mut checks = BTreeMap::new();

        checks.insert(
            "database",
            match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&self.db_pool).await {
                Ok(_) => Check { ok: true, detail: "pool answered".to_string() },
                Err(error) => Check { ok: false, detail: error.to_string() },
            },
        );
        checks.insert(
            "schema",
            match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM skill")
                .fetch_one(&self.db_pool)
                .await
            {
                Ok(count) => Check { ok: true, detail: format!("{count} skill(s) registered") },
                Err(error) => Check {
                    ok: false,
                    detail: format!("skill table unavailable, run `boardwright migrate`: {error}"),
                },
            },
        );

        let status = if checks.values().all(|check| check.ok) {
            Readiness::Ready
        } else {
            Readiness::Degraded
        };
        HealthReport { status, model: self.model.clone(), checks, checked_at: Utc::now() }
    }
}
