use rust_decimal::Decimal;

use boardwright_core::config::LlmConfig;
use boardwright_core::domain::task::UsageTotals;

use crate::llm::TokenUsage;

const TOKENS_PER_MILLION: i64 = 1_000_000;

/// Dollar rates per million tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_per_mtok: Decimal,
    pub output_per_mtok: Decimal,
}

impl ModelPricing {
    pub fn new(input_per_mtok: Decimal, output_per_mtok: Decimal) -> Self {
        Self { input_per_mtok, output_per_mtok }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.input_cost_per_mtok, config.output_cost_per_mtok)
    }

    pub fn cost(&self, usage: TokenUsage) -> Decimal {
        let input = Decimal::from(usage.input_tokens) * self.input_per_mtok;
        let output = Decimal::from(usage.output_tokens) * self.output_per_mtok;
        (input + output) / Decimal::from(TOKENS_PER_MILLION)
    }
}

/// Running totals for one task. Seeded from the persisted totals on resume, so counters
/// only ever grow across suspensions.
#[derive(Clone, Debug, Default)]
pub struct UsageAccumulator {
    totals: UsageTotals,
    pricing: ModelPricing,
}

impl UsageAccumulator {
    pub fn new(pricing: ModelPricing) -> Self {
        Self { totals: UsageTotals::default(), pricing }
    }

    pub fn resume(totals: UsageTotals, pricing: ModelPricing) -> Self {
        Self { totals, pricing }
    }

    /// Adds one model call and returns its cost.
    pub fn record_model_call(&mut self, usage: TokenUsage) -> Decimal {
        let cost = self.pricing.cost(usage);
        self.totals.input_tokens = self.totals.input_tokens.saturating_add(usage.input_tokens);
        self.totals.output_tokens = self.totals.output_tokens.saturating_add(usage.output_tokens);
        self.totals.cost_usd += cost;
        cost
    }

    pub fn record_tool_call(&mut self) {
        self.totals.tool_call_count = self.totals.tool_call_count.saturating_add(1);
    }

    pub fn totals(&self) -> &UsageTotals {
        &self.totals
    }
}
