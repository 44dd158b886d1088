//! Token-based cost prediction.

use crate::config::PricingConfig;
use foreman_core::TokenBudgetHint;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price per million tokens for one model family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Price per million input tokens.
    pub input_per_million: Decimal,
    /// Price per million output tokens.
    pub output_per_million: Decimal,
}

impl ModelPrice {
    /// A price entry.
    pub fn new(input_per_million: Decimal, output_per_million: Decimal) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Predicts the cost of a run from expected token counts.
#[derive(Debug, Clone)]
pub struct CostPredictor {
    config: PricingConfig,
}

impl CostPredictor {
    /// A predictor over the given price table.
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// Price entry for `model`, falling back to the default family.
    pub fn price_for(&self, model: Option<&str>) -> Option<ModelPrice> {
        let models = &self.config.models;
        let by_name = model.and_then(|name| {
            let name = name.to_ascii_lowercase();
            models.get(&name).or_else(|| {
                models
                    .iter()
                    .find(|(family, _)| name.contains(family.as_str()))
                    .map(|(_, price)| price)
            })
        });
        by_name
            .or_else(|| models.get(&self.config.default_model))
            .copied()
    }

    /// Predicted cost including the uncertainty buffer, rounded to 6 places.
    pub fn predict(&self, input_tokens: u64, output_tokens: u64, model: Option<&str>) -> Decimal {
        let Some(price) = self.price_for(model) else {
            return Decimal::ZERO;
        };
        let million = Decimal::new(1_000_000, 0);
        let base = Decimal::from(input_tokens) * price.input_per_million / million
            + Decimal::from(output_tokens) * price.output_per_million / million;
        (base * self.config.uncertainty_buffer).round_dp(6)
    }

    /// Predicted cost for a worker's token hint.
    pub fn predict_hint(&self, hint: &TokenBudgetHint) -> Decimal {
        self.predict(hint.input_tokens, hint.output_tokens, hint.model.as_deref())
    }
}

impl Default for CostPredictor {
    fn default() -> Self {
        Self::new(PricingConfig::default())
    }
}
