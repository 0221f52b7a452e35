/// Static model pricing: maps a model identifier to per-token USD rates.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Costs are reported with this many decimal places.
pub const USD_PRECISION: i32 = 6;

/// Round a USD amount to [`USD_PRECISION`] places.
pub fn round_usd(amount: f64) -> f64 {
    let scale = 10f64.powi(USD_PRECISION);
    (amount * scale).round() / scale
}

/// Input/output rates, expressed per million tokens as vendors publish them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelRate {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn input_per_token(&self) -> f64 {
        self.input_per_mtok / 1_000_000.0
    }

    pub fn output_per_token(&self) -> f64 {
        self.output_per_mtok / 1_000_000.0
    }
}

const BUILTIN_RATES: &[(&str, ModelRate)] = &[
    ("claude-opus-4", ModelRate::new(15.0, 75.0)),
    ("claude-sonnet-4", ModelRate::new(3.0, 15.0)),
    ("claude-haiku-4", ModelRate::new(1.0, 5.0)),
    ("claude-3-7-sonnet", ModelRate::new(3.0, 15.0)),
    ("claude-3-5-sonnet", ModelRate::new(3.0, 15.0)),
    ("claude-3-5-haiku", ModelRate::new(0.8, 4.0)),
    ("claude-3-opus", ModelRate::new(15.0, 75.0)),
    ("opus", ModelRate::new(15.0, 75.0)),
    ("sonnet", ModelRate::new(3.0, 15.0)),
    ("haiku", ModelRate::new(0.8, 4.0)),
    ("gpt-4o", ModelRate::new(2.5, 10.0)),
    ("gpt-4o-mini", ModelRate::new(0.15, 0.6)),
];

/// Rate used for models the table does not know about.
pub const DEFAULT_RATE: ModelRate = ModelRate::new(3.0, 15.0);

/// Lookup table from model id (or id prefix) to rates.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    rates: BTreeMap<String, ModelRate>,
    default_rate: ModelRate,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PricingTable {
    /// The table compiled into the crate.
    pub fn builtin() -> Self {
        Self {
            rates: BUILTIN_RATES
                .iter()
                .map(|(model, rate)| (model.to_string(), *rate))
                .collect(),
            default_rate: DEFAULT_RATE,
        }
    }

    /// Layer configured rates on top of the current table.
    pub fn with_overrides(
        mut self,
        default_rate: Option<ModelRate>,
        models: &BTreeMap<String, ModelRate>,
    ) -> Self {
        if let Some(rate) = default_rate {
            self.default_rate = rate;
        }
        for (model, rate) in models {
            self.rates.insert(model.clone(), *rate);
        }
        self
    }

    pub fn default_rate(&self) -> ModelRate {
        self.default_rate
    }

    /// Resolve rates for `model`: exact match first, then the longest known
    /// prefix (so dated ids like `claude-sonnet-4-20250514` resolve), then
    /// the default rate.
    pub fn rate_for(&self, model: &str) -> ModelRate {
        self.lookup(model).unwrap_or(self.default_rate)
    }

    pub fn is_known(&self, model: &str) -> bool {
        self.lookup(model).is_some()
    }

    fn lookup(&self, model: &str) -> Option<ModelRate> {
        let model = model.trim();
        if let Some(rate) = self.rates.get(model) {
            return Some(*rate);
        }
        self.rates
            .iter()
            .filter(|(known, _)| model.starts_with(known.as_str()))
            .max_by_key(|(known, _)| known.len())
            .map(|(_, rate)| *rate)
    }
}
