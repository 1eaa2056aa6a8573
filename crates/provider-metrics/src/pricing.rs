use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::TokenUsage;

const TOKENS_PER_UNIT: f64 = 1_000_000.0;
const DEFAULT_MODEL: &str = "default";

/// Price in currency units per million tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

impl ModelPricing {
    pub const FREE: ModelPricing = ModelPricing {
        input: 0.0,
        output: 0.0,
    };

    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 * self.input + usage.completion_tokens as f64 * self.output)
            / TOKENS_PER_UNIT
    }
}

const BUILTIN_PRICING: &[(&str, &str, ModelPricing)] = &[
    ("openai", "gpt-4", ModelPricing::new(30.0, 60.0)),
    ("openai", "gpt-4-turbo", ModelPricing::new(10.0, 30.0)),
    ("openai", "gpt-4o", ModelPricing::new(5.0, 15.0)),
    ("openai", "gpt-4o-mini", ModelPricing::new(0.15, 0.6)),
    ("openai", "gpt-3.5-turbo", ModelPricing::new(0.5, 1.5)),
    ("openai", "text-embedding-3-small", ModelPricing::new(0.02, 0.0)),
    ("openai", "text-embedding-3-large", ModelPricing::new(0.13, 0.0)),
    ("openai", DEFAULT_MODEL, ModelPricing::FREE),
    ("anthropic", "claude-3-opus", ModelPricing::new(15.0, 75.0)),
    ("anthropic", "claude-3-sonnet", ModelPricing::new(3.0, 15.0)),
    ("anthropic", "claude-3-5-sonnet", ModelPricing::new(3.0, 15.0)),
    ("anthropic", "claude-3-haiku", ModelPricing::new(0.25, 1.25)),
    ("anthropic", DEFAULT_MODEL, ModelPricing::FREE),
    ("llama.cpp", DEFAULT_MODEL, ModelPricing::FREE),
    ("ollama", DEFAULT_MODEL, ModelPricing::FREE),
    ("local", DEFAULT_MODEL, ModelPricing::FREE),
];

/// `provider -> model -> pricing` lookup with per-provider `default` fallbacks.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: HashMap<String, HashMap<String, ModelPricing>>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut entries: HashMap<String, HashMap<String, ModelPricing>> = HashMap::new();
        for (provider, model, pricing) in BUILTIN_PRICING {
            entries
                .entry((*provider).to_string())
                .or_default()
                .insert((*model).to_string(), *pricing);
        }
        Self { entries }
    }
}

impl PricingTable {
    pub fn with_overrides(overrides: &HashMap<String, HashMap<String, ModelPricing>>) -> Self {
        let mut table = Self::default();
        for (provider, models) in overrides {
            for (model, pricing) in models {
                table.insert(provider.clone(), model.clone(), *pricing);
            }
        }
        table
    }

    pub fn insert(&mut self, provider: impl Into<String>, model: impl Into<String>, pricing: ModelPricing) {
        let models = self.entries.entry(provider.into()).or_default();
        models.entry(DEFAULT_MODEL.to_string()).or_insert(ModelPricing::FREE);
        models.insert(model.into(), pricing);
    }

    /// Exact model entry, else the provider's `default`, else free.
    pub fn lookup(&self, provider: &str, model: &str) -> ModelPricing {
        self.entries
            .get(provider)
            .and_then(|models| models.get(model).or_else(|| models.get(DEFAULT_MODEL)))
            .copied()
            .unwrap_or(ModelPricing::FREE)
    }

    pub fn cost(&self, provider: &str, model: &str, usage: &TokenUsage) -> f64 {
        self.lookup(provider, model).cost(usage)
    }
}
