//! Model catalog.
//!
//! Maps model ids to vendor identifiers and per-million-token pricing. The
//! agent uses the pricing to grow session cost counters after every
//! completion.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Anthropic,
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: &'static str,
    pub name: &'static str,
    pub provider: ModelProvider,
    pub api_model: &'static str,
    pub cost_per_1m_in: f64,
    pub cost_per_1m_out: f64,
    pub cost_per_1m_in_cached: f64,
    pub cost_per_1m_out_cached: f64,
    pub context_window: u64,
    pub default_max_tokens: u32,
}

pub const CLAUDE_37_SONNET: Model = Model {
    id: "claude-3.7-sonnet",
    name: "Claude 3.7 Sonnet",
    provider: ModelProvider::Anthropic,
    api_model: "claude-3-7-sonnet-latest",
    cost_per_1m_in: 3.0,
    cost_per_1m_out: 15.0,
    cost_per_1m_in_cached: 3.75,
    cost_per_1m_out_cached: 0.30,
    context_window: 200_000,
    default_max_tokens: 8_192,
};

pub const CLAUDE_35_SONNET: Model = Model {
    id: "claude-3.5-sonnet",
    name: "Claude 3.5 Sonnet",
    provider: ModelProvider::Anthropic,
    api_model: "claude-3-5-sonnet-latest",
    cost_per_1m_in: 3.0,
    cost_per_1m_out: 15.0,
    cost_per_1m_in_cached: 3.75,
    cost_per_1m_out_cached: 0.30,
    context_window: 200_000,
    default_max_tokens: 8_192,
};

pub const CLAUDE_35_HAIKU: Model = Model {
    id: "claude-3.5-haiku",
    name: "Claude 3.5 Haiku",
    provider: ModelProvider::Anthropic,
    api_model: "claude-3-5-haiku-latest",
    cost_per_1m_in: 0.80,
    cost_per_1m_out: 4.0,
    cost_per_1m_in_cached: 1.0,
    cost_per_1m_out_cached: 0.08,
    context_window: 200_000,
    default_max_tokens: 4_096,
};

pub const GPT_4O: Model = Model {
    id: "gpt-4o",
    name: "GPT-4o",
    provider: ModelProvider::OpenAi,
    api_model: "gpt-4o",
    cost_per_1m_in: 2.50,
    cost_per_1m_out: 10.0,
    cost_per_1m_in_cached: 1.25,
    cost_per_1m_out_cached: 0.0,
    context_window: 128_000,
    default_max_tokens: 8_192,
};

pub const GPT_4O_MINI: Model = Model {
    id: "gpt-4o-mini",
    name: "GPT-4o mini",
    provider: ModelProvider::OpenAi,
    api_model: "gpt-4o-mini",
    cost_per_1m_in: 0.15,
    cost_per_1m_out: 0.60,
    cost_per_1m_in_cached: 0.075,
    cost_per_1m_out_cached: 0.0,
    context_window: 128_000,
    default_max_tokens: 4_096,
};

pub const SUPPORTED_MODELS: &[Model] = &[
    CLAUDE_37_SONNET,
    CLAUDE_35_SONNET,
    CLAUDE_35_HAIKU,
    GPT_4O,
    GPT_4O_MINI,
];

pub fn find(id: &str) -> Option<&'static Model> {
    SUPPORTED_MODELS.iter().find(|m| m.id == id)
}

impl Model {
    /// Dollar cost of one completion, per the vendor's per-million pricing.
    pub fn completion_cost(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        cache_creation_tokens: u64,
        cache_read_tokens: u64,
    ) -> f64 {
        self.cost_per_1m_in * input_tokens as f64 / 1e6
            + self.cost_per_1m_out * output_tokens as f64 / 1e6
            + self.cost_per_1m_in_cached * cache_creation_tokens as f64 / 1e6
            + self.cost_per_1m_out_cached * cache_read_tokens as f64 / 1e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_resolves_known_ids() {
        assert_eq!(find("claude-3.7-sonnet").unwrap().api_model, "claude-3-7-sonnet-latest");
        assert!(find("claude-9").is_none());
    }

    #[test]
    fn completion_cost_scales_per_million() {
        let cost = CLAUDE_37_SONNET.completion_cost(1_000_000, 1_000_000, 0, 0);
        assert!((cost - 18.0).abs() < 1e-9);

        let cost = CLAUDE_37_SONNET.completion_cost(100, 10, 0, 0);
        assert!((cost - (3.0 * 100.0 / 1e6 + 15.0 * 10.0 / 1e6)).abs() < 1e-12);
    }
}
