//! Usage accounting derived from the agent's `result` events.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::protocol::ModelUsage;
use crate::protocol::ResultEvent;

const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Fixed prefix → display-name table. Longest match wins, so more specific
/// versions come first.
const MODEL_DISPLAY_NAMES: &[(&str, &str)] = &[
    ("claude-opus-4-5", "Opus 4.5"),
    ("claude-opus-4-1", "Opus 4.1"),
    ("claude-opus-4", "Opus 4"),
    ("claude-sonnet-4-5", "Sonnet 4.5"),
    ("claude-sonnet-4", "Sonnet 4"),
    ("claude-haiku-4-5", "Haiku 4.5"),
    ("claude-3-7-sonnet", "Sonnet 3.7"),
    ("claude-3-5-sonnet", "Sonnet 3.5"),
    ("claude-3-5-haiku", "Haiku 3.5"),
];

pub fn model_display_name(model_id: &str) -> String {
    for (prefix, display) in MODEL_DISPLAY_NAMES {
        if model_id.starts_with(prefix) {
            return (*display).to_string();
        }
    }
    model_id.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub primary_model: String,
    pub model_display_name: String,
    pub context_window_size: u64,
    /// Tokens currently occupying the context window.
    pub context_tokens: u64,
    /// Cumulative tokens across all models and turns.
    pub total_tokens_used: u64,
    pub total_cost_usd: f64,
    pub per_model: BTreeMap<String, ModelTokens>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTokens {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cost_usd: f64,
}

impl UsageStats {
    /// Context occupancy in percent, clamped to 100.
    pub fn context_percent(&self) -> u64 {
        if self.context_window_size == 0 {
            return 0;
        }
        (self.context_tokens * 100 / self.context_window_size).min(100)
    }
}

fn primary_model<'a>(
    model_usage: &'a std::collections::HashMap<String, ModelUsage>,
) -> Option<(&'a String, &'a ModelUsage)> {
    model_usage
        .iter()
        .max_by(|a, b| a.1.cost_usd.total_cmp(&b.1.cost_usd))
}

/// Fold one `result` event into the session's stats. Returns `true` if this
/// was the first result (callers start the header refresh timer then).
pub fn apply_result(stats: &mut Option<UsageStats>, result: &ResultEvent) -> bool {
    let first = stats.is_none();
    let stats = stats.get_or_insert_with(UsageStats::default);

    if let Some(cost) = result.total_cost_usd {
        stats.total_cost_usd = cost;
    }

    let empty = std::collections::HashMap::new();
    let model_usage = result.model_usage.as_ref().unwrap_or(&empty);

    if let Some((model, usage)) = primary_model(model_usage) {
        stats.primary_model = model.clone();
        stats.model_display_name = model_display_name(model);
        stats.context_window_size = usage.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW);
    } else if stats.context_window_size == 0 {
        stats.context_window_size = DEFAULT_CONTEXT_WINDOW;
    }

    stats.context_tokens = match &result.usage {
        Some(u) => u.input_tokens + u.cache_creation_input_tokens + u.cache_read_input_tokens,
        None => {
            // Fall back to the primary model's view of the context.
            model_usage
                .get(&stats.primary_model)
                .map(|m| m.input_tokens + m.cache_read_input_tokens)
                .unwrap_or(stats.context_tokens)
        }
    };

    stats.total_tokens_used = model_usage
        .values()
        .map(|m| {
            m.input_tokens + m.output_tokens + m.cache_read_input_tokens
                + m.cache_creation_input_tokens
        })
        .sum();

    stats.per_model = model_usage
        .iter()
        .map(|(model, m)| {
            (
                model.clone(),
                ModelTokens {
                    input_tokens: m.input_tokens,
                    output_tokens: m.output_tokens,
                    cache_read_input_tokens: m.cache_read_input_tokens,
                    cache_creation_input_tokens: m.cache_creation_input_tokens,
                    cost_usd: m.cost_usd,
                },
            )
        })
        .collect();

    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn result_event(v: serde_json::Value) -> ResultEvent {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn display_names() {
        assert_eq!(model_display_name("claude-opus-4-5-20251101"), "Opus 4.5");
        assert_eq!(model_display_name("claude-sonnet-4-20250514"), "Sonnet 4");
        assert_eq!(model_display_name("claude-3-5-haiku-20241022"), "Haiku 3.5");
        assert_eq!(model_display_name("gpt-x"), "gpt-x");
    }

    #[test]
    fn first_result_populates_stats() {
        let mut stats = None;
        let first = apply_result(
            &mut stats,
            &result_event(json!({
                "total_cost_usd": 0.25,
                "usage": {
                    "input_tokens": 100,
                    "cache_creation_input_tokens": 200,
                    "cache_read_input_tokens": 700,
                    "output_tokens": 50
                },
                "modelUsage": {
                    "claude-opus-4-5-20251101": {
                        "inputTokens": 100, "outputTokens": 50,
                        "cacheReadInputTokens": 700, "cacheCreationInputTokens": 200,
                        "costUSD": 0.2, "contextWindow": 200000
                    },
                    "claude-3-5-haiku-20241022": {
                        "inputTokens": 10, "outputTokens": 5,
                        "cacheReadInputTokens": 0, "cacheCreationInputTokens": 0,
                        "costUSD": 0.05
                    }
                }
            })),
        );
        assert!(first);
        let stats = stats.unwrap();
        assert_eq!(stats.primary_model, "claude-opus-4-5-20251101");
        assert_eq!(stats.model_display_name, "Opus 4.5");
        assert_eq!(stats.context_tokens, 1000);
        assert_eq!(stats.total_tokens_used, 100 + 50 + 700 + 200 + 10 + 5);
        assert_eq!(stats.total_cost_usd, 0.25);
        assert_eq!(stats.context_window_size, 200000);
        assert_eq!(stats.per_model.len(), 2);
    }

    #[test]
    fn second_result_is_not_first() {
        let mut stats = None;
        assert!(apply_result(&mut stats, &ResultEvent::default()));
        assert!(!apply_result(&mut stats, &ResultEvent::default()));
    }

    #[test]
    fn missing_usage_falls_back_to_primary_model() {
        let mut stats = None;
        apply_result(
            &mut stats,
            &result_event(json!({
                "modelUsage": {
                    "claude-sonnet-4-5-20250929": {
                        "inputTokens": 40, "outputTokens": 1,
                        "cacheReadInputTokens": 60, "cacheCreationInputTokens": 7,
                        "costUSD": 0.1
                    }
                }
            })),
        );
        let stats = stats.unwrap();
        // inputTokens + cacheReadInputTokens, per the fallback rule.
        assert_eq!(stats.context_tokens, 100);
        assert_eq!(stats.context_window_size, DEFAULT_CONTEXT_WINDOW);
    }

    #[test]
    fn context_percent_clamps() {
        let stats = UsageStats {
            context_window_size: 1000,
            context_tokens: 2500,
            ..Default::default()
        };
        assert_eq!(stats.context_percent(), 100);
    }
}
