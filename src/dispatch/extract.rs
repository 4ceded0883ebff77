//! Response field extraction and reasoning-log persistence.
//!
//! Providers return loosely-shaped JSON; extraction walks a fixed list of
//! known key paths and falls back to a top-level scan before giving up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::Value;
use tracing::{debug, info};

use crate::models::{Provider, TokenUsage};

/// Extract the primary content string from a provider response.
///
/// Tries the known paths in order, first non-empty string wins (stripped);
/// then scans top-level keys for a string or a first list element.
pub fn extract_content(data: &Value) -> Option<String> {
    const PATHS: [&str; 7] = [
        "/choices/0/message/content",
        "/message/content",
        "/content",
        "/text",
        "/response",
        "/choices/0/text",
        "/output/text",
    ];

    for path in PATHS {
        if let Some(content) = data.pointer(path).and_then(Value::as_str) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    for key in ["choices", "message", "content", "text", "response", "output"] {
        match data.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Array(items)) if !items.is_empty() => {
                return Some(items[0].to_string());
            }
            _ => {}
        }
    }

    None
}

/// Chain-of-thought text from a reasoner response, when present.
pub fn extract_reasoning_content(data: &Value) -> Option<String> {
    let reasoning = data.pointer("/choices/0/message/reasoning_content")?.as_str()?;
    let trimmed = reasoning.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Research-provider citations, restricted to http(s) URLs.
pub fn extract_citations(data: &Value, provider: Provider) -> Option<Vec<String>> {
    if provider != Provider::Research {
        return None;
    }

    let citations: Vec<String> = data
        .get("citations")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .map(str::to_string)
        .collect();

    if citations.is_empty() {
        None
    } else {
        info!("Extracted {} citations", citations.len());
        Some(citations)
    }
}

/// Tool calls echoed back by the provider, when present.
pub fn extract_tool_calls(data: &Value) -> Option<Vec<Value>> {
    let calls = data.pointer("/choices/0/message/tool_calls")?.as_array()?;
    (!calls.is_empty()).then(|| calls.clone())
}

/// Token usage from the `usage` object, including reasoner cache metrics
/// and a per-provider fallback cost when the provider supplies none.
pub fn extract_token_usage(data: &Value, provider: Provider) -> Option<TokenUsage> {
    let usage = data.get("usage")?.as_object()?;

    let prompt_tokens = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion_tokens = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
    let total_tokens = usage.get("total_tokens").and_then(Value::as_u64).unwrap_or(0);

    let mut reasoning_tokens = 0;
    let mut cache_hit_tokens = 0;
    let mut cache_miss_tokens = 0;
    let mut cache_savings_pct = 0.0;

    if provider == Provider::Reasoner {
        reasoning_tokens = usage
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        cache_hit_tokens = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if cache_hit_tokens == 0 {
            // Legacy cache fields predate prompt_tokens_details.
            cache_hit_tokens = usage.get("prompt_cache_hit_tokens").and_then(Value::as_u64).unwrap_or(0);
            cache_miss_tokens = usage.get("prompt_cache_miss_tokens").and_then(Value::as_u64).unwrap_or(0);
        } else {
            cache_miss_tokens = prompt_tokens.saturating_sub(cache_hit_tokens);
        }

        if prompt_tokens > 0 {
            cache_savings_pct =
                (cache_hit_tokens as f64 / prompt_tokens as f64 * 100.0 * 100.0).round() / 100.0;
        }
    }

    let mut cost_usd = None;
    if provider == Provider::Research {
        cost_usd = usage
            .get("cost")
            .and_then(|c| c.get("total_cost"))
            .and_then(Value::as_f64);
    }

    if provider == Provider::Reasoner && cost_usd.is_none() {
        let (input_rate, output_rate) = if reasoning_tokens > 0 {
            (0.55, 2.19)
        } else {
            (0.14, 0.28)
        };
        let cost = prompt_tokens as f64 * input_rate / 1_000_000.0
            + completion_tokens as f64 * output_rate / 1_000_000.0;
        cost_usd = Some((cost * 1_000_000.0).round() / 1_000_000.0);
    }

    let token_usage = TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        reasoning_tokens,
        cost_usd,
        cache_hit_tokens,
        cache_miss_tokens,
        cache_savings_pct,
    };

    debug!(
        "Token usage: {} total ({} in, {} out{})",
        total_tokens,
        prompt_tokens,
        completion_tokens,
        if reasoning_tokens > 0 {
            format!(", {reasoning_tokens} reasoning")
        } else {
            String::new()
        }
    );

    Some(token_usage)
}

/// Persist chain-of-thought text to a dated markdown file.
///
/// The directory is created on demand; the file is written in one shot so
/// the handle is closed on every exit path. Callers treat failures as
/// warnings, not errors.
pub fn save_reasoning_log(dir: &Path, reasoning: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create reasoning log dir {}", dir.display()))?;

    let now = Local::now();
    let path = dir.join(format!("reasoning_{}.md", now.format("%Y%m%d_%H%M%S")));

    let content = format!(
        "# Reasoning Log\n**Timestamp:** {}\n**Length:** {} chars\n\n## Chain-of-Thought\n\n{}\n",
        now.to_rfc3339(),
        reasoning.chars().count(),
        reasoning
    );
    std::fs::write(&path, content).with_context(|| format!("write reasoning log {}", path.display()))?;

    debug!("Reasoning saved to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_prefers_standard_path() {
        let data = json!({
            "choices": [{"message": {"content": "  primary  "}}],
            "text": "fallback",
        });
        assert_eq!(extract_content(&data).as_deref(), Some("primary"));
    }

    #[test]
    fn content_walks_fallback_paths() {
        let data = json!({"output": {"text": "from output"}});
        assert_eq!(extract_content(&data).as_deref(), Some("from output"));

        let data = json!({"response": "direct"});
        assert_eq!(extract_content(&data).as_deref(), Some("direct"));

        // Top-level scan: first list element stringified.
        let data = json!({"choices": [{"odd": "shape"}]});
        assert_eq!(extract_content(&data).as_deref(), Some(r#"{"odd":"shape"}"#));

        let data = json!({"unrelated": 1});
        assert_eq!(extract_content(&data), None);
    }

    #[test]
    fn citations_filter_non_urls_and_providers() {
        let data = json!({
            "citations": ["https://a.example", "ftp://nope", "http://b.example", 42],
        });
        let urls = extract_citations(&data, Provider::Research).unwrap();
        assert_eq!(urls, vec!["https://a.example", "http://b.example"]);

        assert!(extract_citations(&data, Provider::Reasoner).is_none());
    }

    #[test]
    fn usage_extracts_reasoner_cache_metrics() {
        let data = json!({
            "usage": {
                "prompt_tokens": 1000,
                "completion_tokens": 200,
                "total_tokens": 1200,
                "completion_tokens_details": {"reasoning_tokens": 50},
                "prompt_tokens_details": {"cached_tokens": 400},
            }
        });
        let usage = extract_token_usage(&data, Provider::Reasoner).unwrap();
        assert_eq!(usage.reasoning_tokens, 50);
        assert_eq!(usage.cache_hit_tokens, 400);
        assert_eq!(usage.cache_miss_tokens, 600);
        assert!((usage.cache_savings_pct - 40.0).abs() < 1e-9);
        // Reasoning-mode fallback pricing.
        let cost = usage.cost_usd.unwrap();
        assert!((cost - (1000.0 * 0.55 + 200.0 * 2.19) / 1_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn usage_legacy_cache_fields() {
        let data = json!({
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 10,
                "total_tokens": 110,
                "prompt_cache_hit_tokens": 25,
                "prompt_cache_miss_tokens": 75,
            }
        });
        let usage = extract_token_usage(&data, Provider::Reasoner).unwrap();
        assert_eq!(usage.cache_hit_tokens, 25);
        assert_eq!(usage.cache_miss_tokens, 75);
        // Chat-mode pricing (no reasoning tokens).
        let cost = usage.cost_usd.unwrap();
        assert!((cost - (100.0 * 0.14 + 10.0 * 0.28) / 1_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn usage_research_cost_passthrough() {
        let data = json!({
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 10,
                "total_tokens": 20,
                "cost": {"total_cost": 0.0042},
            }
        });
        let usage = extract_token_usage(&data, Provider::Research).unwrap();
        assert_eq!(usage.cost_usd, Some(0.0042));
        assert_eq!(usage.reasoning_tokens, 0);
    }

    #[test]
    fn reasoning_log_writes_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_reasoning_log(dir.path(), "step 1\nstep 2").unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("reasoning_"));
        assert!(written.starts_with("# Reasoning Log\n**Timestamp:**"));
        assert!(written.contains("**Length:** 13 chars"));
        assert!(written.contains("## Chain-of-Thought\n\nstep 1\nstep 2"));
    }
}
