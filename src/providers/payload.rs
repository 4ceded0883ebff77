//! Provider payload assembly.
//!
//! All three providers speak an OpenAI-compatible chat completions shape;
//! the differences are model selection, sampling parameters, and a few
//! vendor extensions. Expensive model variants sit behind env-var cost
//! guards and silently downgrade with a warning.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::models::{AgentRequest, Provider};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// OpenAI-compatible chat completions payload with provider extensions.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPayload {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_thinking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_search_options: Option<Value>,
}

/// Inputs the dispatcher resolved before payload assembly: the sanitized and
/// optimized user prompt, and the thinking-gate decision for the technical
/// provider.
#[derive(Debug, Clone)]
pub struct PayloadOptions<'a> {
    pub user_prompt: &'a str,
    pub enable_thinking: bool,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn build_payload(request: &AgentRequest, opts: &PayloadOptions<'_>) -> ChatPayload {
    match request.provider {
        Provider::Reasoner => build_reasoner_payload(request, opts),
        Provider::Technical => build_technical_payload(request, opts),
        Provider::Research => build_research_payload(request, opts),
    }
}

/// Reasoner (DeepSeek): reasoning model gated behind
/// `DEEPSEEK_ALLOW_REASONER`; web-search task types use the `developer`
/// system role.
fn build_reasoner_payload(request: &AgentRequest, opts: &PayloadOptions<'_>) -> ChatPayload {
    let allow_reasoner = env_flag("DEEPSEEK_ALLOW_REASONER");
    let use_thinking = request.thinking_mode && allow_reasoner;

    if request.thinking_mode && !allow_reasoner {
        warn!(
            "deepseek-reasoner blocked (DEEPSEEK_ALLOW_REASONER=false). \
             Using deepseek-chat instead."
        );
    }

    let (model, max_tokens) = if use_thinking {
        ("deepseek-reasoner", 16_000)
    } else {
        ("deepseek-chat", 4_000)
    };

    let task_type = request.task_type.to_lowercase();
    let is_search_task = matches!(task_type.as_str(), "search" | "research" | "web" | "find" | "lookup");
    let system_role = if is_search_task { "developer" } else { "system" };

    let tools = if request
        .context
        .get("use_file_access")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        Some(file_access_tools(request.strict_mode))
    } else {
        None
    };

    ChatPayload {
        model: model.to_string(),
        messages: vec![
            ChatMessage {
                role: system_role.to_string(),
                content: "You are an expert developer analyzing trading strategies.".to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: opts.user_prompt.to_string(),
            },
        ],
        max_tokens,
        temperature: (!use_thinking).then_some(0.7),
        top_p: use_thinking.then_some(0.95),
        stream: None,
        tools,
        enable_thinking: None,
        web_search_options: None,
    }
}

/// Technical (Qwen): mid-tier model with an optional fast variant when
/// thinking is off; `enable_thinking` appears in the payload only when the
/// gate allowed it.
fn build_technical_payload(request: &AgentRequest, opts: &PayloadOptions<'_>) -> ChatPayload {
    let mut model = std::env::var("QWEN_MODEL").unwrap_or_else(|_| "qwen-plus".to_string());
    let temperature = std::env::var("QWEN_TEMPERATURE")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.4);

    let enable_thinking = opts.enable_thinking;
    if !enable_thinking {
        let thinking_task = matches!(
            request.task_type.to_lowercase().as_str(),
            "analyze" | "optimize" | "compare" | "deliberation" | "strategy_evolution"
        );
        if thinking_task && !env_flag("QWEN_ENABLE_THINKING") {
            warn!(
                "Qwen thinking mode blocked (QWEN_ENABLE_THINKING=false). \
                 Task '{}' would have triggered thinking.",
                request.task_type
            );
        }
        if let Ok(fast) = std::env::var("QWEN_MODEL_FAST") {
            if !fast.trim().is_empty() {
                model = fast;
            }
        }
    }

    ChatPayload {
        model,
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: "You are an expert quantitative analyst and algorithmic trader.".to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: opts.user_prompt.to_string(),
            },
        ],
        max_tokens: if enable_thinking { 8_192 } else { 4_096 },
        temperature: Some(temperature),
        top_p: None,
        stream: None,
        tools: None,
        enable_thinking: enable_thinking.then_some(true),
        web_search_options: None,
    }
}

/// Research (Perplexity): task-type model matrix with an expensive-model
/// guard; recent-news tasks attach a week recency filter.
fn build_research_payload(request: &AgentRequest, opts: &PayloadOptions<'_>) -> ChatPayload {
    let task_type = request.task_type.to_lowercase();
    let allow_expensive = env_flag("PERPLEXITY_ALLOW_EXPENSIVE");

    let (model, max_tokens) = if allow_expensive {
        match task_type.as_str() {
            "research" | "report" | "deep" => ("sonar-deep-research", 4_000),
            "analyze" | "reason" | "solve" | "complex" => ("sonar-reasoning-pro", 4_000),
            "quick" | "simple" | "fast" => ("sonar", 1_000),
            _ => ("sonar-pro", 2_000),
        }
    } else {
        match task_type.as_str() {
            "research" | "report" | "deep" => {
                warn!(
                    "sonar-deep-research blocked (PERPLEXITY_ALLOW_EXPENSIVE=false). \
                     Task '{}' downgraded to sonar-pro.",
                    task_type
                );
                ("sonar-pro", 2_000)
            }
            "analyze" | "reason" | "solve" | "complex" => {
                warn!(
                    "sonar-reasoning-pro blocked (PERPLEXITY_ALLOW_EXPENSIVE=false). \
                     Task '{}' downgraded to sonar-pro.",
                    task_type
                );
                ("sonar-pro", 2_000)
            }
            "quick" | "simple" | "fast" => ("sonar", 1_000),
            _ => ("sonar-pro", 2_000),
        }
    };

    let web_search_options = matches!(task_type.as_str(), "research" | "news" | "current" | "latest")
        .then(|| json!({ "search_recency_filter": "week" }));

    ChatPayload {
        model: model.to_string(),
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: "You are a helpful assistant specialized in trading strategies and market analysis."
                    .to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: opts.user_prompt.to_string(),
            },
        ],
        max_tokens,
        temperature: Some(0.2),
        top_p: None,
        stream: None,
        tools: None,
        enable_thinking: None,
        web_search_options,
    }
}

/// File-access tool definitions offered to the reasoner when the caller
/// sets the `use_file_access` context flag.
fn file_access_tools(strict_mode: bool) -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "read_project_file",
                "description": "Read a file from the project. Supports source, JSON, Markdown and YAML files. Cannot read .env, .git, or secrets.",
                "strict": strict_mode,
                "parameters": {
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "Relative path to file from project root"
                        },
                        "max_size_kb": {
                            "type": "integer",
                            "description": "Maximum file size in KB (default: 100)",
                            "default": 100
                        }
                    },
                    "required": ["file_path"],
                    "additionalProperties": false
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "list_project_structure",
                "description": "List directory structure of the project as a nested tree. Auto-blocks .git and build artifacts.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "directory": {
                            "type": "string",
                            "description": "Directory to list (relative to project root)",
                            "default": "."
                        },
                        "max_depth": {
                            "type": "integer",
                            "description": "Maximum depth to traverse (default: 3)",
                            "default": 3
                        },
                        "include_hidden": {
                            "type": "boolean",
                            "description": "Include hidden files/folders",
                            "default": false
                        }
                    },
                    "required": []
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "analyze_code_quality",
                "description": "Run lint and formatting checks on a source file.",
                "strict": strict_mode,
                "parameters": {
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "Path to source file to analyze"
                        }
                    },
                    "required": ["file_path"],
                    "additionalProperties": false
                }
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentRequest;
    use serde_json::json;

    fn opts(prompt: &str) -> PayloadOptions<'_> {
        PayloadOptions {
            user_prompt: prompt,
            enable_thinking: false,
        }
    }

    #[test]
    fn reasoner_downgrades_without_cost_guard() {
        std::env::remove_var("DEEPSEEK_ALLOW_REASONER");
        let req = AgentRequest::new(Provider::Reasoner, "analyze", "check this").with_thinking(true);
        let payload = build_payload(&req, &opts("check this"));
        assert_eq!(payload.model, "deepseek-chat");
        assert_eq!(payload.max_tokens, 4_000);
        assert_eq!(payload.temperature, Some(0.7));
        assert!(payload.top_p.is_none());
    }

    #[test]
    fn reasoner_search_tasks_use_developer_role() {
        let req = AgentRequest::new(Provider::Reasoner, "search", "find docs");
        let payload = build_payload(&req, &opts("find docs"));
        assert_eq!(payload.messages[0].role, "developer");

        let req = AgentRequest::new(Provider::Reasoner, "analyze", "check");
        let payload = build_payload(&req, &opts("check"));
        assert_eq!(payload.messages[0].role, "system");
    }

    #[test]
    fn reasoner_attaches_tools_on_file_access_flag() {
        let req = AgentRequest::new(Provider::Reasoner, "analyze", "audit")
            .with_context("use_file_access", json!(true));
        let payload = build_payload(&req, &opts("audit"));
        assert_eq!(payload.tools.as_ref().map(Vec::len), Some(3));

        let req = AgentRequest::new(Provider::Reasoner, "analyze", "audit");
        let payload = build_payload(&req, &opts("audit"));
        assert!(payload.tools.is_none());
    }

    #[test]
    fn technical_thinking_toggles_token_budget() {
        std::env::remove_var("QWEN_MODEL");
        std::env::remove_var("QWEN_MODEL_FAST");
        std::env::remove_var("QWEN_TEMPERATURE");

        let req = AgentRequest::new(Provider::Technical, "analyze", "pattern check");
        let off = build_payload(&req, &opts("pattern check"));
        assert_eq!(off.max_tokens, 4_096);
        assert!(off.enable_thinking.is_none());

        let on = build_payload(
            &req,
            &PayloadOptions {
                user_prompt: "pattern check",
                enable_thinking: true,
            },
        );
        assert_eq!(on.max_tokens, 8_192);
        assert_eq!(on.enable_thinking, Some(true));
        assert_eq!(on.temperature, Some(0.4));
    }

    #[test]
    fn research_guard_collapses_expensive_models() {
        std::env::remove_var("PERPLEXITY_ALLOW_EXPENSIVE");

        let req = AgentRequest::new(Provider::Research, "research", "BTC outlook");
        let payload = build_payload(&req, &opts("BTC outlook"));
        assert_eq!(payload.model, "sonar-pro");
        assert_eq!(payload.max_tokens, 2_000);
        assert!(payload.web_search_options.is_some());

        let req = AgentRequest::new(Provider::Research, "quick", "price?");
        let payload = build_payload(&req, &opts("price?"));
        assert_eq!(payload.model, "sonar");
        assert_eq!(payload.max_tokens, 1_000);
        assert!(payload.web_search_options.is_none());
    }

    #[test]
    fn optional_fields_skip_serialization() {
        let req = AgentRequest::new(Provider::Research, "quick", "hi");
        let payload = build_payload(&req, &opts("hi"));
        let wire = serde_json::to_value(&payload).unwrap();
        assert!(wire.get("tools").is_none());
        assert!(wire.get("enable_thinking").is_none());
        assert!(wire.get("stream").is_none());
    }
}
