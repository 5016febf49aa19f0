//! Per-backend stdout parsers.
//!
//! Each backend emits NDJSON in its own dialect; the parsers translate a
//! line into zero or more neutral [`ParsedEvent`]s. Parsing is JSON-first
//! with a raw-text fallback, and unknown JSON shapes degrade to debug logs
//! rather than being discarded.

use serde_json::Value;

use tp_core::types::{AgentKind, ChatRole, LogLevel, ToolStatus};

/// Caps applied before any text leaves the parser.
pub const TEXT_CAP: usize = 1000;
pub const TOOL_DETAIL_CAP: usize = 500;
pub const SUMMARY_CAP: usize = 200;

// ---------------------------------------------------------------------------
// ParsedEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Log {
        level: LogLevel,
        message: String,
        data: Option<Value>,
    },
    Chat {
        role: ChatRole,
        text: String,
    },
    Tool {
        name: String,
        summary: String,
        status: ToolStatus,
    },
    /// The backend's structured final result, preferred for the run summary.
    Result {
        text: String,
    },
}

/// Truncate on a char boundary, appending an ellipsis when cut.
pub fn truncate(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

// ---------------------------------------------------------------------------
// StreamParser trait
// ---------------------------------------------------------------------------

pub trait StreamParser: Send {
    fn parse_line(&mut self, line: &str) -> Vec<ParsedEvent>;
}

/// Parser lookup for an agent kind.
pub fn parser_for(kind: AgentKind) -> Box<dyn StreamParser> {
    match kind {
        AgentKind::ClaudeCode => Box::new(ClaudeStreamParser),
        AgentKind::Codex => Box::new(CodexStreamParser),
        AgentKind::Copilot | AgentKind::Gemini | AgentKind::Openrouter => {
            Box::new(PlainTextParser)
        }
    }
}

fn debug_unknown(value: &Value) -> ParsedEvent {
    ParsedEvent::Log {
        level: LogLevel::Debug,
        message: "unrecognized agent event".to_string(),
        data: Some(value.clone()),
    }
}

// ---------------------------------------------------------------------------
// Claude Code: stream-json dialect
// ---------------------------------------------------------------------------

/// Parses the `stream-json` dialect: top-level `type` of
/// `system | assistant | user | result`, with tool calls and results nested
/// in message content blocks.
pub struct ClaudeStreamParser;

impl StreamParser for ClaudeStreamParser {
    fn parse_line(&mut self, line: &str) -> Vec<ParsedEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return vec![ParsedEvent::Log {
                level: LogLevel::Info,
                message: truncate(trimmed, TEXT_CAP),
                data: None,
            }];
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("system") => {
                let subtype = value.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
                let model = value.get("model").and_then(|m| m.as_str()).unwrap_or("");
                vec![ParsedEvent::Log {
                    level: LogLevel::Info,
                    message: format!("session {subtype} {model}").trim().to_string(),
                    data: None,
                }]
            }
            Some("assistant") => parse_message_blocks(&value, ChatRole::Assistant),
            Some("user") => parse_message_blocks(&value, ChatRole::User),
            Some("result") => {
                let text = value
                    .get("result")
                    .and_then(|r| r.as_str())
                    .unwrap_or_default();
                let mut events = vec![ParsedEvent::Result {
                    text: text.to_string(),
                }];
                if let (Some(cost), Some(duration)) = (
                    value.get("total_cost_usd").and_then(|c| c.as_f64()),
                    value.get("duration_ms").and_then(|d| d.as_u64()),
                ) {
                    events.push(ParsedEvent::Log {
                        level: LogLevel::Info,
                        message: format!("run finished: ${cost:.4}, {duration} ms"),
                        data: None,
                    });
                }
                events
            }
            _ => vec![debug_unknown(&value)],
        }
    }
}

fn parse_message_blocks(value: &Value, role: ChatRole) -> Vec<ParsedEvent> {
    let Some(blocks) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    else {
        return vec![debug_unknown(value)];
    };

    let mut events = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    if !text.trim().is_empty() {
                        events.push(ParsedEvent::Chat {
                            role,
                            text: truncate(text, TEXT_CAP),
                        });
                    }
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("tool")
                    .to_string();
                let input = block
                    .get("input")
                    .map(|i| i.to_string())
                    .unwrap_or_default();
                events.push(ParsedEvent::Tool {
                    name,
                    summary: truncate(&input, TOOL_DETAIL_CAP),
                    status: ToolStatus::Running,
                });
            }
            Some("tool_result") => {
                let is_error = block
                    .get("is_error")
                    .and_then(|e| e.as_bool())
                    .unwrap_or(false);
                let content = tool_result_text(block);
                events.push(ParsedEvent::Tool {
                    name: "tool_result".to_string(),
                    summary: truncate(&content, SUMMARY_CAP),
                    status: if is_error {
                        ToolStatus::Error
                    } else {
                        ToolStatus::Completed
                    },
                });
            }
            _ => {}
        }
    }
    if events.is_empty() {
        events.push(debug_unknown(value));
    }
    events
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Codex: item.started / item.completed dialect
// ---------------------------------------------------------------------------

/// Parses the codex exec dialect: `type` of `item.started | item.completed |
/// turn.completed | error`, wrapping an `item` whose own `type` selects the
/// payload shape.
pub struct CodexStreamParser;

impl StreamParser for CodexStreamParser {
    fn parse_line(&mut self, line: &str) -> Vec<ParsedEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return vec![ParsedEvent::Log {
                level: LogLevel::Info,
                message: truncate(trimmed, TEXT_CAP),
                data: None,
            }];
        };

        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match kind {
            "item.started" | "item.completed" => {
                let completed = kind == "item.completed";
                let Some(item) = value.get("item") else {
                    return vec![debug_unknown(&value)];
                };
                parse_codex_item(item, completed)
                    .map(|e| vec![e])
                    .unwrap_or_else(|| vec![debug_unknown(&value)])
            }
            "turn.completed" => {
                let usage = value.get("usage").cloned();
                vec![ParsedEvent::Log {
                    level: LogLevel::Debug,
                    message: "turn completed".to_string(),
                    data: usage,
                }]
            }
            "error" => {
                let message = value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("agent error");
                vec![ParsedEvent::Log {
                    level: LogLevel::Error,
                    message: truncate(message, TEXT_CAP),
                    data: None,
                }]
            }
            _ => vec![debug_unknown(&value)],
        }
    }
}

fn parse_codex_item(item: &Value, completed: bool) -> Option<ParsedEvent> {
    let item_type = item.get("type").and_then(|t| t.as_str())?;
    match item_type {
        "agent_message" => {
            // Only the completed form carries the full text.
            if !completed {
                return Some(ParsedEvent::Log {
                    level: LogLevel::Debug,
                    message: "assistant message started".to_string(),
                    data: None,
                });
            }
            let text = item.get("text").and_then(|t| t.as_str()).unwrap_or("");
            Some(ParsedEvent::Chat {
                role: ChatRole::Assistant,
                text: truncate(text, TEXT_CAP),
            })
        }
        "reasoning" => Some(ParsedEvent::Log {
            level: LogLevel::Debug,
            message: truncate(
                item.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                SUMMARY_CAP,
            ),
            data: None,
        }),
        "command_execution" => {
            let command = item.get("command").and_then(|c| c.as_str()).unwrap_or("");
            let failed = item
                .get("exit_code")
                .and_then(|c| c.as_i64())
                .map(|c| c != 0)
                .unwrap_or(false);
            Some(ParsedEvent::Tool {
                name: "command".to_string(),
                summary: truncate(command, TOOL_DETAIL_CAP),
                status: if !completed {
                    ToolStatus::Running
                } else if failed {
                    ToolStatus::Error
                } else {
                    ToolStatus::Completed
                },
            })
        }
        "file_change" => {
            let summary = item
                .get("changes")
                .map(|c| c.to_string())
                .unwrap_or_default();
            Some(ParsedEvent::Tool {
                name: "file_change".to_string(),
                summary: truncate(&summary, TOOL_DETAIL_CAP),
                status: if completed {
                    ToolStatus::Completed
                } else {
                    ToolStatus::Running
                },
            })
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Plain-text backends
// ---------------------------------------------------------------------------

/// For backends without a structured stream: JSON lines are inspected for a
/// `type`/`message` pair, everything else is assistant text.
pub struct PlainTextParser;

impl StreamParser for PlainTextParser {
    fn parse_line(&mut self, line: &str) -> Vec<ParsedEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return vec![debug_unknown(&value)];
            }
        }
        vec![ParsedEvent::Chat {
            role: ChatRole::Assistant,
            text: truncate(trimmed, TEXT_CAP),
        }]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let cut = truncate(&"é".repeat(100), 11);
        assert!(cut.ends_with('…'));
        // Never panics on multibyte boundaries.
        assert!(cut.len() <= 11 + '…'.len_utf8());
    }

    #[test]
    fn claude_assistant_text_becomes_chat() {
        let mut parser = ClaudeStreamParser;
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"I'll add the endpoint."}]}}"#;
        let events = parser.parse_line(line);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ParsedEvent::Chat { role: ChatRole::Assistant, text } if text.contains("endpoint")
        ));
    }

    #[test]
    fn claude_tool_use_and_result() {
        let mut parser = ClaudeStreamParser;
        let use_line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"write_file","input":{"path":"src/api.rs"}}]}}"#;
        let events = parser.parse_line(use_line);
        assert!(matches!(
            &events[0],
            ParsedEvent::Tool { name, status: ToolStatus::Running, summary }
                if name == "write_file" && summary.contains("src/api.rs")
        ));

        let result_line = r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"ok","is_error":false}]}}"#;
        let events = parser.parse_line(result_line);
        assert!(matches!(
            &events[0],
            ParsedEvent::Tool { status: ToolStatus::Completed, .. }
        ));

        let err_line = r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"no such file","is_error":true}]}}"#;
        let events = parser.parse_line(err_line);
        assert!(matches!(
            &events[0],
            ParsedEvent::Tool { status: ToolStatus::Error, .. }
        ));
    }

    #[test]
    fn claude_result_event_is_captured() {
        let mut parser = ClaudeStreamParser;
        let line = r#"{"type":"result","subtype":"success","result":"Added the endpoint.","total_cost_usd":0.12,"duration_ms":45000}"#;
        let events = parser.parse_line(line);
        assert!(matches!(
            &events[0],
            ParsedEvent::Result { text } if text == "Added the endpoint."
        ));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn claude_unknown_shape_degrades_to_debug() {
        let mut parser = ClaudeStreamParser;
        let events = parser.parse_line(r#"{"type":"telemetry","blob":1}"#);
        assert!(matches!(
            &events[0],
            ParsedEvent::Log { level: LogLevel::Debug, .. }
        ));
    }

    #[test]
    fn claude_raw_text_falls_back_to_log() {
        let mut parser = ClaudeStreamParser;
        let events = parser.parse_line("warming up...");
        assert!(matches!(
            &events[0],
            ParsedEvent::Log { level: LogLevel::Info, message, .. } if message == "warming up..."
        ));
    }

    #[test]
    fn claude_long_text_is_truncated() {
        let mut parser = ClaudeStreamParser;
        let long = "x".repeat(5000);
        let line = format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{long}"}}]}}}}"#
        );
        let events = parser.parse_line(&line);
        match &events[0] {
            ParsedEvent::Chat { text, .. } => assert!(text.len() <= TEXT_CAP + '…'.len_utf8()),
            other => panic!("expected chat, got {other:?}"),
        }
    }

    #[test]
    fn codex_item_lifecycle() {
        let mut parser = CodexStreamParser;
        let started = r#"{"type":"item.started","item":{"type":"command_execution","command":"ls -la"}}"#;
        let events = parser.parse_line(started);
        assert!(matches!(
            &events[0],
            ParsedEvent::Tool { status: ToolStatus::Running, summary, .. } if summary == "ls -la"
        ));

        let completed = r#"{"type":"item.completed","item":{"type":"command_execution","command":"ls -la","exit_code":0}}"#;
        let events = parser.parse_line(completed);
        assert!(matches!(
            &events[0],
            ParsedEvent::Tool { status: ToolStatus::Completed, .. }
        ));

        let message = r#"{"type":"item.completed","item":{"type":"agent_message","text":"Done."}}"#;
        let events = parser.parse_line(message);
        assert!(matches!(
            &events[0],
            ParsedEvent::Chat { role: ChatRole::Assistant, text } if text == "Done."
        ));
    }

    #[test]
    fn codex_error_event() {
        let mut parser = CodexStreamParser;
        let events = parser.parse_line(r#"{"type":"error","message":"auth expired"}"#);
        assert!(matches!(
            &events[0],
            ParsedEvent::Log { level: LogLevel::Error, message, .. } if message == "auth expired"
        ));
    }

    #[test]
    fn plain_text_backend_emits_assistant_chat() {
        let mut parser = PlainTextParser;
        let events = parser.parse_line("The function is now renamed.");
        assert!(matches!(
            &events[0],
            ParsedEvent::Chat { role: ChatRole::Assistant, .. }
        ));
        assert!(parser.parse_line("   ").is_empty());
    }

    #[test]
    fn parser_factory_covers_all_kinds() {
        for kind in [
            AgentKind::ClaudeCode,
            AgentKind::Codex,
            AgentKind::Copilot,
            AgentKind::Gemini,
            AgentKind::Openrouter,
        ] {
            let mut parser = parser_for(kind);
            // Every parser tolerates arbitrary input.
            let _ = parser.parse_line("hello");
        }
    }
}
