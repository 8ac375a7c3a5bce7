//! The `stream-json` dialect spoken by Claude-compatible agent CLIs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<NestedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedMessage {
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub content: FlexContent,
    #[serde(default)]
    pub tool_use_id: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Tool result content, either a plain string or a list of text parts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlexContent(pub String);

impl<'de> Deserialize<'de> for FlexContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Null => Ok(FlexContent::default()),
            Value::String(s) => Ok(FlexContent(s)),
            Value::Array(parts) => {
                #[derive(Deserialize)]
                struct Part {
                    #[serde(default)]
                    text: String,
                }

                let texts = parts
                    .into_iter()
                    .filter_map(|part| serde_json::from_value::<Part>(part).ok())
                    .map(|p| p.text)
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>();
                Ok(FlexContent(texts.join("\n")))
            }
            other => Ok(FlexContent(other.to_string())),
        }
    }
}

impl Serialize for FlexContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

/// A user turn written to the agent's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMessage {
    #[serde(rename = "type")]
    pub r#type: String,
    pub message: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub role: String,
    pub content: String,
}

impl InputMessage {
    pub fn user(content: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            r#type: "user".to_owned(),
            message: MessageBody {
                role: "user".to_owned(),
                content: content.into(),
            },
            session_id,
        }
    }
}

/// The parts of a stream message the executor acts on, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    SessionStarted {
        session_id: String,
    },
    Text {
        text: String,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Finished {
        is_error: bool,
        result: Option<String>,
        session_id: Option<String>,
    },
}

impl StreamMessage {
    pub fn items(&self) -> Vec<StreamItem> {
        match self.r#type.as_str() {
            "system" => {
                let is_init = self.subtype.as_deref().map_or(true, |s| s == "init");
                return non_empty(self.session_id.as_deref())
                    .filter(|_| is_init)
                    .map(|session_id| StreamItem::SessionStarted {
                        session_id: session_id.to_owned(),
                    })
                    .into_iter()
                    .collect();
            }
            "result" => {
                let is_error = self.is_error
                    || self
                        .subtype
                        .as_deref()
                        .is_some_and(|s| s.starts_with("error"));
                return vec![StreamItem::Finished {
                    is_error,
                    result: self.result.clone().filter(|s| !s.is_empty()),
                    session_id: non_empty(self.session_id.as_deref()).map(str::to_owned),
                }];
            }
            _ => {}
        }

        let Some(message) = &self.message else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for block in &message.content {
            match block.r#type.as_str() {
                "text" if message.role == "assistant" => {
                    if !block.text.trim().is_empty() {
                        out.push(StreamItem::Text {
                            text: block.text.clone(),
                        });
                    }
                }
                "tool_use" => {
                    if block.name.trim().is_empty() {
                        continue;
                    }
                    out.push(StreamItem::ToolUse {
                        tool_use_id: block.id.trim().to_owned(),
                        name: block.name.clone(),
                        input: block.input.clone(),
                    });
                }
                "tool_result" => out.push(StreamItem::ToolResult {
                    tool_use_id: block.tool_use_id.trim().to_owned(),
                    content: block.content.0.clone(),
                    is_error: block.is_error,
                }),
                _ => {}
            }
        }
        out
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Plan text carried by an `ExitPlanMode` tool input.
pub fn plan_text(input: &Value) -> Option<&str> {
    input
        .get("plan")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Short human-readable summary of a tool input.
pub fn format_tool_input(name: &str, input: &Value) -> String {
    let obj = match input.as_object() {
        Some(v) => v,
        None => return input.to_string(),
    };

    match name {
        "Bash" => obj
            .get("command")
            .and_then(|v| v.as_str())
            .map(|cmd| truncate(cmd, 100))
            .unwrap_or_else(|| format_generic_input(obj)),
        "Read" | "Write" | "Edit" | "MultiEdit" => obj
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(|p| p.to_owned())
            .unwrap_or_else(|| format_generic_input(obj)),
        "Glob" | "Grep" => {
            let pattern = obj.get("pattern").and_then(|v| v.as_str()).unwrap_or("");
            let path = obj.get("path").and_then(|v| v.as_str()).unwrap_or("");
            match (pattern.is_empty(), path.is_empty()) {
                (false, false) => format!("{pattern:?} in {path}"),
                (false, true) => format!("{pattern:?}"),
                _ => format_generic_input(obj),
            }
        }
        _ => format_generic_input(obj),
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let take = max - 3;
    let mut it = s.chars();
    let prefix: String = it.by_ref().take(take).collect();
    let rest: Vec<char> = it.take(4).collect();
    if rest.len() <= 3 {
        let mut whole = prefix;
        whole.extend(rest);
        return whole;
    }
    format!("{prefix}...")
}

fn format_generic_input(obj: &serde_json::Map<String, Value>) -> String {
    let mut parts = Vec::new();
    for (k, v) in obj {
        let value = match v {
            Value::String(s) => truncate(s, 50),
            other => other.to_string(),
        };
        parts.push(format!("{k}={value}"));
    }
    parts.sort();
    parts.join(", ")
}
