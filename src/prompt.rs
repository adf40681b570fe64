//! Projection of a conversation onto the request payload a model family expects.
//!
//! Formatting never touches the input conversation and has no hidden state:
//! the same conversation, family and system prompt always produce the same
//! payload.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Prompt-templating convention shared by a group of models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    #[serde(rename = "llama")]
    Llama,
    #[serde(rename = "mistral")]
    Mistral,
    #[serde(rename = "openchat")]
    OpenChat,
    #[serde(rename = "neural-chat")]
    NeuralChat,
    #[serde(rename = "starling")]
    Starling,
    #[serde(rename = "other")]
    Other,
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llama => write!(f, "llama"),
            Self::Mistral => write!(f, "mistral"),
            Self::OpenChat => write!(f, "openchat"),
            Self::NeuralChat => write!(f, "neural-chat"),
            Self::Starling => write!(f, "starling"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl Family {
    fn render(self, system: Option<&str>, turns: &[&Message]) -> Payload {
        match self {
            Self::Llama => Payload::Prompt(render_llama(system, turns)),
            Self::Mistral => Payload::Prompt(render_mistral(system, turns)),
            Self::OpenChat => Payload::Prompt(render_openchat(system, turns)),
            Self::NeuralChat => Payload::Prompt(render_neural_chat(system, turns)),
            Self::Starling => Payload::Prompt(render_starling(system, turns)),
            Self::Other => render_other(system, turns),
        }
    }
}

/// What gets sent to the provider for a chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A fully templated prompt string.
    Prompt(String),
    /// Structured messages, with a flat `role: content` transcript to fall back on.
    Messages {
        messages: Vec<Message>,
        transcript: String,
    },
}

impl Payload {
    /// Provider request body. Templated prompts are sent raw so the provider
    /// does not wrap them in its own template a second time.
    pub fn to_request_body(&self, stream: bool, max_tokens: Option<u32>) -> Value {
        let mut body = match self {
            Self::Prompt(prompt) => json!({ "prompt": prompt, "raw": true }),
            Self::Messages { messages, .. } => json!({ "messages": messages }),
        };
        body["stream"] = Value::Bool(stream);
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    /// Alternative encoding for providers that reject structured messages.
    pub fn to_fallback_body(&self, stream: bool, max_tokens: Option<u32>) -> Option<Value> {
        let Self::Messages { transcript, .. } = self else {
            return None;
        };
        let mut body = json!({ "prompt": transcript, "stream": stream });
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        Some(body)
    }
}

/// Build the provider payload for `conversation` under `family`'s template.
///
/// An explicit `system_prompt` wins over `system` messages inside the
/// conversation. A conversation without user or assistant turns yields just
/// the system prompt, or an empty prompt when there is none.
pub fn format(conversation: &[Message], family: Family, system_prompt: Option<&str>) -> Payload {
    let system = effective_system(conversation, system_prompt);
    let turns: Vec<&Message> = conversation
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();

    if turns.is_empty() {
        return Payload::Prompt(system.unwrap_or_default());
    }

    family.render(system.as_deref(), &turns)
}

fn effective_system(conversation: &[Message], explicit: Option<&str>) -> Option<String> {
    if let Some(system) = explicit.filter(|s| !s.trim().is_empty()) {
        return Some(system.to_string());
    }
    let inline: Vec<&str> = conversation
        .iter()
        .filter(|m| m.role == Role::System && !m.content.trim().is_empty())
        .map(|m| m.content.as_str())
        .collect();
    if inline.is_empty() {
        None
    } else {
        Some(inline.join("\n\n"))
    }
}

fn ends_with_user(turns: &[&Message]) -> bool {
    turns.last().is_some_and(|m| m.role == Role::User)
}

fn render_llama(system: Option<&str>, turns: &[&Message]) -> String {
    let mut out = String::new();
    let mut pending_system = system;
    for turn in turns {
        match turn.role {
            Role::User => {
                out.push_str("<s>[INST] ");
                if let Some(sys) = pending_system.take() {
                    out.push_str(&format!("<<SYS>>\n{sys}\n<</SYS>>\n\n"));
                }
                out.push_str(&turn.content);
                out.push_str(" [/INST]");
            }
            Role::Assistant => {
                if let Some(sys) = pending_system.take() {
                    out.push_str(&format!("<s>[INST] <<SYS>>\n{sys}\n<</SYS>>\n\n [/INST]"));
                }
                out.push_str(&format!(" {} </s>", turn.content));
            }
            Role::System => {}
        }
    }
    out
}

fn render_mistral(system: Option<&str>, turns: &[&Message]) -> String {
    let mut out = String::from("<s>");
    let mut pending_system = system;
    for turn in turns {
        match turn.role {
            Role::User => {
                out.push_str("[INST] ");
                if let Some(sys) = pending_system.take() {
                    out.push_str(&format!("{sys}\n\n"));
                }
                out.push_str(&turn.content);
                out.push_str(" [/INST]");
            }
            Role::Assistant => {
                if let Some(sys) = pending_system.take() {
                    out.push_str(&format!("[INST] {sys} [/INST]"));
                }
                out.push_str(&turn.content);
                out.push_str("</s>");
            }
            Role::System => {}
        }
    }
    out
}

// OpenChat 3.5 "GPT4 Correct" turn markers; Starling is trained on the same layout.
fn render_gpt4_correct(system: Option<&str>, turns: &[&Message]) -> String {
    let mut out = String::new();
    if let Some(sys) = system {
        out.push_str(&format!("GPT4 Correct System: {sys}<|end_of_turn|>"));
    }
    for turn in turns {
        match turn.role {
            Role::User => out.push_str(&format!("GPT4 Correct User: {}<|end_of_turn|>", turn.content)),
            Role::Assistant => {
                out.push_str(&format!("GPT4 Correct Assistant: {}<|end_of_turn|>", turn.content))
            }
            Role::System => {}
        }
    }
    if ends_with_user(turns) {
        out.push_str("GPT4 Correct Assistant:");
    }
    out
}

fn render_openchat(system: Option<&str>, turns: &[&Message]) -> String {
    render_gpt4_correct(system, turns)
}

fn render_starling(system: Option<&str>, turns: &[&Message]) -> String {
    render_gpt4_correct(system, turns)
}

fn render_neural_chat(system: Option<&str>, turns: &[&Message]) -> String {
    let mut out = String::new();
    if let Some(sys) = system {
        out.push_str(&format!("### System:\n{sys}\n"));
    }
    for turn in turns {
        match turn.role {
            Role::User => out.push_str(&format!("### User:\n{}\n", turn.content)),
            Role::Assistant => out.push_str(&format!("### Assistant:\n{}\n", turn.content)),
            Role::System => {}
        }
    }
    if ends_with_user(turns) {
        out.push_str("### Assistant:\n");
    }
    out
}

fn render_other(system: Option<&str>, turns: &[&Message]) -> Payload {
    let mut messages = Vec::with_capacity(turns.len() + 1);
    if let Some(sys) = system {
        messages.push(Message::system(sys));
    }
    messages.extend(turns.iter().map(|m| (*m).clone()));

    let mut transcript = messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    if ends_with_user(turns) {
        transcript.push_str("\nassistant:");
    }

    Payload::Messages {
        messages,
        transcript,
    }
}
