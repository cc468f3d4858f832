//! Per-recipient channel messages for an accepted audience.
//!
//! Three steps: a yes/no gate (does the request ask for message copy?),
//! one templates call returning a subject/message per channel, then local
//! substitution of `{{column}}` placeholders for every matching row.

use quarry_core::storage::Row;
use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::llm::LlmClient;
use crate::prompts;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid"));

/// Identity columns copied onto every recipient when present.
const IDENTITY_COLUMNS: [&str; 4] = ["id", "first_name", "last_name", "data_source"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Whatsapp,
    Ads,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
            Self::Ads => "ads",
        }
    }

    /// The column a recipient must have to be reachable on this channel.
    pub fn contact_column(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms | Self::Whatsapp => "phone",
            Self::Ads => "social_platforms",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelTemplate {
    pub channel: Channel,
    #[serde(default)]
    pub subject: Option<String>,
    pub message: String,
}

impl ChannelTemplate {
    fn is_complete(&self) -> bool {
        let has_subject = self.subject.as_deref().is_some_and(|s| !s.trim().is_empty());
        !self.message.trim().is_empty() && (self.channel != Channel::Email || has_subject)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TemplatesReply {
    List(Vec<ChannelTemplate>),
    Wrapped { templates: Vec<ChannelTemplate> },
}

/// Filled messages for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelMessages {
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub template: String,
    /// Identity columns, `contact`, `message` and (email) `subject`.
    pub recipients: Vec<Row>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
struct GateReply {
    needs_marketing_messages: bool,
    #[serde(default)]
    reasoning: String,
}

pub struct Personalizer {
    llm: LlmClient,
    sample_rows: usize,
}

impl Personalizer {
    pub fn new(llm: LlmClient, sample_rows: usize) -> Self {
        Self { llm, sample_rows }
    }

    /// Whether the request asks for message copy at all.
    pub async fn wants_messages(&self, message: &str) -> Result<bool, AgentError> {
        let reply: GateReply = self.llm.complete_json(prompts::personalization_gate(message)).await?;
        debug!(wanted = reply.needs_marketing_messages, reasoning = %reply.reasoning, "Personalization gate");
        Ok(reply.needs_marketing_messages)
    }

    /// Ask for one template per channel. Incomplete templates are dropped.
    pub async fn templates(&self, message: &str, rows: &[Row]) -> Result<Vec<ChannelTemplate>, AgentError> {
        let columns: Vec<String> = rows.first().map(|r| r.keys().cloned().collect()).unwrap_or_default();
        let sample = &rows[..rows.len().min(self.sample_rows)];
        let reply: TemplatesReply = self
            .llm
            .complete_json(prompts::channel_templates(message, &columns, sample))
            .await?;

        let raw = match reply {
            TemplatesReply::List(list) | TemplatesReply::Wrapped { templates: list } => list,
        };

        let mut templates: Vec<ChannelTemplate> = Vec::new();
        for template in raw {
            if !template.is_complete() {
                warn!(channel = template.channel.as_str(), "Dropping incomplete template");
            } else if templates.iter().any(|t| t.channel == template.channel) {
                debug!(channel = template.channel.as_str(), "Dropping duplicate template");
            } else {
                templates.push(template);
            }
        }

        if templates.is_empty() {
            return Err(AgentError::MalformedOutput("no usable channel templates".into()));
        }
        Ok(templates)
    }

    /// Gate, template and fill. `None` when no messages were asked for.
    pub async fn personalize(&self, message: &str, rows: &[Row]) -> Result<Option<Vec<ChannelMessages>>, AgentError> {
        if rows.is_empty() || !self.wants_messages(message).await? {
            return Ok(None);
        }
        let templates = self.templates(message, rows).await?;
        let rendered = render(&templates, rows);
        info!(channels = rendered.len(), "Channel messages personalized");
        Ok(Some(rendered))
    }
}

/// Substitute `{{column}}` placeholders from `row`. Columns the row lacks,
/// and nulls, become empty text.
pub fn fill(template: &str, row: &Row) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| row.get(&caps[1]).map(value_text).unwrap_or_default())
        .into_owned()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn has_contact(row: &Row, channel: Channel) -> bool {
    match row.get(channel.contact_column()) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

/// Rows that state channel preferences must include `channel`.
fn prefers(row: &Row, channel: Channel) -> bool {
    let parsed;
    let preferences = match row.get("preferred_channels") {
        Some(Value::Array(list)) => list,
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(list)) => {
                parsed = list;
                &parsed
            }
            _ => return true,
        },
        _ => return true,
    };
    preferences
        .iter()
        .any(|p| p.as_str().is_some_and(|p| p.eq_ignore_ascii_case(channel.as_str())))
}

/// Fill every template for every reachable row.
pub fn render(templates: &[ChannelTemplate], rows: &[Row]) -> Vec<ChannelMessages> {
    templates
        .iter()
        .map(|template| {
            let recipients: Vec<Row> = rows
                .iter()
                .filter(|row| has_contact(row, template.channel) && prefers(row, template.channel))
                .map(|row| {
                    let mut recipient = Row::new();
                    for column in IDENTITY_COLUMNS {
                        if let Some(value) = row.get(column) {
                            recipient.insert(column.to_string(), value.clone());
                        }
                    }
                    let contact = row.get(template.channel.contact_column()).cloned().unwrap_or(Value::Null);
                    recipient.insert("contact".into(), contact);
                    recipient.insert("message".into(), Value::String(fill(&template.message, row)));
                    if let Some(subject) = &template.subject {
                        recipient.insert("subject".into(), Value::String(fill(subject, row)));
                    }
                    recipient
                })
                .collect();

            ChannelMessages {
                channel: template.channel,
                subject: template.subject.clone(),
                template: template.message.clone(),
                total: recipients.len(),
                recipients,
            }
        })
        .collect()
}
