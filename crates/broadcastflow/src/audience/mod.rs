//! Templates, recipients, and the binding of recipient attributes to
//! template variable slots.

pub mod memory;
pub mod pg;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::campaigns::{AudienceSpec, VariableMapping, Variables};
use crate::error::InfraError;
use crate::BoxFuture;

pub use memory::MemoryDirectory;
pub use pg::PgDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderFormat {
    Text,
    Image,
    Video,
    Document,
}

impl HeaderFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Some(HeaderFormat::Text),
            "image" => Some(HeaderFormat::Image),
            "video" => Some(HeaderFormat::Video),
            "document" => Some(HeaderFormat::Document),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderFormat::Text => "text",
            HeaderFormat::Image => "image",
            HeaderFormat::Video => "video",
            HeaderFormat::Document => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateHeader {
    pub format: HeaderFormat,
    pub text: Option<String>,
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub language: String,
    pub header: Option<TemplateHeader>,
    pub body: String,
    pub approved: bool,
}

impl MessageTemplate {
    /// Distinct `{{n}}` slots of the text header, ascending.
    pub fn header_slots(&self) -> Vec<u32> {
        match &self.header {
            Some(TemplateHeader {
                format: HeaderFormat::Text,
                text: Some(text),
                ..
            }) => placeholders(text),
            _ => Vec::new(),
        }
    }

    pub fn body_slots(&self) -> Vec<u32> {
        placeholders(&self.body)
    }

    /// Every slot the template needs a value for, ascending and distinct.
    pub fn variable_slots(&self) -> Vec<u32> {
        let mut slots = self.header_slots();
        slots.extend(self.body_slots());
        slots.sort_unstable();
        slots.dedup();
        slots
    }
}

/// Numbers written as `{{n}}` in `text`, ascending and distinct.
pub fn placeholders(text: &str) -> Vec<u32> {
    let mut slots = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        if let Ok(n) = after[..close].trim().parse::<u32>() {
            slots.push(n);
        }
        rest = &after[close + 2..];
    }
    slots.sort_unstable();
    slots.dedup();
    slots
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub channel_address: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

pub trait TemplateStore: Send + Sync {
    fn get_template<'a>(
        &'a self,
        tenant_id: Uuid,
        template_id: Uuid,
    ) -> BoxFuture<'a, Result<Option<MessageTemplate>, InfraError>>;
}

pub trait AudienceResolver: Send + Sync {
    /// Recipients of a tag or explicit-list audience, in a stable order.
    /// Requeue audiences are not handled here and resolve to nothing.
    fn resolve<'a>(
        &'a self,
        tenant_id: Uuid,
        audience: &'a AudienceSpec,
    ) -> BoxFuture<'a, Result<Vec<Recipient>, InfraError>>;
}

/// Keeps the digits of `raw` and a leading `+`. `None` when no digit remains.
pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if trimmed.starts_with('+') {
        Some(format!("+{digits}"))
    } else {
        Some(digits)
    }
}

/// Values for every slot of `slots`. A mapping for the slot selects the
/// recipient attribute; otherwise `variable<n>` is used. Missing attributes
/// bind to the empty string.
pub fn bind_variables(
    slots: &[u32],
    mappings: &[VariableMapping],
    recipient: &Recipient,
) -> Variables {
    slots
        .iter()
        .map(|slot| {
            let key = slot.to_string();
            let source = mappings
                .iter()
                .find(|m| m.slot.trim() == key)
                .map(|m| m.source.clone())
                .unwrap_or_else(|| format!("variable{slot}"));
            let value = recipient.attributes.get(&source).cloned().unwrap_or_default();
            (key, value)
        })
        .collect()
}

/// String form of a JSON attribute value as it is substituted into a message.
pub(crate) fn attribute_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
