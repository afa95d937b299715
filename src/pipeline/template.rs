//! Template renderer.
//!
//! Placeholders are `{name}`. Recognized names are substituted from the
//! original message; anything else is copied through verbatim. A `{` with no
//! closing `}` after it is the only malformed input.

use serde::{Deserialize, Serialize};

use crate::error::TemplateError;
use crate::pipeline::types::{Message, RenderedReply};

/// Date format used for `{received_date}`.
pub const RECEIVED_DATE_FORMAT: &str = "%B %d, %Y";

/// Placeholder names the renderer resolves.
pub const PLACEHOLDERS: &[&str] = &[
    "original_subject",
    "original_sender",
    "received_date",
    "sender_name",
    "sender_domain",
];

/// A named response template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub subject: String,
    pub body: String,
}

impl Template {
    pub fn new(name: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Check placeholder syntax without a message.
    pub fn validate(&self) -> Result<(), TemplateError> {
        scan(&self.subject, |_| None)?;
        scan(&self.body, |_| None)?;
        Ok(())
    }
}

/// Render `template` against `message`. Pure and deterministic.
pub fn render(template: &Template, message: &Message) -> Result<RenderedReply, TemplateError> {
    let resolve = |name: &str| resolve_placeholder(name, message);
    Ok(RenderedReply {
        subject: scan(&template.subject, resolve)?,
        body: scan(&template.body, resolve)?,
    })
}

fn resolve_placeholder(name: &str, message: &Message) -> Option<String> {
    match name {
        "original_subject" => Some(message.subject.clone()),
        "original_sender" => Some(message.sender.clone()),
        "received_date" => Some(message.received_at.format(RECEIVED_DATE_FORMAT).to_string()),
        "sender_name" => Some(message.display_name().to_string()),
        "sender_domain" => Some(message.sender_domain.clone()),
        _ => None,
    }
}

/// Walk `pattern`, replacing every `{name}` that `resolve` knows.
fn scan<F>(pattern: &str, resolve: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    let mut offset = 0;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return Err(TemplateError::UnterminatedPlaceholder {
                position: offset + open,
            });
        };

        let name = &after[..close];
        if name.contains('{') {
            // `{a{b}`: the first brace is literal, rescan from the inner one.
            out.push('{');
            rest = after;
            offset += open + 1;
            continue;
        }

        match resolve(name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
        offset += open + close + 2;
    }

    out.push_str(rest);
    Ok(out)
}
