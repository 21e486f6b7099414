use crate::error::FieldError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Maximum message length in characters. Longer messages are a client error,
/// not a truncation.
pub const MAX_MESSAGE_CHARS: usize = 5000;

/// Maximum length for identifier-ish fields (channel, user, username, command).
pub const MAX_FIELD_CHARS: usize = 255;

/// Closed set of platforms the collectors normalize from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Discord,
    Slack,
    Kick,
}

impl Platform {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "twitch" => Some(Self::Twitch),
            "discord" => Some(Self::Discord),
            "slack" => Some(Self::Slack),
            "kick" => Some(Self::Kick),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twitch => "twitch",
            Self::Discord => "discord",
            Self::Slack => "slack",
            Self::Kick => "kick",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validated inbound unit of work. Immutable after normalization and
/// consumed exactly once by the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub platform: Platform,
    pub channel_id: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventRecord {
    /// Limit type an event charges: commands and plain messages have
    /// distinct ceilings.
    pub fn limit_type(&self) -> &'static str {
        if self.command.is_some() {
            "command"
        } else {
            "message"
        }
    }
}

/// Wire shape of an inbound event. Unknown top-level fields are rejected
/// outright; everything else is validated field by field so the caller gets
/// the complete list of violations in one pass.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEvent {
    platform: Option<String>,
    channel_id: Option<String>,
    user_id: Option<String>,
    username: Option<String>,
    message: Option<String>,
    command: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

/// Validate and canonicalize a raw JSON event.
///
/// Pure function: trims string fields, enforces the closed platform set and
/// length bounds, and collects every offending field instead of stopping at
/// the first.
pub fn normalize(raw: serde_json::Value) -> Result<EventRecord, Vec<FieldError>> {
    let raw: RawEvent = serde_json::from_value(raw).map_err(|e| {
        // Unknown fields and type mismatches surface here; serde reports
        // them one at a time, so this is a single structured entry.
        vec![FieldError::new("event", e.to_string(), "schema")]
    })?;

    let mut errors = Vec::new();

    let platform = match raw.platform.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push(FieldError::new("platform", "platform is required", "required"));
            None
        }
        Some(name) => match Platform::from_name(name) {
            Some(p) => Some(p),
            None => {
                errors.push(FieldError::new(
                    "platform",
                    format!("unknown platform '{}' (expected twitch|discord|slack|kick)", name),
                    "invalid",
                ));
                None
            }
        },
    };

    let channel_id = required_field(&mut errors, "channel_id", raw.channel_id, MAX_FIELD_CHARS);
    let user_id = required_field(&mut errors, "user_id", raw.user_id, MAX_FIELD_CHARS);
    let username = required_field(&mut errors, "username", raw.username, MAX_FIELD_CHARS);
    let message = required_field(&mut errors, "message", raw.message, MAX_MESSAGE_CHARS);

    // Optional command: blank canonicalizes to absent, overlong is an error.
    let command = match raw.command.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(cmd) if cmd.chars().count() > MAX_FIELD_CHARS => {
            errors.push(FieldError::new(
                "command",
                format!("must be at most {} characters", MAX_FIELD_CHARS),
                "length",
            ));
            None
        }
        Some(cmd) => Some(cmd.to_string()),
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(EventRecord {
        platform: platform.expect("validated above"),
        channel_id: channel_id.expect("validated above"),
        user_id: user_id.expect("validated above"),
        username: username.expect("validated above"),
        message: message.expect("validated above"),
        command,
        metadata: raw.metadata,
    })
}

fn required_field(
    errors: &mut Vec<FieldError>,
    name: &str,
    value: Option<String>,
    max_chars: usize,
) -> Option<String> {
    let value = match value {
        Some(v) => v,
        None => {
            errors.push(FieldError::new(name, format!("{} is required", name), "required"));
            return None;
        }
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        errors.push(FieldError::new(name, format!("{} must not be blank", name), "blank"));
        return None;
    }
    if trimmed.chars().count() > max_chars {
        errors.push(FieldError::new(
            name,
            format!("must be at most {} characters", max_chars),
            "length",
        ));
        return None;
    }

    Some(trimmed.to_string())
}
