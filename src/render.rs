use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::stats::{DisplayIdentity, MetricsSnapshot};

const EMBED_COLOR: u32 = 0x004F_A3FF;
const FOOTER_ATTRIBUTION: &str = "Roblox Stats Discord Bot, licensed under CC BY 4.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub username: String,
    pub avatar_url: String,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Embed {
    pub title: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    pub footer: EmbedFooter,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

fn inline_field(name: &str, value: impl ToString) -> EmbedField {
    EmbedField {
        name: name.to_string(),
        value: value.to_string(),
        inline: true,
    }
}

/// Builds the webhook message for one refresh. Pure, no I/O.
#[must_use]
pub fn render(
    snapshot: &MetricsSnapshot,
    identity: &DisplayIdentity,
    now: DateTime<Utc>,
) -> WebhookPayload {
    WebhookPayload {
        username: identity.name.clone(),
        avatar_url: identity.icon_url.clone(),
        embeds: vec![Embed {
            title: format!("Live Stats - {}", identity.name),
            color: EMBED_COLOR,
            fields: vec![
                inline_field("Players Online", snapshot.players),
                inline_field("Visits", snapshot.visits),
                inline_field("Favorites", snapshot.favorites),
            ],
            footer: EmbedFooter {
                text: format!("{FOOTER_ATTRIBUTION} | v{}", env!("CARGO_PKG_VERSION")),
            },
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        }],
    }
}
