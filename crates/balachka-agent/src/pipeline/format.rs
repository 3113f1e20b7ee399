//! The two outbound prompt shapes.
//!
//! Structured: alternating user/model turns, each a list of typed parts
//! (metadata header, body text, media), with background/episodic context
//! carried in a separate system string. Compact: one line per turn with
//! `Display#IdSuffix` speakers, reply arrows, bracketed media tags, and a
//! trailing `[RESPOND]` marker; media still travels alongside for models
//! that accept it.

use std::collections::HashMap;

use balachka_core::config::MAX_USERNAME_CHARS;
use balachka_core::types::{MessageRecord, Role};

use crate::pipeline::context::ContextBundle;
use crate::provider::{Part, Turn};

/// `Display#IdSuffix` speaker label. The suffix disambiguates users who
/// share a display name.
fn speaker_label(message: &MessageRecord) -> String {
    let display = message
        .metadata
        .get("display_name")
        .map(String::as_str)
        .unwrap_or("user");
    let display: String = display.chars().take(MAX_USERNAME_CHARS).collect();
    let id_str = message.user_id.unsigned_abs().to_string();
    let suffix = &id_str[id_str.len().saturating_sub(4)..];
    format!("{display}#{suffix}")
}

/// Structured history turns for the LLM API. User turns get a metadata
/// header part before the body; model turns are body-only.
pub fn structured_history(messages: &[MessageRecord], bot_user_id: i64) -> Vec<Turn> {
    messages
        .iter()
        .map(|message| {
            let is_bot = message.user_id == bot_user_id || message.role == Role::Model;
            let mut parts = Vec::new();
            if !is_bot {
                parts.push(Part::text(format!("[{}]", speaker_label(message))));
            }
            if !message.text.is_empty() {
                parts.push(Part::text(message.text.clone()));
            }
            for media in &message.media {
                parts.push(Part::Media {
                    media: media.clone(),
                });
            }
            Turn {
                role: if is_bot { Role::Model } else { Role::User },
                parts,
            }
        })
        .collect()
}

/// Background + episodic summaries as one system-context string, or
/// `None` when both layers came back empty.
pub fn system_context(bundle: &ContextBundle) -> Option<String> {
    let mut sections = Vec::new();
    if !bundle.background.is_empty() {
        sections.push(bundle.background.clone());
    }
    if !bundle.episodic.is_empty() {
        sections.push(bundle.episodic.clone());
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Compact plain-text transcript. Reply chains render as `A → B: text`
/// when the reply target is inside the same window; media renders as
/// bracketed kind tags before the text.
pub fn compact_transcript(
    messages: &[MessageRecord],
    bot_user_id: i64,
    bot_name: &str,
) -> String {
    // Resolve reply targets by external message id within this window.
    let by_external: HashMap<&str, &MessageRecord> = messages
        .iter()
        .filter_map(|m| {
            m.external
                .message_id
                .as_deref()
                .map(|external_id| (external_id, m))
        })
        .collect();

    let mut out = String::new();
    for message in messages {
        let is_bot = message.user_id == bot_user_id || message.role == Role::Model;
        let speaker = if is_bot {
            bot_name.to_string()
        } else {
            speaker_label(message)
        };

        let target = message
            .external
            .reply_to_message_id
            .as_deref()
            .and_then(|id| by_external.get(id))
            .map(|m| {
                if m.user_id == bot_user_id || m.role == Role::Model {
                    bot_name.to_string()
                } else {
                    speaker_label(m)
                }
            });

        match target {
            Some(target) => out.push_str(&format!("{speaker} → {target}: ")),
            None => out.push_str(&format!("{speaker}: ")),
        }

        for media in &message.media {
            out.push_str(media.kind.tag());
            out.push(' ');
        }
        out.push_str(&message.text);
        out.push('\n');
    }
    out.push_str("[RESPOND]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use balachka_core::types::{
        ExternalIds, MediaDescriptor, MediaKind, MediaPayload,
    };
    use std::collections::BTreeMap;

    fn message(id: i64, user_id: i64, name: &str, text: &str) -> MessageRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert("display_name".to_string(), name.to_string());
        MessageRecord {
            id,
            chat_id: 1,
            thread_id: None,
            user_id,
            role: Role::User,
            text: text.to_string(),
            media: Vec::new(),
            metadata,
            embedding: None,
            created_at: 1_000 + id,
            external: ExternalIds {
                message_id: Some(id.to_string()),
                ..ExternalIds::default()
            },
        }
    }

    fn inline(kind: MediaKind) -> MediaDescriptor {
        MediaDescriptor {
            kind,
            mime: "application/octet-stream".into(),
            size_bytes: None,
            payload: MediaPayload::Inline { data: vec![0] },
            caption: None,
        }
    }

    #[test]
    fn compact_renders_media_replies_and_respond_marker() {
        let mut alice = message(1, 1001, "Alice", "image here");
        alice.media.push(inline(MediaKind::Image));
        let mut bot = message(2, 0, "bot", "...");
        bot.role = Role::Model;
        let mut bob = message(3, 2002, "Bob", "video here");
        bob.media.push(inline(MediaKind::Video));
        let mut charlie = message(4, 3003, "Charlie", "nice");
        charlie.external.reply_to_message_id = Some("1".to_string());

        let out = compact_transcript(&[alice, bot, bob, charlie], 0, "gryag");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Alice#1001: [Image] image here");
        assert_eq!(lines[1], "gryag: ...");
        assert_eq!(lines[2], "Bob#2002: [Video] video here");
        assert_eq!(lines[3], "Charlie#3003 → Alice#1001: nice");
        assert_eq!(lines[4], "[RESPOND]");
    }

    #[test]
    fn long_display_names_are_truncated() {
        let long = "x".repeat(200);
        let m = message(1, 1234, &long, "hi");
        let out = compact_transcript(&[m], 0, "bot");
        let label_len = out.split(':').next().unwrap().len();
        // 60 chars of name + "#1234"
        assert_eq!(label_len, MAX_USERNAME_CHARS + 5);
    }

    #[test]
    fn structured_history_alternates_roles_with_headers() {
        let alice = message(1, 1001, "Alice", "hello");
        let mut bot = message(2, 0, "bot", "hi there");
        bot.role = Role::Model;

        let turns = structured_history(&[alice, bot], 0);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].parts[0], Part::text("[Alice#1001]"));
        assert_eq!(turns[0].parts[1], Part::text("hello"));
        assert_eq!(turns[1].role, Role::Model);
        assert_eq!(turns[1].parts, vec![Part::text("hi there")]);
    }

    #[test]
    fn short_user_ids_keep_their_full_suffix() {
        let m = message(1, 7, "Zed", "hi");
        assert!(compact_transcript(&[m], 0, "bot").starts_with("Zed#7: "));
    }
}
