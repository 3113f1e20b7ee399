//! Token estimation shared by every layer and both output formats.
//!
//! Text counts as ceil(chars / 4). Every media item carries a non-zero
//! surcharge: inline payloads cost what the generation API bills per
//! image, remote references cost a flat URL fee. Both formats use these
//! exact numbers, so the budget invariants hold regardless of format.

use balachka_core::config::{INLINE_MEDIA_TOKENS, URI_MEDIA_TOKENS};
use balachka_core::types::{MediaDescriptor, MediaPayload, MessageRecord};

use crate::provider::{Part, Turn};

pub fn estimate_text(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn estimate_media(media: &MediaDescriptor) -> usize {
    let surcharge = match media.payload {
        MediaPayload::Inline { .. } => INLINE_MEDIA_TOKENS,
        MediaPayload::Uri { .. } => URI_MEDIA_TOKENS,
    };
    let caption = media
        .caption
        .as_deref()
        .map(estimate_text)
        .unwrap_or(0);
    surcharge + caption
}

pub fn estimate_message(message: &MessageRecord) -> usize {
    estimate_text(&message.text)
        + message.media.iter().map(estimate_media).sum::<usize>()
}

pub fn estimate_messages(messages: &[MessageRecord]) -> usize {
    messages.iter().map(estimate_message).sum()
}

pub fn estimate_part(part: &Part) -> usize {
    match part {
        Part::Text { text } => estimate_text(text),
        Part::Media { media } => estimate_media(media),
    }
}

pub fn estimate_turn(turn: &Turn) -> usize {
    turn.parts.iter().map(estimate_part).sum()
}
