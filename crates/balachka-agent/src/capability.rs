//! Model capability gate: what a given model identifier can accept, as a
//! pure function of the identifier string plus config override lists.
//! No network calls — detection must work before the first request.

use balachka_core::config::CapabilityConfig;
use balachka_core::types::MediaKind;
use tracing::debug;

use crate::provider::{Part, Turn};
use crate::telemetry::Telemetry;

/// History media cap for models with full multimodal support.
const MULTIMODAL_MEDIA_CAP: usize = 28;
/// Cap for image-only models.
const IMAGE_ONLY_MEDIA_CAP: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub supports_tools: bool,
    pub supports_images: bool,
    pub supports_audio: bool,
    pub supports_video: bool,
    pub max_media_items: usize,
}

impl ModelCapabilities {
    pub fn supports(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Image | MediaKind::Sticker => self.supports_images,
            MediaKind::Animation | MediaKind::Video => self.supports_video,
            MediaKind::Audio => self.supports_audio,
            MediaKind::Document => self.supports_images,
        }
    }
}

/// Detect capabilities for a model identifier. Family heuristics: "flash",
/// "1.5" and "2." generations are fully multimodal; embedding and
/// text-only families take no media at all; the config deny list switches
/// tools off regardless of family.
pub fn detect(model_id: &str, overrides: &CapabilityConfig) -> ModelCapabilities {
    let id = model_id.to_lowercase();

    let text_only = id.contains("embedding") || id.contains("text-") || id.contains("-lite");
    let full_multimodal = !text_only
        && (id.contains("flash")
            || id.contains("1.5")
            || id.contains("2.")
            || overrides.video_allow_list.iter().any(|m| id.contains(&m.to_lowercase())));
    let audio = full_multimodal
        || overrides
            .audio_allow_list
            .iter()
            .any(|m| id.contains(&m.to_lowercase()));

    let tools_denied = overrides
        .tool_deny_list
        .iter()
        .any(|m| id.contains(&m.to_lowercase()));

    let supports_images = !text_only;
    let max_media_items = overrides.max_media_items.unwrap_or(if full_multimodal {
        MULTIMODAL_MEDIA_CAP
    } else if supports_images {
        IMAGE_ONLY_MEDIA_CAP
    } else {
        0
    });

    ModelCapabilities {
        supports_tools: !tools_denied && !text_only,
        supports_images,
        supports_audio: audio,
        supports_video: full_multimodal,
        max_media_items,
    }
}

/// Filter media in the outbound request against the model's capabilities.
///
/// Unsupported kinds are dropped everywhere. When the remaining count
/// exceeds the cap, history media is dropped oldest-turn-first; media on
/// the current turn is always preserved.
pub fn filter_media(
    caps: &ModelCapabilities,
    history: &mut [Turn],
    current: &mut Vec<Part>,
    telemetry: &Telemetry,
) {
    drop_unsupported(caps, current, telemetry);
    for turn in history.iter_mut() {
        drop_unsupported(caps, &mut turn.parts, telemetry);
    }

    let current_count = media_count(current);
    let mut remaining = caps.max_media_items.saturating_sub(current_count);

    // Newest history turns keep their media first.
    for turn in history.iter_mut().rev() {
        let count = media_count(&turn.parts);
        if count == 0 {
            continue;
        }
        if count <= remaining {
            remaining -= count;
        } else {
            let keep = remaining;
            let mut seen = 0;
            turn.parts.retain(|part| {
                if matches!(part, Part::Media { .. }) {
                    seen += 1;
                    if seen > keep {
                        Telemetry::incr(&telemetry.media_dropped_over_cap);
                        return false;
                    }
                }
                true
            });
            remaining = 0;
        }
    }

    let included = current_count
        + history.iter().map(|t| media_count(&t.parts)).sum::<usize>();
    Telemetry::add(&telemetry.media_included, included as u64);
    if included > 0 {
        debug!(included, cap = caps.max_media_items, "media filtered for model");
    }
}

fn drop_unsupported(caps: &ModelCapabilities, parts: &mut Vec<Part>, telemetry: &Telemetry) {
    parts.retain(|part| match part {
        Part::Media { media } => {
            if caps.supports(media.kind) {
                true
            } else {
                Telemetry::incr(&telemetry.media_dropped_unsupported);
                false
            }
        }
        Part::Text { .. } => true,
    });
}

fn media_count(parts: &[Part]) -> usize {
    parts
        .iter()
        .filter(|p| matches!(p, Part::Media { .. }))
        .count()
}
