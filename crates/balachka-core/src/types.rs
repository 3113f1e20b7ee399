use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Who authored a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Model => write!(f, "model"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "model" => Ok(Self::Model),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Media attachment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Animation,
}

impl MediaKind {
    /// Bracketed tag used by the compact transcript format.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Image => "[Image]",
            Self::Video => "[Video]",
            Self::Audio => "[Audio]",
            Self::Document => "[Document]",
            Self::Sticker => "[Sticker]",
            Self::Animation => "[Animation]",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Animation => "animation",
        };
        write!(f, "{s}")
    }
}

/// Where the media bytes live. Exactly one variant per descriptor, so the
/// "inline XOR uri" invariant is carried by the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum MediaPayload {
    Inline {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Uri {
        uri: String,
    },
}

/// One attachment on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub payload: MediaPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl MediaDescriptor {
    pub fn is_inline(&self) -> bool {
        matches!(self.payload, MediaPayload::Inline { .. })
    }
}

/// Transport-assigned identifiers, kept as strings end-to-end so 64-bit
/// values never round-trip through a lossy JSON number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    pub message_id: Option<String>,
    pub user_id: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub reply_to_user_id: Option<String>,
}

/// A persisted chat message. `id` is the only join key inside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub user_id: i64,
    pub role: Role,
    pub text: String,
    pub media: Vec<MediaDescriptor>,
    pub metadata: BTreeMap<String, String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
    pub external: ExternalIds,
}

/// The subject a fact describes: a user (positive id) or a chat (signed,
/// typically negative for groups).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum Entity {
    User(i64),
    Chat(i64),
}

impl Entity {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Chat(_) => "chat",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::User(id) | Self::Chat(id) => *id,
        }
    }

    pub fn from_kind(kind: &str, id: i64) -> Result<Self, String> {
        match kind {
            "user" => Ok(Self::User(id)),
            "chat" => Ok(Self::Chat(id)),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Closed fact taxonomy. The set is fixed; unknown strings are rejected at
/// the parse boundary rather than coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Personal,
    Preference,
    Skill,
    Interest,
    Language,
    Location,
    Relationship,
    Rule,
    Trait,
    Style,
    Topic,
    Norm,
    Culture,
}

impl FactCategory {
    pub const ALL: [FactCategory; 13] = [
        Self::Personal,
        Self::Preference,
        Self::Skill,
        Self::Interest,
        Self::Language,
        Self::Location,
        Self::Relationship,
        Self::Rule,
        Self::Trait,
        Self::Style,
        Self::Topic,
        Self::Norm,
        Self::Culture,
    ];
}

impl std::fmt::Display for FactCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Personal => "personal",
            Self::Preference => "preference",
            Self::Skill => "skill",
            Self::Interest => "interest",
            Self::Language => "language",
            Self::Location => "location",
            Self::Relationship => "relationship",
            Self::Rule => "rule",
            Self::Trait => "trait",
            Self::Style => "style",
            Self::Topic => "topic",
            Self::Norm => "norm",
            Self::Culture => "culture",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for FactCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(Self::Personal),
            "preference" => Ok(Self::Preference),
            "skill" => Ok(Self::Skill),
            "interest" => Ok(Self::Interest),
            "language" => Ok(Self::Language),
            "location" => Ok(Self::Location),
            "relationship" => Ok(Self::Relationship),
            "rule" => Ok(Self::Rule),
            "trait" => Ok(Self::Trait),
            "style" => Ok(Self::Style),
            "topic" => Ok(Self::Topic),
            "norm" => Ok(Self::Norm),
            "culture" => Ok(Self::Culture),
            other => Err(format!("unknown fact category: {other}")),
        }
    }
}

/// What happened to a fact in a single version transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactChange {
    Created,
    Reinforced,
    Evolved,
    Corrected,
    Superseded,
    Deleted,
}

impl std::fmt::Display for FactChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Reinforced => "reinforced",
            Self::Evolved => "evolved",
            Self::Corrected => "corrected",
            Self::Superseded => "superseded",
            Self::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for FactChange {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "reinforced" => Ok(Self::Reinforced),
            "evolved" => Ok(Self::Evolved),
            "corrected" => Ok(Self::Corrected),
            "superseded" => Ok(Self::Superseded),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown fact change: {other}")),
        }
    }
}

/// A learned fact about an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub entity: Entity,
    /// Chat the fact was learned in, when a user fact has chat context.
    pub chat_context: Option<i64>,
    pub category: FactCategory,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub evidence_count: u32,
    pub evidence_text: String,
    pub source_message_id: Option<i64>,
    pub embedding: Option<Vec<f32>>,
    /// Per-day exponential decay rate, assigned from the category table.
    pub decay_rate: f64,
    pub created_at: i64,
    pub updated_at: i64,
    pub active: bool,
}

/// Confidence floor below which decay never pushes a fact.
pub const CONFIDENCE_FLOOR: f64 = 0.1;

impl Fact {
    /// Confidence after temporal decay, read-time only. Monotone in age,
    /// floored at [`CONFIDENCE_FLOOR`].
    pub fn effective_confidence(&self, now: i64) -> f64 {
        let age_days = (now - self.updated_at).max(0) as f64 / 86_400.0;
        let decayed = self.confidence * (-self.decay_rate * age_days).exp();
        decayed.max(CONFIDENCE_FLOOR)
    }
}

/// One append-only version row in a fact's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactVersion {
    pub id: i64,
    pub fact_id: i64,
    pub change: FactChange,
    pub confidence_delta: f64,
    pub prior_value: Option<String>,
    pub new_value: Option<String>,
    pub created_at: i64,
}

/// Emotional tone of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Valence {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

impl std::fmt::Display for Valence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Mixed => "mixed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Valence {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "neutral" => Ok(Self::Neutral),
            "mixed" => Ok(Self::Mixed),
            other => Err(format!("unknown valence: {other}")),
        }
    }
}

/// A durable summary of a bounded conversation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub participant_ids: Vec<i64>,
    pub topic: String,
    pub summary: String,
    pub valence: Valence,
    pub tags: Vec<String>,
    /// Internal message ids, non-empty and strictly increasing.
    pub message_ids: Vec<i64>,
    pub importance: f64,
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

/// A message as handed to the engine by the transport adapter, before it
/// has an internal id.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub user_id: i64,
    pub display_name: String,
    pub username: Option<String>,
    pub text: String,
    pub media: Vec<MediaDescriptor>,
    pub timestamp: i64,
    pub external: ExternalIds,
    /// Mention, reply to the bot, or private chat — the bot must answer.
    pub addressed: bool,
}

/// Cosine similarity over two equal-length vectors. Returns 0.0 when either
/// side has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        na += *x as f64 * *x as f64;
        nb += *y as f64 * *y as f64;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Current wall clock as epoch seconds — the engine's timestamp unit.
pub fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_round_trips_kind_and_id() {
        let e = Entity::Chat(-100123);
        assert_eq!(e.kind(), "chat");
        assert_eq!(e.id(), -100123);
        assert_eq!(Entity::from_kind("chat", -100123).unwrap(), e);
        assert!(Entity::from_kind("robot", 1).is_err());
    }

    #[test]
    fn fact_category_parses_all_variants() {
        for cat in FactCategory::ALL {
            let s = cat.to_string();
            assert_eq!(s.parse::<FactCategory>().unwrap(), cat);
        }
        assert!("mood".parse::<FactCategory>().is_err());
    }

    #[test]
    fn effective_confidence_decays_and_floors() {
        let mut fact = Fact {
            id: 1,
            entity: Entity::User(42),
            chat_context: None,
            category: FactCategory::Personal,
            key: "location".into(),
            value: "kyiv".into(),
            confidence: 0.9,
            evidence_count: 1,
            evidence_text: String::new(),
            source_message_id: None,
            embedding: None,
            decay_rate: 0.05,
            created_at: 0,
            updated_at: 0,
            active: true,
        };
        let fresh = fact.effective_confidence(0);
        let month = fact.effective_confidence(30 * 86_400);
        let decade = fact.effective_confidence(3650 * 86_400);
        assert!(fresh > month, "decay must be monotone");
        assert!((fresh - 0.9).abs() < 1e-9);
        assert_eq!(decade, CONFIDENCE_FLOOR);

        // zero decay rate never loses confidence
        fact.decay_rate = 0.0;
        assert!((fact.effective_confidence(3650 * 86_400) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn media_payload_serializes_inline_as_base64() {
        let media = MediaDescriptor {
            kind: MediaKind::Image,
            mime: "image/png".into(),
            size_bytes: Some(3),
            payload: MediaPayload::Inline {
                data: vec![1, 2, 3],
            },
            caption: None,
        };
        let json = serde_json::to_string(&media).unwrap();
        assert!(json.contains("\"AQID\""), "got {json}");
        let back: MediaDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, media);
    }

    #[test]
    fn cosine_similarity_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        let sim = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-9);
    }
}
