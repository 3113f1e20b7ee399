//! Episode boundary detection: temporal gaps, topic-marker phrases, and
//! semantic drift between consecutive messages, combined into one score.
//!
//! Detection is a pure function of (messages, configuration) — same
//! inputs, same decision, every time.

use regex::Regex;

use balachka_core::config::EpisodeConfig;
use balachka_core::types::{cosine_similarity, MessageRecord};

/// Messages this close in time belong to one boundary cluster.
const CLUSTER_WINDOW_SECS: i64 = 60;
/// Strength of a matched topic-marker phrase.
const MARKER_STRENGTH: f64 = 0.8;
/// Cosine similarity at or above which no semantic signal fires.
const SEMANTIC_HIGH: f64 = 0.7;
/// Both sides of a semantic comparison need at least this many words.
const MIN_SEMANTIC_WORDS: usize = 3;

/// Topic-change phrases, Ukrainian and English. Compiled once,
/// case-insensitive with Unicode folding.
const TOPIC_MARKERS: &[&str] = &[
    r"(?i)\bby the way\b",
    r"(?i)\bbtw\b",
    r"(?i)\banyway\b",
    r"(?i)\bspeaking of\b",
    r"(?i)\bon another note\b",
    r"(?i)\bchang(e|ing) (the )?(subject|topic)\b",
    r"(?i)до речі",
    r"(?i)між іншим",
    r"(?i)не в тему",
    r"(?i)нова тема",
    r"(?i)поговор(и|і)мо про",
    r"(?i)а ще\b",
    r"(?i)до слова",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Temporal,
    TopicMarker,
    Semantic,
}

/// One boundary indication: the window should split *before* the message
/// at `position`.
#[derive(Debug, Clone)]
pub struct BoundarySignal {
    pub kind: SignalKind,
    pub strength: f64,
    pub position: usize,
}

#[derive(Debug, Clone)]
pub struct BoundaryDecision {
    pub create: bool,
    pub score: f64,
    pub position: Option<usize>,
    pub signals: Vec<BoundarySignal>,
}

impl BoundaryDecision {
    fn none() -> Self {
        Self {
            create: false,
            score: 0.0,
            position: None,
            signals: Vec::new(),
        }
    }
}

pub struct BoundaryDetector {
    config: EpisodeConfig,
    markers: Vec<Regex>,
}

impl BoundaryDetector {
    pub fn new(config: EpisodeConfig) -> Self {
        let markers = TOPIC_MARKERS
            .iter()
            .map(|pattern| Regex::new(pattern).expect("topic marker pattern"))
            .collect();
        Self { config, markers }
    }

    /// All raw signals over consecutive message pairs.
    pub fn detect_signals(&self, messages: &[MessageRecord]) -> Vec<BoundarySignal> {
        let mut signals = Vec::new();
        for (idx, pair) in messages.windows(2).enumerate() {
            let position = idx + 1;
            let (a, b) = (&pair[0], &pair[1]);

            if let Some(strength) = self.temporal_strength(b.created_at - a.created_at) {
                signals.push(BoundarySignal {
                    kind: SignalKind::Temporal,
                    strength,
                    position,
                });
            }
            if self.has_topic_marker(&b.text) {
                signals.push(BoundarySignal {
                    kind: SignalKind::TopicMarker,
                    strength: MARKER_STRENGTH,
                    position,
                });
            }
            if let Some(strength) = semantic_strength(a, b) {
                signals.push(BoundarySignal {
                    kind: SignalKind::Semantic,
                    strength,
                    position,
                });
            }
        }
        signals
    }

    /// Cluster signals, score the strongest cluster, compare against the
    /// boundary threshold.
    pub fn evaluate(&self, messages: &[MessageRecord]) -> BoundaryDecision {
        let signals = self.detect_signals(messages);
        if signals.is_empty() {
            return BoundaryDecision::none();
        }

        let mut best = BoundaryDecision::none();
        for cluster in cluster_signals(&signals, messages) {
            let score = score_cluster(&cluster);
            if score > best.score {
                best = BoundaryDecision {
                    create: false,
                    score,
                    position: cluster.first().map(|s| s.position),
                    signals: cluster,
                };
            }
        }
        best.create = best.score >= self.config.boundary_threshold;
        best
    }

    fn temporal_strength(&self, gap: i64) -> Option<f64> {
        if gap < self.config.short_gap_seconds {
            None
        } else if gap < self.config.medium_gap_seconds {
            Some(0.4)
        } else if gap < self.config.long_gap_seconds {
            Some(0.7)
        } else {
            Some(1.0)
        }
    }

    fn has_topic_marker(&self, text: &str) -> bool {
        self.markers.iter().any(|re| re.is_match(text))
    }
}

/// Semantic drift between two messages with embeddings. Requires at least
/// [`MIN_SEMANTIC_WORDS`] on each side; similarity at or above
/// [`SEMANTIC_HIGH`] means no signal.
fn semantic_strength(a: &MessageRecord, b: &MessageRecord) -> Option<f64> {
    if a.text.split_whitespace().count() < MIN_SEMANTIC_WORDS
        || b.text.split_whitespace().count() < MIN_SEMANTIC_WORDS
    {
        return None;
    }
    let (ea, eb) = (a.embedding.as_deref()?, b.embedding.as_deref()?);
    let similarity = cosine_similarity(ea, eb);
    if similarity >= SEMANTIC_HIGH {
        None
    } else {
        Some((1.0 - similarity).clamp(0.0, 1.0))
    }
}

/// Group signals whose boundary messages sit within one cluster window of
/// each other. Signals arrive ordered by position.
fn cluster_signals(
    signals: &[BoundarySignal],
    messages: &[MessageRecord],
) -> Vec<Vec<BoundarySignal>> {
    let mut clusters: Vec<Vec<BoundarySignal>> = Vec::new();
    for signal in signals {
        let t = messages[signal.position].created_at;
        match clusters.last_mut() {
            Some(cluster)
                if (t - messages[cluster[0].position].created_at).abs()
                    <= CLUSTER_WINDOW_SECS =>
            {
                cluster.push(signal.clone());
            }
            _ => clusters.push(vec![signal.clone()]),
        }
    }
    clusters
}

/// Weighted combination with a multi-signal bonus, capped at 1.0. A kind
/// that fired more than once in a cluster contributes its strongest
/// instance.
fn score_cluster(cluster: &[BoundarySignal]) -> f64 {
    let strongest = |kind: SignalKind| {
        cluster
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.strength)
            .fold(0.0f64, f64::max)
    };
    let semantic = strongest(SignalKind::Semantic);
    let temporal = strongest(SignalKind::Temporal);
    let marker = strongest(SignalKind::TopicMarker);

    let base = semantic * 0.40 + temporal * 0.35 + marker * 0.25;
    let kinds = [semantic, temporal, marker]
        .iter()
        .filter(|s| **s > 0.0)
        .count();
    let bonus = match kinds {
        3 => 1.30,
        2 => 1.20,
        _ => 1.0,
    };
    (base * bonus).min(1.0)
}
