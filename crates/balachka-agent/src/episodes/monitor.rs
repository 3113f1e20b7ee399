//! Per-conversation sliding windows. The monitor is the exclusive owner
//! of every window; other components only ever see closed windows handed
//! back from `track`, `sweep`, or `drain`.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;

use balachka_core::config::EpisodeConfig;
use balachka_core::types::MessageRecord;

use super::boundary::BoundaryDetector;

/// An in-memory buffer of one conversation's recent messages.
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub messages: Vec<MessageRecord>,
    pub participants: HashSet<i64>,
    pub first_activity: i64,
    pub last_activity: i64,
}

impl ConversationWindow {
    fn start(message: MessageRecord) -> Self {
        let mut window = Self {
            chat_id: message.chat_id,
            thread_id: message.thread_id,
            messages: Vec::new(),
            participants: HashSet::new(),
            first_activity: message.created_at,
            last_activity: message.created_at,
        };
        window.push(message);
        window
    }

    fn push(&mut self, message: MessageRecord) {
        self.participants.insert(message.user_id);
        self.last_activity = message.created_at;
        self.messages.push(message);
    }

    pub fn duration_seconds(&self) -> i64 {
        self.last_activity - self.first_activity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Boundary,
    Timeout,
    Capacity,
    Shutdown,
}

impl CloseReason {
    /// Tag attached to heuristic episode summaries.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Boundary => "boundary",
            Self::Timeout => "timeout",
            Self::Capacity => "capacity",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
pub struct ClosedWindow {
    pub window: ConversationWindow,
    pub reason: CloseReason,
}

pub struct EpisodeMonitor {
    windows: DashMap<(i64, Option<i64>), ConversationWindow>,
    detector: BoundaryDetector,
    config: EpisodeConfig,
}

impl EpisodeMonitor {
    pub fn new(config: EpisodeConfig) -> Self {
        Self {
            windows: DashMap::new(),
            detector: BoundaryDetector::new(config.clone()),
            config,
        }
    }

    /// Track one message. At most one window closes per tracked message:
    /// on a stale window (inactivity), on capacity, or on a detected
    /// boundary once the window holds enough messages.
    pub fn track(&self, message: MessageRecord) -> Option<ClosedWindow> {
        let key = (message.chat_id, message.thread_id);
        let mut entry = self.windows.entry(key).or_insert_with({
            let message = message.clone();
            move || ConversationWindow::start(message)
        });
        let window = entry.value_mut();

        // The or_insert closure consumed the message for a brand-new window.
        if window.messages.len() == 1 && window.messages[0].id == message.id {
            return None;
        }

        // Inactivity between this message and the window's tail: the old
        // window closes as-is and the message starts a fresh one.
        if message.created_at - window.last_activity >= self.config.window_timeout_seconds {
            let closed = std::mem::replace(window, ConversationWindow::start(message));
            debug!(chat_id = closed.chat_id, messages = closed.messages.len(), "window closed: timeout");
            return Some(ClosedWindow {
                window: closed,
                reason: CloseReason::Timeout,
            });
        }

        window.push(message);

        if window.messages.len() >= self.config.max_messages_per_window {
            let closed = take_window(window);
            drop(entry);
            self.windows.remove(&key);
            debug!(chat_id = closed.chat_id, messages = closed.messages.len(), "window closed: capacity");
            return Some(ClosedWindow {
                window: closed,
                reason: CloseReason::Capacity,
            });
        }

        if window.messages.len() >= self.config.min_messages {
            let decision = self.detector.evaluate(&window.messages);
            if decision.create {
                if let Some(position) = decision.position.filter(|p| *p > 0) {
                    let (chat_id, thread_id) = (window.chat_id, window.thread_id);
                    let remainder = window.messages.split_off(position);
                    let closed =
                        std::mem::replace(window, rebuild_window(chat_id, thread_id, remainder));
                    debug!(
                        chat_id = closed.chat_id,
                        messages = closed.messages.len(),
                        score = decision.score,
                        "window closed: boundary"
                    );
                    return Some(ClosedWindow {
                        window: recount(closed),
                        reason: CloseReason::Boundary,
                    });
                }
            }
        }
        None
    }

    /// Close every window idle for at least the configured timeout. Run
    /// from the background sweep loop.
    pub fn sweep(&self, now: i64) -> Vec<ClosedWindow> {
        let stale: Vec<(i64, Option<i64>)> = self
            .windows
            .iter()
            .filter(|entry| now - entry.value().last_activity >= self.config.window_timeout_seconds)
            .map(|entry| *entry.key())
            .collect();

        stale
            .into_iter()
            .filter_map(|key| self.windows.remove(&key))
            .map(|(_, window)| {
                debug!(chat_id = window.chat_id, messages = window.messages.len(), "window closed: sweep timeout");
                ClosedWindow {
                    window,
                    reason: CloseReason::Timeout,
                }
            })
            .collect()
    }

    /// Flush all open windows (graceful shutdown).
    pub fn drain(&self) -> Vec<ClosedWindow> {
        let keys: Vec<(i64, Option<i64>)> = self.windows.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.windows.remove(&key))
            .map(|(_, window)| ClosedWindow {
                window,
                reason: CloseReason::Shutdown,
            })
            .collect()
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }
}

fn take_window(window: &mut ConversationWindow) -> ConversationWindow {
    window.clone()
}

fn rebuild_window(
    chat_id: i64,
    thread_id: Option<i64>,
    messages: Vec<MessageRecord>,
) -> ConversationWindow {
    let mut iter = messages.into_iter();
    let first = iter.next().expect("boundary split keeps at least one message");
    let mut window = ConversationWindow::start(first);
    window.chat_id = chat_id;
    window.thread_id = thread_id;
    for message in iter {
        window.push(message);
    }
    window
}

/// Recompute the participant set and activity bounds after a split.
fn recount(mut window: ConversationWindow) -> ConversationWindow {
    window.participants = window.messages.iter().map(|m| m.user_id).collect();
    if let (Some(first), Some(last)) = (window.messages.first(), window.messages.last()) {
        window.first_activity = first.created_at;
        window.last_activity = last.created_at;
    }
    window
}

/// Episode importance from window shape: message volume, breadth of
/// participation, and how long the conversation ran. Capped at 1.0.
pub fn episode_importance(message_count: usize, participant_count: usize, duration_secs: i64) -> f64 {
    let mut score: f64 = 0.3;
    score += match message_count {
        n if n >= 30 => 0.3,
        n if n >= 15 => 0.2,
        n if n >= 8 => 0.1,
        _ => 0.0,
    };
    score += match participant_count {
        n if n >= 4 => 0.2,
        3 => 0.15,
        2 => 0.1,
        _ => 0.0,
    };
    score += match duration_secs {
        d if d >= 1_800 => 0.2,
        d if d >= 600 => 0.1,
        _ => 0.0,
    };
    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use balachka_core::types::{ExternalIds, Role};
    use std::collections::BTreeMap;

    fn message(id: i64, chat_id: i64, user_id: i64, text: &str, at: i64) -> MessageRecord {
        MessageRecord {
            id,
            chat_id,
            thread_id: None,
            user_id,
            role: Role::User,
            text: text.to_string(),
            media: Vec::new(),
            metadata: BTreeMap::new(),
            embedding: None,
            created_at: at,
            external: ExternalIds::default(),
        }
    }

    fn monitor() -> EpisodeMonitor {
        EpisodeMonitor::new(EpisodeConfig::default())
    }

    #[test]
    fn capacity_closes_the_window() {
        let config = EpisodeConfig {
            max_messages_per_window: 5,
            ..EpisodeConfig::default()
        };
        let monitor = EpisodeMonitor::new(config);
        let mut closed = None;
        for i in 0..5 {
            closed = monitor.track(message(i, 1, 42, "same topic words here", 1_000 + i));
        }
        let closed = closed.expect("fifth message hits capacity");
        assert_eq!(closed.reason, CloseReason::Capacity);
        assert_eq!(closed.window.messages.len(), 5);
        assert_eq!(monitor.open_windows(), 0);
    }

    #[test]
    fn inactivity_gap_closes_and_restarts() {
        let monitor = monitor();
        monitor.track(message(1, 1, 42, "old talk", 1_000));
        monitor.track(message(2, 1, 42, "more old talk", 1_010));
        let closed = monitor
            .track(message(3, 1, 42, "hours later", 1_010 + 2_000))
            .expect("gap closes window");
        assert_eq!(closed.reason, CloseReason::Timeout);
        assert_eq!(closed.window.messages.len(), 2);
        // the new message seeds a fresh window
        assert_eq!(monitor.open_windows(), 1);
    }

    #[test]
    fn boundary_split_keeps_the_remainder() {
        let monitor = monitor();
        let texts = [
            "Python is great for this",
            "pandas handles the data",
            "numpy arrays are fast too",
            "matplotlib for the charts",
        ];
        for (i, text) in texts.iter().enumerate() {
            let mut m = message(i as i64, 1, 42, text, 1_000 + i as i64 * 10);
            m.embedding = Some(vec![1.0, 0.1]);
            assert!(monitor.track(m).is_none());
        }
        // marker + medium gap + semantic drift on the fifth message,
        // still inside the inactivity timeout
        let mut off_topic = message(5, 1, 43, "by the way, did anyone feed the cat", 1_030 + 1_000);
        off_topic.embedding = Some(vec![0.0, 1.0]);
        let closed = monitor.track(off_topic).expect("boundary closes the window");
        assert_eq!(closed.reason, CloseReason::Boundary);
        assert_eq!(closed.window.messages.len(), 4);
        assert_eq!(closed.window.participants.len(), 1);
        // the marker message lives on in the fresh window
        assert_eq!(monitor.open_windows(), 1);
    }

    #[test]
    fn sweep_closes_only_stale_windows() {
        let monitor = monitor();
        monitor.track(message(1, 1, 42, "chat one", 1_000));
        monitor.track(message(2, 2, 43, "chat two", 10_000));

        let closed = monitor.sweep(1_000 + 1_800);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].window.chat_id, 1);
        assert_eq!(monitor.open_windows(), 1);
    }

    #[test]
    fn drain_flushes_everything() {
        let monitor = monitor();
        monitor.track(message(1, 1, 42, "a", 1_000));
        monitor.track(message(2, 2, 42, "b", 1_000));
        let closed = monitor.drain();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|c| c.reason == CloseReason::Shutdown));
        assert_eq!(monitor.open_windows(), 0);
    }

    #[test]
    fn windows_are_keyed_by_chat_and_thread() {
        let monitor = monitor();
        monitor.track(message(1, 1, 42, "main", 1_000));
        let mut threaded = message(2, 1, 42, "thread", 1_000);
        threaded.thread_id = Some(5);
        monitor.track(threaded);
        assert_eq!(monitor.open_windows(), 2);
    }

    #[test]
    fn importance_brackets() {
        // short two-person exchange
        assert!((episode_importance(5, 2, 120) - 0.4).abs() < 1e-9);
        // long, busy, many-participant conversation caps at 1.0
        assert_eq!(episode_importance(60, 6, 4_000), 1.0);
        // monotone in each dimension
        assert!(episode_importance(16, 2, 120) > episode_importance(5, 2, 120));
        assert!(episode_importance(5, 4, 120) > episode_importance(5, 2, 120));
        assert!(episode_importance(5, 2, 2_000) > episode_importance(5, 2, 120));
    }
}
