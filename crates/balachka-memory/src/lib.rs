//! Persistence layer: conversation, fact, episode, and system-prompt
//! stores over a single shared SQLite connection, plus the hybrid search
//! engine and retention pruning.

pub mod conversation;
pub mod db;
pub mod episodes;
pub mod error;
pub mod facts;
pub mod normalize;
pub mod prompts;
pub mod search;
