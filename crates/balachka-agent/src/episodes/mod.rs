//! Episodic memory: boundary detection over message sequences, the
//! per-conversation window monitor, and the summarizer that turns a
//! closed window into a durable episode.

pub mod boundary;
pub mod monitor;
pub mod summarizer;
