//! Live poll backend: many concurrent voters update shared counters, many
//! concurrent viewers watch them change in near-real time without polling
//! the authoritative store.
//!
//! The pipeline: vote submission → event log → [`processor::VoteProcessor`]
//! (authoritative write + counter cache delta) → change notification on a
//! per-poll channel → [`multiplexer`] (one shared subscription connection)
//! → [`fanout::FanoutManager`] (admission-limited per-client mailboxes) →
//! SSE stream to the viewer.

pub mod cache;
pub mod config;
pub mod counter;
pub mod db;
pub mod error;
pub mod events;
pub mod fanout;
pub mod multiplexer;
pub mod notify;
pub mod processor;
pub mod pubsub;
pub mod sse;
pub mod startup;
pub mod votes;
