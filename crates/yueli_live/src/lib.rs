//! # YueLi Live
//!
//! Intake for the live-room event stream. Newline-delimited JSON envelopes
//! arrive over TCP, are validated and normalized into [`LiveEvent`]s, checked
//! for per-source sequence gaps, filtered, and fanned out to every subscribed
//! consumer through its own rate limiter and bounded priority mailbox.
//!
//! Nothing in the hub ever blocks on a slow consumer: excess events are
//! dropped and counted, least urgent first.

mod event;
mod filter;
mod hub;
mod intake;
mod limiter;
mod mailbox;
mod sequence;
mod server;

pub use event::{
    Danmaku, Gift, Guard, LiveEnvelope, LiveError, LiveEvent, LiveEventKind, LivePayload, SuperChat,
};
pub use filter::DanmakuFilter;
pub use hub::{IngestOutcome, LiveHub};
pub use intake::{pump, StreamEnd};
pub use limiter::TokenBucket;
pub use mailbox::LiveReceiver;
pub use sequence::{SequenceCheck, SequenceTracker};
pub use server::LiveServer;
