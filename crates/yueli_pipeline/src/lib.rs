//! # YueLi Pipeline
//!
//! Wires the emotion store, decision engine, dispatcher and audio router
//! around an explicit session registry. Every stage receives a session id;
//! ending a session is the single point that cancels its queued work and
//! forgets its state.

mod pipeline;
mod session;

pub use pipeline::{Pipeline, ReplyOutcome, Teardown, TurnOutcome, REACTION_SOUND_LENGTH};
pub use session::{SessionHandle, SessionRegistry};
