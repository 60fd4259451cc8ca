//! # YueLi Limbic Store
//!
//! Holds the avatar's emotion per session. Unlike a heartbeat-driven model,
//! nothing runs in the background: each read or write first relaxes the stored
//! values toward their baselines for the time elapsed since the last write,
//! so an idle session costs nothing.
//!
//! Writes for one session are serialized; sessions are independent.

mod store;

pub use store::EmotionStore;
