//! # YueLi VTS
//!
//! [`AvatarControl`](yueli_expression::AvatarControl) over the VTube Studio
//! public WebSocket API. The client keeps one connection alive in the
//! background, authenticates as a plugin, and fires hotkeys by id or name.

mod client;
mod message;

pub use client::{backoff, VtsClient};
pub use message::{VtsRequest, VtsResponse, API_NAME, API_VERSION};
