//! # YueLi Expression
//!
//! Turns what the avatar means and feels into what it visibly does.
//!
//! - [`DecisionEngine`] fuses a semantic signal, an emotion snapshot and the
//!   per-session action history into a [`Decision`](yueli_core::Decision).
//! - [`Dispatcher`] sends the chosen action's trigger bindings to an
//!   [`AvatarControl`] target, one in-flight intent per exclusivity group.
//! - [`ActionLedger`] is the history both of them share: cooldowns,
//!   reservations, failure streaks and occupied groups.

pub mod decision;
pub mod dispatcher;
pub mod ledger;

pub use decision::DecisionEngine;
pub use dispatcher::{AvatarControl, AvatarError, DispatchRejection, DispatchTicket, Dispatcher};
pub use ledger::ActionLedger;
