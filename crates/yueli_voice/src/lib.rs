//! Voice module for YueLi
//!
//! - [`AudioRouter`]: one consumer loop per output device, three priority
//!   classes (speech > reaction > ambient), preemption and cancellation.
//! - [`AudioOutput`]: the device seam; [`SimulatedOutput`] stands in when no
//!   hardware backend is wired.
//! - [`TextToSpeech`] + [`Speaker`]: sentence-level synthesis of replies.

mod output;
mod router;
mod speaker;
mod tts;

pub use output::{AudioError, AudioOutput, AudioPayload, Playback, PlaybackHandle, SimulatedOutput};
pub use router::{AudioOutcome, AudioRequest, AudioRouter, AudioTicket, PriorityClass};
pub use speaker::{split_sentences, Speaker};
pub use tts::{OutputFormat, SilentTts, TextToSpeech};
