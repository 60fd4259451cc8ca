//! Sentence-level speech.
//!
//! A reply is cut at sentence boundaries and each sentence is synthesized
//! and queued on its own, so the first sentence plays while the rest are
//! still being synthesized.

use crate::output::AudioPayload;
use crate::router::{AudioRequest, AudioRouter, AudioTicket, PriorityClass};
use crate::tts::TextToSpeech;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use yueli_core::SessionId;

/// Sentence-ending punctuation (including Chinese).
const SENTENCE_ENDERS: [char; 7] = ['。', '！', '？', '；', '!', '?', ';'];

/// Rough speaking rate used to size synthesized clips.
const MS_PER_CHAR: u64 = 220;
const MIN_CLIP: Duration = Duration::from_millis(400);

/// Split text after each sentence ender and at line breaks. Empty pieces are
/// dropped; the punctuation stays with its sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch == '\n' {
            result.push(std::mem::take(&mut current));
            continue;
        }
        current.push(ch);
        if SENTENCE_ENDERS.contains(&ch) {
            result.push(std::mem::take(&mut current));
        }
    }
    result.push(current);

    result
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.chars().all(|c| SENTENCE_ENDERS.contains(&c)))
        .collect()
}

fn estimate_duration(sentence: &str) -> Duration {
    Duration::from_millis(sentence.chars().count() as u64 * MS_PER_CHAR).max(MIN_CLIP)
}

pub struct Speaker {
    tts: Arc<dyn TextToSpeech>,
    router: AudioRouter,
}

impl Speaker {
    pub fn new(tts: Arc<dyn TextToSpeech>, router: AudioRouter) -> Self {
        Self { tts, router }
    }

    /// Synthesize `text` sentence by sentence and queue each as
    /// non-preemptible speech tied to `cancel`.
    ///
    /// A sentence that fails to synthesize is skipped with a warning.
    pub async fn speak(
        &self,
        session: &SessionId,
        text: &str,
        tone: Option<&str>,
        cancel: &CancellationToken,
    ) -> Vec<AudioTicket> {
        let mut tickets = Vec::new();
        for sentence in split_sentences(text) {
            if cancel.is_cancelled() {
                break;
            }
            let bytes = match self.tts.synthesize(&sentence, tone).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(
                        session = %session,
                        provider = self.tts.provider_name(),
                        "Speech synthesis failed, skipping sentence: {:#}",
                        e
                    );
                    continue;
                }
            };
            let payload = AudioPayload::Encoded {
                duration: estimate_duration(&sentence),
                label: sentence,
                bytes: bytes.into(),
                format: self.tts.format(),
            };
            let request = AudioRequest::new(payload, PriorityClass::Speech, session.clone())
                .preemptible(false)
                .cancelled_by(cancel);
            tickets.push(self.router.enqueue(request));
        }
        tracing::debug!(session = %session, sentences = tickets.len(), voice = self.tts.voice_id(), "Reply queued for speech");
        tickets
    }
}
