//! Text-to-Speech (TTS) trait definition

use anyhow::Result;
use async_trait::async_trait;

/// Output format for synthesized audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Mp3,
    Wav,
    OggOpus,
    Pcm,
}

/// Text-to-Speech trait for synthesizing audio from text
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize one sentence.
    ///
    /// `tone` is the speaker's dominant emotion dimension (e.g. `"joy"`);
    /// engines without emotional voices ignore it.
    async fn synthesize(&self, text: &str, tone: Option<&str>) -> Result<Vec<u8>>;

    fn format(&self) -> OutputFormat {
        OutputFormat::Mp3
    }

    fn voice_id(&self) -> &str;

    fn provider_name(&self) -> &'static str;
}

/// Engine that produces no audio bytes. Paired with a simulated output it
/// lets the pipeline run end to end without a speech backend.
#[derive(Debug, Default, Clone)]
pub struct SilentTts;

#[async_trait]
impl TextToSpeech for SilentTts {
    async fn synthesize(&self, _text: &str, _tone: Option<&str>) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Pcm
    }

    fn voice_id(&self) -> &str {
        "silent"
    }

    fn provider_name(&self) -> &'static str {
        "silent"
    }
}
