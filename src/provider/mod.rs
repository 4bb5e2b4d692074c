//! External provider boundary.
//!
//! The service talks to two collaborators over HTTP: a transcription
//! provider (audio upload, job creation, status polling, result fetch) and
//! a translation provider (chat-completion style). Both are behind traits
//! so the job tracker and event router can be exercised against scripted
//! implementations in tests.

mod assemblyai;
mod openai;

pub use assemblyai::AssemblyAiClient;
pub use openai::OpenAiTranslator;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::subtitle::Sentence;

/// Provider-reported lifecycle of a transcription job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl std::fmt::Display for TranscriptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TranscriptStatus::Queued => "queued",
            TranscriptStatus::Processing => "processing",
            TranscriptStatus::Completed => "completed",
            TranscriptStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One status read of a transcription job.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptPoll {
    pub status: TranscriptStatus,
    /// Full transcript text, present once the job completed.
    pub text: Option<String>,
    /// Failure reason, present when `status` is `error`.
    pub error: Option<String>,
}

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Upload raw audio bytes; returns the provider-hosted audio URL.
    async fn upload_audio(&self, audio: Vec<u8>) -> Result<String>;

    /// Create a transcription job for a previously uploaded audio URL;
    /// returns the provider's job id.
    async fn create_transcript(&self, audio_url: &str, language_code: &str) -> Result<String>;

    /// Read the current job status. One call per client poll.
    async fn fetch_status(&self, job_id: &str) -> Result<TranscriptPoll>;

    /// Fetch the timestamped sentence list of a completed job.
    async fn fetch_sentences(&self, job_id: &str) -> Result<Vec<Sentence>>;

    /// Fetch the provider-rendered SRT of a completed job.
    async fn fetch_srt(&self, job_id: &str) -> Result<String>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate a sentence list, preserving timestamps and order.
    async fn translate_sentences(&self, sentences: &[Sentence]) -> Result<Vec<Sentence>>;

    /// Translate a plain transcript.
    async fn translate_transcript(&self, transcript: &str) -> Result<String>;
}
