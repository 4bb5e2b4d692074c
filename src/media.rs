//! Media pipeline: extraction and provider hand-off.
//!
//! Turns a fully reassembled upload into an audio stream via ffmpeg and
//! sequences the provider hand-off: extraction must finish before the
//! audio upload, and the upload must finish before the transcription job
//! is created. The pipeline itself holds no job state; the caller drives
//! the job record around these calls.

use std::sync::Arc;

use anyhow::{Context, Result};
use ffmpeg_sidecar::command::FfmpegCommand;
use log::info;

use crate::error::ServiceError;
use crate::provider::TranscriptionProvider;

pub struct MediaPipeline {
    provider: Arc<dyn TranscriptionProvider>,
    language_code: String,
}

impl MediaPipeline {
    pub fn new(provider: Arc<dyn TranscriptionProvider>, language_code: String) -> Self {
        Self {
            provider,
            language_code,
        }
    }

    pub fn language_code(&self) -> &str {
        &self.language_code
    }

    /// Extract the audio track of an uploaded media file as MP3 bytes.
    ///
    /// ffmpeg runs on the blocking pool; any failure surfaces as
    /// `ExtractionFailed`. Transient and permanent codec failures are not
    /// distinguished and nothing is retried.
    pub async fn extract_audio(&self, video: Vec<u8>) -> Result<Vec<u8>> {
        let result = tokio::task::spawn_blocking(move || extract_audio_blocking(&video))
            .await
            .context("extraction task panicked")?;
        result.map_err(|e| ServiceError::ExtractionFailed(e.to_string()).into())
    }

    /// Upload extracted audio and create the transcription job.
    ///
    /// Returns the provider audio URL and the new job id. A failure at
    /// either step aborts the sequence with its own error variant; the job
    /// remains retryable by re-issuing the upload.
    pub async fn request_transcription(&self, audio: Vec<u8>) -> Result<(String, String)> {
        let upload_url = self
            .provider
            .upload_audio(audio)
            .await
            .map_err(|e| ServiceError::ProviderUploadFailed(e.to_string()))?;
        let job_id = self
            .provider
            .create_transcript(&upload_url, &self.language_code)
            .await
            .map_err(|e| ServiceError::ProviderJobCreationFailed(e.to_string()))?;
        Ok((upload_url, job_id))
    }
}

fn extract_audio_blocking(video: &[u8]) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir().context("failed to create scratch directory")?;
    let input_path = dir.path().join("upload.media");
    let output_path = dir.path().join("audio.mp3");
    std::fs::write(&input_path, video).context("failed to stage uploaded media")?;

    let mut child = FfmpegCommand::new()
        .input(input_path.to_string_lossy().as_ref())
        .args(["-vn", "-codec:a", "libmp3lame", "-q:a", "0"])
        .overwrite()
        .output(output_path.to_string_lossy().as_ref())
        .spawn()
        .context("failed to spawn ffmpeg")?;
    let status = child.wait().context("ffmpeg did not run")?;
    if !status.success() {
        anyhow::bail!("ffmpeg exited with {}", status);
    }

    let audio = std::fs::read(&output_path).context("ffmpeg produced no audio output")?;
    info!(
        "Extracted audio of size: {:.2} MB",
        audio.len() as f64 / (1024.0 * 1024.0)
    );
    Ok(audio)
}
