//! AssemblyAI-style transcription provider client.

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;

use super::{TranscriptPoll, TranscriptionProvider};
use crate::subtitle::Sentence;

const DEFAULT_BASE_URL: &str = "https://api.assemblyai.com/v2";

pub struct AssemblyAiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
struct SentencesResponse {
    sentences: Vec<Sentence>,
}

impl AssemblyAiClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .client
            .get(&url)
            .header("authorization", &self.api_key)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("provider returned {} for {}: {}", status, url, body);
        }
        Ok(res)
    }
}

#[async_trait]
impl TranscriptionProvider for AssemblyAiClient {
    async fn upload_audio(&self, audio: Vec<u8>) -> Result<String> {
        let url = format!("{}/upload", self.base_url);
        info!(
            "Uploading {:.2} MB of audio to the transcription provider...",
            audio.len() as f64 / (1024.0 * 1024.0)
        );
        let start = Instant::now();
        let res = self
            .client
            .post(&url)
            .header("authorization", &self.api_key)
            .header("content-type", "application/octet-stream")
            .body(audio)
            .send()
            .await
            .context("audio upload request failed")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("audio upload returned {}: {}", status, body);
        }
        let upload: UploadResponse = res.json().await.context("invalid upload response")?;
        info!(
            "Audio uploaded in {:.2} seconds",
            start.elapsed().as_secs_f64()
        );
        Ok(upload.upload_url)
    }

    async fn create_transcript(&self, audio_url: &str, language_code: &str) -> Result<String> {
        let url = format!("{}/transcript", self.base_url);
        let res = self
            .client
            .post(&url)
            .header("authorization", &self.api_key)
            .json(&serde_json::json!({
                "audio_url": audio_url,
                "language_code": language_code,
            }))
            .send()
            .await
            .context("transcript creation request failed")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("transcript creation returned {}: {}", status, body);
        }
        let created: CreateResponse = res.json().await.context("invalid transcript response")?;
        info!("Transcription job {} created", created.id);
        Ok(created.id)
    }

    async fn fetch_status(&self, job_id: &str) -> Result<TranscriptPoll> {
        let poll: TranscriptPoll = self
            .get(&format!("/transcript/{}", job_id))
            .await?
            .json()
            .await
            .context("invalid transcript status response")?;
        debug!("Job {} status: {}", job_id, poll.status);
        Ok(poll)
    }

    async fn fetch_sentences(&self, job_id: &str) -> Result<Vec<Sentence>> {
        let res: SentencesResponse = self
            .get(&format!("/transcript/{}/sentences", job_id))
            .await?
            .json()
            .await
            .context("invalid sentences response")?;
        Ok(res.sentences)
    }

    async fn fetch_srt(&self, job_id: &str) -> Result<String> {
        self.get(&format!("/transcript/{}/srt", job_id))
            .await?
            .text()
            .await
            .context("invalid srt response")
    }
}
