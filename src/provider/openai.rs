//! Chat-completion translation provider client.
//!
//! Sentence translation round-trips the timestamped sentence list through
//! the model as a JSON array; the model is instructed to return only the
//! modified array so the reply parses directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use reqwest::Client;

use super::Translator;
use crate::subtitle::Sentence;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const SENTENCES_PROMPT: &str = "You are given a stringified JSON array that represents a \
timestamped Hindi transcript that contains quotations in Sanskrit. Translate the text into \
English, skipping any quotations in Sanskrit, and return the modified array. Only include \
the array in the response so that it can be easily parsed by the client.";

const TRANSCRIPT_PROMPT: &str =
    "Translate the given Hindi transcript into English, skipping any quotations in Sanskrit.";

pub struct OpenAiTranslator {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiTranslator {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or_else(|| "gpt-4o".to_string()),
        }
    }

    async fn chat(&self, developer_prompt: &str, user_content: String) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [
                    { "role": "developer", "content": developer_prompt },
                    { "role": "user", "content": user_content },
                ],
            }))
            .send()
            .await
            .context("translation request failed")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("translation provider returned {}: {}", status, body);
        }
        let json: serde_json::Value = res.json().await?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .context("translation response missing content")?;
        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    async fn translate_sentences(&self, sentences: &[Sentence]) -> Result<Vec<Sentence>> {
        info!("Translating {} sentences...", sentences.len());
        let payload = serde_json::to_string(sentences)?;
        let reply = self.chat(SENTENCES_PROMPT, payload).await?;
        serde_json::from_str(&reply).context("translated sentence array did not parse")
    }

    async fn translate_transcript(&self, transcript: &str) -> Result<String> {
        info!("Translating transcript ({} chars)...", transcript.len());
        self.chat(TRANSCRIPT_PROMPT, transcript.to_string()).await
    }
}
