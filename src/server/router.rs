//! Inbound event dispatch.
//!
//! Maps the three client event kinds (`upload` as a binary chunk frame,
//! `pollTranscription` and `translate` as JSON text frames) onto the
//! upload registry, media pipeline, and job tracker, and converts every
//! component error into a single `error` event that echoes the client's
//! correlation id. Nothing in here tears down a connection.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::frame::parse_chunk_frame;
use crate::error::ServiceError;
use crate::job::{Job, JobState, JobTracker, PollOutcome, TranslateOptions};
use crate::media::MediaPipeline;
use crate::provider::{TranscriptionProvider, Translator};
use crate::upload::{SubmitOutcome, UploadRegistry};

/// Outbound event kinds.
pub mod events {
    pub const PROGRESS: &str = "progress";
    pub const TRANSCRIPTION_QUEUED: &str = "transcriptionQueued";
    pub const TRANSCRIPTION_IN_PROGRESS: &str = "transcriptionInProgress";
    pub const TRANSCRIPTION_COMPLETE: &str = "transcriptionComplete";
    pub const TRANSCRIPTION_FAILED: &str = "transcriptionFailed";
    pub const TRANSLATION_IN_PROGRESS: &str = "translationInProgress";
    pub const TRANSLATION_SUCCESS: &str = "translationSuccess";
    pub const ERROR: &str = "error";
}

/// Envelope for every outbound event: `{event, id, data}`, where `id` is
/// the client correlation id echoed verbatim.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OutboundEvent {
    pub event: String,
    pub id: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event: &str, id: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            id: id.to_string(),
            data,
        }
    }

    pub fn progress(id: &str, data: Value) -> Self {
        Self::new(events::PROGRESS, id, data)
    }

    pub fn error(id: &str, message: String) -> Self {
        Self::new(events::ERROR, id, json!({ "message": message }))
    }
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    event: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollRequest {
    #[serde(alias = "transcriptId")]
    job_id: String,
    #[serde(default = "default_true")]
    include_transcript: bool,
    #[serde(default = "default_true")]
    include_sentences: bool,
    #[serde(default = "default_true")]
    include_srt: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateRequest {
    #[serde(alias = "transcriptId")]
    job_id: String,
    #[serde(default = "default_true")]
    include_srt: bool,
    #[serde(default = "default_true")]
    include_sentences: bool,
    #[serde(default)]
    include_transcript: bool,
}

fn default_true() -> bool {
    true
}

/// Per-connection bookkeeping: which upload sessions and jobs this
/// connection created, so closing it can clean them up.
#[derive(Default)]
pub struct ConnectionScope {
    sessions: Mutex<HashSet<String>>,
    jobs: Mutex<HashSet<String>>,
}

pub struct EventRouter {
    uploads: Arc<UploadRegistry>,
    jobs: Arc<JobTracker>,
    pipeline: MediaPipeline,
    provider: Arc<dyn TranscriptionProvider>,
    translator: Arc<dyn Translator>,
}

impl EventRouter {
    pub fn new(
        uploads: Arc<UploadRegistry>,
        jobs: Arc<JobTracker>,
        provider: Arc<dyn TranscriptionProvider>,
        translator: Arc<dyn Translator>,
        language_code: String,
    ) -> Self {
        Self {
            uploads,
            jobs,
            pipeline: MediaPipeline::new(provider.clone(), language_code),
            provider,
            translator,
        }
    }

    /// Handle one binary frame: an upload chunk, possibly the completing
    /// one, in which case the whole extract/upload/queue pipeline runs.
    pub async fn dispatch_chunk(
        &self,
        scope: &ConnectionScope,
        frame: &[u8],
        tx: &mpsc::Sender<OutboundEvent>,
    ) {
        let frame = match parse_chunk_frame(frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Rejecting malformed chunk frame: {}", e);
                let _ = tx.send(OutboundEvent::error("", e.to_string())).await;
                return;
            }
        };
        let id = frame.correlation_id.clone();
        scope.sessions.lock().unwrap().insert(id.clone());

        match self.uploads.submit_chunk(&id, &frame.meta, frame.payload) {
            Ok(SubmitOutcome::Pending { received, total }) => {
                let _ = tx
                    .send(OutboundEvent::progress(
                        &id,
                        json!({
                            "uploadUrl": null,
                            "status": "pending",
                            "receivedChunks": received,
                            "totalChunks": total,
                        }),
                    ))
                    .await;
            }
            Ok(SubmitOutcome::Completed(video)) => {
                if let Err(e) = self.run_pipeline(scope, &id, video, tx).await {
                    error!("Pipeline for session {} failed: {}", id, e);
                    let _ = tx.send(OutboundEvent::error(&id, e.to_string())).await;
                }
            }
            Err(e) => {
                let _ = tx.send(OutboundEvent::error(&id, e.to_string())).await;
            }
        }
    }

    async fn run_pipeline(
        &self,
        scope: &ConnectionScope,
        id: &str,
        video: Vec<u8>,
        tx: &mpsc::Sender<OutboundEvent>,
    ) -> anyhow::Result<()> {
        let _ = tx
            .send(OutboundEvent::progress(
                id,
                json!({ "message": "Starting audio extraction..." }),
            ))
            .await;

        let mut job = Job::new(self.pipeline.language_code().to_string());
        job.advance(JobState::Uploading)?;
        job.advance(JobState::Extracting)?;

        let audio = self.pipeline.extract_audio(video).await?;
        let _ = tx
            .send(OutboundEvent::progress(
                id,
                json!({ "message": "Audio extracted..." }),
            ))
            .await;

        let (upload_url, job_id) = self.pipeline.request_transcription(audio).await?;
        job.advance(JobState::Uploaded)?;
        let _ = tx
            .send(OutboundEvent::progress(
                id,
                json!({
                    "message": "File uploaded to servers...",
                    "uploadUrl": upload_url,
                    "status": "completed",
                }),
            ))
            .await;

        job.job_id = Some(job_id.clone());
        job.advance(JobState::TranscriptionQueued)?;
        self.jobs.insert(job)?;
        scope.jobs.lock().unwrap().insert(job_id.clone());

        let _ = tx
            .send(OutboundEvent::new(
                events::TRANSCRIPTION_QUEUED,
                id,
                json!({
                    "transcriptId": job_id,
                    "message": "Transcription process has started.",
                }),
            ))
            .await;
        Ok(())
    }

    /// Handle one JSON text frame.
    pub async fn dispatch_text(
        &self,
        _scope: &ConnectionScope,
        text: &str,
        tx: &mpsc::Sender<OutboundEvent>,
    ) {
        let envelope: InboundEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Rejecting unparseable message: {}", e);
                let _ = tx
                    .send(OutboundEvent::error("", format!("invalid message: {}", e)))
                    .await;
                return;
            }
        };

        let result = match envelope.event.as_str() {
            "pollTranscription" => self.handle_poll(&envelope.id, envelope.data, tx).await,
            "translate" => self.handle_translate(&envelope.id, envelope.data, tx).await,
            other => Err(ServiceError::UnknownEvent(other.to_string()).into()),
        };
        if let Err(e) = result {
            debug!("Event {} failed: {}", envelope.event, e);
            let _ = tx
                .send(OutboundEvent::error(&envelope.id, e.to_string()))
                .await;
        }
    }

    async fn handle_poll(
        &self,
        id: &str,
        data: Value,
        tx: &mpsc::Sender<OutboundEvent>,
    ) -> anyhow::Result<()> {
        let req: PollRequest =
            serde_json::from_value(data).map_err(|e| anyhow::anyhow!("invalid pollTranscription payload: {}", e))?;
        debug!("Checking transcription status for {}", req.job_id);

        match self.jobs.poll(&req.job_id, &*self.provider).await? {
            PollOutcome::InProgress { status } => {
                let _ = tx
                    .send(OutboundEvent::new(
                        events::TRANSCRIPTION_IN_PROGRESS,
                        id,
                        json!({
                            "transcriptId": req.job_id,
                            "message": format!("Transcription status: {}", status),
                        }),
                    ))
                    .await;
            }
            PollOutcome::Complete {
                transcript,
                sentences,
                srt,
            } => {
                let _ = tx
                    .send(OutboundEvent::new(
                        events::TRANSCRIPTION_IN_PROGRESS,
                        id,
                        json!({
                            "transcriptId": req.job_id,
                            "message": "Transcription status: completed",
                        }),
                    ))
                    .await;
                let _ = tx
                    .send(OutboundEvent::new(
                        events::TRANSCRIPTION_COMPLETE,
                        id,
                        json!({
                            "transcriptId": req.job_id,
                            "text": req.include_transcript.then_some(transcript).flatten(),
                            "sentences": req.include_sentences.then_some(sentences),
                            "srt": req.include_srt.then_some(srt).flatten(),
                        }),
                    ))
                    .await;
            }
            PollOutcome::Failed { reason } => {
                let _ = tx
                    .send(OutboundEvent::new(
                        events::TRANSCRIPTION_IN_PROGRESS,
                        id,
                        json!({
                            "transcriptId": req.job_id,
                            "message": "Transcription status: error",
                        }),
                    ))
                    .await;
                let _ = tx
                    .send(OutboundEvent::new(
                        events::TRANSCRIPTION_FAILED,
                        id,
                        json!({
                            "transcriptId": req.job_id,
                            "text": "Transcription failed",
                            "message": reason,
                        }),
                    ))
                    .await;
            }
        }
        Ok(())
    }

    async fn handle_translate(
        &self,
        id: &str,
        data: Value,
        tx: &mpsc::Sender<OutboundEvent>,
    ) -> anyhow::Result<()> {
        let req: TranslateRequest =
            serde_json::from_value(data).map_err(|e| anyhow::anyhow!("invalid translate payload: {}", e))?;

        let _ = tx
            .send(OutboundEvent::new(
                events::TRANSLATION_IN_PROGRESS,
                id,
                json!({
                    "transcriptId": req.job_id,
                    "message": "Translating transcript...",
                }),
            ))
            .await;

        let options = TranslateOptions {
            include_sentences: req.include_sentences,
            include_srt: req.include_srt,
            include_transcript: req.include_transcript,
        };
        let outcome = self
            .jobs
            .translate(&req.job_id, &*self.translator, options)
            .await?;

        let _ = tx
            .send(OutboundEvent::new(
                events::TRANSLATION_SUCCESS,
                id,
                json!({
                    "transcriptId": req.job_id,
                    "sentences": outcome.sentences,
                    "srt": outcome.srt,
                    "transcript": outcome.transcript,
                }),
            ))
            .await;
        Ok(())
    }

    /// Tear down what a closed connection owned.
    ///
    /// In-flight upload sessions are abandoned outright. Jobs the connection
    /// queued are left in the tracker so a reconnecting client can still poll
    /// them; the provider-side work keeps running either way since there is
    /// no cancellation primitive, and the idle sweeper reaps unclaimed
    /// records.
    pub fn close_connection(&self, scope: &ConnectionScope) {
        let sessions: Vec<String> = scope.sessions.lock().unwrap().drain().collect();
        for session_id in sessions {
            self.uploads.remove(&session_id);
        }
        let jobs: Vec<String> = scope.jobs.lock().unwrap().drain().collect();
        for job_id in jobs {
            warn!(
                "Connection closed; job {} left running for later polls or eviction",
                job_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{TranscriptPoll, TranscriptStatus};
    use crate::server::frame::encode_chunk_frame;
    use crate::subtitle::Sentence;
    use crate::upload::ChunkMeta;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct ScriptedProvider {
        statuses: StdMutex<VecDeque<TranscriptStatus>>,
    }

    #[async_trait]
    impl TranscriptionProvider for ScriptedProvider {
        async fn upload_audio(&self, _audio: Vec<u8>) -> Result<String> {
            Ok("https://provider.example/audio/1".to_string())
        }

        async fn create_transcript(&self, _url: &str, _lang: &str) -> Result<String> {
            Ok("job-1".to_string())
        }

        async fn fetch_status(&self, _job_id: &str) -> Result<TranscriptPoll> {
            let status = self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))?;
            Ok(TranscriptPoll {
                status,
                text: (status == TranscriptStatus::Completed).then(|| "Hello world".to_string()),
                error: (status == TranscriptStatus::Error)
                    .then(|| "audio was unintelligible".to_string()),
            })
        }

        async fn fetch_sentences(&self, _job_id: &str) -> Result<Vec<Sentence>> {
            Ok(vec![Sentence {
                text: "Hello world".to_string(),
                start_ms: 0,
                end_ms: 2_000,
            }])
        }

        async fn fetch_srt(&self, _job_id: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    struct EchoTranslator;

    #[async_trait]
    impl Translator for EchoTranslator {
        async fn translate_sentences(&self, sentences: &[Sentence]) -> Result<Vec<Sentence>> {
            Ok(sentences.to_vec())
        }

        async fn translate_transcript(&self, transcript: &str) -> Result<String> {
            Ok(transcript.to_string())
        }
    }

    fn router_with(statuses: Vec<TranscriptStatus>) -> (EventRouter, Arc<JobTracker>) {
        let uploads = Arc::new(UploadRegistry::new());
        let jobs = Arc::new(JobTracker::new());
        let provider = Arc::new(ScriptedProvider {
            statuses: StdMutex::new(statuses.into()),
        });
        let router = EventRouter::new(
            uploads,
            jobs.clone(),
            provider,
            Arc::new(EchoTranslator),
            "hi".to_string(),
        );
        (router, jobs)
    }

    fn queued_job(job_id: &str) -> Job {
        let mut job = Job::new("hi".to_string());
        job.advance(JobState::Uploading).unwrap();
        job.advance(JobState::Extracting).unwrap();
        job.advance(JobState::Uploaded).unwrap();
        job.job_id = Some(job_id.to_string());
        job.advance(JobState::TranscriptionQueued).unwrap();
        job
    }

    async fn collect(
        rx: &mut mpsc::Receiver<OutboundEvent>,
    ) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_unknown_event_produces_error() {
        let (router, _) = router_with(vec![]);
        let scope = ConnectionScope::default();
        let (tx, mut rx) = mpsc::channel(8);
        router
            .dispatch_text(&scope, r#"{"event":"selfDestruct","id":"abc","data":{}}"#, &tx)
            .await;
        let events = collect(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "error");
        assert_eq!(events[0].id, "abc");
        assert!(events[0].data["message"]
            .as_str()
            .unwrap()
            .contains("selfDestruct"));
    }

    #[tokio::test]
    async fn test_poll_transitions_and_completes() {
        let (router, jobs) = router_with(vec![
            TranscriptStatus::Processing,
            TranscriptStatus::Completed,
        ]);
        jobs.insert(queued_job("job-1")).unwrap();
        let scope = ConnectionScope::default();
        let (tx, mut rx) = mpsc::channel(8);

        let poll = r#"{"event":"pollTranscription","id":"cid","data":{"jobId":"job-1"}}"#;
        router.dispatch_text(&scope, poll, &tx).await;
        let events = collect(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "transcriptionInProgress");
        assert!(events[0].data["message"]
            .as_str()
            .unwrap()
            .contains("processing"));
        assert_eq!(
            jobs.state("job-1").await,
            Some(JobState::TranscriptionInProgress)
        );

        router.dispatch_text(&scope, poll, &tx).await;
        let events = collect(&mut rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event, "transcriptionComplete");
        assert_eq!(events[1].id, "cid");
        assert_eq!(events[1].data["sentences"][0]["text"], "Hello world");
        assert!(events[1].data["srt"].as_str().unwrap().contains("Hello world"));
    }

    #[tokio::test]
    async fn test_failed_poll_narrates_status_before_failure() {
        let (router, jobs) = router_with(vec![TranscriptStatus::Error]);
        jobs.insert(queued_job("job-1")).unwrap();
        let scope = ConnectionScope::default();
        let (tx, mut rx) = mpsc::channel(8);

        router
            .dispatch_text(
                &scope,
                r#"{"event":"pollTranscription","id":"cid","data":{"jobId":"job-1"}}"#,
                &tx,
            )
            .await;
        let events = collect(&mut rx).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(kinds, vec!["transcriptionInProgress", "transcriptionFailed"]);
        assert!(events[0].data["message"]
            .as_str()
            .unwrap()
            .contains("error"));
        assert_eq!(
            events[1].data["message"].as_str().unwrap(),
            "audio was unintelligible"
        );
    }

    #[tokio::test]
    async fn test_translate_in_wrong_state_is_reported_not_fatal() {
        let (router, jobs) = router_with(vec![TranscriptStatus::Processing]);
        jobs.insert(queued_job("job-1")).unwrap();
        let scope = ConnectionScope::default();
        let (tx, mut rx) = mpsc::channel(8);

        router
            .dispatch_text(
                &scope,
                r#"{"event":"pollTranscription","id":"cid","data":{"jobId":"job-1"}}"#,
                &tx,
            )
            .await;
        router
            .dispatch_text(
                &scope,
                r#"{"event":"translate","id":"cid","data":{"jobId":"job-1"}}"#,
                &tx,
            )
            .await;
        let events = collect(&mut rx).await;
        let last = events.last().unwrap();
        assert_eq!(last.event, "error");
        assert!(last.data["message"]
            .as_str()
            .unwrap()
            .contains("cannot be translated"));
        // Job state untouched by the rejected translate.
        assert_eq!(
            jobs.state("job-1").await,
            Some(JobState::TranscriptionInProgress)
        );
    }

    #[tokio::test]
    async fn test_translate_success_event() {
        let (router, jobs) = router_with(vec![TranscriptStatus::Completed]);
        jobs.insert(queued_job("job-1")).unwrap();
        let scope = ConnectionScope::default();
        let (tx, mut rx) = mpsc::channel(8);

        router
            .dispatch_text(
                &scope,
                r#"{"event":"pollTranscription","id":"cid","data":{"jobId":"job-1"}}"#,
                &tx,
            )
            .await;
        router
            .dispatch_text(
                &scope,
                r#"{"event":"translate","id":"cid","data":{"jobId":"job-1","includeSRT":true}}"#,
                &tx,
            )
            .await;
        let events = collect(&mut rx).await;
        let success = events
            .iter()
            .find(|e| e.event == "translationSuccess")
            .expect("no translationSuccess event");
        assert_eq!(success.id, "cid");
        assert!(success.data["srt"].as_str().unwrap().contains("Hello world"));
        assert_eq!(
            jobs.state("job-1").await,
            Some(JobState::TranslationComplete)
        );
    }

    #[tokio::test]
    async fn test_pending_chunk_is_acknowledged() {
        let (router, _) = router_with(vec![]);
        let scope = ConnectionScope::default();
        let (tx, mut rx) = mpsc::channel(8);

        let meta = ChunkMeta {
            chunk_index: 0,
            total_chunks: 3,
            chunk_offset: 0,
            chunk_size: 4,
            mime_type: "video/mp4".to_string(),
        };
        let frame = encode_chunk_frame("V1StGXR8_Z5jdHi6B-myT", &meta, b"data").unwrap();
        router.dispatch_chunk(&scope, &frame, &tx).await;
        let events = collect(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "progress");
        assert_eq!(events[0].id, "V1StGXR8_Z5jdHi6B-myT");
        assert_eq!(events[0].data["status"], "pending");
        assert!(events[0].data["uploadUrl"].is_null());
    }

    #[tokio::test]
    async fn test_out_of_range_chunk_is_rejected() {
        let (router, _) = router_with(vec![]);
        let scope = ConnectionScope::default();
        let (tx, mut rx) = mpsc::channel(8);

        let meta = ChunkMeta {
            chunk_index: 9,
            total_chunks: 3,
            chunk_offset: 0,
            chunk_size: 4,
            mime_type: "video/mp4".to_string(),
        };
        let frame = encode_chunk_frame("V1StGXR8_Z5jdHi6B-myT", &meta, b"data").unwrap();
        router.dispatch_chunk(&scope, &frame, &tx).await;
        let events = collect(&mut rx).await;
        assert_eq!(events[0].event, "error");
        assert!(events[0].data["message"]
            .as_str()
            .unwrap()
            .contains("out of range"));
    }

    #[tokio::test]
    async fn test_close_connection_abandons_uploads_but_keeps_jobs() {
        let (router, jobs) = router_with(vec![]);
        jobs.insert(queued_job("job-1")).unwrap();
        let scope = ConnectionScope::default();
        let (tx, _rx) = mpsc::channel(8);
        let meta = ChunkMeta {
            chunk_index: 0,
            total_chunks: 2,
            chunk_offset: 0,
            chunk_size: 4,
            mime_type: "video/mp4".to_string(),
        };
        let frame = encode_chunk_frame("V1StGXR8_Z5jdHi6B-myT", &meta, b"data").unwrap();
        router.dispatch_chunk(&scope, &frame, &tx).await;
        scope.jobs.lock().unwrap().insert("job-1".to_string());

        router.close_connection(&scope);
        assert_eq!(router.uploads.session_count(), 0);
        // Queued jobs survive the close so a reconnect can poll them.
        assert_eq!(jobs.job_count(), 1);
    }
}
