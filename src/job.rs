//! Transcription/translation job tracking.
//!
//! A [`Job`] is one unit of work: an uploaded media file moving through
//! extraction, provider upload, transcription, and optional translation.
//! The [`JobTracker`] keys committed jobs by the provider-issued job id and
//! enforces the state machine. Polling is client-driven: each poll performs
//! at most one provider status read and commits at most one transition, and
//! a per-job async mutex is held across the provider round trip so
//! concurrent polls for the same job cannot interleave.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::ServiceError;
use crate::provider::{TranscriptStatus, TranscriptionProvider, Translator};
use crate::subtitle::{generate_srt, Sentence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Created,
    Uploading,
    Extracting,
    Uploaded,
    TranscriptionQueued,
    TranscriptionInProgress,
    TranscriptionComplete,
    TranscriptionFailed,
    TranslationInProgress,
    TranslationComplete,
    TranslationFailed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl JobState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::TranscriptionFailed | JobState::TranslationComplete | JobState::TranslationFailed
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// `Uploading -> Uploaded` is the coarse arrow; the pipeline drives the
    /// fine-grained path through `Extracting`. A poll may jump straight
    /// from `TranscriptionQueued` to a terminal transcription state when
    /// the provider finishes between polls.
    pub fn can_transition(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Uploading)
                | (Uploading, Extracting)
                | (Uploading, Uploaded)
                | (Extracting, Uploaded)
                | (Uploaded, TranscriptionQueued)
                | (TranscriptionQueued, TranscriptionInProgress)
                | (TranscriptionQueued, TranscriptionComplete)
                | (TranscriptionQueued, TranscriptionFailed)
                | (TranscriptionInProgress, TranscriptionComplete)
                | (TranscriptionInProgress, TranscriptionFailed)
                | (TranscriptionComplete, TranslationInProgress)
                | (TranslationInProgress, TranslationComplete)
                | (TranslationInProgress, TranslationFailed)
        )
    }
}

/// One tracked unit of transcription/translation work.
///
/// Owned by the client session that created it; other sessions never
/// mutate it.
pub struct Job {
    /// Provider-issued identifier; `None` until the job is queued.
    pub job_id: Option<String>,
    pub state: JobState,
    pub source_language: String,
    pub transcript_text: Option<String>,
    pub sentences: Option<Vec<Sentence>>,
    pub srt_original: Option<String>,
    pub translated_transcript: Option<String>,
    pub translated_sentences: Option<Vec<Sentence>>,
    pub srt_translated: Option<String>,
    pub failure_reason: Option<String>,
    last_activity: Instant,
}

impl Job {
    pub fn new(source_language: String) -> Self {
        Self {
            job_id: None,
            state: JobState::Created,
            source_language,
            transcript_text: None,
            sentences: None,
            srt_original: None,
            translated_transcript: None,
            translated_sentences: None,
            srt_translated: None,
            failure_reason: None,
            last_activity: Instant::now(),
        }
    }

    /// Commit a state transition, rejecting anything the machine forbids.
    pub fn advance(&mut self, next: JobState) -> Result<()> {
        if self.state.is_terminal() {
            anyhow::bail!(
                "job {} is terminal in state {}",
                self.job_id.as_deref().unwrap_or("(unqueued)"),
                self.state
            );
        }
        if !self.state.can_transition(next) {
            anyhow::bail!("illegal job transition {} -> {}", self.state, next);
        }
        debug!(
            "Job {}: {} -> {}",
            self.job_id.as_deref().unwrap_or("(unqueued)"),
            self.state,
            next
        );
        self.state = next;
        self.last_activity = Instant::now();
        Ok(())
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Result of one client-driven poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// The provider is still working; `status` is its last reported state.
    InProgress { status: TranscriptStatus },
    /// Transcription finished; artifacts are stored on the job and echoed
    /// here for the response.
    Complete {
        transcript: Option<String>,
        sentences: Vec<Sentence>,
        srt: Option<String>,
    },
    /// Terminal failure, either freshly observed or replayed from the
    /// stored reason.
    Failed { reason: String },
}

/// Which artifacts a translate request wants back.
#[derive(Debug, Clone, Copy)]
pub struct TranslateOptions {
    pub include_sentences: bool,
    pub include_srt: bool,
    pub include_transcript: bool,
}

#[derive(Debug)]
pub struct TranslationOutcome {
    pub sentences: Option<Vec<Sentence>>,
    pub srt: Option<String>,
    pub transcript: Option<String>,
}

/// Registry of committed jobs, keyed by provider job id.
pub struct JobTracker {
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Commit a queued job under its provider id.
    pub fn insert(&self, job: Job) -> Result<String> {
        let job_id = job
            .job_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("job committed without a provider id"))?;
        let mut jobs = self.jobs.write().unwrap();
        jobs.insert(job_id.clone(), Arc::new(Mutex::new(job)));
        info!("Tracking job {}", job_id);
        Ok(job_id)
    }

    fn lookup(&self, job_id: &str) -> Result<Arc<Mutex<Job>>, ServiceError> {
        let jobs = self.jobs.read().unwrap();
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownJob(job_id.to_string()))
    }

    /// Drop a job record. The provider-side job, if any, keeps running;
    /// there is no cancellation primitive for it.
    pub fn remove(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().unwrap();
        jobs.remove(job_id).is_some()
    }

    /// Evict jobs idle past `max_idle`. Jobs currently locked by an
    /// in-flight poll or translate are active and skipped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut stale = Vec::new();
        {
            let jobs = self.jobs.read().unwrap();
            for (id, job) in jobs.iter() {
                if let Ok(job) = job.try_lock() {
                    if job.last_activity.elapsed() > max_idle {
                        stale.push(id.clone());
                    }
                }
            }
        }
        let count = stale.len();
        if count > 0 {
            let mut jobs = self.jobs.write().unwrap();
            for id in &stale {
                warn!("Evicting idle job {}", id);
                jobs.remove(id);
            }
        }
        count
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    /// Perform one client-driven poll for a job.
    ///
    /// Jobs in a terminal failure state replay the stored reason without a
    /// provider call; completed jobs replay the stored artifacts. Otherwise
    /// exactly one provider status read happens and at most one transition
    /// is committed. The sentence/SRT fetches on the completing poll happen
    /// before the transition, so a fetch failure leaves the job pollable.
    pub async fn poll(
        &self,
        job_id: &str,
        provider: &dyn TranscriptionProvider,
    ) -> Result<PollOutcome> {
        let job = self.lookup(job_id)?;
        let mut job = job.lock().await;
        job.touch();

        match job.state {
            JobState::TranscriptionFailed | JobState::TranslationFailed => {
                return Ok(PollOutcome::Failed {
                    reason: job
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "unknown failure".to_string()),
                });
            }
            JobState::TranscriptionComplete
            | JobState::TranslationInProgress
            | JobState::TranslationComplete => {
                return Ok(PollOutcome::Complete {
                    transcript: job.transcript_text.clone(),
                    sentences: job.sentences.clone().unwrap_or_default(),
                    srt: job.srt_original.clone(),
                });
            }
            JobState::TranscriptionQueued | JobState::TranscriptionInProgress => {}
            state => {
                anyhow::bail!("job {} is not pollable in state {}", job_id, state);
            }
        }

        let status = provider.fetch_status(job_id).await?;
        match status.status {
            TranscriptStatus::Queued | TranscriptStatus::Processing => {
                if job.state == JobState::TranscriptionQueued {
                    job.advance(JobState::TranscriptionInProgress)?;
                }
                Ok(PollOutcome::InProgress {
                    status: status.status,
                })
            }
            TranscriptStatus::Completed => {
                let sentences = provider.fetch_sentences(job_id).await?;
                let srt = match provider.fetch_srt(job_id).await {
                    Ok(srt) if !srt.is_empty() => srt,
                    _ => generate_srt(&sentences, true),
                };
                job.transcript_text = status.text.clone();
                job.sentences = Some(sentences.clone());
                job.srt_original = Some(srt.clone());
                job.advance(JobState::TranscriptionComplete)?;
                Ok(PollOutcome::Complete {
                    transcript: status.text,
                    sentences,
                    srt: Some(srt),
                })
            }
            TranscriptStatus::Error => {
                let reason = status
                    .error
                    .unwrap_or_else(|| "transcription failed".to_string());
                job.failure_reason = Some(reason.clone());
                job.advance(JobState::TranscriptionFailed)?;
                Ok(PollOutcome::Failed { reason })
            }
        }
    }

    /// Translate a completed job's transcript and sentence list.
    ///
    /// Rejected with `InvalidStateForTranslation` unless the job is in
    /// `TranscriptionComplete`; terminal failure states replay their stored
    /// reason without invoking the translator.
    pub async fn translate(
        &self,
        job_id: &str,
        translator: &dyn Translator,
        options: TranslateOptions,
    ) -> Result<TranslationOutcome> {
        let job = self.lookup(job_id)?;
        let mut job = job.lock().await;
        job.touch();

        match job.state {
            JobState::TranscriptionComplete => {}
            JobState::TranscriptionFailed => {
                return Err(ServiceError::TranscriptionFailed(
                    job.failure_reason
                        .clone()
                        .unwrap_or_else(|| "transcription failed".to_string()),
                )
                .into());
            }
            JobState::TranslationFailed => {
                return Err(ServiceError::TranslationFailed(
                    job.failure_reason
                        .clone()
                        .unwrap_or_else(|| "translation failed".to_string()),
                )
                .into());
            }
            state => {
                return Err(ServiceError::InvalidStateForTranslation {
                    job_id: job_id.to_string(),
                    state,
                }
                .into());
            }
        }

        job.advance(JobState::TranslationInProgress)?;

        let sentences = job.sentences.clone().unwrap_or_default();
        let translated = match translator.translate_sentences(&sentences).await {
            Ok(translated) => translated,
            Err(e) => {
                let reason = e.to_string();
                job.failure_reason = Some(reason.clone());
                job.advance(JobState::TranslationFailed)?;
                return Err(ServiceError::TranslationFailed(reason).into());
            }
        };

        let transcript = if options.include_transcript {
            let source = job.transcript_text.clone().unwrap_or_default();
            match translator.translate_transcript(&source).await {
                Ok(text) => Some(text),
                Err(e) => {
                    let reason = e.to_string();
                    job.failure_reason = Some(reason.clone());
                    job.advance(JobState::TranslationFailed)?;
                    return Err(ServiceError::TranslationFailed(reason).into());
                }
            }
        } else {
            None
        };

        let srt = generate_srt(&translated, true);
        job.translated_sentences = Some(translated.clone());
        job.srt_translated = Some(srt.clone());
        job.translated_transcript = transcript.clone();
        job.advance(JobState::TranslationComplete)?;
        info!("Job {} translated", job_id);

        Ok(TranslationOutcome {
            sentences: options.include_sentences.then_some(translated),
            srt: options.include_srt.then_some(srt),
            transcript,
        })
    }

    /// Current state of a job, if tracked.
    pub async fn state(&self, job_id: &str) -> Option<JobState> {
        let job = self.lookup(job_id).ok()?;
        let job = job.lock().await;
        Some(job.state)
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TranscriptPoll;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Provider that replays a scripted sequence of statuses.
    struct ScriptedProvider {
        statuses: StdMutex<VecDeque<TranscriptPoll>>,
        status_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(statuses: Vec<TranscriptPoll>) -> Self {
            Self {
                statuses: StdMutex::new(statuses.into()),
                status_calls: AtomicUsize::new(0),
            }
        }

        fn poll_of(status: TranscriptStatus) -> TranscriptPoll {
            TranscriptPoll {
                status,
                text: (status == TranscriptStatus::Completed)
                    .then(|| "नमस्ते दुनिया".to_string()),
                error: (status == TranscriptStatus::Error)
                    .then(|| "audio was unintelligible".to_string()),
            }
        }
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
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock().unwrap();
            statuses
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
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

    struct ScriptedTranslator {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Translator for ScriptedTranslator {
        async fn translate_sentences(&self, sentences: &[Sentence]) -> Result<Vec<Sentence>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("model unavailable");
            }
            Ok(sentences
                .iter()
                .map(|s| Sentence {
                    text: format!("[en] {}", s.text),
                    start_ms: s.start_ms,
                    end_ms: s.end_ms,
                })
                .collect())
        }

        async fn translate_transcript(&self, transcript: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("model unavailable");
            }
            Ok(format!("[en] {}", transcript))
        }
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

    #[test]
    fn test_transition_matrix() {
        use JobState::*;
        assert!(Created.can_transition(Uploading));
        assert!(Uploading.can_transition(Uploaded));
        assert!(Uploading.can_transition(Extracting));
        assert!(TranscriptionQueued.can_transition(TranscriptionInProgress));
        assert!(TranscriptionComplete.can_transition(TranslationInProgress));
        // Terminal states admit nothing.
        for next in [
            Created,
            Uploading,
            TranscriptionQueued,
            TranscriptionInProgress,
            TranslationInProgress,
        ] {
            assert!(!TranscriptionFailed.can_transition(next));
            assert!(!TranslationFailed.can_transition(next));
            assert!(!TranslationComplete.can_transition(next));
        }
        // No skipping back or sideways.
        assert!(!TranscriptionComplete.can_transition(TranscriptionInProgress));
        assert!(!Created.can_transition(TranscriptionQueued));
    }

    #[test]
    fn test_advance_out_of_terminal_state_is_rejected() {
        let mut job = queued_job("job-1");
        job.advance(JobState::TranscriptionFailed).unwrap();
        let err = job.advance(JobState::TranslationInProgress).unwrap_err();
        assert!(err.to_string().contains("terminal"));
        assert_eq!(job.state, JobState::TranscriptionFailed);
    }

    #[tokio::test]
    async fn test_poll_progression_to_complete() {
        let tracker = JobTracker::new();
        tracker.insert(queued_job("job-1")).unwrap();
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::poll_of(TranscriptStatus::Processing),
            ScriptedProvider::poll_of(TranscriptStatus::Completed),
        ]);

        match tracker.poll("job-1", &provider).await.unwrap() {
            PollOutcome::InProgress { status } => {
                assert_eq!(status, TranscriptStatus::Processing)
            }
            other => panic!("expected in-progress, got {:?}", other),
        }
        assert_eq!(
            tracker.state("job-1").await,
            Some(JobState::TranscriptionInProgress)
        );

        match tracker.poll("job-1", &provider).await.unwrap() {
            PollOutcome::Complete {
                transcript,
                sentences,
                srt,
            } => {
                assert_eq!(transcript.as_deref(), Some("नमस्ते दुनिया"));
                assert_eq!(sentences.len(), 1);
                // Provider srt was empty, so the local generator filled in.
                assert!(srt.unwrap().starts_with("1\n00:00:00,000"));
            }
            other => panic!("expected complete, got {:?}", other),
        }
        assert_eq!(
            tracker.state("job-1").await,
            Some(JobState::TranscriptionComplete)
        );
    }

    #[tokio::test]
    async fn test_failed_job_is_terminal_and_replayed() {
        let tracker = JobTracker::new();
        tracker.insert(queued_job("job-1")).unwrap();
        let provider =
            ScriptedProvider::new(vec![ScriptedProvider::poll_of(TranscriptStatus::Error)]);

        match tracker.poll("job-1", &provider).await.unwrap() {
            PollOutcome::Failed { reason } => assert_eq!(reason, "audio was unintelligible"),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(
            tracker.state("job-1").await,
            Some(JobState::TranscriptionFailed)
        );

        // A second poll replays the stored reason without another provider
        // call, and the state does not move.
        match tracker.poll("job-1", &provider).await.unwrap() {
            PollOutcome::Failed { reason } => assert_eq!(reason, "audio was unintelligible"),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            tracker.state("job-1").await,
            Some(JobState::TranscriptionFailed)
        );
    }

    #[tokio::test]
    async fn test_completed_poll_is_replayed_without_provider_call() {
        let tracker = JobTracker::new();
        tracker.insert(queued_job("job-1")).unwrap();
        let provider =
            ScriptedProvider::new(vec![ScriptedProvider::poll_of(TranscriptStatus::Completed)]);

        assert!(matches!(
            tracker.poll("job-1", &provider).await.unwrap(),
            PollOutcome::Complete { .. }
        ));
        assert!(matches!(
            tracker.poll("job-1", &provider).await.unwrap(),
            PollOutcome::Complete { .. }
        ));
        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_translate_rejected_while_transcribing() {
        let tracker = JobTracker::new();
        tracker.insert(queued_job("job-1")).unwrap();
        let provider =
            ScriptedProvider::new(vec![ScriptedProvider::poll_of(TranscriptStatus::Processing)]);
        tracker.poll("job-1", &provider).await.unwrap();

        let translator = ScriptedTranslator {
            fail: false,
            calls: AtomicUsize::new(0),
        };
        let options = TranslateOptions {
            include_sentences: true,
            include_srt: true,
            include_transcript: false,
        };
        let err = tracker
            .translate("job-1", &translator, options)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServiceError>(),
            Some(ServiceError::InvalidStateForTranslation { .. })
        ));
        // State unchanged, translator untouched.
        assert_eq!(
            tracker.state("job-1").await,
            Some(JobState::TranscriptionInProgress)
        );
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_translate_success() {
        let tracker = JobTracker::new();
        tracker.insert(queued_job("job-1")).unwrap();
        let provider =
            ScriptedProvider::new(vec![ScriptedProvider::poll_of(TranscriptStatus::Completed)]);
        tracker.poll("job-1", &provider).await.unwrap();

        let translator = ScriptedTranslator {
            fail: false,
            calls: AtomicUsize::new(0),
        };
        let options = TranslateOptions {
            include_sentences: true,
            include_srt: true,
            include_transcript: true,
        };
        let outcome = tracker
            .translate("job-1", &translator, options)
            .await
            .unwrap();
        let sentences = outcome.sentences.unwrap();
        assert_eq!(sentences[0].text, "[en] Hello world");
        assert!(outcome.srt.unwrap().contains("[en] Hello world"));
        assert_eq!(outcome.transcript.as_deref(), Some("[en] नमस्ते दुनिया"));
        assert_eq!(
            tracker.state("job-1").await,
            Some(JobState::TranslationComplete)
        );
    }

    #[tokio::test]
    async fn test_translation_failure_is_terminal() {
        let tracker = JobTracker::new();
        tracker.insert(queued_job("job-1")).unwrap();
        let provider =
            ScriptedProvider::new(vec![ScriptedProvider::poll_of(TranscriptStatus::Completed)]);
        tracker.poll("job-1", &provider).await.unwrap();

        let translator = ScriptedTranslator {
            fail: true,
            calls: AtomicUsize::new(0),
        };
        let options = TranslateOptions {
            include_sentences: true,
            include_srt: true,
            include_transcript: false,
        };
        let err = tracker
            .translate("job-1", &translator, options)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServiceError>(),
            Some(ServiceError::TranslationFailed(_))
        ));
        assert_eq!(
            tracker.state("job-1").await,
            Some(JobState::TranslationFailed)
        );

        // Retrying replays the stored reason without another model call.
        let err = tracker
            .translate("job-1", &translator, options)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServiceError>(),
            Some(ServiceError::TranslationFailed(_))
        ));
        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let tracker = JobTracker::new();
        let provider = ScriptedProvider::new(vec![]);
        let err = tracker.poll("missing", &provider).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServiceError>(),
            Some(ServiceError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let tracker = JobTracker::new();
        tracker.insert(queued_job("job-1")).unwrap();
        assert_eq!(tracker.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(tracker.evict_idle(Duration::ZERO), 1);
        assert_eq!(tracker.job_count(), 0);
    }
}
