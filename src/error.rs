//! Error taxonomy for the subtitle service.
//!
//! Component-level errors are caught at the event-router boundary and
//! converted into a single `error` event carrying the message; none of them
//! terminate a client connection or affect other sessions.

use thiserror::Error;

use crate::job::JobState;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The chunk index fell outside `0..total_chunks`.
    #[error("chunk index {index} out of range for {total} declared chunks")]
    InvalidChunkIndex { index: u32, total: u32 },

    /// The declared chunk count exceeds what a session may allocate.
    #[error("declared chunk count {total} exceeds the maximum of {max}")]
    TooManyChunks { total: u32, max: u32 },

    /// A chunk arrived for a session that already assembled and handed off.
    #[error("upload session {0} is already complete")]
    SessionAlreadyComplete(String),

    /// A chunk arrived for a session evicted after the idle timeout.
    #[error("upload session {0} expired")]
    SessionExpired(String),

    /// ffmpeg failed to produce an audio stream from the uploaded media.
    #[error("audio extraction failed: {0}")]
    ExtractionFailed(String),

    /// Uploading the extracted audio to the transcription provider failed.
    #[error("provider upload failed: {0}")]
    ProviderUploadFailed(String),

    /// The provider refused or failed to create the transcription job.
    #[error("provider job creation failed: {0}")]
    ProviderJobCreationFailed(String),

    /// Provider-reported transcription failure. Terminal for the job.
    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    /// Translation failure. Terminal for the job.
    #[error("translation failed: {0}")]
    TranslationFailed(String),

    /// A translate request arrived before transcription completed.
    #[error("job {job_id} is in state {state} and cannot be translated")]
    InvalidStateForTranslation { job_id: String, state: JobState },

    /// The inbound event kind is not one the router knows.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// A poll or translate referenced a job that was never created or was
    /// evicted after the idle timeout.
    #[error("unknown job {0}")]
    UnknownJob(String),
}
