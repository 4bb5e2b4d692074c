//! Subtitle generation service.
//!
//! A WebSocket server that reassembles chunked media uploads, extracts the
//! audio track with ffmpeg, submits it to a transcription provider, tracks
//! the asynchronous job through client-driven polling, and renders the
//! result as SRT subtitles with optional translation.

pub mod config;
pub mod error;
pub mod job;
pub mod media;
pub mod provider;
pub mod server;
pub mod subtitle;
pub mod upload;
