//! SRT subtitle generation.
//!
//! Converts an ordered list of timestamped sentences into SubRip text,
//! splitting sentences that would overflow a subtitle line and allocating
//! the split parts' durations proportionally to their character counts.
//!
//! Everything here is pure: the same sentence list always yields
//! byte-identical output.

use serde::{Deserialize, Serialize};

/// Maximum characters per subtitle block before a sentence is split.
pub const MAX_LINE_LENGTH: usize = 80;

/// A timestamped unit of transcribed text.
///
/// Timestamps are milliseconds from the start of the media. The provider
/// wire format calls the fields `start`/`end`, so serialization keeps
/// those names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    pub text: String,
    #[serde(rename = "start")]
    pub start_ms: u64,
    #[serde(rename = "end")]
    pub end_ms: u64,
}

/// Format a millisecond offset as an SRT timestamp (`HH:MM:SS,mmm`).
///
/// Hours are not capped at 24, so arbitrarily long media is representable.
pub fn format_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
}

/// Split a sentence longer than `max_length` characters into parts.
///
/// Words are packed greedily; a single word longer than `max_length` still
/// becomes its own part (words are never broken mid-way). Each part gets
/// `ceil(chars * time_per_char)` milliseconds and the parts are laid out
/// back-to-back from the original start. The final part's end may overshoot
/// the original end by accumulated rounding; that drift is intentional.
pub fn split_long_sentence(sentence: &Sentence, max_length: usize) -> Vec<Sentence> {
    let total_chars = sentence.text.chars().count();
    if total_chars <= max_length {
        return vec![sentence.clone()];
    }

    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in sentence.text.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
        } else if current.chars().count() + 1 + word.chars().count() <= max_length {
            current.push(' ');
            current.push_str(word);
        } else {
            parts.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }

    let time_per_char = (sentence.end_ms - sentence.start_ms) as f64 / total_chars as f64;

    let mut result = Vec::with_capacity(parts.len());
    let mut part_start = sentence.start_ms;
    for part in parts {
        let chars = part.chars().count();
        let duration = (chars as f64 * time_per_char).ceil() as u64;
        let part_end = part_start + duration;
        result.push(Sentence {
            text: part,
            start_ms: part_start,
            end_ms: part_end,
        });
        part_start = part_end;
    }
    result
}

/// Generate SRT text from an ordered sentence list.
///
/// When `split` is set, overlong sentences are broken up via
/// [`split_long_sentence`] first, preserving relative order. Blocks are
/// numbered contiguously from 1 and separated by a blank line.
pub fn generate_srt(sentences: &[Sentence], split: bool) -> String {
    let subtitles: Vec<Sentence> = if split {
        sentences
            .iter()
            .flat_map(|s| split_long_sentence(s, MAX_LINE_LENGTH))
            .collect()
    } else {
        sentences.to_vec()
    };

    subtitles
        .iter()
        .enumerate()
        .map(|(index, s)| {
            format!(
                "{}\n{} --> {}\n{}\n",
                index + 1,
                format_timestamp(s.start_ms),
                format_timestamp(s.end_ms),
                s.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
