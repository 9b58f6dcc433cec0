//! Streaming text to sentence segmentation.
//!
//! Reply text arrives as arbitrary fragments per message. Each message gets an
//! accumulator; whenever newly appended text completes a sentence, that
//! sentence is handed back exactly once, in order. Boundary detection is a
//! heuristic: terminal punctuation (`.`, `!`, `?`) followed by whitespace or
//! the end of the text seen so far. A `.` immediately followed by a digit
//! (decimals, version numbers) or terminating a short known abbreviation is
//! not a boundary. No lookahead across chunks, so a chunk ending exactly at an
//! ambiguous `.` can still split early.

use std::collections::HashMap;

use crate::ids::{CharacterId, MessageId};

/// A complete spoken unit, ready for downstream TTS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sentence {
    pub message_id: MessageId,
    pub character_id: CharacterId,
    pub text: String,
}

/// What `flush` hands back when a message completes.
#[derive(Clone, Debug)]
pub struct FlushedMessage {
    /// Trailing buffered text emitted as a final sentence, if any remained.
    pub trailing: Option<Sentence>,
    /// Every fragment of the message, concatenated.
    pub full_text: String,
    pub character_id: CharacterId,
}

struct Accumulator {
    character_id: CharacterId,
    pending: String,
    full_text: String,
}

const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc",
];

/// Per-message sentence accumulators. Messages are tracked independently;
/// ordering is only guaranteed within one message.
#[derive(Default)]
pub struct SentenceBuffer {
    active: HashMap<MessageId, Accumulator>,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return any sentences it completed, left to right.
    pub fn append_chunk(
        &mut self,
        message_id: &MessageId,
        character_id: &CharacterId,
        text: &str,
    ) -> Vec<Sentence> {
        let acc = self
            .active
            .entry(message_id.clone())
            .or_insert_with(|| Accumulator {
                character_id: character_id.clone(),
                pending: String::new(),
                full_text: String::new(),
            });
        acc.pending.push_str(text);
        acc.full_text.push_str(text);

        split_complete(&mut acc.pending)
            .into_iter()
            .map(|text| Sentence {
                message_id: message_id.clone(),
                character_id: acc.character_id.clone(),
                text,
            })
            .collect()
    }

    /// Complete a message: emit any trailing buffered text as a final sentence
    /// (even without terminal punctuation) and destroy the accumulator.
    /// Returns `None` for unknown or already-discarded messages.
    pub fn flush(&mut self, message_id: &MessageId) -> Option<FlushedMessage> {
        let acc = self.active.remove(message_id)?;
        let trailing = acc.pending.trim();
        let trailing = (!trailing.is_empty()).then(|| Sentence {
            message_id: message_id.clone(),
            character_id: acc.character_id.clone(),
            text: trailing.to_string(),
        });
        Some(FlushedMessage {
            trailing,
            full_text: acc.full_text,
            character_id: acc.character_id,
        })
    }

    /// Drop a message's accumulator without emitting its buffered remainder.
    /// Sentences already emitted are not recalled.
    pub fn discard(&mut self, message_id: &MessageId) -> bool {
        self.active.remove(message_id).is_some()
    }

    /// Drop every in-flight accumulator; used when an external speaker
    /// interrupts the whole generation pass. Returns how many were dropped.
    pub fn discard_all(&mut self) -> usize {
        let count = self.active.len();
        self.active.clear();
        count
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Extract completed sentences from `pending`, leaving the remainder in place.
fn split_complete(pending: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    {
        let s = pending.as_str();
        for (i, c) in s.char_indices() {
            if !matches!(c, '.' | '!' | '?') {
                continue;
            }
            let next = s[i + 1..].chars().next();
            let boundary = match next {
                None => c != '.' || !ends_with_abbreviation(&s[..i]),
                Some(n) if n.is_whitespace() => c != '.' || !ends_with_abbreviation(&s[..i]),
                // Covers the explicit no-split-on-decimals policy; any other
                // non-whitespace follower is mid-token anyway.
                Some(n) if c == '.' && n.is_ascii_digit() => false,
                Some(_) => false,
            };
            if boundary {
                let sentence = s[start..=i].trim_start();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = i + 1;
            }
        }
    }
    if start > 0 {
        *pending = pending.split_off(start);
    }
    sentences
}

/// True when the text before a `.` ends in a known short abbreviation.
fn ends_with_abbreviation(before: &str) -> bool {
    let word = before
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric());
    ABBREVIATIONS.iter().any(|a| word.eq_ignore_ascii_case(a))
}
