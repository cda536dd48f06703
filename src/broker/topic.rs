//! Topic matching
//!
//! Topics are `/`-separated, case-sensitive segment lists following the
//! `service/event_name` convention. Patterns share the grammar and add two
//! wildcard segments:
//!
//! - `*` matches exactly one segment of any value
//! - `**` matches every remaining segment, including none
//!
//! `matches` is pure and total. A `**` that is not the final segment still
//! swallows the rest of the topic there, so anything after it is never
//! consulted. `Pattern::parse` refuses such patterns so a client cannot
//! subscribe with one.

use std::fmt;

use crate::utils::error::PatternError;

/// Segment separator for topics and patterns.
pub const SEPARATOR: char = '/';
/// Single-segment wildcard.
pub const SINGLE_WILDCARD: &str = "*";
/// Multi-segment wildcard.
pub const MULTI_WILDCARD: &str = "**";

/// Decide whether `topic` is selected by `pattern`.
pub fn matches(topic: &str, pattern: &str) -> bool {
    let mut topic_segments = topic.split(SEPARATOR);

    for expected in pattern.split(SEPARATOR) {
        if expected == MULTI_WILDCARD {
            return true;
        }
        match topic_segments.next() {
            Some(actual) if expected == SINGLE_WILDCARD || expected == actual => {}
            _ => return false,
        }
    }

    topic_segments.next().is_none()
}

/// Returns `true` when `topic` is non-empty and has no empty segments.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.split(SEPARATOR).all(|segment| !segment.is_empty())
}

/// A validated subscription pattern owned by one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern(String);

impl Pattern {
    /// Validate `raw` as a subscription pattern.
    ///
    /// Rejects empty patterns, empty segments and a `**` anywhere but last.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }

        let segments: Vec<&str> = raw.split(SEPARATOR).collect();
        let last = segments.len() - 1;
        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(PatternError::EmptySegment(raw.to_string()));
            }
            if *segment == MULTI_WILDCARD && index != last {
                return Err(PatternError::MisplacedMultiWildcard(raw.to_string()));
            }
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this pattern selects `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        matches(topic, &self.0)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
