//! Topic pattern classification and matching
//!
//! Patterns are `/`-separated. A `+` segment matches exactly one non-empty
//! level, a trailing `#` segment matches zero or more remaining levels and any
//! other segment matches literally. Everything here is pure.

use std::fmt;
use thiserror::Error;

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Pattern and topic validation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("pattern must not be empty")]
    EmptyPattern,
    #[error("'#' must be the last segment: {0}")]
    MisplacedMultiLevel(String),
    #[error("wildcards must occupy a whole segment: {0}")]
    PartialWildcard(String),
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("wildcards are not allowed in publish topics: {0}")]
    WildcardInTopic(String),
}

/// Classification of a subscription pattern, fixed at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// No wildcard segments - matches only the identical topic
    Exact,
    /// Contains `+` and/or a trailing `#`
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A validated, compiled subscription pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    kind: PatternKind,
    segments: Vec<Segment>,
}

/// Classify a pattern as exact or wildcard, rejecting malformed ones
pub fn classify(pattern: &str) -> Result<PatternKind, TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::EmptyPattern);
    }

    let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = segments.len() - 1;
    let mut kind = PatternKind::Exact;

    for (index, segment) in segments.iter().enumerate() {
        match *segment {
            SINGLE_LEVEL => kind = PatternKind::Wildcard,
            MULTI_LEVEL if index == last => kind = PatternKind::Wildcard,
            MULTI_LEVEL => return Err(TopicError::MisplacedMultiLevel(pattern.to_string())),
            other if other.contains(['+', '#']) => {
                return Err(TopicError::PartialWildcard(pattern.to_string()));
            }
            _ => {}
        }
    }

    Ok(kind)
}

/// Validate a topic used for publishing: non-empty and wildcard free
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

impl TopicPattern {
    /// Classify and compile a pattern
    pub fn compile(pattern: &str) -> Result<Self, TopicError> {
        let kind = classify(pattern)?;
        let segments = match kind {
            // Exact patterns compare the whole string, no need to split
            PatternKind::Exact => Vec::new(),
            PatternKind::Wildcard => pattern
                .split(SEPARATOR)
                .map(|segment| match segment {
                    SINGLE_LEVEL => Segment::SingleLevel,
                    MULTI_LEVEL => Segment::MultiLevel,
                    literal => Segment::Literal(literal.to_string()),
                })
                .collect(),
        };

        Ok(Self {
            raw: pattern.to_string(),
            kind,
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn is_wildcard(&self) -> bool {
        self.kind == PatternKind::Wildcard
    }

    /// Test whether a delivered topic matches this pattern
    pub fn matches(&self, topic: &str) -> bool {
        match self.kind {
            PatternKind::Exact => self.raw == topic,
            PatternKind::Wildcard => self.matches_segments(topic),
        }
    }

    fn matches_segments(&self, topic: &str) -> bool {
        let mut levels = topic.split(SEPARATOR);

        for segment in &self.segments {
            match segment {
                // Only ever compiled as the final segment
                Segment::MultiLevel => return true,
                Segment::SingleLevel => match levels.next() {
                    Some(level) if !level.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(literal) => match levels.next() {
                    Some(level) if level == literal => {}
                    _ => return false,
                },
            }
        }

        levels.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Convenience: compile and match in one step (invalid patterns never match)
pub fn matches(pattern: &str, topic: &str) -> bool {
    TopicPattern::compile(pattern).is_ok_and(|compiled| compiled.matches(topic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classify_exact_and_wildcard() {
        assert_eq!(classify("sensors/room1/temp"), Ok(PatternKind::Exact));
        assert_eq!(classify("sensors/+/temp"), Ok(PatternKind::Wildcard));
        assert_eq!(classify("sensors/#"), Ok(PatternKind::Wildcard));
        assert_eq!(classify("#"), Ok(PatternKind::Wildcard));
        assert_eq!(classify("+"), Ok(PatternKind::Wildcard));
        assert_eq!(classify("/leading/slash"), Ok(PatternKind::Exact));
    }

    #[test]
    fn test_classify_rejects_malformed_patterns() {
        assert_eq!(classify(""), Err(TopicError::EmptyPattern));
        assert_eq!(
            classify("sensors/#/temp"),
            Err(TopicError::MisplacedMultiLevel("sensors/#/temp".to_string()))
        );
        assert_eq!(
            classify("sensors/room+/temp"),
            Err(TopicError::PartialWildcard("sensors/room+/temp".to_string()))
        );
        assert_eq!(
            classify("sensors#"),
            Err(TopicError::PartialWildcard("sensors#".to_string()))
        );
        assert!(classify("#/#").is_err());
    }

    #[test]
    fn test_single_level_wildcard() {
        let pattern = TopicPattern::compile("sensors/+/temp").unwrap();

        assert!(pattern.matches("sensors/room1/temp"));
        assert!(!pattern.matches("sensors/room1/humidity"));
        assert!(!pattern.matches("sensors/temp"));
        assert!(!pattern.matches("sensors/room1/temp/raw"));
        // '+' needs a non-empty level
        assert!(!pattern.matches("sensors//temp"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let pattern = TopicPattern::compile("sensors/#").unwrap();

        assert!(pattern.matches("sensors/room1/temp/raw"));
        assert!(pattern.matches("sensors/room1"));
        assert!(pattern.matches("sensors"));
        assert!(!pattern.matches("actuators/room1"));
        assert!(!pattern.matches("sensorsX/room1"));
    }

    #[test]
    fn test_hash_alone_matches_everything() {
        let pattern = TopicPattern::compile("#").unwrap();

        assert!(pattern.matches(""));
        assert!(pattern.matches("a"));
        assert!(pattern.matches("a/b/c"));
        assert!(pattern.matches("/leading"));
    }

    #[test]
    fn test_combined_wildcards() {
        let pattern = TopicPattern::compile("+/status/#").unwrap();

        assert!(pattern.matches("gateway/status"));
        assert!(pattern.matches("gateway/status/online"));
        assert!(!pattern.matches("gateway/config/online"));
    }

    #[test]
    fn test_exact_pattern_is_not_split() {
        let pattern = TopicPattern::compile("a/b").unwrap();
        assert_eq!(pattern.kind(), PatternKind::Exact);
        assert!(!pattern.is_wildcard());
        assert!(pattern.matches("a/b"));
        assert!(!pattern.matches("a/b/"));
        assert_eq!(pattern.to_string(), "a/b");
    }

    #[test]
    fn test_validate_publish_topic() {
        assert!(validate_publish_topic("sensors/room1/temp").is_ok());
        assert_eq!(validate_publish_topic(""), Err(TopicError::EmptyTopic));
        assert!(matches!(
            validate_publish_topic("sensors/+/temp"),
            Err(TopicError::WildcardInTopic(_))
        ));
        assert!(matches!(
            validate_publish_topic("sensors/#"),
            Err(TopicError::WildcardInTopic(_))
        ));
    }

    #[test]
    fn test_matches_helper_rejects_invalid_patterns() {
        assert!(matches("a/+", "a/b"));
        assert!(!matches("a/#/b", "a/x/b"));
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,8}"
    }

    proptest! {
        #[test]
        fn exact_pattern_matches_only_itself(
            pattern in proptest::collection::vec(segment(), 1..5),
            topic in proptest::collection::vec(segment(), 1..5),
        ) {
            let pattern = pattern.join("/");
            let topic = topic.join("/");
            let compiled = TopicPattern::compile(&pattern).unwrap();

            prop_assert!(compiled.matches(&pattern));
            prop_assert_eq!(compiled.matches(&topic), topic == pattern);
        }

        #[test]
        fn single_level_wildcard_ignores_aligned_segment(
            prefix in proptest::collection::vec(segment(), 0..3),
            suffix in proptest::collection::vec(segment(), 0..3),
            first in segment(),
            second in segment(),
        ) {
            let mut pattern = prefix.clone();
            pattern.push("+".to_string());
            pattern.extend(suffix.clone());
            let compiled = TopicPattern::compile(&pattern.join("/")).unwrap();

            let build = |level: &str| {
                let mut topic = prefix.clone();
                topic.push(level.to_string());
                topic.extend(suffix.clone());
                topic.join("/")
            };

            prop_assert!(compiled.matches(&build(&first)));
            prop_assert_eq!(compiled.matches(&build(&first)), compiled.matches(&build(&second)));
        }

        #[test]
        fn multi_level_wildcard_matches_any_tail(
            prefix in proptest::collection::vec(segment(), 1..4),
            tail in proptest::collection::vec(segment(), 0..5),
        ) {
            let pattern = format!("{}/#", prefix.join("/"));
            let compiled = TopicPattern::compile(&pattern).unwrap();

            let mut topic = prefix.clone();
            topic.extend(tail);
            prop_assert!(compiled.matches(&topic.join("/")));
        }

        #[test]
        fn classify_never_panics(pattern in ".*") {
            let _ = classify(&pattern);
        }
    }
}
