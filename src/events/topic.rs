//! Topic pattern matching
//!
//! Topics are slash separated (`strategy/performance/success`). A pattern
//! segment `*` matches exactly one topic segment; a final `**` matches any
//! number of remaining segments, including none.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
    Rest,
}

/// A parsed subscription pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a pattern such as `strategy/performance/*`
    pub fn parse(raw: &str) -> crate::Result<Self> {
        if raw.is_empty() {
            return Err(crate::DispatchError::InvalidPattern(
                "pattern is empty".to_string(),
            ));
        }

        let parts: Vec<&str> = raw.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (idx, part) in parts.into_iter().enumerate() {
            let segment = match part {
                "" => {
                    return Err(crate::DispatchError::InvalidPattern(format!(
                        "'{}' has an empty segment",
                        raw
                    )))
                }
                "*" => Segment::Any,
                "**" if idx == last => Segment::Rest,
                "**" => {
                    return Err(crate::DispatchError::InvalidPattern(format!(
                        "'{}': '**' is only allowed as the last segment",
                        raw
                    )))
                }
                literal if literal.contains('*') => {
                    return Err(crate::DispatchError::InvalidPattern(format!(
                        "'{}': wildcards must span a whole segment",
                        raw
                    )))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Whether a concrete topic matches this pattern
    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('/');

        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Any => {
                    if parts.next().map_or(true, str::is_empty) {
                        return false;
                    }
                }
                Segment::Literal(expected) => {
                    if parts.next() != Some(expected.as_str()) {
                        return false;
                    }
                }
            }
        }

        parts.next().is_none()
    }

    /// Pattern text as given
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_segment_wildcard() {
        let pattern = TopicPattern::parse("strategy/performance/*").unwrap();
        assert!(pattern.matches("strategy/performance/success"));
        assert!(pattern.matches("strategy/performance/failure"));
        assert!(!pattern.matches("strategy/performance"));
        assert!(!pattern.matches("strategy/performance/success/extra"));
        assert!(!pattern.matches("strategy/threshold/cost"));
    }

    #[test]
    fn test_trailing_rest_wildcard() {
        let pattern = TopicPattern::parse("resource/**").unwrap();
        assert!(pattern.matches("resource"));
        assert!(pattern.matches("resource/alert/saturation"));
        assert!(!pattern.matches("strategy/alert"));
    }

    #[test]
    fn test_literal_pattern_is_exact() {
        let pattern = TopicPattern::parse("queue/job/completed").unwrap();
        assert!(pattern.matches("queue/job/completed"));
        assert!(!pattern.matches("queue/job/failed"));
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("a//b").is_err());
        assert!(TopicPattern::parse("a/**/b").is_err());
        assert!(TopicPattern::parse("a/b*").is_err());
    }
}
