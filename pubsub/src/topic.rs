//! MQTT topic wildcard matching.
//!
//! Topics and patterns are `/`-separated level sequences. In a pattern:
//! - `+` matches exactly one topic level
//! - `#` matches zero or more trailing topic levels (must be the last level)
//!
//! Matching is byte-exact and stateless; nothing is cached between calls.

use crate::error::{Error, Result};

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Reports whether `topic` is matched by `pattern`.
///
/// Empty topics or patterns never match. A pattern of just `#` matches any
/// non-empty topic.
///
/// # Example
///
/// ```
/// use giztoy_pubsub::topic::is_match;
///
/// assert!(is_match("a/b/c", "a/+/c"));
/// assert!(is_match("a/b/c", "a/#"));
/// assert!(!is_match("a/b/c", "a/+"));
/// ```
pub fn is_match(topic: &str, pattern: &str) -> bool {
    if topic.is_empty() || pattern.is_empty() {
        return false;
    }
    if pattern == MULTI_LEVEL {
        return true;
    }

    let topic_levels: Vec<&str> = topic.split(SEPARATOR).collect();
    let pattern_levels: Vec<&str> = pattern.split(SEPARATOR).collect();

    match pattern_levels.split_last() {
        Some((&MULTI_LEVEL, prefix)) => {
            if prefix.contains(&MULTI_LEVEL) || topic_levels.len() < prefix.len() {
                return false;
            }
            levels_match(&topic_levels[..prefix.len()], prefix)
        }
        _ => {
            if pattern_levels.contains(&MULTI_LEVEL) {
                return false;
            }
            topic_levels.len() == pattern_levels.len()
                && levels_match(&topic_levels, &pattern_levels)
        }
    }
}

fn levels_match(topic: &[&str], pattern: &[&str]) -> bool {
    topic
        .iter()
        .zip(pattern)
        .all(|(t, p)| *p == SINGLE_LEVEL || t == p)
}

/// Returns the patterns that match `topic`, in input order.
///
/// The result is lazy: patterns are evaluated as the iterator is consumed.
pub fn find_matching_patterns<'a, I>(
    topic: &'a str,
    patterns: I,
) -> impl Iterator<Item = I::Item> + 'a
where
    I: IntoIterator + 'a,
    I::IntoIter: 'a,
    I::Item: AsRef<str>,
{
    patterns
        .into_iter()
        .filter(move |p| is_match(topic, p.as_ref()))
}

/// Reports whether `pattern` contains a wildcard level.
pub fn has_wildcards(pattern: &str) -> bool {
    pattern
        .split(SEPARATOR)
        .any(|level| level == SINGLE_LEVEL || level == MULTI_LEVEL)
}

/// Validates a subscription pattern.
///
/// Wildcards must occupy a whole level and `#` may only be the last level.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::InvalidTopicPattern(pattern.to_string()));
    }
    let levels: Vec<&str> = pattern.split(SEPARATOR).collect();
    for (i, level) in levels.iter().enumerate() {
        let is_last = i + 1 == levels.len();
        if *level == MULTI_LEVEL && !is_last {
            return Err(Error::InvalidTopicPattern(pattern.to_string()));
        }
        if level.len() > 1 && (level.contains('+') || level.contains('#')) {
            return Err(Error::InvalidTopicPattern(pattern.to_string()));
        }
    }
    Ok(())
}
