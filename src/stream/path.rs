//! Paths locating streamed values inside the enclosing JSON document

use std::fmt;
use std::str::FromStr;

use crate::stream::JsonStreamError;

/// One step from a container to a value it holds
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Member of an object
    Key(String),
    /// Element of an array
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, ".{}", key),
            PathSegment::Index(index) => write!(f, "[{}]", index),
        }
    }
}

/// Selector segment: a literal object key or a wildcard
#[derive(Clone, Debug, PartialEq, Eq)]
enum SelectorSegment {
    Key(String),
    Wildcard,
}

/// A JSONPath-like selector such as `$.*` or `$.utterances.*`
///
/// Only dotted keys and `*` are supported. `*` matches any object key or
/// array index; a literal segment matches the object key of the same name or,
/// when numeric, the array index of the same value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathSelector {
    segments: Vec<SelectorSegment>,
}

impl PathSelector {
    /// Selector matching only the root value
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Check whether a value at `path` is selected
    pub fn matches(&self, path: &[PathSegment]) -> bool {
        if path.len() != self.segments.len() {
            return false;
        }

        self.segments
            .iter()
            .zip(path)
            .all(|(selector, segment)| match (selector, segment) {
                (SelectorSegment::Wildcard, _) => true,
                (SelectorSegment::Key(want), PathSegment::Key(key)) => want == key,
                (SelectorSegment::Key(want), PathSegment::Index(index)) => {
                    want.parse::<usize>().map(|n| n == *index).unwrap_or(false)
                }
            })
    }
}

impl FromStr for PathSelector {
    type Err = JsonStreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('$')
            .ok_or_else(|| JsonStreamError::InvalidSelector(s.to_string()))?;

        if rest.is_empty() {
            return Ok(Self::root());
        }

        let rest = rest
            .strip_prefix('.')
            .ok_or_else(|| JsonStreamError::InvalidSelector(s.to_string()))?;

        let segments = rest
            .split('.')
            .map(|part| match part {
                "" => Err(JsonStreamError::InvalidSelector(s.to_string())),
                "*" => Ok(SelectorSegment::Wildcard),
                key => Ok(SelectorSegment::Key(key.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { segments })
    }
}

/// Render a full path as `$.utterances[0].speaker`
pub fn format_path(path: &[PathSegment]) -> String {
    let mut out = String::from("$");
    for segment in path {
        out.push_str(&segment.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> PathSegment {
        PathSegment::Key(k.to_string())
    }

    #[test]
    fn test_parse_wildcard_selector() {
        let selector: PathSelector = "$.utterances.*".parse().unwrap();
        assert!(selector.matches(&[key("utterances"), PathSegment::Index(3)]));
        assert!(!selector.matches(&[key("utterances")]));
        assert!(!selector.matches(&[key("other"), PathSegment::Index(0)]));
    }

    #[test]
    fn test_numeric_segment_matches_index() {
        let selector: PathSelector = "$.items.1".parse().unwrap();
        assert!(selector.matches(&[key("items"), PathSegment::Index(1)]));
        assert!(!selector.matches(&[key("items"), PathSegment::Index(2)]));
    }

    #[test]
    fn test_root_selector() {
        let selector: PathSelector = "$".parse().unwrap();
        assert!(selector.matches(&[]));
        assert!(!selector.matches(&[PathSegment::Index(0)]));
    }

    #[test]
    fn test_invalid_selectors() {
        assert!("utterances.*".parse::<PathSelector>().is_err());
        assert!("$..x".parse::<PathSelector>().is_err());
        assert!("$x".parse::<PathSelector>().is_err());
    }

    #[test]
    fn test_format_path() {
        let path = vec![key("utterances"), PathSegment::Index(0), key("speaker")];
        assert_eq!(format_path(&path), "$.utterances[0].speaker");
    }
}
