//! The predicate a write must satisfy against the current stream version.
use std::fmt;

use crate::condition::{self, Condition};

/// Condition evaluated against the current stream version before a write
/// commits.
///
/// `AnyStreamVersion` always holds and is the only condition accepted by
/// stores that do not maintain stream versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    AnyStreamVersion,
    StreamVersion(Condition<i64>),
}

impl WriteCondition {
    /// Accept any stream version.
    pub fn any() -> Self {
        WriteCondition::AnyStreamVersion
    }

    /// Require the current stream version to match `condition`.
    pub fn stream_version(condition: Condition<i64>) -> Self {
        WriteCondition::StreamVersion(condition)
    }

    /// Require the current stream version to be exactly `version`.
    pub fn stream_version_eq(version: i64) -> Self {
        WriteCondition::StreamVersion(condition::eq(version))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, WriteCondition::AnyStreamVersion)
    }

    pub fn as_stream_version(&self) -> Option<&Condition<i64>> {
        match self {
            WriteCondition::AnyStreamVersion => None,
            WriteCondition::StreamVersion(condition) => Some(condition),
        }
    }
}

impl fmt::Display for WriteCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteCondition::AnyStreamVersion => f.write_str("any stream version"),
            WriteCondition::StreamVersion(condition) => write!(f, "{condition}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{and, gte, lt, ne};

    #[test]
    fn stream_version_eq_is_sugar_for_eq() {
        assert_eq!(
            WriteCondition::stream_version_eq(10),
            WriteCondition::StreamVersion(condition::eq(10))
        );
    }

    #[test]
    fn it_renders_the_inner_condition() {
        let condition = WriteCondition::stream_version(and([gte(0), lt(100), ne(1)]));
        assert_eq!(
            condition.to_string(),
            "to be greater than or equal to 0 and to be less than 100 and to not be equal to 1"
        );
        assert_eq!(WriteCondition::any().to_string(), "any stream version");
    }
}
