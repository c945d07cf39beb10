// Token ring primitives

use serde::{Deserialize, Serialize};

/// Stable identifier of a database node (UUID)
pub type NodeId = uuid::Uuid;

/// Half-open interval `(start, end]` on the signed 64-bit token ring.
///
/// Ranges may wrap past the maximum token. Two ranges are equal iff both
/// bounds match exactly; there is no containment or normalization here,
/// token arithmetic belongs to the cluster metadata layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: i64,
    pub end: i64,
}

impl TokenRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// True when the range wraps past the maximum token. `(x, x]` denotes
    /// the full ring and counts as wrapping.
    pub fn is_wrapping(&self) -> bool {
        self.end <= self.start
    }
}

impl std::fmt::Display for TokenRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_exact() {
        assert_eq!(TokenRange::new(0, 10), TokenRange::new(0, 10));
        assert_ne!(TokenRange::new(0, 10), TokenRange::new(0, 11));
        assert_ne!(TokenRange::new(0, 10), TokenRange::new(1, 10));
    }

    #[test]
    fn test_wrapping() {
        assert!(!TokenRange::new(0, 10).is_wrapping());
        assert!(TokenRange::new(i64::MAX - 5, i64::MIN + 5).is_wrapping());
        assert!(TokenRange::new(7, 7).is_wrapping());
    }

    #[test]
    fn test_display() {
        assert_eq!(TokenRange::new(-3, 42).to_string(), "(-3,42]");
    }
}
