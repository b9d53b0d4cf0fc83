use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_THRESHOLD: f32 = 0.75;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("Match service unavailable: {0}")]
    Unavailable(String),

    #[error("Match service rejected the request: {0}")]
    Rejected(String),

    #[error("Match service returned out-of-range similarity {0}")]
    InvalidScore(f32),

    #[error("Match service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Match protocol error: {0}")]
    Protocol(String),
}

/// A similarity score in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Similarity(f32);

impl Similarity {
    pub fn new(value: f32) -> Result<Self, MatchError> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(MatchError::InvalidScore(value))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl fmt::Display for Similarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

/// Compares a probe image against a reference image.
#[async_trait]
pub trait FaceMatcher: Send + Sync {
    fn name(&self) -> &str;

    async fn compare(&self, probe: &[u8], reference: &[u8]) -> Result<Similarity, MatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    threshold: f32,
}

impl MatchPolicy {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Scores equal to the threshold are accepted.
    pub fn decide(&self, similarity: Similarity) -> Decision {
        if similarity.value() >= self.threshold {
            Decision::Accept
        } else {
            Decision::Reject
        }
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

/// Always answers with the same score. Development only.
#[derive(Debug, Clone)]
pub struct FixedMatcher {
    score: Similarity,
}

impl FixedMatcher {
    pub fn new(score: f32) -> Result<Self, MatchError> {
        Ok(Self { score: Similarity::new(score)? })
    }
}

#[async_trait]
impl FaceMatcher for FixedMatcher {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn compare(&self, _probe: &[u8], _reference: &[u8]) -> Result<Similarity, MatchError> {
        Ok(self.score)
    }
}

/// Scores 1.0 for byte-identical images and a fixed low score otherwise.
/// Lets development setups exercise both outcomes with the simulated camera.
#[derive(Debug, Clone)]
pub struct IdenticalImageMatcher {
    mismatch: Similarity,
}

impl IdenticalImageMatcher {
    pub fn new(mismatch: f32) -> Result<Self, MatchError> {
        Ok(Self { mismatch: Similarity::new(mismatch)? })
    }
}

#[async_trait]
impl FaceMatcher for IdenticalImageMatcher {
    fn name(&self) -> &str {
        "identical"
    }

    async fn compare(&self, probe: &[u8], reference: &[u8]) -> Result<Similarity, MatchError> {
        if probe == reference {
            Similarity::new(1.0)
        } else {
            Ok(self.mismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_range() {
        assert!(Similarity::new(0.0).is_ok());
        assert!(Similarity::new(1.0).is_ok());
        assert_eq!(Similarity::new(1.01), Err(MatchError::InvalidScore(1.01)));
        assert!(Similarity::new(-0.1).is_err());
        assert!(Similarity::new(f32::NAN).is_err());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let policy = MatchPolicy::default();
        assert_eq!(policy.decide(Similarity::new(0.75).unwrap()), Decision::Accept);
        assert_eq!(policy.decide(Similarity::new(0.749999).unwrap()), Decision::Reject);
        assert_eq!(policy.decide(Similarity::new(1.0).unwrap()), Decision::Accept);
    }

    #[tokio::test]
    async fn test_identical_matcher() {
        let matcher = IdenticalImageMatcher::new(0.1).unwrap();
        assert_eq!(matcher.compare(b"abc", b"abc").await.unwrap().value(), 1.0);
        assert_eq!(matcher.compare(b"abc", b"abd").await.unwrap().value(), 0.1);
    }
}
