//! Nearest-neighbour identity matching against the gallery.

use crate::types::{Embedding, KnownIdentity, MatchResult, Metric};

/// Strategy for comparing a query embedding against a gallery of known identities.
pub trait Matcher {
    /// Return the closest identity whose distance is strictly below `tolerance`,
    /// or `None` when nothing in the gallery is close enough.
    fn find<'g>(
        &self,
        query: &Embedding,
        gallery: &'g [KnownIdentity],
        tolerance: f32,
    ) -> Option<MatchResult<'g>>;
}

/// Minimum-distance matcher.
///
/// Visits every gallery entry and keeps the smallest distance. Among exactly
/// equidistant entries the earliest in gallery order wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestMatcher {
    pub metric: Metric,
}

impl NearestMatcher {
    pub fn new(metric: Metric) -> Self {
        Self { metric }
    }
}

impl Matcher for NearestMatcher {
    fn find<'g>(
        &self,
        query: &Embedding,
        gallery: &'g [KnownIdentity],
        tolerance: f32,
    ) -> Option<MatchResult<'g>> {
        let mut best: Option<(usize, f32)> = None;

        for (i, identity) in gallery.iter().enumerate() {
            let distance = self.metric.distance(query, &identity.embedding);
            // NaN never compares less, so a corrupt entry can't win.
            let is_better = match best {
                None => distance.is_finite(),
                Some((_, d)) => distance < d,
            };
            if is_better {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance < tolerance => Some(MatchResult {
                identity: &gallery[idx],
                distance,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, values: &[f32]) -> KnownIdentity {
        KnownIdentity {
            name: name.into(),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    #[test]
    fn test_nearest_visits_whole_gallery() {
        // Best match is the last entry.
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            identity("decoy1", &[0.0, 1.0, 0.0]),
            identity("decoy2", &[0.0, 0.0, 1.0]),
            identity("bob", &[0.9, 0.0, 0.0]),
        ];

        let result = NearestMatcher::default().find(&query, &gallery, 0.6).unwrap();
        assert_eq!(result.identity.name, "bob");
        assert!((result.distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_tolerance_is_strict() {
        let query = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![identity("alice", &[0.5, 0.0])];

        assert!(NearestMatcher::default().find(&query, &gallery, 0.5).is_none());
        assert!(NearestMatcher::default().find(&query, &gallery, 0.50001).is_some());
    }

    #[test]
    fn test_no_match_beyond_tolerance() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![identity("other", &[0.0, 1.0])];
        assert!(NearestMatcher::default().find(&query, &gallery, 0.6).is_none());
    }

    #[test]
    fn test_empty_gallery() {
        let query = Embedding::new(vec![1.0, 0.0]);
        assert!(NearestMatcher::default().find(&query, &[], 0.6).is_none());
    }

    #[test]
    fn test_tie_returns_some_candidate_under_tolerance() {
        let query = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![identity("a", &[0.1, 0.0]), identity("b", &[0.0, 0.1])];

        let result = NearestMatcher::default().find(&query, &gallery, 0.6).unwrap();
        assert!(["a", "b"].contains(&result.identity.name.as_str()));
        assert!(result.distance < 0.6);
    }

    #[test]
    fn test_cosine_metric() {
        let query = Embedding::new(vec![2.0, 0.0]);
        let gallery = vec![identity("scaled", &[10.0, 0.1]), identity("ortho", &[0.0, 1.0])];

        let result = NearestMatcher::new(Metric::Cosine)
            .find(&query, &gallery, 0.1)
            .unwrap();
        assert_eq!(result.identity.name, "scaled");
    }
}
