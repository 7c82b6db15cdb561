//! Online clustering of unmatched embeddings into stable unknown identities.
//!
//! Greedy single pass: each embedding joins the nearest existing cluster whose
//! representative is strictly within tolerance, otherwise it founds a new
//! cluster. The assignment sequence is a pure function of the input sequence.
//! Clusters never merge, split or expire while the clusterer lives.

use crate::types::{Embedding, Metric};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an unknown-person cluster. Allocated from 1, strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub u64);

impl ClusterId {
    /// Identity key used for throttling and journaling, e.g. `Unknown_3`.
    pub fn label(self) -> String {
        format!("Unknown_{}", self.0)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a cluster's representative evolves as members join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepresentativePolicy {
    /// The founding embedding, never updated. No drift.
    #[default]
    Fixed,
    /// Running mean of every member. Tolerates gradual appearance change but
    /// can drift toward a neighbouring person.
    Centroid,
}

impl std::str::FromStr for RepresentativePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "centroid" => Ok(Self::Centroid),
            other => Err(format!("unknown representative policy '{other}' (expected fixed or centroid)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: ClusterId,
    pub representative: Embedding,
    pub created_at: NaiveDateTime,
    /// Number of embeddings assigned, including the founder.
    pub members: u64,
}

/// Outcome of [`UnknownClusterer::assign`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub id: ClusterId,
    /// True when this embedding founded the cluster.
    pub is_new: bool,
    /// Distance to the representative; 0.0 for a new cluster.
    pub distance: f32,
}

/// Per-stream unknown-face clusterer.
#[derive(Debug)]
pub struct UnknownClusterer {
    clusters: Vec<Cluster>,
    next_id: u64,
    metric: Metric,
    policy: RepresentativePolicy,
}

impl UnknownClusterer {
    pub fn new(metric: Metric, policy: RepresentativePolicy) -> Self {
        Self {
            clusters: Vec::new(),
            next_id: 1,
            metric,
            policy,
        }
    }

    /// Assign `embedding` to a cluster, creating one if nothing is within `tolerance`.
    ///
    /// Ties between equidistant clusters resolve to the oldest (lowest id).
    pub fn assign(&mut self, embedding: &Embedding, tolerance: f32, now: NaiveDateTime) -> Assignment {
        let mut best: Option<(usize, f32)> = None;
        for (i, cluster) in self.clusters.iter().enumerate() {
            let distance = self.metric.distance(embedding, &cluster.representative);
            if distance < tolerance && best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        if let Some((idx, distance)) = best {
            let cluster = &mut self.clusters[idx];
            cluster.members += 1;
            if self.policy == RepresentativePolicy::Centroid {
                fold_into_mean(&mut cluster.representative, embedding, cluster.members);
            }
            return Assignment {
                id: cluster.id,
                is_new: false,
                distance,
            };
        }

        let id = ClusterId(self.next_id);
        self.next_id += 1;
        self.clusters.push(Cluster {
            id,
            representative: embedding.clone(),
            created_at: now,
            members: 1,
        });
        tracing::debug!(cluster_id = id.0, "new unknown cluster");

        Assignment {
            id,
            is_new: true,
            distance: 0.0,
        }
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Incremental mean: `mean += (x - mean) / n`.
fn fold_into_mean(mean: &mut Embedding, sample: &Embedding, n: u64) {
    let n = n as f32;
    for (m, x) in mean.values.iter_mut().zip(sample.values.iter()) {
        *m += (x - *m) / n;
    }
}
