//! Gallery scan: compare a query descriptor against every matchable record.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::DescriptorCache;
use crate::error::StoreError;
use crate::store::GalleryStore;
use crate::types::{Descriptor, MissingPersonRecord};

/// Maximum distance for two faces to count as the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// Which record wins when several are within threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Earliest record (ascending id) within threshold; the scan stops there.
    #[default]
    FirstMatch,
    /// Closest record within threshold; ties go to the earlier record.
    BestMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// `1 - cosine similarity`, in [0, 2].
    Cosine,
}

impl DistanceMetric {
    pub fn distance(self, a: &Descriptor, b: &Descriptor) -> f32 {
        match self {
            Self::Euclidean => a.euclidean_distance(b),
            Self::Cosine => 1.0 - a.similarity(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub threshold: f32,
    pub policy: MatchPolicy,
    pub metric: DistanceMetric,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            policy: MatchPolicy::default(),
            metric: DistanceMetric::default(),
        }
    }
}

/// What happened to the records a scan visited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Records compared against the query.
    pub compared: usize,
    /// Records with no usable face.
    pub unmatchable: usize,
    /// Records skipped because their descriptor could not be obtained.
    pub failed: usize,
    /// Records whose descriptor came from a different model or dimension.
    pub incompatible: usize,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub record: MissingPersonRecord,
    pub distance: f32,
    pub summary: ScanSummary,
}

pub struct MatchEngine {
    store: Arc<dyn GalleryStore>,
    cache: Arc<DescriptorCache>,
    config: MatchConfig,
}

impl MatchEngine {
    pub fn new(store: Arc<dyn GalleryStore>, cache: Arc<DescriptorCache>, config: MatchConfig) -> Self {
        Self { store, cache, config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<DescriptorCache> {
        &self.cache
    }

    /// Scan the gallery in ascending id order for a record within the
    /// configured threshold.
    ///
    /// `Ok(None)` is "no match". Only a failure to list the gallery is an
    /// error; a record whose descriptor cannot be obtained is skipped.
    pub fn find_match(&self, query: &Descriptor) -> Result<Option<MatchResult>, StoreError> {
        let threshold = self.config.threshold;
        let gallery = self.store.scan_with_images()?;
        let mut summary = ScanSummary::default();
        let mut best: Option<(MissingPersonRecord, f32)> = None;

        for record in gallery {
            let descriptor = match self.cache.get_descriptor(self.store.as_ref(), &record) {
                Ok(Some(d)) => d,
                Ok(None) => {
                    summary.unmatchable += 1;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(id = %record.id, error = %err, "skipping gallery record");
                    summary.failed += 1;
                    continue;
                }
            };

            if !descriptor.is_compatible(query) {
                tracing::warn!(
                    id = %record.id,
                    record_dim = descriptor.dim(),
                    query_dim = query.dim(),
                    "descriptor incompatible with query; skipping"
                );
                summary.incompatible += 1;
                continue;
            }

            summary.compared += 1;
            let distance = self.config.metric.distance(query, &descriptor);
            if distance.is_nan() || distance > threshold {
                continue;
            }

            match self.config.policy {
                MatchPolicy::FirstMatch => {
                    best = Some((record, distance));
                    break;
                }
                MatchPolicy::BestMatch => {
                    if best.as_ref().map_or(true, |(_, d)| distance < *d) {
                        best = Some((record, distance));
                    }
                }
            }
        }

        tracing::debug!(
            compared = summary.compared,
            unmatchable = summary.unmatchable,
            failed = summary.failed,
            incompatible = summary.incompatible,
            matched = best.is_some(),
            "gallery scan finished"
        );

        Ok(best.map(|(record, distance)| MatchResult { record, distance, summary }))
    }
}
