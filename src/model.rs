use std::collections::BTreeMap;

use serde::Serialize;

use crate::geofence::{GeoPoint, UtmPoint};

/// Image populations per bucket of an organized dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetCounts {
    /// `None` when the dataset was organized without a train bucket.
    pub train: Option<usize>,
    pub val_database: usize,
    pub val_queries: usize,
    pub test_database: usize,
    pub test_queries: usize,
    pub sections: BTreeMap<usize, usize>,
}

impl DatasetCounts {
    pub fn val_total(&self) -> usize {
        self.val_database + self.val_queries
    }

    pub fn test_total(&self) -> usize {
        self.test_database + self.test_queries
    }

    pub fn total(&self) -> usize {
        self.train.unwrap_or(0) + self.val_total() + self.test_total()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrganizeParameters {
    pub grid_size: u32,
    pub training: bool,
    pub p_training: f64,
    pub p_val: f64,
    pub p_database: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrganizeReport {
    pub run_id: String,
    pub generated_at: String,
    pub root: String,
    pub parameters: OrganizeParameters,
    pub sections_in_grid: usize,
    pub routed: usize,
    pub left_in_place: usize,
    pub fallback_routed: usize,
    pub failed: Vec<String>,
    pub routed_by_rule: BTreeMap<String, usize>,
    pub pruned_directories: usize,
    pub counts: DatasetCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: String,
    pub root: String,
    pub counts: DatasetCounts,
    pub cached_descriptors: Option<usize>,
}

/// Planar and geographic estimate of a query's position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub gps: GeoPoint,
    pub utm: UtmPoint,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionCenter {
    pub id: usize,
    pub center: UtmPoint,
}
