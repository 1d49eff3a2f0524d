use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use rand::SeedableRng;
use rand::seq::index;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::warn;

/// How the query sections to evaluate are picked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SectionSelection {
    All,
    Explicit { ids: Vec<u32> },
    Random { count: usize, seed: u64 },
}

impl SectionSelection {
    /// `--all-sections` wins over `--section`, which wins over random sampling.
    pub fn from_flags(all: bool, ids: &[u32], random_count: usize, seed: u64) -> Self {
        if all {
            Self::All
        } else if !ids.is_empty() {
            Self::Explicit { ids: ids.to_vec() }
        } else {
            Self::Random {
                count: random_count,
                seed,
            }
        }
    }

    /// Picks from the section directories found on disk. Explicit ids keep
    /// their first-occurrence order; the other modes are id-ordered.
    pub fn resolve(&self, available: &BTreeMap<usize, PathBuf>) -> Vec<(usize, PathBuf)> {
        match self {
            Self::All => available
                .iter()
                .map(|(id, path)| (*id, path.clone()))
                .collect(),
            Self::Explicit { ids } => {
                let mut seen = BTreeSet::new();
                let mut picked = Vec::new();
                for id in ids {
                    let id = *id as usize;
                    if !seen.insert(id) {
                        continue;
                    }
                    match available.get(&id) {
                        Some(path) => picked.push((id, path.clone())),
                        None => warn!(section = id, "no query directory for section; skipping"),
                    }
                }
                picked
            }
            Self::Random { count, seed } => {
                let ids = available.keys().copied().collect::<Vec<usize>>();
                let amount = (*count).min(ids.len());
                let mut rng = ChaCha8Rng::seed_from_u64(*seed);
                let mut sampled = index::sample(&mut rng, ids.len(), amount)
                    .into_iter()
                    .map(|position| ids[position])
                    .collect::<Vec<usize>>();
                sampled.sort_unstable();
                sampled
                    .into_iter()
                    .filter_map(|id| available.get(&id).map(|path| (id, path.clone())))
                    .collect()
            }
        }
    }
}
