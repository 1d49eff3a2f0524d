use anyhow::Result;

use crate::embedding::squared_l2;
use crate::error::CurateError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Position of the vector in insertion order.
    pub index: usize,
    pub squared_distance: f32,
}

/// Exhaustive nearest-neighbor search over squared Euclidean distance.
#[derive(Debug, Clone)]
pub struct FlatL2Index {
    dimensions: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&mut self, vector: &[f32]) -> Result<usize> {
        if vector.len() != self.dimensions || self.dimensions == 0 {
            return Err(CurateError::Retrieval(format!(
                "descriptor has {} values, index expects {}",
                vector.len(),
                self.dimensions
            ))
            .into());
        }
        self.data.extend_from_slice(vector);
        Ok(self.len() - 1)
    }

    /// The `k` closest vectors, nearest first; equal distances keep the lower
    /// index first. `k` is clamped to the index size.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if self.is_empty() {
            return Err(CurateError::insufficient("search on an empty index").into());
        }
        if query.len() != self.dimensions {
            return Err(CurateError::Retrieval(format!(
                "query descriptor has {} values, index expects {}",
                query.len(),
                self.dimensions
            ))
            .into());
        }

        let mut scored = self
            .data
            .chunks_exact(self.dimensions)
            .enumerate()
            .map(|(index, vector)| Neighbor {
                index,
                squared_distance: squared_l2(query, vector),
            })
            .collect::<Vec<Neighbor>>();
        scored.sort_by(|left, right| {
            left.squared_distance
                .total_cmp(&right.squared_distance)
                .then(left.index.cmp(&right.index))
        });
        scored.truncate(k.max(1).min(self.len()));
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> FlatL2Index {
        let mut index = FlatL2Index::new(2);
        for vector in [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0], [1.0, 0.0]] {
            index.add(&vector).expect("add");
        }
        index
    }

    #[test]
    fn nearest_vector_comes_first() {
        let hits = filled().search(&[5.0, 5.0], 1).expect("search");
        assert_eq!(hits, vec![Neighbor { index: 3, squared_distance: 0.0 }]);
    }

    #[test]
    fn ties_prefer_the_lower_index() {
        let hits = filled().search(&[1.0, 0.0], 2).expect("search");
        assert_eq!(hits[0].index, 1);
        assert_eq!(hits[1].index, 4);
    }

    #[test]
    fn k_is_clamped_to_the_index_size() {
        let hits = filled().search(&[0.0, 0.0], 50).expect("search");
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].index, 0);
        assert_eq!(hits[4].index, 3);
    }

    #[test]
    fn empty_index_and_bad_dimensions_fail() {
        let err = FlatL2Index::new(2).search(&[0.0, 0.0], 1).expect_err("empty");
        assert!(matches!(
            err.downcast_ref::<CurateError>(),
            Some(CurateError::InsufficientData(_))
        ));

        let mut index = FlatL2Index::new(2);
        assert!(index.add(&[1.0, 2.0, 3.0]).is_err());
        index.add(&[1.0, 2.0]).expect("add");
        assert!(index.search(&[1.0], 1).is_err());
    }
}
