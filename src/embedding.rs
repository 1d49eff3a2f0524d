use anyhow::{Result, bail};
use image::DynamicImage;
use serde::Serialize;

use crate::error::CurateError;

pub const DEFAULT_MODEL_ID: &str = "thumbnail-8x8-local-v1";
pub const DEFAULT_NORMALIZATION: &str = "imagenet-meanstd+l2";
pub const DEFAULT_BACKEND: &str = "local-thumbnail-v1";

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const KNOWN_MODELS: &[(&str, u32)] = &[
    ("thumbnail-8x8-local-v1", 8),
    ("thumbnail-16x16-local-v1", 16),
];

#[derive(Debug, Clone, Serialize)]
pub struct EmbedderConfig {
    pub model_id: String,
    pub dimensions: usize,
    pub normalization: String,
    pub backend: String,
}

/// Maps images to fixed-length descriptors. Implementations must be
/// deterministic: the same pixels always give the same vector.
pub trait ImageEmbedder: Send + Sync {
    fn config(&self) -> &EmbedderConfig;

    fn embed_batch(&self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>>;
}

pub fn resolve_embedder(model_id: &str) -> Result<Box<dyn ImageEmbedder>> {
    let trimmed = model_id.trim();
    let resolved_id = if trimmed.is_empty() {
        DEFAULT_MODEL_ID
    } else {
        trimmed
    };

    let Some((id, cells)) = KNOWN_MODELS.iter().find(|(id, _)| *id == resolved_id) else {
        let known = KNOWN_MODELS
            .iter()
            .map(|(id, _)| *id)
            .collect::<Vec<&str>>()
            .join(", ");
        bail!(CurateError::config(format!(
            "unknown embedding model '{resolved_id}' (known: {known})"
        )));
    };

    Ok(Box::new(LocalThumbnailEmbedder::new(id, *cells)))
}

/// Area-averaged, ImageNet-normalized RGB thumbnail flattened to a unit
/// vector of `cells * cells * 3` values.
#[derive(Debug, Clone)]
pub struct LocalThumbnailEmbedder {
    config: EmbedderConfig,
    cells: u32,
}

impl LocalThumbnailEmbedder {
    pub fn new(model_id: &str, cells: u32) -> Self {
        let cells = cells.max(1);
        Self {
            config: EmbedderConfig {
                model_id: model_id.to_string(),
                dimensions: (cells * cells * 3) as usize,
                normalization: DEFAULT_NORMALIZATION.to_string(),
                backend: DEFAULT_BACKEND.to_string(),
            },
            cells,
        }
    }

    fn embed_one(&self, image: &DynamicImage) -> Vec<f32> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        let cells = self.cells as usize;
        let mut sums = vec![0_f64; cells * cells * 3];
        let mut counts = vec![0_u32; cells * cells];

        if width > 0 && height > 0 {
            for (x, y, pixel) in rgb.enumerate_pixels() {
                let cell_x = (x as usize * cells) / width as usize;
                let cell_y = (y as usize * cells) / height as usize;
                let cell = cell_y * cells + cell_x;
                counts[cell] += 1;
                for channel in 0..3 {
                    let value = f32::from(pixel.0[channel]) / 255.0;
                    let normalized = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
                    sums[cell * 3 + channel] += f64::from(normalized);
                }
            }
        }

        let mut vector = sums
            .iter()
            .enumerate()
            .map(|(index, sum)| {
                let count = counts[index / 3];
                if count == 0 { 0.0 } else { (*sum / f64::from(count)) as f32 }
            })
            .collect::<Vec<f32>>();
        normalize_vector(&mut vector);
        vector
    }
}

impl ImageEmbedder for LocalThumbnailEmbedder {
    fn config(&self) -> &EmbedderConfig {
        &self.config
    }

    fn embed_batch(&self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>> {
        Ok(images.iter().map(|image| self.embed_one(image)).collect())
    }
}

pub fn squared_l2(left: &[f32], right: &[f32]) -> f32 {
    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| {
            let delta = left_value - right_value;
            delta * delta
        })
        .sum::<f32>()
}

pub fn encode_embedding_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding_blob(blob: &[u8], expected_dim: usize) -> Option<Vec<f32>> {
    if expected_dim == 0 || blob.len() != expected_dim.saturating_mul(4) {
        return None;
    }

    let out = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<f32>>();

    (out.len() == expected_dim).then_some(out)
}

fn normalize_vector(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    for value in values {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{solid_image, split_image};

    #[test]
    fn local_embedding_is_deterministic_and_unit_length() {
        let embedder = LocalThumbnailEmbedder::new(DEFAULT_MODEL_ID, 8);
        let image = split_image(64, 48, [200, 30, 30], [20, 90, 220]);

        let first = embedder.embed_batch(&[image.clone()]).expect("embed");
        let second = embedder.embed_batch(&[image]).expect("embed");
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 192);

        let norm = first[0].iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn different_images_get_different_descriptors() {
        let embedder = LocalThumbnailEmbedder::new(DEFAULT_MODEL_ID, 4);
        let vectors = embedder
            .embed_batch(&[
                solid_image(16, 16, [255, 0, 0]),
                split_image(16, 16, [255, 0, 0], [0, 0, 255]),
            ])
            .expect("embed");
        assert!(squared_l2(&vectors[0], &vectors[1]) > 0.01);
    }

    #[test]
    fn resolve_embedder_rejects_unknown_models() {
        assert_eq!(
            resolve_embedder("").expect("default").config().model_id,
            DEFAULT_MODEL_ID
        );
        assert_eq!(
            resolve_embedder("thumbnail-16x16-local-v1")
                .expect("known")
                .config()
                .dimensions,
            768
        );
        let err = resolve_embedder("resnet50").err().expect("unknown model");
        assert!(matches!(
            err.downcast_ref::<CurateError>(),
            Some(CurateError::Config(_))
        ));
    }

    #[test]
    fn embedding_blob_round_trips_and_checks_length() {
        let values = vec![0.25_f32, -1.5, 3.0];
        let blob = encode_embedding_blob(&values);
        assert_eq!(decode_embedding_blob(&blob, 3), Some(values));
        assert_eq!(decode_embedding_blob(&blob, 4), None);
    }
}
