//! Image tag mapping produced by the EXIF decoder and the facts derived from it.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result, bail};
use exif::{In, Tag, Value};

use crate::error::CurateError;
use crate::geofence::GeoPoint;
use crate::record::round_to;

pub const TAG_WIDTH: &str = "EXIF ExifImageWidth";
pub const TAG_HEIGHT: &str = "EXIF ExifImageLength";
pub const TAG_LATITUDE: &str = "GPS GPSLatitude";
pub const TAG_LATITUDE_REF: &str = "GPS GPSLatitudeRef";
pub const TAG_LONGITUDE: &str = "GPS GPSLongitude";
pub const TAG_LONGITUDE_REF: &str = "GPS GPSLongitudeRef";
pub const TAG_HEADING: &str = "GPS GPSImgDirection";
pub const TAG_HEADING_REF: &str = "GPS GPSImgDirectionRef";
pub const TAG_ORIENTATION: &str = "Image Orientation";

/// Headings this close to 0°/360° count as facing north.
pub const NORTH_TOLERANCE_DEG: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Text(String),
    Numbers(Vec<f64>),
}

impl TagValue {
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Numbers(values) => values
                .iter()
                .map(|value| value.to_string())
                .collect::<Vec<String>>()
                .join(", "),
        }
    }

    fn numbers(&self) -> Option<&[f64]> {
        match self {
            Self::Numbers(values) => Some(values),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageTags {
    values: BTreeMap<String, TagValue>,
}

impl ImageTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: TagValue) {
        self.values.insert(key.to_string(), value);
    }

    pub fn with(mut self, key: &str, value: TagValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn number(&self, key: &str, index: usize) -> Result<f64> {
        self.get(key)
            .and_then(TagValue::numbers)
            .and_then(|values| values.get(index).copied())
            .with_context(|| format!("tag '{key}' has no numeric value at {index}"))
    }

    fn text(&self, key: &str) -> Result<String> {
        self.get(key)
            .map(TagValue::as_text)
            .with_context(|| format!("tag '{key}' is missing"))
    }
}

/// Decodes the tag mapping of an image file. `Ok(None)` means the file
/// carries no tags at all.
pub trait TagReader: Send + Sync {
    fn read_tags(&self, path: &Path) -> Result<Option<ImageTags>>;
}

pub fn has_size(tags: &ImageTags) -> bool {
    tags.contains(TAG_WIDTH) && tags.contains(TAG_HEIGHT)
}

pub fn has_geolocation(tags: &ImageTags) -> bool {
    [TAG_LATITUDE, TAG_LONGITUDE, TAG_LATITUDE_REF, TAG_LONGITUDE_REF]
        .iter()
        .all(|key| tags.contains(key))
}

pub fn has_heading(tags: &ImageTags) -> bool {
    tags.contains(TAG_HEADING) && tags.contains(TAG_HEADING_REF)
}

pub fn is_rotated(tags: &ImageTags) -> bool {
    tags.get(TAG_ORIENTATION)
        .map(|value| value.as_text().contains("Rotated"))
        .unwrap_or(false)
}

/// Declared `(width, height)`.
pub fn image_size(tags: &ImageTags) -> Result<(u32, u32)> {
    let width = tags.number(TAG_WIDTH, 0)?;
    let height = tags.number(TAG_HEIGHT, 0)?;
    if width < 1.0 || height < 1.0 {
        bail!(CurateError::Metadata(format!(
            "declared size {width}x{height} is empty"
        )));
    }
    Ok((width as u32, height as u32))
}

/// Decimal degrees with hemisphere sign correction, rounded to 5 decimals.
pub fn geolocation(tags: &ImageTags) -> Result<GeoPoint> {
    let mut lat = degrees_from_dms(tags, TAG_LATITUDE)?;
    let mut lon = degrees_from_dms(tags, TAG_LONGITUDE)?;
    if tags.text(TAG_LATITUDE_REF)?.trim() != "N" {
        lat = -lat;
    }
    if tags.text(TAG_LONGITUDE_REF)?.trim() != "E" {
        lon = -lon;
    }
    Ok(GeoPoint::new(round_to(lon, 5), round_to(lat, 5)))
}

/// Integer degrees clockwise from north, snapped to 0 near north.
pub fn heading(tags: &ImageTags) -> Result<i32> {
    let degrees = tags.number(TAG_HEADING, 0)?;
    if degrees <= NORTH_TOLERANCE_DEG || degrees >= 360.0 - NORTH_TOLERANCE_DEG {
        return Ok(0);
    }
    Ok(degrees as i32)
}

fn degrees_from_dms(tags: &ImageTags, key: &str) -> Result<f64> {
    let degrees = tags.number(key, 0)?;
    let minutes = tags.number(key, 1)?;
    let seconds = tags.number(key, 2)?;
    Ok(degrees + minutes / 60.0 + seconds / 3600.0)
}

/// Production decoder backed by `kamadak-exif`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifTagReader;

const EXIF_MAPPINGS: &[(Tag, &str)] = &[
    (Tag::PixelXDimension, TAG_WIDTH),
    (Tag::PixelYDimension, TAG_HEIGHT),
    (Tag::GPSLatitude, TAG_LATITUDE),
    (Tag::GPSLatitudeRef, TAG_LATITUDE_REF),
    (Tag::GPSLongitude, TAG_LONGITUDE),
    (Tag::GPSLongitudeRef, TAG_LONGITUDE_REF),
    (Tag::GPSImgDirection, TAG_HEADING),
    (Tag::GPSImgDirectionRef, TAG_HEADING_REF),
];

impl TagReader for ExifTagReader {
    fn read_tags(&self, path: &Path) -> Result<Option<ImageTags>> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let exif = match exif::Reader::new().read_from_container(&mut reader) {
            Ok(exif) => exif,
            Err(exif::Error::NotFound(_)) => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to decode tags: {}", path.display()));
            }
        };

        let mut tags = ImageTags::new();
        for (tag, key) in EXIF_MAPPINGS {
            if let Some(field) = exif.get_field(*tag, In::PRIMARY) {
                if let Some(value) = convert_exif_value(&field.value) {
                    tags.insert(key, value);
                }
            }
        }

        if let Some(field) = exif.get_field(Tag::Orientation, In::PRIMARY) {
            if let Some(code) = field.value.get_uint(0) {
                tags.insert(TAG_ORIENTATION, TagValue::Text(orientation_label(code).to_string()));
            }
        }

        Ok(Some(tags))
    }
}

fn convert_exif_value(value: &Value) -> Option<TagValue> {
    match value {
        Value::Ascii(parts) => parts.first().map(|bytes| {
            TagValue::Text(
                String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string(),
            )
        }),
        Value::Rational(values) => Some(TagValue::Numbers(
            values.iter().map(|value| value.to_f64()).collect(),
        )),
        Value::SRational(values) => Some(TagValue::Numbers(
            values.iter().map(|value| value.to_f64()).collect(),
        )),
        other => other
            .iter_uint()
            .map(|values| TagValue::Numbers(values.map(f64::from).collect())),
    }
}

fn orientation_label(code: u32) -> &'static str {
    match code {
        1 => "Horizontal (normal)",
        2 => "Mirrored horizontal",
        3 => "Rotated 180",
        4 => "Mirrored vertical",
        5 => "Mirrored horizontal then rotated 90 CCW",
        6 => "Rotated 90 CW",
        7 => "Mirrored horizontal then rotated 90 CW",
        8 => "Rotated 90 CCW",
        _ => "Unknown",
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;

    /// Tags of a valid landscape photo near the Caen campus.
    pub fn campus_tags() -> ImageTags {
        ImageTags::new()
            .with(TAG_WIDTH, TagValue::Numbers(vec![4000.0]))
            .with(TAG_HEIGHT, TagValue::Numbers(vec![3000.0]))
            .with(TAG_LATITUDE, TagValue::Numbers(vec![49.0, 12.0, 55.0]))
            .with(TAG_LATITUDE_REF, TagValue::Text("N".to_string()))
            .with(TAG_LONGITUDE, TagValue::Numbers(vec![0.0, 22.0, 19.0]))
            .with(TAG_LONGITUDE_REF, TagValue::Text("W".to_string()))
            .with(TAG_HEADING, TagValue::Numbers(vec![352.5]))
            .with(TAG_HEADING_REF, TagValue::Text("T".to_string()))
    }
}
