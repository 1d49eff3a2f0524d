//! Geolocation encoded into processed image file names:
//! `@east@north@zone@hemisphere@lon@lat@<name>_<crop>@@<heading|-1>@@@@@@.jpg`.

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::geofence::{GeoPoint, UtmPoint};

pub const PROCESSED_EXTENSION: &str = "jpg";

const FIELD_UTM_EAST: usize = 1;
const FIELD_UTM_NORTH: usize = 2;
const FIELD_ZONE: usize = 3;
const FIELD_HEMISPHERE: usize = 4;
const FIELD_GPS_LON: usize = 5;
const FIELD_GPS_LAT: usize = 6;
const FIELD_NAME: usize = 7;
const FIELD_HEADING: usize = 9;
const MIN_FIELDS: usize = FIELD_HEADING + 1;

const NO_HEADING: i32 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedImageRecord {
    pub utm: UtmPoint,
    /// Opaque; never read back as a real zone.
    pub zone_code: String,
    pub hemisphere_code: String,
    pub gps: GeoPoint,
    /// `<original stem>_<crop index>`.
    pub image_name: String,
    pub heading: Option<i32>,
}

impl ProcessedImageRecord {
    pub fn new(
        utm: UtmPoint,
        zone_code: impl Into<String>,
        hemisphere_code: impl Into<String>,
        gps: GeoPoint,
        original_stem: &str,
        crop_index: usize,
        heading: Option<i32>,
    ) -> Self {
        Self {
            utm: UtmPoint::new(round_to(utm.east, 2), round_to(utm.north, 2)),
            zone_code: zone_code.into(),
            hemisphere_code: hemisphere_code.into(),
            gps: GeoPoint::new(round_to(gps.lon, 5), round_to(gps.lat, 5)),
            image_name: format!("{original_stem}_{crop_index}"),
            heading,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "@{}@{}@{}@{}@{}@{}@{}@@{}@@@@@@.{PROCESSED_EXTENSION}",
            coordinate_text(self.utm.east),
            coordinate_text(self.utm.north),
            self.zone_code,
            self.hemisphere_code,
            coordinate_text(self.gps.lon),
            coordinate_text(self.gps.lat),
            self.image_name,
            self.heading.unwrap_or(NO_HEADING),
        )
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .with_context(|| format!("invalid UTF-8 file name: {}", path.display()))?;
        Self::decode(stem).with_context(|| format!("malformed processed name: {}", path.display()))
    }

    pub fn decode(stem: &str) -> Result<Self> {
        let fields = stem.split('@').collect::<Vec<&str>>();
        if fields.len() < MIN_FIELDS {
            bail!("expected at least {MIN_FIELDS} '@' fields, found {}", fields.len());
        }

        let number = |index: usize, label: &str| -> Result<f64> {
            fields[index]
                .parse::<f64>()
                .with_context(|| format!("field {index} ({label}) is not a number: '{}'", fields[index]))
        };

        let heading = fields[FIELD_HEADING]
            .parse::<i32>()
            .with_context(|| format!("heading field is not an integer: '{}'", fields[FIELD_HEADING]))?;

        Ok(Self {
            utm: UtmPoint::new(number(FIELD_UTM_EAST, "utm east")?, number(FIELD_UTM_NORTH, "utm north")?),
            zone_code: fields[FIELD_ZONE].to_string(),
            hemisphere_code: fields[FIELD_HEMISPHERE].to_string(),
            gps: GeoPoint::new(number(FIELD_GPS_LON, "longitude")?, number(FIELD_GPS_LAT, "latitude")?),
            image_name: fields[FIELD_NAME].to_string(),
            heading: (heading != NO_HEADING).then_some(heading),
        })
    }

    /// Raw image stem the crop was cut from.
    pub fn original_stem(&self) -> &str {
        self.image_name
            .rsplit_once('_')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.image_name)
    }

    pub fn is_facing_north(&self) -> bool {
        self.heading == Some(0)
    }
}

/// Shortest round-trip decimal text; whole numbers keep one fractional digit
/// (`500000.0`), matching existing dataset names.
fn coordinate_text(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}
