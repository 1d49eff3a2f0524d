mod grid;
mod utm;

use std::path::Path;

use anyhow::{Context, Result};
use geo::{Area, Contains, Coord, Intersects, Line, LineString, Point, Polygon};
use serde::Serialize;

use crate::error::CurateError;

pub use grid::{GridSection, GridSectionView, find_section, section_grid};
pub use utm::{UtmPoint, UtmZone, planar_distance, project_to_utm, project_to_utm_in_zone};

/// Geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// Recognition area, held both as the geographic ring and as its projection
/// into a single UTM zone (the zone of the first vertex).
#[derive(Debug, Clone)]
pub struct Geofence {
    gps: Polygon<f64>,
    utm: Polygon<f64>,
    zone: UtmZone,
}

impl Geofence {
    pub fn from_vertices(vertices: &[GeoPoint]) -> Result<Self> {
        let Some(first) = vertices.first() else {
            return Err(CurateError::config("polygon has no vertices").into());
        };
        let (_, zone) = project_to_utm(first.lat, first.lon);

        let gps_coords = vertices
            .iter()
            .map(|vertex| Coord {
                x: vertex.lon,
                y: vertex.lat,
            })
            .collect::<Vec<_>>();
        let utm_coords = vertices
            .iter()
            .map(|vertex| {
                let point = project_to_utm_in_zone(vertex.lat, vertex.lon, zone.number);
                Coord {
                    x: point.east,
                    y: point.north,
                }
            })
            .collect::<Vec<_>>();

        Self::from_rings(gps_coords, utm_coords, zone)
    }

    /// Validates the geographic ring and its projection.
    fn from_rings(
        gps_coords: Vec<Coord<f64>>,
        utm_coords: Vec<Coord<f64>>,
        zone: UtmZone,
    ) -> Result<Self> {
        validate_ring(&gps_coords).context("invalid recognition polygon")?;
        validate_ring(&utm_coords).with_context(|| {
            format!(
                "recognition polygon is invalid once projected to UTM zone {}",
                zone.number
            )
        })?;

        Ok(Self {
            gps: Polygon::new(LineString::from(gps_coords), Vec::new()),
            utm: Polygon::new(LineString::from(utm_coords), Vec::new()),
            zone,
        })
    }

    pub fn from_csv(path: &Path) -> Result<Self> {
        let vertices = read_polygon_csv(path)?;
        Self::from_vertices(&vertices)
            .with_context(|| format!("failed to build polygon from {}", path.display()))
    }

    /// Strict interior test on the geographic ring.
    pub fn contains_gps(&self, point: &GeoPoint) -> bool {
        self.gps.contains(&Point::new(point.lon, point.lat))
    }

    pub fn utm_polygon(&self) -> &Polygon<f64> {
        &self.utm
    }

    pub fn zone(&self) -> UtmZone {
        self.zone
    }

    pub fn sections(&self, section_size: u32) -> Vec<GridSection> {
        section_grid(&self.utm, section_size)
    }
}

/// Reads `(longitude, latitude)` rows after a single header row. The ring is
/// closed implicitly.
pub fn read_polygon_csv(path: &Path) -> Result<Vec<GeoPoint>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open polygon csv: {}", path.display()))?;

    let mut vertices = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record
            .with_context(|| format!("failed to read row {} of {}", row_index + 2, path.display()))?;
        let field = |index: usize, name: &str| -> Result<f64> {
            record
                .get(index)
                .with_context(|| format!("row {} is missing {name}", row_index + 2))?
                .parse::<f64>()
                .with_context(|| format!("row {} has a non-numeric {name}", row_index + 2))
        };
        vertices.push(GeoPoint::new(field(0, "longitude")?, field(1, "latitude")?));
    }

    Ok(vertices)
}

/// Rejects empty, degenerate, and self-intersecting rings.
pub fn validate_ring(coords: &[Coord<f64>]) -> std::result::Result<(), CurateError> {
    let mut ring = coords.to_vec();
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }

    let mut distinct = ring.clone();
    distinct.sort_by(|left, right| left.x.total_cmp(&right.x).then(left.y.total_cmp(&right.y)));
    distinct.dedup();
    if distinct.len() < 3 {
        return Err(CurateError::config(format!(
            "polygon needs at least 3 distinct vertices, got {}",
            distinct.len()
        )));
    }

    let polygon = Polygon::new(LineString::from(ring.clone()), Vec::new());
    if polygon.unsigned_area() <= 0.0 {
        return Err(CurateError::config("polygon has zero area"));
    }

    let count = ring.len();
    let edges = (0..count)
        .map(|index| Line::new(ring[index], ring[(index + 1) % count]))
        .collect::<Vec<_>>();
    for left in 0..count {
        for right in (left + 1)..count {
            let adjacent = right == left + 1 || (left == 0 && right == count - 1);
            if adjacent {
                continue;
            }
            if edges[left].intersects(&edges[right]) {
                return Err(CurateError::config(format!(
                    "polygon edges {left} and {right} intersect"
                )));
            }
        }
    }

    Ok(())
}
