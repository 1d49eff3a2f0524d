use geo::{BoundingRect, Contains, LineString, Point, Polygon};
use serde::Serialize;

use super::utm::UtmPoint;

/// Square cell of the recognition area. The id is the position of the cell in
/// the east-major, north-minor sweep and names the `section_id_<id>` query
/// directory.
#[derive(Debug, Clone)]
pub struct GridSection {
    pub id: usize,
    pub origin: UtmPoint,
    pub size: f64,
    pub polygon: Polygon<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GridSectionView {
    pub id: usize,
    pub center: UtmPoint,
    pub ring: Vec<[f64; 2]>,
}

impl GridSection {
    fn new(id: usize, x: f64, y: f64, size: f64) -> Self {
        let ring = LineString::from(vec![
            (x, y),
            (x + size, y),
            (x + size, y + size),
            (x, y + size),
            (x, y),
        ]);
        Self {
            id,
            origin: UtmPoint::new(x, y),
            size,
            polygon: Polygon::new(ring, Vec::new()),
        }
    }

    /// Strict interior test; points on a cell edge belong to no cell.
    pub fn contains(&self, point: &UtmPoint) -> bool {
        self.polygon.contains(&Point::new(point.east, point.north))
    }

    pub fn center(&self) -> UtmPoint {
        UtmPoint::new(
            self.origin.east + self.size / 2.0,
            self.origin.north + self.size / 2.0,
        )
    }

    pub fn view(&self) -> GridSectionView {
        GridSectionView {
            id: self.id,
            center: self.center(),
            ring: self
                .polygon
                .exterior()
                .coords()
                .map(|coord| [coord.x, coord.y])
                .collect(),
        }
    }
}

/// Sweeps the bounding box of `area` (planar, meters) in `section_size` steps
/// and keeps every cell with at least one corner strictly inside `area`. Cells
/// may hang over the boundary.
pub fn section_grid(area: &Polygon<f64>, section_size: u32) -> Vec<GridSection> {
    let Some(bounds) = area.bounding_rect() else {
        return Vec::new();
    };
    if section_size == 0 {
        return Vec::new();
    }

    let step = i64::from(section_size);
    let size = f64::from(section_size);
    let min_east = bounds.min().x.trunc() as i64;
    let max_east = bounds.max().x.trunc() as i64;
    let min_north = bounds.min().y.trunc() as i64;
    let max_north = bounds.max().y.trunc() as i64;

    let inside = |x: f64, y: f64| area.contains(&Point::new(x, y));

    let mut sections = Vec::new();
    let mut x = min_east;
    while x < max_east {
        let mut y = min_north;
        while y < max_north {
            let (left, bottom) = (x as f64, y as f64);
            let (right, top) = (left + size, bottom + size);
            if inside(left, bottom)
                || inside(right, bottom)
                || inside(right, top)
                || inside(left, top)
            {
                sections.push(GridSection::new(sections.len(), left, bottom, size));
            }
            y += step;
        }
        x += step;
    }

    sections
}

/// First section, in id order, whose interior holds `point`.
pub fn find_section<'a>(sections: &'a [GridSection], point: &UtmPoint) -> Option<&'a GridSection> {
    sections.iter().find(|section| section.contains(point))
}
