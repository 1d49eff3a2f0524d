//! WGS84 to UTM projection, delegated to the `utm` crate.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UtmPoint {
    pub east: f64,
    pub north: f64,
}

impl UtmPoint {
    pub fn new(east: f64, north: f64) -> Self {
        Self { east, north }
    }
}

/// Euclidean distance in meters between two points of the same zone.
pub fn planar_distance(left: &UtmPoint, right: &UtmPoint) -> f64 {
    (left.east - right.east).hypot(left.north - right.north)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UtmZone {
    pub number: u8,
    /// Latitude band letter, `None` outside the -80..=84 band coverage.
    pub band: Option<char>,
}

impl UtmZone {
    pub fn band_or_placeholder(&self) -> char {
        self.band.unwrap_or('Z')
    }
}

/// Zone from longitude, with the Norway and Svalbard exceptions. The
/// antimeridian itself belongs to zone 60.
pub fn zone_number(lat: f64, lon: f64) -> u8 {
    if lon == 180.0 {
        return 60;
    }
    ::utm::lat_lon_to_zone_number(lat, lon)
}

pub fn band_letter(lat: f64) -> Option<char> {
    ::utm::lat_to_zone_letter(lat)
}

pub fn project_to_utm(lat: f64, lon: f64) -> (UtmPoint, UtmZone) {
    let number = zone_number(lat, lon);
    let zone = UtmZone {
        number,
        band: band_letter(lat),
    };
    (project_to_utm_in_zone(lat, lon, number), zone)
}

/// Projects into a caller-chosen zone, so that points near a zone edge stay in
/// the same planar frame as the rest of a polygon. Southern points carry the
/// 10 000 km false northing.
pub fn project_to_utm_in_zone(lat: f64, lon: f64, zone_number: u8) -> UtmPoint {
    let (north, east, _convergence) = ::utm::to_utm_wgs84(lat, lon, zone_number);
    UtmPoint { east, north }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_caen_campus_point() {
        let (point, zone) = project_to_utm(49.21528, -0.37194);
        assert!((point.east - 691_383.35).abs() < 0.01, "east={}", point.east);
        assert!((point.north - 5_454_712.35).abs() < 0.01, "north={}", point.north);
        assert_eq!(zone.number, 30);
        assert_eq!(zone.band, Some('U'));
    }

    #[test]
    fn planar_distance_is_euclidean() {
        let truth = UtmPoint::new(0.0, 0.0);
        assert_eq!(planar_distance(&truth, &UtmPoint::new(3.0, 4.0)), 5.0);
        assert_eq!(planar_distance(&UtmPoint::new(-3.0, -4.0), &truth), 5.0);
    }

    #[test]
    fn southern_hemisphere_gets_false_northing() {
        let (point, zone) = project_to_utm(-33.8688, 151.2093);
        assert_eq!(zone.number, 56);
        assert_eq!(zone.band, Some('H'));
        assert!(point.north > 6_000_000.0 && point.north < 7_000_000.0);
    }

    #[test]
    fn zone_exceptions_for_norway_and_svalbard() {
        assert_eq!(zone_number(60.0, 5.0), 32);
        assert_eq!(zone_number(78.0, 15.0), 33);
        assert_eq!(zone_number(10.0, 180.0), 60);
        assert_eq!(zone_number(0.0, -180.0), 1);
    }

    #[test]
    fn band_letter_is_none_near_poles() {
        assert_eq!(band_letter(85.0), None);
        assert_eq!(band_letter(-81.0), None);
        assert_eq!(band_letter(84.0), Some('X'));
    }
}
