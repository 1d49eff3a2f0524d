use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use crate::dataset::Bucket;
use crate::geofence::{GridSection, find_section};
use crate::record::ProcessedImageRecord;

/// One step of the routing funnel. Returning `None` hands the image to the
/// next rule; draws taken from `rng` are not given back.
pub trait RoutingRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn route(&self, image: &ProcessedImageRecord, rng: &mut ChaCha8Rng) -> Option<Bucket>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routing {
    pub bucket: Bucket,
    pub rule: &'static str,
}

fn draw(rng: &mut ChaCha8Rng) -> f64 {
    rng.random::<f64>()
}

/// North-facing images go to training with probability `p_training`.
/// Other headings do not consume a draw.
pub struct NorthFacingTraining {
    pub p_training: f64,
}

impl RoutingRule for NorthFacingTraining {
    fn name(&self) -> &'static str {
        "north_facing_training"
    }

    fn route(&self, image: &ProcessedImageRecord, rng: &mut ChaCha8Rng) -> Option<Bucket> {
        if !image.is_facing_north() {
            return None;
        }
        (draw(rng) <= self.p_training).then_some(Bucket::Train)
    }
}

/// Commits the image to validation, then splits database/queries with a
/// second draw.
pub struct Validation {
    pub p_val: f64,
    pub p_database: f64,
}

impl RoutingRule for Validation {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn route(&self, _image: &ProcessedImageRecord, rng: &mut ChaCha8Rng) -> Option<Bucket> {
        if draw(rng) > self.p_val {
            return None;
        }
        if draw(rng) <= self.p_database {
            Some(Bucket::ValDatabase)
        } else {
            Some(Bucket::ValQueries)
        }
    }
}

pub struct TestDatabase {
    pub p_database: f64,
}

impl RoutingRule for TestDatabase {
    fn name(&self) -> &'static str {
        "test_database"
    }

    fn route(&self, _image: &ProcessedImageRecord, rng: &mut ChaCha8Rng) -> Option<Bucket> {
        (draw(rng) <= self.p_database).then_some(Bucket::TestDatabase)
    }
}

/// Query bucket of the first grid section containing the image.
pub struct TestSectionQueries {
    pub sections: Arc<Vec<GridSection>>,
}

impl RoutingRule for TestSectionQueries {
    fn name(&self) -> &'static str {
        "test_section_queries"
    }

    fn route(&self, image: &ProcessedImageRecord, _rng: &mut ChaCha8Rng) -> Option<Bucket> {
        find_section(&self.sections, &image.utm).map(|section| Bucket::TestQueries(section.id))
    }
}

/// Catches images outside every grid section.
pub struct FallbackQueries;

pub const FALLBACK_RULE: &str = "fallback_queries";

impl RoutingRule for FallbackQueries {
    fn name(&self) -> &'static str {
        FALLBACK_RULE
    }

    fn route(&self, _image: &ProcessedImageRecord, _rng: &mut ChaCha8Rng) -> Option<Bucket> {
        Some(Bucket::ValQueries)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunnelParams {
    pub training: bool,
    pub p_training: f64,
    pub p_val: f64,
    pub p_database: f64,
}

pub struct Funnel {
    rules: Vec<Box<dyn RoutingRule>>,
}

impl Funnel {
    pub fn new(rules: Vec<Box<dyn RoutingRule>>) -> Self {
        Self { rules }
    }

    pub fn standard(params: FunnelParams, sections: Arc<Vec<GridSection>>) -> Self {
        let mut rules: Vec<Box<dyn RoutingRule>> = Vec::with_capacity(5);
        if params.training {
            rules.push(Box::new(NorthFacingTraining {
                p_training: params.p_training,
            }));
        }
        rules.push(Box::new(Validation {
            p_val: params.p_val,
            p_database: params.p_database,
        }));
        rules.push(Box::new(TestDatabase {
            p_database: params.p_database,
        }));
        rules.push(Box::new(TestSectionQueries { sections }));
        rules.push(Box::new(FallbackQueries));
        Self::new(rules)
    }

    #[cfg(test)]
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// First matching rule wins.
    pub fn route(&self, image: &ProcessedImageRecord, rng: &mut ChaCha8Rng) -> Routing {
        self.rules
            .iter()
            .find_map(|rule| {
                rule.route(image, rng).map(|bucket| Routing {
                    bucket,
                    rule: rule.name(),
                })
            })
            .unwrap_or(Routing {
                bucket: Bucket::ValQueries,
                rule: FALLBACK_RULE,
            })
    }
}

/// Random source private to one image: the same run seed and file name
/// always give the same draws, whatever the worker or processing order.
pub fn image_rng(run_seed: u64, file_name: &str) -> ChaCha8Rng {
    let mut hasher = Sha256::new();
    hasher.update(run_seed.to_le_bytes());
    hasher.update(file_name.as_bytes());
    ChaCha8Rng::from_seed(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use geo::{LineString, Polygon};

    use super::*;
    use crate::geofence::{GeoPoint, UtmPoint, section_grid};

    fn record(east: f64, north: f64, heading: Option<i32>) -> ProcessedImageRecord {
        ProcessedImageRecord::new(
            UtmPoint::new(east, north),
            "30",
            "U",
            GeoPoint::new(-0.37, 49.21),
            "IMG",
            0,
            heading,
        )
    }

    fn square_sections() -> Arc<Vec<GridSection>> {
        let area = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)]),
            Vec::new(),
        );
        Arc::new(section_grid(&area, 50))
    }

    fn always(training: bool) -> FunnelParams {
        FunnelParams {
            training,
            p_training: 1.0,
            p_val: 1.0,
            p_database: 1.0,
        }
    }

    fn never(training: bool) -> FunnelParams {
        FunnelParams {
            training,
            p_training: 0.0,
            p_val: 0.0,
            p_database: 0.0,
        }
    }

    #[test]
    fn north_facing_images_go_to_training_first() {
        let funnel = Funnel::standard(always(true), square_sections());
        let mut rng = image_rng(1, "north");
        let routing = funnel.route(&record(10.0, 10.0, Some(0)), &mut rng);
        assert_eq!(routing.bucket, Bucket::Train);
        assert_eq!(routing.rule, "north_facing_training");
    }

    #[test]
    fn training_rule_ignores_other_headings_without_drawing() {
        let rule = NorthFacingTraining { p_training: 1.0 };
        let mut rng = image_rng(7, "east");
        let untouched = image_rng(7, "east");
        assert_eq!(rule.route(&record(1.0, 1.0, Some(90)), &mut rng), None);
        assert_eq!(rule.route(&record(1.0, 1.0, None), &mut rng), None);
        assert_eq!(rng, untouched);
    }

    #[test]
    fn disabled_training_skips_the_rule() {
        let funnel = Funnel::standard(always(false), square_sections());
        assert!(!funnel.rule_names().contains(&"north_facing_training"));
        let routing = funnel.route(&record(10.0, 10.0, Some(0)), &mut image_rng(1, "a"));
        assert_eq!(routing.bucket, Bucket::ValDatabase);
    }

    #[test]
    fn validation_commits_to_val_even_when_database_draw_fails() {
        let rule = Validation {
            p_val: 1.0,
            p_database: 0.0,
        };
        for seed in 0..20 {
            let bucket = rule.route(&record(1.0, 1.0, None), &mut image_rng(seed, "img"));
            assert_eq!(bucket, Some(Bucket::ValQueries));
        }
    }

    #[test]
    fn test_database_takes_remaining_images_by_draw() {
        let rule = TestDatabase { p_database: 1.0 };
        assert_eq!(
            rule.route(&record(1.0, 1.0, None), &mut image_rng(3, "img")),
            Some(Bucket::TestDatabase)
        );
        let rule = TestDatabase { p_database: 0.0 };
        assert_eq!(rule.route(&record(1.0, 1.0, None), &mut image_rng(3, "img")), None);
    }

    #[test]
    fn queries_land_in_the_containing_section() {
        let funnel = Funnel::standard(never(true), square_sections());
        let routing = funnel.route(&record(60.0, 10.0, Some(0)), &mut image_rng(5, "q"));
        assert_eq!(routing.bucket, Bucket::TestQueries(2));
        assert_eq!(routing.rule, "test_section_queries");
    }

    #[test]
    fn images_outside_every_section_fall_back_to_val_queries() {
        let funnel = Funnel::standard(never(true), square_sections());
        for point in [(500.0, 500.0), (50.0, 25.0)] {
            let routing = funnel.route(&record(point.0, point.1, None), &mut image_rng(5, "q"));
            assert_eq!(routing.bucket, Bucket::ValQueries);
            assert_eq!(routing.rule, FALLBACK_RULE);
        }
    }

    #[test]
    fn every_image_reaches_exactly_one_bucket() {
        let params = FunnelParams {
            training: true,
            p_training: 0.85,
            p_val: 0.15,
            p_database: 0.8,
        };
        let funnel = Funnel::standard(params, square_sections());
        let mut seen = std::collections::BTreeMap::<&'static str, usize>::new();
        for index in 0..400 {
            let heading = if index % 3 == 0 { Some(0) } else { Some(180) };
            let image = record((index % 100) as f64 + 0.5, (index % 97) as f64 + 0.5, heading);
            let routing = funnel.route(&image, &mut image_rng(11, &format!("img_{index}")));
            *seen.entry(routing.rule).or_default() += 1;
        }
        assert_eq!(seen.values().sum::<usize>(), 400);
        assert!(seen.contains_key("north_facing_training"));
        assert!(seen.contains_key("validation"));
        assert!(seen.contains_key("test_database"));
        assert!(seen.contains_key("test_section_queries"));
    }

    #[test]
    fn image_rng_is_keyed_by_seed_and_name() {
        let first = image_rng(42, "a.jpg").random::<u64>();
        assert_eq!(first, image_rng(42, "a.jpg").random::<u64>());
        assert_ne!(first, image_rng(43, "a.jpg").random::<u64>());
        assert_ne!(first, image_rng(42, "b.jpg").random::<u64>());
    }
}
