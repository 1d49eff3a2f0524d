use std::fs;

use super::*;
use crate::dataset::Bucket;
use crate::geofence::{GeoPoint, find_section, project_to_utm};
use crate::test_support::{campus_fence, scratch_dir};

fn processed_name(lon: f64, lat: f64, stem: &str, heading: Option<i32>) -> String {
    let gps = GeoPoint::new(lon, lat);
    let (utm, _) = project_to_utm(lat, lon);
    ProcessedImageRecord::new(utm, "30", "U", gps, stem, 0, heading).file_name()
}

fn seed_images(root: &Path, count: usize) -> Vec<String> {
    (0..count)
        .map(|index| {
            let lon = -0.3795 + 0.0185 * (index as f64 / count as f64);
            let lat = 49.2105 + 0.0090 * ((index * 7 % count) as f64 / count as f64);
            let heading = if index % 2 == 0 { Some(0) } else { Some(135) };
            let name = processed_name(lon, lat, &format!("IMG_{index:04}"), heading);
            fs::write(root.join(&name), b"jpeg").expect("write image");
            name
        })
        .collect()
}

fn options(training: bool, p_training: f64, p_val: f64, p_database: f64) -> OrganizeOptions {
    OrganizeOptions {
        grid_size: 250,
        funnel: FunnelParams {
            training,
            p_training,
            p_val,
            p_database,
        },
        seed: 2024,
    }
}

fn config_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<CurateError>(), Some(CurateError::Config(_)))
}

#[test]
fn every_image_lands_in_exactly_one_bucket() {
    let root = scratch_dir("organize-funnel");
    let names = seed_images(&root, 40);

    let organizer =
        Organizer::new(&root, &campus_fence(), options(true, 0.85, 0.15, 0.8)).expect("organizer");
    let report = organizer.organize(4).expect("organize");

    assert_eq!(report.routed, 40);
    assert!(report.failed.is_empty());
    assert_eq!(report.counts.total(), 40);
    assert_eq!(report.routed_by_rule.values().sum::<usize>(), 40);

    for name in &names {
        let bucket = organizer.bucket_of(Path::new(name)).expect("bucket");
        let expected = organizer.layout().bucket_dir(bucket).join(name);
        assert!(expected.exists(), "{name} missing from {bucket:?}");
        assert!(!root.join(name).exists());
    }
    assert_eq!(list_files_recursive(&root, "jpg").expect("list").len(), 40);
}

#[test]
fn rerunning_with_the_same_seed_leaves_images_in_place() {
    let root = scratch_dir("organize-rerun");
    seed_images(&root, 25);
    let organizer =
        Organizer::new(&root, &campus_fence(), options(true, 0.85, 0.15, 0.8)).expect("organizer");

    let first = organizer.organize(2).expect("first run");
    let second = organizer.organize(3).expect("second run");
    assert_eq!(second.routed, 0);
    assert_eq!(second.left_in_place, 25);
    assert_eq!(first.counts, second.counts);
}

#[test]
fn zero_probabilities_send_images_to_their_sections() {
    let root = scratch_dir("organize-sections");
    let names = seed_images(&root, 12);
    let fence = campus_fence();
    let sections = fence.sections(250);

    let organizer = Organizer::new(&root, &fence, options(true, 0.0, 0.0, 0.0)).expect("organizer");
    let report = organizer.organize(2).expect("organize");
    assert_eq!(report.counts.train, Some(0));
    assert_eq!(report.counts.val_total() + report.counts.test_database, report.fallback_routed);

    for name in names {
        let record = ProcessedImageRecord::decode(name.trim_end_matches(".jpg")).expect("decode");
        let bucket = match find_section(&sections, &record.utm) {
            Some(section) => Bucket::TestQueries(section.id),
            None => Bucket::ValQueries,
        };
        assert!(organizer.layout().bucket_dir(bucket).join(&name).exists(), "{name}");
    }
}

#[test]
fn disabled_training_builds_no_train_bucket() {
    let root = scratch_dir("organize-no-train");
    seed_images(&root, 10);
    let report = Organizer::new(&root, &campus_fence(), options(false, 1.0, 0.15, 0.8))
        .expect("organizer")
        .organize(2)
        .expect("organize");
    assert_eq!(report.counts.train, None);
    assert!(!root.join("train").exists());
    assert!(!report.routed_by_rule.contains_key("north_facing_training"));
}

#[test]
fn empty_directories_are_pruned() {
    let root = scratch_dir("organize-prune");
    seed_images(&root, 6);
    fs::create_dir_all(root.join("stale/nested")).expect("mkdir");

    let report = Organizer::new(&root, &campus_fence(), options(true, 0.85, 0.15, 0.8))
        .expect("organizer")
        .organize(1)
        .expect("organize");
    assert!(!root.join("stale").exists());
    assert!(report.pruned_directories >= 2);
    for (id, count) in &report.counts.sections {
        assert!(*count > 0, "empty section {id} survived pruning");
    }
}

#[test]
fn malformed_names_are_counted_and_left_alone() {
    let root = scratch_dir("organize-malformed");
    seed_images(&root, 3);
    fs::write(root.join("holiday.jpg"), b"jpeg").expect("write");

    let report = Organizer::new(&root, &campus_fence(), options(true, 0.85, 0.15, 0.8))
        .expect("organizer")
        .organize(1)
        .expect("organize");
    assert_eq!(report.routed, 3);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].starts_with("holiday.jpg"));
    assert!(root.join("holiday.jpg").exists());
}

#[test]
fn preconditions_fail_before_any_work() {
    let empty = scratch_dir("organize-empty");
    let err = Organizer::new(&empty, &campus_fence(), options(true, 0.85, 0.15, 0.8))
        .err()
        .expect("no images");
    assert!(config_error(&err));

    let err = Organizer::new(&empty.join("missing"), &campus_fence(), options(true, 0.85, 0.15, 0.8))
        .err()
        .expect("missing folder");
    assert!(config_error(&err));

    let root = scratch_dir("organize-bad-params");
    seed_images(&root, 2);
    let err = Organizer::new(&root, &campus_fence(), options(true, 0.85, 1.5, 0.8))
        .err()
        .expect("bad probability");
    assert!(config_error(&err));

    let mut zero_grid = options(true, 0.85, 0.15, 0.8);
    zero_grid.grid_size = 0;
    let err = Organizer::new(&root, &campus_fence(), zero_grid)
        .err()
        .expect("zero grid");
    assert!(config_error(&err));
    assert_eq!(list_files_recursive(&root, "jpg").expect("list").len(), 2);
    assert!(!root.join("val").exists());
}
