use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::cli::VerifyArgs;
use crate::error::CurateError;
use crate::geofence::Geofence;
use crate::tags::{
    ExifTagReader, TagReader, geolocation, has_geolocation, has_heading, has_size, is_rotated,
};
use crate::util::{
    build_pool, has_extension, list_files, now_utc_string, require_directory, write_json_pretty,
};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png", "gif", "bmp", "svg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidKind {
    Metadata,
    Geofence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Invalid { kind: InvalidKind, detail: String },
    Valid { missing_heading: bool, needs_rotation: bool },
}

/// Merged outcome of a verification pass, built only after every worker has
/// returned.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub scanned: usize,
    pub invalid: BTreeSet<PathBuf>,
    pub needs_rotation: BTreeSet<PathBuf>,
    pub missing_heading: BTreeSet<PathBuf>,
    pub invalid_by_kind: BTreeMap<InvalidKind, usize>,
}

impl VerificationReport {
    pub fn from_verdicts(verdicts: Vec<(PathBuf, Verdict)>) -> Self {
        let mut report = Self {
            scanned: verdicts.len(),
            ..Self::default()
        };

        for (path, verdict) in verdicts {
            match verdict {
                Verdict::Invalid { kind, detail } => {
                    debug!(path = %path.display(), kind = ?kind, detail = %detail, "invalid image");
                    *report.invalid_by_kind.entry(kind).or_default() += 1;
                    report.invalid.insert(path);
                }
                Verdict::Valid {
                    missing_heading,
                    needs_rotation,
                } => {
                    if missing_heading {
                        report.missing_heading.insert(path.clone());
                    }
                    if needs_rotation {
                        report.needs_rotation.insert(path);
                    }
                }
            }
        }

        report
    }

    pub fn is_invalid(&self, path: &Path) -> bool {
        self.invalid.contains(path)
    }

    pub fn needs_rotation(&self, path: &Path) -> bool {
        self.needs_rotation.contains(path)
    }

    pub fn has_no_heading(&self, path: &Path) -> bool {
        self.missing_heading.contains(path)
    }

    pub fn summary(&self) -> VerificationSummary {
        VerificationSummary {
            generated_at: now_utc_string(),
            scanned: self.scanned,
            invalid: self.invalid.len(),
            needs_rotation: self.needs_rotation.len(),
            missing_heading: self.missing_heading.len(),
            invalid_by_kind: self.invalid_by_kind.clone(),
            invalid_files: self
                .invalid
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationSummary {
    pub generated_at: String,
    pub scanned: usize,
    pub invalid: usize,
    pub needs_rotation: usize,
    pub missing_heading: usize,
    pub invalid_by_kind: BTreeMap<InvalidKind, usize>,
    pub invalid_files: Vec<String>,
}

pub struct Verifier {
    folder: PathBuf,
    fence: Geofence,
    reader: Arc<dyn TagReader>,
}

impl Verifier {
    pub fn new(folder: &Path, fence: Geofence, reader: Arc<dyn TagReader>) -> Result<Self> {
        require_directory(folder, "raw image")?;
        Ok(Self {
            folder: folder.to_path_buf(),
            fence,
            reader,
        })
    }

    pub fn candidate_files(&self) -> Result<Vec<PathBuf>> {
        Ok(list_files(&self.folder)?
            .into_iter()
            .filter(|path| has_extension(path, IMAGE_EXTENSIONS))
            .collect())
    }

    pub fn verify(&self, workers: usize) -> Result<VerificationReport> {
        let files = self.candidate_files()?;
        info!(folder = %self.folder.display(), files = files.len(), workers, "verifying raw images");

        let pool = build_pool(workers)?;
        let verdicts = pool.install(|| {
            files
                .par_iter()
                .map(|path| {
                    (
                        path.clone(),
                        verify_image(path, self.reader.as_ref(), &self.fence),
                    )
                })
                .collect::<Vec<(PathBuf, Verdict)>>()
        });

        let report = VerificationReport::from_verdicts(verdicts);
        info!(
            scanned = report.scanned,
            invalid = report.invalid.len(),
            needs_rotation = report.needs_rotation.len(),
            missing_heading = report.missing_heading.len(),
            "verification completed"
        );
        Ok(report)
    }
}

/// Checks run in a fixed order and stop at the first failure.
pub fn verify_image(path: &Path, reader: &dyn TagReader, fence: &Geofence) -> Verdict {
    match check_image(path, reader, fence) {
        Ok(verdict) => verdict,
        Err(CurateError::GeofenceRejection(detail)) => Verdict::Invalid {
            kind: InvalidKind::Geofence,
            detail,
        },
        Err(err) => Verdict::Invalid {
            kind: InvalidKind::Metadata,
            detail: err.to_string(),
        },
    }
}

fn check_image(
    path: &Path,
    reader: &dyn TagReader,
    fence: &Geofence,
) -> std::result::Result<Verdict, CurateError> {
    let tags = match reader.read_tags(path) {
        Ok(Some(tags)) if !tags.is_empty() => tags,
        Ok(_) => return Err(CurateError::Metadata("image carries no tags".to_string())),
        Err(err) => return Err(CurateError::Metadata(format!("{err:#}"))),
    };

    if !has_size(&tags) {
        return Err(CurateError::Metadata("missing image size tags".to_string()));
    }
    if !has_geolocation(&tags) {
        return Err(CurateError::Metadata("missing GPS tags".to_string()));
    }

    let point = geolocation(&tags).map_err(|err| CurateError::Metadata(format!("{err:#}")))?;
    if !fence.contains_gps(&point) {
        return Err(CurateError::GeofenceRejection(format!(
            "lon={} lat={}",
            point.lon, point.lat
        )));
    }

    Ok(Verdict::Valid {
        missing_heading: !has_heading(&tags),
        needs_rotation: is_rotated(&tags),
    })
}

pub fn run(args: VerifyArgs) -> Result<()> {
    let fence = Geofence::from_csv(&args.polygon_csv)?;
    let verifier = Verifier::new(&args.input_folder, fence, Arc::new(ExifTagReader))?;
    let report = verifier.verify(args.workers)?;

    write_verification_summary(&report)?;
    if let Some(path) = args.report_path {
        write_json_pretty(&path, &report.summary())?;
        info!(path = %path.display(), "wrote verification report");
    }

    Ok(())
}

pub fn write_verification_summary(report: &VerificationReport) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, " ==> {} incorrect images were found.", report.invalid.len())?;
    writeln!(output, " ==> {} images need to be rotated.", report.needs_rotation.len())?;
    writeln!(output, " ==> {} images have no heading.", report.missing_heading.len())?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::tags::fixtures::campus_tags;
    use crate::tags::{ImageTags, TAG_HEADING, TAG_LATITUDE_REF, TAG_ORIENTATION, TAG_WIDTH, TagValue};
    use crate::test_support::{StaticTagReader, campus_fence, scratch_dir};

    fn without(tags: ImageTags, key: &str) -> ImageTags {
        let mut out = ImageTags::new();
        for candidate in [
            crate::tags::TAG_WIDTH,
            crate::tags::TAG_HEIGHT,
            crate::tags::TAG_LATITUDE,
            crate::tags::TAG_LATITUDE_REF,
            crate::tags::TAG_LONGITUDE,
            crate::tags::TAG_LONGITUDE_REF,
            crate::tags::TAG_HEADING,
            crate::tags::TAG_HEADING_REF,
            crate::tags::TAG_ORIENTATION,
        ] {
            if candidate == key {
                continue;
            }
            if let Some(value) = tags.get(candidate) {
                out.insert(candidate, value.clone());
            }
        }
        out
    }

    fn fixture_reader() -> StaticTagReader {
        StaticTagReader::new()
            .with("good.jpg", Some(campus_tags()))
            .with("untagged.jpg", None)
            .with("no_size.jpg", Some(without(campus_tags(), TAG_WIDTH)))
            .with(
                "outside.jpg",
                Some(campus_tags().with(TAG_LATITUDE_REF, TagValue::Text("S".to_string()))),
            )
            .with(
                "rotated_no_heading.jpg",
                Some(
                    without(campus_tags(), TAG_HEADING)
                        .with(TAG_ORIENTATION, TagValue::Text("Rotated 90 CW".to_string())),
                ),
            )
            .with(
                "rotated_outside.jpg",
                Some(
                    campus_tags()
                        .with(TAG_LATITUDE_REF, TagValue::Text("S".to_string()))
                        .with(TAG_ORIENTATION, TagValue::Text("Rotated 90 CW".to_string())),
                ),
            )
    }

    #[test]
    fn verify_image_short_circuits_in_order() {
        let reader = fixture_reader();
        let fence = campus_fence();
        let verdict = |name: &str| verify_image(Path::new(name), &reader, &fence);

        assert_eq!(
            verdict("good.jpg"),
            Verdict::Valid {
                missing_heading: false,
                needs_rotation: false
            }
        );
        assert!(matches!(
            verdict("corrupt.jpg"),
            Verdict::Invalid { kind: InvalidKind::Metadata, .. }
        ));
        assert!(matches!(
            verdict("untagged.jpg"),
            Verdict::Invalid { kind: InvalidKind::Metadata, .. }
        ));
        assert!(matches!(
            verdict("no_size.jpg"),
            Verdict::Invalid { kind: InvalidKind::Metadata, .. }
        ));
        assert!(matches!(
            verdict("outside.jpg"),
            Verdict::Invalid { kind: InvalidKind::Geofence, .. }
        ));
        assert_eq!(
            verdict("rotated_no_heading.jpg"),
            Verdict::Valid {
                missing_heading: true,
                needs_rotation: true
            }
        );
    }

    #[test]
    fn verifier_merges_sets_after_join_and_keeps_invalid_exclusive() {
        let dir = scratch_dir("verify");
        for name in [
            "good.jpg",
            "corrupt.jpg",
            "untagged.jpg",
            "no_size.jpg",
            "outside.jpg",
            "rotated_no_heading.jpg",
            "rotated_outside.jpg",
            "notes.txt",
        ] {
            fs::write(dir.join(name), b"raw").expect("write fixture");
        }
        fs::create_dir(dir.join("processed.jpg")).expect("directory with image suffix");

        let verifier =
            Verifier::new(&dir, campus_fence(), Arc::new(fixture_reader())).expect("verifier");
        let report = verifier.verify(3).expect("verify");

        assert_eq!(report.scanned, 7);
        assert_eq!(report.invalid.len(), 5);
        assert_eq!(report.invalid_by_kind.get(&InvalidKind::Geofence), Some(&2));
        assert!(report.needs_rotation(&dir.join("rotated_no_heading.jpg")));
        assert!(report.has_no_heading(&dir.join("rotated_no_heading.jpg")));
        assert!(!report.is_invalid(&dir.join("good.jpg")));
        assert!(report.is_invalid(&dir.join("rotated_outside.jpg")));

        for path in &report.invalid {
            assert!(!report.needs_rotation.contains(path));
            assert!(!report.missing_heading.contains(path));
        }

        let summary = report.summary();
        assert_eq!(summary.invalid, 5);
        assert_eq!(summary.needs_rotation, 1);
        assert_eq!(summary.missing_heading, 1);
    }

    #[test]
    fn verifier_requires_existing_folder() {
        let dir = scratch_dir("verify-missing");
        let result = Verifier::new(&dir.join("absent"), campus_fence(), Arc::new(fixture_reader()));
        assert!(result.is_err());
    }
}
