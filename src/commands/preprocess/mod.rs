use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cli::{PreprocessArgs, UnprocessableMethod};
use crate::commands::verify::{VerificationReport, VerificationSummary, Verifier};
use crate::error::CurateError;
use crate::geofence::{Geofence, project_to_utm};
use crate::record::{PROCESSED_EXTENSION, ProcessedImageRecord};
use crate::tags::{ExifTagReader, TagReader, geolocation, heading, image_size};
use crate::util::{
    build_pool, ensure_directory, file_name_string, has_extension, list_files,
    list_files_recursive, now_utc_string, require_directory, utc_compact_string,
    write_json_pretty,
};

mod crop;

pub use crop::{CropBox, crop_boxes, render_crop};

pub const UNPROCESSABLE_SUFFIX: &str = "UNPROCESSABLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnprocessablePolicy {
    /// Append `.UNPROCESSABLE` so later runs ignore the file.
    ChangeSuffix,
    Delete,
}

impl From<UnprocessableMethod> for UnprocessablePolicy {
    fn from(method: UnprocessableMethod) -> Self {
        match method {
            UnprocessableMethod::ChangeSuffix => Self::ChangeSuffix,
            UnprocessableMethod::Delete => Self::Delete,
        }
    }
}

impl UnprocessablePolicy {
    pub fn apply(self, path: &Path) -> Result<()> {
        match self {
            Self::ChangeSuffix => {
                let tagged = tagged_path(path);
                fs::rename(path, &tagged).with_context(|| {
                    format!(
                        "failed to rename {} to {}",
                        path.display(),
                        tagged.display()
                    )
                })
            }
            Self::Delete => fs::remove_file(path)
                .with_context(|| format!("failed to delete {}", path.display())),
        }
    }
}

/// `photo.jpg` -> `photo.jpg.UNPROCESSABLE`.
pub fn tagged_path(path: &Path) -> PathBuf {
    let mut tagged = OsString::from(path.as_os_str());
    tagged.push(".");
    tagged.push(UNPROCESSABLE_SUFFIX);
    PathBuf::from(tagged)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropSettings {
    pub width: u32,
    pub height: u32,
    pub policy: UnprocessablePolicy,
}

impl Default for CropSettings {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            policy: UnprocessablePolicy::ChangeSuffix,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Processed(usize),
    Skipped,
    Unprocessable,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedImage {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreprocessReport {
    pub run_id: String,
    pub generated_at: String,
    pub raw_folder: String,
    pub output_folder: String,
    pub width: u32,
    pub height: u32,
    pub unprocessable_policy: UnprocessablePolicy,
    pub verification: VerificationSummary,
    pub processed_images: usize,
    pub crops_written: usize,
    pub skipped: usize,
    pub unprocessable: usize,
    pub failed: Vec<FailedImage>,
    pub generated_images: usize,
}

pub struct Preprocessor {
    raw_folder: PathBuf,
    output_folder: PathBuf,
    verifier: Verifier,
    reader: Arc<dyn TagReader>,
    settings: CropSettings,
}

impl Preprocessor {
    pub fn new(
        raw_folder: &Path,
        output_folder: Option<&Path>,
        fence: Geofence,
        reader: Arc<dyn TagReader>,
        settings: CropSettings,
    ) -> Result<Self> {
        if settings.width == 0 || settings.height == 0 {
            return Err(CurateError::config(format!(
                "output size must be at least 1x1, got {}x{}",
                settings.width, settings.height
            ))
            .into());
        }
        require_directory(raw_folder, "raw image")?;
        let output_folder = match output_folder {
            Some(path) => {
                require_directory(path, "processed output")?;
                path.to_path_buf()
            }
            None => {
                let path = raw_folder.join("processed");
                ensure_directory(&path)?;
                path
            }
        };

        Ok(Self {
            raw_folder: raw_folder.to_path_buf(),
            output_folder,
            verifier: Verifier::new(raw_folder, fence, reader.clone())?,
            reader,
            settings,
        })
    }

    #[cfg(test)]
    pub fn output_folder(&self) -> &Path {
        &self.output_folder
    }

    /// Deletes everything previously written to the output folder.
    pub fn reset_output(&self) -> Result<()> {
        if self.output_folder.exists() {
            fs::remove_dir_all(&self.output_folder).with_context(|| {
                format!("failed to clear {}", self.output_folder.display())
            })?;
        }
        ensure_directory(&self.output_folder)?;
        info!(folder = %self.output_folder.display(), "cleared processed output");
        Ok(())
    }

    /// Stems of the raw images that already have crops anywhere under the
    /// output tree, including images moved into dataset buckets.
    pub fn processed_stems(&self) -> Result<HashSet<String>> {
        let mut stems = HashSet::new();
        for path in list_files_recursive(&self.output_folder, PROCESSED_EXTENSION)? {
            match ProcessedImageRecord::from_path(&path) {
                Ok(record) => {
                    stems.insert(record.original_stem().to_string());
                }
                Err(err) => debug!(path = %path.display(), error = %err, "ignoring unrecognized output file"),
            }
        }
        Ok(stems)
    }

    pub fn run(&self, workers: usize) -> Result<PreprocessReport> {
        let verification = self.verifier.verify(workers)?;
        let processed = self.processed_stems()?;
        let files = self.verifier.candidate_files()?;
        info!(
            raw_folder = %self.raw_folder.display(),
            output_folder = %self.output_folder.display(),
            images = files.len(),
            already_processed = processed.len(),
            "cropping raw images"
        );

        let pool = build_pool(workers)?;
        let outcomes = pool.install(|| {
            files
                .par_iter()
                .map(|path| (path.clone(), self.process_one(path, &verification, &processed)))
                .collect::<Vec<(PathBuf, Outcome)>>()
        });

        let report = self.build_report(&verification, outcomes)?;
        info!(
            processed = report.processed_images,
            crops = report.crops_written,
            skipped = report.skipped,
            unprocessable = report.unprocessable,
            failed = report.failed.len(),
            generated = report.generated_images,
            "preprocessing completed"
        );
        Ok(report)
    }

    fn process_one(
        &self,
        path: &Path,
        verification: &VerificationReport,
        processed: &HashSet<String>,
    ) -> Outcome {
        if verification.is_invalid(path) {
            return match self.settings.policy.apply(path) {
                Ok(()) => Outcome::Unprocessable,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to set image aside");
                    Outcome::Failed(format!("{err:#}"))
                }
            };
        }

        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        if processed.contains(&stem) {
            return Outcome::Skipped;
        }

        let rotate = verification.needs_rotation(path);
        let with_heading = !verification.has_no_heading(path);
        match write_crops(
            path,
            &stem,
            self.reader.as_ref(),
            &self.output_folder,
            &self.settings,
            rotate,
            with_heading,
        ) {
            Ok(count) => Outcome::Processed(count),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to crop image");
                Outcome::Failed(format!("{err:#}"))
            }
        }
    }

    fn build_report(
        &self,
        verification: &VerificationReport,
        outcomes: Vec<(PathBuf, Outcome)>,
    ) -> Result<PreprocessReport> {
        let mut processed_images = 0usize;
        let mut crops_written = 0usize;
        let mut skipped = 0usize;
        let mut unprocessable = 0usize;
        let mut failed = Vec::new();

        for (path, outcome) in outcomes {
            match outcome {
                Outcome::Processed(count) => {
                    processed_images += 1;
                    crops_written += count;
                }
                Outcome::Skipped => skipped += 1,
                Outcome::Unprocessable => unprocessable += 1,
                Outcome::Failed(reason) => failed.push(FailedImage {
                    file: file_name_string(&path),
                    reason,
                }),
            }
        }

        Ok(PreprocessReport {
            run_id: format!("preprocess-{}", utc_compact_string(Utc::now())),
            generated_at: now_utc_string(),
            raw_folder: self.raw_folder.display().to_string(),
            output_folder: self.output_folder.display().to_string(),
            width: self.settings.width,
            height: self.settings.height,
            unprocessable_policy: self.settings.policy,
            verification: verification.summary(),
            processed_images,
            crops_written,
            skipped,
            unprocessable,
            failed,
            generated_images: count_generated(&self.output_folder)?,
        })
    }
}

/// Crops, resizes and saves one raw image; returns the number of files
/// written.
fn write_crops(
    path: &Path,
    stem: &str,
    reader: &dyn TagReader,
    output_folder: &Path,
    settings: &CropSettings,
    rotate: bool,
    with_heading: bool,
) -> Result<usize> {
    let tags = reader
        .read_tags(path)?
        .with_context(|| format!("no tags on {}", path.display()))?;
    let (width, height) = image_size(&tags)?;
    let gps = geolocation(&tags)?;
    let bearing = if with_heading {
        Some(heading(&tags)?)
    } else {
        None
    };
    let (utm, zone) = project_to_utm(gps.lat, gps.lon);

    let image =
        image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;

    let boxes = crop_boxes(width, height);
    for (index, crop) in boxes.iter().enumerate() {
        let rendered = render_crop(&image, *crop, settings.width, settings.height, rotate);
        let record = ProcessedImageRecord::new(
            utm,
            zone.number.to_string(),
            zone.band_or_placeholder().to_string(),
            gps,
            stem,
            index,
            bearing,
        );
        let target = output_folder.join(record.file_name());
        rendered
            .to_rgb8()
            .save_with_format(&target, image::ImageFormat::Jpeg)
            .with_context(|| format!("failed to write {}", target.display()))?;
    }

    Ok(boxes.len())
}

fn count_generated(output_folder: &Path) -> Result<usize> {
    Ok(list_files(output_folder)?
        .iter()
        .filter(|path| has_extension(path, &[PROCESSED_EXTENSION]))
        .count())
}

pub fn run(args: PreprocessArgs) -> Result<()> {
    let fence = Geofence::from_csv(&args.polygon_csv)?;
    let settings = CropSettings {
        width: args.width,
        height: args.height,
        policy: args.unprocessable_method.into(),
    };
    let preprocessor = Preprocessor::new(
        &args.input_folder,
        args.output_folder.as_deref(),
        fence,
        Arc::new(ExifTagReader),
        settings,
    )?;
    if args.reset {
        preprocessor.reset_output()?;
    }

    let report = preprocessor.run(args.workers)?;
    write_preprocess_summary(&report)?;

    if let Some(path) = args.report_path {
        write_json_pretty(&path, &report)?;
        info!(path = %path.display(), "wrote preprocess report");
    }
    Ok(())
}

pub fn write_preprocess_summary(report: &PreprocessReport) -> Result<()> {
    let mut failures_by_reason = BTreeMap::<&str, usize>::new();
    for failure in &report.failed {
        *failures_by_reason.entry(failure.reason.as_str()).or_default() += 1;
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, " ==> {} incorrect images were found.", report.verification.invalid)?;
    writeln!(output, " ==> {} images need to be rotated.", report.verification.needs_rotation)?;
    writeln!(output, " ==> {} images have no heading.", report.verification.missing_heading)?;
    writeln!(
        output,
        " ==> processed {} / skipped {} / set aside {} / failed {}",
        report.processed_images,
        report.skipped,
        report.unprocessable,
        report.failed.len()
    )?;
    for (reason, count) in failures_by_reason {
        writeln!(output, "     {count} x {reason}")?;
    }
    writeln!(output, "==> Number of images generated : {}", report.generated_images)?;
    output.flush()?;
    Ok(())
}
