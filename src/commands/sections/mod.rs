use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::SectionsArgs;
use crate::commands::evaluate::{BuildStats, Evaluator, QueryInput, build_evaluator};
use crate::commands::organize::clock_seed;
use crate::dataset::{QUERIES_DIR, scan_section_dirs};
use crate::error::CurateError;
use crate::geofence::{Geofence, planar_distance};
use crate::model::{Location, SectionCenter};
use crate::record::{PROCESSED_EXTENSION, ProcessedImageRecord};
use crate::util::{
    build_pool, file_name_string, list_files_recursive, now_utc_string, require_directory,
    utc_compact_string, write_json_pretty,
};

mod selection;

pub use selection::SectionSelection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Good,
    Bad,
}

/// Strictly below the margin is good.
pub fn classify(distance: f64, error_margin: f64) -> Verdict {
    if distance < error_margin {
        Verdict::Good
    } else {
        Verdict::Bad
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSample {
    pub file_name: String,
    pub truth: Location,
    pub prediction: Location,
    pub distance: f64,
    pub latency_ms: f64,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageError {
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionResult {
    pub section_id: usize,
    pub samples: Vec<ImageSample>,
    pub errors: Vec<ImageError>,
    pub good: usize,
    pub bad: usize,
    pub mean_latency_ms: Option<f64>,
}

impl SectionResult {
    fn new(section_id: usize) -> Self {
        Self {
            section_id,
            samples: Vec::new(),
            errors: Vec::new(),
            good: 0,
            bad: 0,
            mean_latency_ms: None,
        }
    }

    fn push(&mut self, sample: ImageSample) {
        match sample.verdict {
            Verdict::Good => self.good += 1,
            Verdict::Bad => self.bad += 1,
        }
        self.samples.push(sample);
    }

    fn finish(mut self) -> Self {
        self.mean_latency_ms = mean(self.samples.iter().map(|sample| sample.latency_ms));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GlobalSummary {
    pub sections: usize,
    pub images: usize,
    pub errors: usize,
    pub good: usize,
    pub bad: usize,
    pub mean_distance: Option<f64>,
    pub mean_latency_ms: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct SectionsReport {
    pub run_id: String,
    pub generated_at: String,
    pub test_folder: String,
    pub database_folder: String,
    pub model_id: String,
    pub k: usize,
    pub error_margin: f64,
    pub selection: SectionSelection,
    pub build: BuildStats,
    pub summary: GlobalSummary,
    pub sections: Vec<SectionResult>,
    pub section_centers: Vec<SectionCenter>,
}

/// Evaluates every selected section as its own task; results come back in
/// the order of `sections`.
pub fn evaluate_sections(
    evaluator: &Evaluator,
    sections: &[(usize, PathBuf)],
    error_margin: f64,
    workers: usize,
) -> Result<Vec<SectionResult>> {
    let pool = build_pool(workers)?;
    pool.install(|| {
        sections
            .par_iter()
            .map(|(id, dir)| evaluate_section(evaluator, *id, dir, error_margin))
            .collect::<Result<Vec<SectionResult>>>()
    })
}

fn evaluate_section(
    evaluator: &Evaluator,
    section_id: usize,
    dir: &Path,
    error_margin: f64,
) -> Result<SectionResult> {
    let mut result = SectionResult::new(section_id);
    for path in list_files_recursive(dir, PROCESSED_EXTENSION)? {
        let file_name = file_name_string(&path);
        match evaluate_image(evaluator, &path, error_margin) {
            Ok(sample) => result.push(sample),
            Err(err) => {
                warn!(section = section_id, file = %file_name, error = %format!("{err:#}"), "query failed");
                result.errors.push(ImageError {
                    file_name,
                    reason: format!("{err:#}"),
                });
            }
        }
    }
    Ok(result.finish())
}

fn evaluate_image(evaluator: &Evaluator, path: &Path, error_margin: f64) -> Result<ImageSample> {
    let record = ProcessedImageRecord::from_path(path)?;
    let truth = Location {
        gps: record.gps,
        utm: record.utm,
    };

    let started = Instant::now();
    let prediction = evaluator.evaluate(&QueryInput::Path(path.to_path_buf()))?;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    let distance = planar_distance(&prediction.location.utm, &truth.utm);
    Ok(ImageSample {
        file_name: file_name_string(path),
        truth,
        prediction: prediction.location,
        distance,
        latency_ms,
        verdict: classify(distance, error_margin),
    })
}

/// Means over every evaluated image of every section.
pub fn summarize(results: &[SectionResult]) -> GlobalSummary {
    let samples = || results.iter().flat_map(|result| result.samples.iter());
    GlobalSummary {
        sections: results.len(),
        images: samples().count(),
        errors: results.iter().map(|result| result.errors.len()).sum(),
        good: results.iter().map(|result| result.good).sum(),
        bad: results.iter().map(|result| result.bad).sum(),
        mean_distance: mean(samples().map(|sample| sample.distance)),
        mean_latency_ms: mean(samples().map(|sample| sample.latency_ms)),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Grid centers of the evaluated sections, for map rendering.
pub fn section_centers(fence: &Geofence, section_size: u32, ids: &[usize]) -> Vec<SectionCenter> {
    fence
        .sections(section_size)
        .iter()
        .filter(|section| ids.contains(&section.id))
        .map(|section| SectionCenter {
            id: section.id,
            center: section.center(),
        })
        .collect()
}

pub fn run(args: SectionsArgs) -> Result<()> {
    require_directory(&args.test_folder, "test")?;
    if args.error_margin <= 0.0 {
        return Err(CurateError::config("error margin must be positive").into());
    }
    let seed = args.seed.unwrap_or_else(clock_seed);
    let selection = SectionSelection::from_flags(
        args.all_sections,
        &args.sections,
        args.random_sections,
        seed,
    );

    let available = scan_section_dirs(&args.test_folder.join(QUERIES_DIR))?;
    let selected = selection.resolve(&available);
    if selected.is_empty() {
        return Err(CurateError::insufficient(format!(
            "no query sections selected under {}",
            args.test_folder.display()
        ))
        .into());
    }
    let ids = selected.iter().map(|(id, _)| *id).collect::<Vec<usize>>();
    info!(available = available.len(), selected = ids.len(), ?selection, "selected sections");

    let centers = match &args.polygon_csv {
        Some(path) => {
            let fence = Geofence::from_csv(path)?;
            section_centers(&fence, args.section_size, &ids)
        }
        None => Vec::new(),
    };

    let evaluator = build_evaluator(&args.retrieval)?;
    let results = evaluate_sections(
        &evaluator,
        &selected,
        args.error_margin,
        args.retrieval.workers,
    )?;
    let summary = summarize(&results);
    info!(
        images = summary.images,
        errors = summary.errors,
        good = summary.good,
        bad = summary.bad,
        "section evaluation complete"
    );

    let report = SectionsReport {
        run_id: format!("sections-{}", utc_compact_string(Utc::now())),
        generated_at: now_utc_string(),
        test_folder: args.test_folder.display().to_string(),
        database_folder: args.retrieval.database_folder.display().to_string(),
        model_id: args.retrieval.model_id.clone(),
        k: evaluator.k(),
        error_margin: args.error_margin,
        selection,
        build: evaluator.stats(),
        summary,
        sections: results,
        section_centers: centers,
    };

    if let Some(path) = &args.report_path {
        write_json_pretty(path, &report)?;
        info!(path = %path.display(), "wrote section report");
    }
    write_sections_summary(&report)
}

fn write_sections_summary(report: &SectionsReport) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, "Error margin: {:.2} meters, k={}", report.error_margin, report.k)?;
    writeln!(output, "section\tgood\tbad\terrors\tmean_latency_ms")?;
    for section in &report.sections {
        writeln!(
            output,
            "{}\t{}\t{}\t{}\t{}",
            section.section_id,
            section.good,
            section.bad,
            section.errors.len(),
            format_optional(section.mean_latency_ms)
        )?;
    }
    let summary = &report.summary;
    writeln!(
        output,
        "Total: images={} good={} bad={} errors={}",
        summary.images, summary.good, summary.bad, summary.errors
    )?;
    writeln!(
        output,
        "Mean distance: {} meters",
        format_optional(summary.mean_distance)
    )?;
    writeln!(
        output,
        "Mean latency: {} ms",
        format_optional(summary.mean_latency_ms)
    )?;
    output.flush()?;
    Ok(())
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| format!("{value:.2}"))
}
