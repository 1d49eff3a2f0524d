use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::cli::OrganizeArgs;
use crate::dataset::{DatasetLayout, write_tree};
use crate::error::CurateError;
use crate::geofence::Geofence;
use crate::model::{OrganizeParameters, OrganizeReport};
use crate::record::{PROCESSED_EXTENSION, ProcessedImageRecord};
use crate::util::{
    build_pool, file_name_string, list_files_recursive, now_utc_string, remove_empty_dirs,
    require_directory, utc_compact_string, write_json_pretty,
};

mod funnel;
#[cfg(test)]
mod tests;

pub use funnel::{FALLBACK_RULE, Funnel, FunnelParams, Routing, image_rng};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrganizeOptions {
    pub grid_size: u32,
    pub funnel: FunnelParams,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum ImageOutcome {
    Moved(Routing),
    InPlace(Routing),
    Failed(String),
}

pub struct Organizer {
    layout: DatasetLayout,
    options: OrganizeOptions,
    section_ids: Vec<usize>,
    funnel: Funnel,
}

impl Organizer {
    pub fn new(root: &Path, fence: &Geofence, options: OrganizeOptions) -> Result<Self> {
        require_directory(root, "processed")?;
        if list_files_recursive(root, PROCESSED_EXTENSION)?.is_empty() {
            return Err(CurateError::config(format!(
                "folder {} holds no processed .{PROCESSED_EXTENSION} images",
                root.display()
            ))
            .into());
        }
        if options.grid_size == 0 {
            return Err(CurateError::config("grid size must be greater than 0").into());
        }
        for (name, value) in [
            ("p_training", options.funnel.p_training),
            ("p_val", options.funnel.p_val),
            ("p_database", options.funnel.p_database),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CurateError::config(format!(
                    "{name} must lie in [0, 1], got {value}"
                ))
                .into());
            }
        }

        let sections = Arc::new(fence.sections(options.grid_size));
        let section_ids = sections.iter().map(|section| section.id).collect();
        Ok(Self {
            layout: DatasetLayout::new(root),
            options,
            section_ids,
            funnel: Funnel::standard(options.funnel, sections),
        })
    }

    #[cfg(test)]
    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    pub fn organize(&self, workers: usize) -> Result<OrganizeReport> {
        let root = self.layout.root();
        let mut pruned = remove_empty_dirs(root)?;
        self.layout
            .create_skeleton(self.options.funnel.training, self.section_ids.iter().copied())?;

        let images = list_files_recursive(root, PROCESSED_EXTENSION)?;
        info!(
            root = %root.display(),
            images = images.len(),
            sections = self.section_ids.len(),
            seed = self.options.seed,
            workers,
            "organizing processed images"
        );

        let pool = build_pool(workers)?;
        let outcomes = pool.install(|| {
            images
                .par_iter()
                .map(|path| (path.clone(), self.route_image(path)))
                .collect::<Vec<(PathBuf, ImageOutcome)>>()
        });

        pruned += remove_empty_dirs(root)?;
        let counts = self.layout.counts()?;

        let mut routed = 0usize;
        let mut left_in_place = 0usize;
        let mut fallback_routed = 0usize;
        let mut routed_by_rule = BTreeMap::<String, usize>::new();
        let mut failed = Vec::new();
        for (path, outcome) in outcomes {
            let routing = match outcome {
                ImageOutcome::Moved(routing) => {
                    routed += 1;
                    routing
                }
                ImageOutcome::InPlace(routing) => {
                    left_in_place += 1;
                    routing
                }
                ImageOutcome::Failed(reason) => {
                    failed.push(format!("{}: {reason}", file_name_string(&path)));
                    continue;
                }
            };
            if routing.rule == FALLBACK_RULE {
                fallback_routed += 1;
            }
            *routed_by_rule.entry(routing.rule.to_string()).or_default() += 1;
        }

        if fallback_routed > 0 {
            warn!(
                images = fallback_routed,
                "images outside every grid section were routed to val/queries"
            );
        }
        info!(
            routed,
            left_in_place,
            failed = failed.len(),
            pruned,
            "organizing completed"
        );

        Ok(OrganizeReport {
            run_id: format!("organize-{}", utc_compact_string(Utc::now())),
            generated_at: now_utc_string(),
            root: root.display().to_string(),
            parameters: OrganizeParameters {
                grid_size: self.options.grid_size,
                training: self.options.funnel.training,
                p_training: self.options.funnel.p_training,
                p_val: self.options.funnel.p_val,
                p_database: self.options.funnel.p_database,
                seed: self.options.seed,
            },
            sections_in_grid: self.section_ids.len(),
            routed,
            left_in_place,
            fallback_routed,
            failed,
            routed_by_rule,
            pruned_directories: pruned,
            counts,
        })
    }

    fn route_image(&self, path: &Path) -> ImageOutcome {
        match self.move_image(path) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "failed to organize image");
                ImageOutcome::Failed(format!("{err:#}"))
            }
        }
    }

    fn move_image(&self, path: &Path) -> Result<ImageOutcome> {
        let record = ProcessedImageRecord::from_path(path)?;
        let file_name = file_name_string(path);
        let mut rng = image_rng(self.options.seed, &file_name);
        let routing = self.funnel.route(&record, &mut rng);

        let target = self.layout.bucket_dir(routing.bucket).join(&file_name);
        if target == path {
            return Ok(ImageOutcome::InPlace(routing));
        }
        fs::rename(path, &target).with_context(|| {
            format!("failed to move {} to {}", path.display(), target.display())
        })?;
        Ok(ImageOutcome::Moved(routing))
    }

    /// Bucket the funnel picks for `path` under this organizer's seed.
    #[cfg(test)]
    pub fn bucket_of(&self, path: &Path) -> Result<crate::dataset::Bucket> {
        let record = ProcessedImageRecord::from_path(path)?;
        let mut rng = image_rng(self.options.seed, &file_name_string(path));
        Ok(self.funnel.route(&record, &mut rng).bucket)
    }
}

/// Seed taken from the wall clock when none is given.
pub fn clock_seed() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .map(|nanos| nanos as u64)
        .unwrap_or_default()
}

pub fn run(args: OrganizeArgs) -> Result<()> {
    let fence = Geofence::from_csv(&args.polygon_csv)?;
    let seed = args.seed.unwrap_or_else(clock_seed);
    info!(seed, "routing seed");

    let options = OrganizeOptions {
        grid_size: args.grid_size,
        funnel: FunnelParams {
            training: !args.no_training,
            p_training: args.p_training,
            p_val: args.p_val,
            p_database: args.p_database,
        },
        seed,
    };
    let organizer = Organizer::new(&args.processed_folder, &fence, options)?;
    let report = organizer.organize(args.workers)?;

    let root_name = args
        .processed_folder
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.processed_folder.display().to_string());
    let mut output = io::BufWriter::new(io::stdout().lock());
    write_tree(&mut output, &root_name, &report.counts)?;
    if !report.failed.is_empty() {
        writeln!(output, " ==> {} images could not be organized.", report.failed.len())?;
    }
    output.flush()?;

    if let Some(path) = args.report_path {
        write_json_pretty(&path, &report)?;
        info!(path = %path.display(), "wrote organize report");
    }
    Ok(())
}
