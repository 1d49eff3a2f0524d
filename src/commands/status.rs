use std::io::{self, Write};

use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::evaluate::DescriptorStore;
use crate::dataset::{DatasetLayout, write_tree};
use crate::model::StatusReport;
use crate::util::{file_name_string, now_utc_string, require_directory};

pub fn status_report(args: &StatusArgs) -> Result<StatusReport> {
    require_directory(&args.processed_folder, "processed")?;
    let layout = DatasetLayout::new(&args.processed_folder);
    let counts = layout.counts()?;

    let cached_descriptors = match &args.descriptor_cache {
        Some(path) if path.exists() => Some(DescriptorStore::open(path)?.count(None)?),
        Some(path) => {
            warn!(path = %path.display(), "descriptor cache missing");
            None
        }
        None => None,
    };

    Ok(StatusReport {
        generated_at: now_utc_string(),
        root: args.processed_folder.display().to_string(),
        counts,
        cached_descriptors,
    })
}

pub fn run(args: StatusArgs) -> Result<()> {
    info!(root = %args.processed_folder.display(), "status requested");
    let report = status_report(&args)?;
    info!(
        total = report.counts.total(),
        sections = report.counts.sections.len(),
        cached_descriptors = report.cached_descriptors.unwrap_or_default(),
        "dataset status"
    );

    let mut output = io::BufWriter::new(io::stdout().lock());
    write_tree(
        &mut output,
        &file_name_string(&args.processed_folder),
        &report.counts,
    )?;
    if let Some(cached) = report.cached_descriptors {
        writeln!(output, "Cached descriptors: {cached}")?;
    }
    output.flush()?;
    Ok(())
}
