use std::io::{self, Write};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::cli::GridArgs;
use crate::error::CurateError;
use crate::geofence::{Geofence, GridSectionView, UtmZone};
use crate::util::{now_utc_string, write_json_pretty};

/// Grid sections as consumed by map rendering.
#[derive(Debug, Serialize)]
pub struct GridExport {
    pub generated_at: String,
    pub zone: UtmZone,
    pub section_size: u32,
    pub polygon: Vec<[f64; 2]>,
    pub sections: Vec<GridSectionView>,
}

pub fn build_export(fence: &Geofence, section_size: u32) -> Result<GridExport> {
    if section_size == 0 {
        return Err(CurateError::config("grid size must be greater than 0").into());
    }
    Ok(GridExport {
        generated_at: now_utc_string(),
        zone: fence.zone(),
        section_size,
        polygon: fence
            .utm_polygon()
            .exterior()
            .coords()
            .map(|coord| [coord.x, coord.y])
            .collect(),
        sections: fence
            .sections(section_size)
            .iter()
            .map(|section| section.view())
            .collect(),
    })
}

pub fn run(args: GridArgs) -> Result<()> {
    let fence = Geofence::from_csv(&args.polygon_csv)?;
    let export = build_export(&fence, args.grid_size)?;
    info!(sections = export.sections.len(), size = args.grid_size, "built grid");

    match args.output_path {
        Some(path) => {
            write_json_pretty(&path, &export)?;
            info!(path = %path.display(), "wrote grid export");
        }
        None => {
            let mut output = io::BufWriter::new(io::stdout().lock());
            serde_json::to_writer_pretty(&mut output, &export)
                .context("failed to serialize grid export")?;
            writeln!(output)?;
            output.flush()?;
        }
    }
    Ok(())
}
