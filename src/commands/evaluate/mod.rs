use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::cli::{EvaluateArgs, RetrievalArgs};
use crate::commands::organize::clock_seed;
use crate::embedding::{ImageEmbedder, resolve_embedder};
use crate::error::CurateError;
use crate::geofence::planar_distance;
use crate::record::{PROCESSED_EXTENSION, ProcessedImageRecord};
use crate::util::{list_files_recursive, require_directory};

mod evaluator;
mod index;
mod loader;
mod store;

pub use evaluator::{BuildOptions, BuildStats, Evaluator, QueryInput};
pub use loader::{DatabaseLoader, LoaderMode};
pub use store::DescriptorStore;

/// Opens the database, resolves the embedder and builds the index described
/// by the shared retrieval flags.
pub fn build_evaluator(args: &RetrievalArgs) -> Result<Evaluator> {
    let loader = DatabaseLoader::open(&args.database_folder, LoaderMode::Images)?;
    let embedder: Arc<dyn ImageEmbedder> = Arc::from(resolve_embedder(&args.model_id)?);
    let mut cache = args
        .descriptor_cache
        .as_deref()
        .map(DescriptorStore::open)
        .transpose()?;

    Evaluator::build(
        &loader,
        embedder,
        BuildOptions {
            batch_size: args.batch_size,
            workers: args.workers,
            k: args.k,
        },
        cache.as_mut(),
    )
}

/// Explicit image, else a seeded random pick among the queries of `folder`.
pub fn choose_query(
    image: Option<PathBuf>,
    random_folder: Option<PathBuf>,
    seed: u64,
) -> Result<PathBuf> {
    if let Some(image) = image {
        return Ok(image);
    }
    let Some(folder) = random_folder else {
        return Err(CurateError::config("pass --image or --random-queries-folder").into());
    };
    require_directory(&folder, "queries")?;
    let candidates = list_files_recursive(&folder, PROCESSED_EXTENSION)?;
    if candidates.is_empty() {
        return Err(CurateError::insufficient(format!(
            "no query images under {}",
            folder.display()
        ))
        .into());
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let pick = rng.random_range(0..candidates.len());
    Ok(candidates[pick].clone())
}

pub fn run(args: EvaluateArgs) -> Result<()> {
    let seed = args.seed.unwrap_or_else(clock_seed);
    let query_path = choose_query(args.image, args.random_queries_folder, seed)?;
    info!(path = %query_path.display(), seed, base64 = args.use_base64, "query image");

    let truth = ProcessedImageRecord::from_path(&query_path)?;
    let query = if args.use_base64 {
        QueryInput::encode_file(&query_path)?
    } else {
        QueryInput::Path(query_path.clone())
    };

    let evaluator = build_evaluator(&args.retrieval)?;
    let prediction = evaluator.evaluate(&query)?;
    let predicted = prediction.location.utm;

    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, " -- Evaluation -- ")?;
    writeln!(output, "Query : {}", query_path.display())?;
    writeln!(
        output,
        "UTM_prediction = {:.2}, {:.2}",
        predicted.east, predicted.north
    )?;
    writeln!(
        output,
        "UTM_truth = {:.2}, {:.2}",
        truth.utm.east, truth.utm.north
    )?;
    writeln!(
        output,
        "GPS_prediction = {:.5}, {:.5}",
        prediction.location.gps.lon, prediction.location.gps.lat
    )?;
    writeln!(
        output,
        " - Diff UTM_east : {:.2} meters",
        (predicted.east - truth.utm.east).abs()
    )?;
    writeln!(
        output,
        " - Diff UTM_north : {:.2} meters",
        (predicted.north - truth.utm.north).abs()
    )?;
    writeln!(
        output,
        " - Distance : {:.2} meters",
        planar_distance(&predicted, &truth.utm)
    )?;
    for matched in &prediction.matches {
        writeln!(
            output,
            "   match #{} {} (d2={:.4})",
            matched.index, matched.file_name, matched.squared_distance
        )?;
    }
    output.flush()?;
    Ok(())
}
