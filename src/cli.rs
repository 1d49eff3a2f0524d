use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::embedding::DEFAULT_MODEL_ID;
use crate::util::default_workers;

#[derive(Parser, Debug)]
#[command(
    name = "geocurate",
    version,
    about = "Geotagged photo curation, dataset splitting and place-recognition evaluation"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Classify raw images as invalid / needs-rotation / missing-heading.
    Verify(VerifyArgs),
    /// Verify, crop, resize and rename raw images into the processed folder.
    Preprocess(PreprocessArgs),
    /// Remove the unprocessable tag from raw images.
    Restore(RestoreArgs),
    /// Split processed images into train / val / test buckets.
    Organize(OrganizeArgs),
    /// Export the grid sections of the recognition polygon as JSON.
    Grid(GridArgs),
    /// Predict the location of a single query image.
    Evaluate(EvaluateArgs),
    /// Evaluate retrieval accuracy per test query section.
    Sections(SectionsArgs),
    /// Report bucket populations of an organized dataset.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    #[arg(long, default_value = "./dataset")]
    pub input_folder: PathBuf,

    #[arg(long, default_value = "./polygon.csv")]
    pub polygon_csv: PathBuf,

    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum UnprocessableMethod {
    ChangeSuffix,
    Delete,
}

#[derive(Args, Debug, Clone)]
pub struct PreprocessArgs {
    #[arg(long, default_value = "./dataset")]
    pub input_folder: PathBuf,

    /// Defaults to `<input-folder>/processed`.
    #[arg(long)]
    pub output_folder: Option<PathBuf>,

    #[arg(long, default_value = "./polygon.csv")]
    pub polygon_csv: PathBuf,

    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,

    #[arg(long, default_value_t = 512)]
    pub width: u32,

    #[arg(long, default_value_t = 512)]
    pub height: u32,

    #[arg(long, value_enum, default_value_t = UnprocessableMethod::ChangeSuffix)]
    pub unprocessable_method: UnprocessableMethod,

    /// Clear the output folder before processing.
    #[arg(long, default_value_t = false)]
    pub reset: bool,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    #[arg(long, default_value = "./dataset")]
    pub input_folder: PathBuf,

    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,
}

#[derive(Args, Debug, Clone)]
pub struct OrganizeArgs {
    #[arg(long, default_value = "./dataset/processed")]
    pub processed_folder: PathBuf,

    #[arg(long, default_value = "./polygon.csv")]
    pub polygon_csv: PathBuf,

    #[arg(long, default_value_t = 25)]
    pub grid_size: u32,

    /// Do not build a train bucket.
    #[arg(long, default_value_t = false)]
    pub no_training: bool,

    #[arg(long, default_value_t = 0.85)]
    pub p_training: f64,

    #[arg(long, default_value_t = 0.15)]
    pub p_val: f64,

    #[arg(long, default_value_t = 0.80)]
    pub p_database: f64,

    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,

    /// Seed for the routing draws; derived from the clock when omitted.
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct GridArgs {
    #[arg(long, default_value = "./polygon.csv")]
    pub polygon_csv: PathBuf,

    #[arg(long, default_value_t = 25)]
    pub grid_size: u32,

    /// Written to stdout when omitted.
    #[arg(long)]
    pub output_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RetrievalArgs {
    #[arg(long, default_value = "./dataset/processed/test/database")]
    pub database_folder: PathBuf,

    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,

    /// Number of neighbors averaged into the prediction.
    #[arg(long, default_value_t = 1)]
    pub k: usize,

    /// SQLite file caching database descriptors between runs.
    #[arg(long)]
    pub descriptor_cache: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub retrieval: RetrievalArgs,

    #[arg(long)]
    pub image: Option<PathBuf>,

    /// Pick a random query from this folder when `--image` is omitted.
    #[arg(long)]
    pub random_queries_folder: Option<PathBuf>,

    /// Send the query as a base64 payload instead of a path.
    #[arg(long, default_value_t = false)]
    pub use_base64: bool,

    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct SectionsArgs {
    #[command(flatten)]
    pub retrieval: RetrievalArgs,

    #[arg(long, default_value = "./dataset/processed/test")]
    pub test_folder: PathBuf,

    #[arg(long = "section")]
    pub sections: Vec<u32>,

    #[arg(long, default_value_t = 5)]
    pub random_sections: usize,

    #[arg(long, default_value_t = false)]
    pub all_sections: bool,

    #[arg(long, default_value_t = 10.0)]
    pub error_margin: f64,

    /// Adds section centers to the report.
    #[arg(long)]
    pub polygon_csv: Option<PathBuf>,

    #[arg(long, default_value_t = 25)]
    pub section_size: u32,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = "./dataset/processed")]
    pub processed_folder: PathBuf,

    #[arg(long)]
    pub descriptor_cache: Option<PathBuf>,
}
