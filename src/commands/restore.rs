use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::cli::RestoreArgs;
use crate::commands::preprocess::UNPROCESSABLE_SUFFIX;
use crate::util::{build_pool, list_files, require_directory};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreCounts {
    pub restored: usize,
    pub failed: usize,
}

/// Strips the unprocessable marker from every tagged file directly inside
/// `folder`.
pub fn restore_folder(folder: &Path, workers: usize) -> Result<RestoreCounts> {
    require_directory(folder, "raw image")?;
    let tagged = list_files(folder)?
        .into_iter()
        .filter(|path| {
            path.extension()
                .map(|ext| ext == UNPROCESSABLE_SUFFIX)
                .unwrap_or(false)
        })
        .collect::<Vec<PathBuf>>();
    info!(folder = %folder.display(), files = tagged.len(), "restoring unprocessable images");

    let pool = build_pool(workers)?;
    let results = pool.install(|| {
        tagged
            .par_iter()
            .map(|path| restore_file(path))
            .collect::<Vec<Result<()>>>()
    });

    let mut counts = RestoreCounts::default();
    for result in results {
        match result {
            Ok(()) => counts.restored += 1,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to restore image");
                counts.failed += 1;
            }
        }
    }
    Ok(counts)
}

fn restore_file(path: &Path) -> Result<()> {
    let original = path.with_extension("");
    fs::rename(path, &original).with_context(|| {
        format!(
            "failed to rename {} to {}",
            path.display(),
            original.display()
        )
    })
}

pub fn run(args: RestoreArgs) -> Result<()> {
    let counts = restore_folder(&args.input_folder, args.workers)?;
    info!(
        restored = counts.restored,
        failed = counts.failed,
        "restore completed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::preprocess::{UnprocessablePolicy, tagged_path};
    use crate::test_support::scratch_dir;

    #[test]
    fn restore_undoes_the_suffix_policy() {
        let folder = scratch_dir("restore");
        for name in ["a.jpg", "b.JPG", "keep.png"] {
            fs::write(folder.join(name), b"x").expect("write");
        }
        UnprocessablePolicy::ChangeSuffix
            .apply(&folder.join("a.jpg"))
            .expect("tag a");
        UnprocessablePolicy::ChangeSuffix
            .apply(&folder.join("b.JPG"))
            .expect("tag b");
        assert!(tagged_path(&folder.join("a.jpg")).exists());

        let counts = restore_folder(&folder, 2).expect("restore");
        assert_eq!(counts, RestoreCounts { restored: 2, failed: 0 });
        for name in ["a.jpg", "b.JPG", "keep.png"] {
            assert!(folder.join(name).exists(), "{name}");
        }
        assert_eq!(list_files(&folder).expect("list").len(), 3);
    }

    #[test]
    fn restore_requires_an_existing_folder() {
        let folder = scratch_dir("restore-missing").join("nope");
        assert!(restore_folder(&folder, 1).is_err());
    }
}
