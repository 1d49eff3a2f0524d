use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;

use crate::error::CurateError;
use crate::record::PROCESSED_EXTENSION;
use crate::util::{list_files_recursive, require_directory};

/// What `DatabaseLoader::get` hands out. Fixed when the loader is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderMode {
    /// Decoded RGB images, for descriptor extraction.
    Images,
    /// File paths only, for resolving matches back to locations.
    Paths,
}

#[derive(Debug, Clone)]
pub enum DatabaseItem {
    Image(DynamicImage),
    Path(PathBuf),
}

/// Sorted listing of the processed images under a database folder.
#[derive(Debug, Clone)]
pub struct DatabaseLoader {
    folder: PathBuf,
    paths: Vec<PathBuf>,
    mode: LoaderMode,
}

impl DatabaseLoader {
    pub fn open(folder: &Path, mode: LoaderMode) -> Result<Self> {
        require_directory(folder, "database")?;
        let paths = list_files_recursive(folder, PROCESSED_EXTENSION)?;
        if paths.is_empty() {
            return Err(CurateError::insufficient(format!(
                "database folder {} holds no .{PROCESSED_EXTENSION} images",
                folder.display()
            ))
            .into());
        }
        Ok(Self {
            folder: folder.to_path_buf(),
            paths,
            mode,
        })
    }

    /// Same listing, served in another mode.
    pub fn with_mode(&self, mode: LoaderMode) -> Self {
        Self {
            folder: self.folder.clone(),
            paths: self.paths.clone(),
            mode,
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn mode(&self) -> LoaderMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn path(&self, index: usize) -> Option<&Path> {
        self.paths.get(index).map(PathBuf::as_path)
    }

    pub fn get(&self, index: usize) -> Result<DatabaseItem> {
        let path = self
            .path(index)
            .with_context(|| format!("database index {index} out of range ({})", self.len()))?;
        match self.mode {
            LoaderMode::Images => Ok(DatabaseItem::Image(open_rgb(path)?)),
            LoaderMode::Paths => Ok(DatabaseItem::Path(path.to_path_buf())),
        }
    }

    /// Decoded image at `index` whatever the mode.
    pub fn image(&self, index: usize) -> Result<DynamicImage> {
        match self.get(index)? {
            DatabaseItem::Image(image) => Ok(image),
            DatabaseItem::Path(path) => open_rgb(&path),
        }
    }
}

pub fn open_rgb(path: &Path) -> Result<DynamicImage> {
    let image = image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}
