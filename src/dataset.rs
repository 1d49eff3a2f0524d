//! On-disk layout of an organized dataset:
//! `<root>/{train, val/{database,queries}, test/{database, queries/section_id_<n>}}`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;

use crate::model::DatasetCounts;
use crate::record::PROCESSED_EXTENSION;
use crate::util::{ensure_directory, has_extension, list_files, list_files_recursive};

pub const TRAIN_DIR: &str = "train";
pub const VAL_DIR: &str = "val";
pub const TEST_DIR: &str = "test";
pub const DATABASE_DIR: &str = "database";
pub const QUERIES_DIR: &str = "queries";
pub const SECTION_DIR_PREFIX: &str = "section_id_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Train,
    ValDatabase,
    ValQueries,
    TestDatabase,
    TestQueries(usize),
}

impl Bucket {
    pub fn relative_dir(self) -> PathBuf {
        match self {
            Self::Train => PathBuf::from(TRAIN_DIR),
            Self::ValDatabase => Path::new(VAL_DIR).join(DATABASE_DIR),
            Self::ValQueries => Path::new(VAL_DIR).join(QUERIES_DIR),
            Self::TestDatabase => Path::new(TEST_DIR).join(DATABASE_DIR),
            Self::TestQueries(id) => Path::new(TEST_DIR)
                .join(QUERIES_DIR)
                .join(section_dir_name(id)),
        }
    }
}

pub fn section_dir_name(id: usize) -> String {
    format!("{SECTION_DIR_PREFIX}{id}")
}

pub fn section_dir_regex() -> Result<Regex> {
    Regex::new(r"^section_id_(\d+)$").context("failed to compile section directory regex")
}

pub fn parse_section_dir(name: &str, pattern: &Regex) -> Option<usize> {
    pattern
        .captures(name)
        .and_then(|captures| captures.get(1))
        .and_then(|id| id.as_str().parse::<usize>().ok())
}

/// `section_id_<n>` directories directly under `queries`, keyed by id. A
/// missing `queries` directory yields an empty map.
pub fn scan_section_dirs(queries: &Path) -> Result<BTreeMap<usize, PathBuf>> {
    let mut sections = BTreeMap::new();
    if !queries.is_dir() {
        return Ok(sections);
    }

    let pattern = section_dir_regex()?;
    let entries =
        fs::read_dir(queries).with_context(|| format!("failed to read {}", queries.display()))?;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", queries.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(|name| parse_section_dir(name, &pattern)) {
            sections.insert(id, path);
        }
    }
    Ok(sections)
}

#[derive(Debug, Clone)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket_dir(&self, bucket: Bucket) -> PathBuf {
        self.root.join(bucket.relative_dir())
    }

    pub fn test_queries_dir(&self) -> PathBuf {
        self.root.join(TEST_DIR).join(QUERIES_DIR)
    }

    /// Creates every bucket directory, one query directory per section id.
    pub fn create_skeleton(
        &self,
        training: bool,
        section_ids: impl IntoIterator<Item = usize>,
    ) -> Result<()> {
        if training {
            ensure_directory(&self.bucket_dir(Bucket::Train))?;
        }
        for bucket in [Bucket::ValDatabase, Bucket::ValQueries, Bucket::TestDatabase] {
            ensure_directory(&self.bucket_dir(bucket))?;
        }
        ensure_directory(&self.test_queries_dir())?;
        for id in section_ids {
            ensure_directory(&self.bucket_dir(Bucket::TestQueries(id)))?;
        }
        Ok(())
    }

    /// Query section directories present on disk, keyed by id.
    pub fn section_dirs(&self) -> Result<BTreeMap<usize, PathBuf>> {
        scan_section_dirs(&self.test_queries_dir())
    }

    /// Re-scans the tree; buckets that do not exist count as empty.
    pub fn counts(&self) -> Result<DatasetCounts> {
        let train_dir = self.bucket_dir(Bucket::Train);
        let mut sections = BTreeMap::new();
        for (id, path) in self.section_dirs()? {
            sections.insert(id, count_images(&path, true)?);
        }

        Ok(DatasetCounts {
            train: if train_dir.is_dir() {
                Some(count_images(&train_dir, false)?)
            } else {
                None
            },
            val_database: count_images(&self.bucket_dir(Bucket::ValDatabase), false)?,
            val_queries: count_images(&self.bucket_dir(Bucket::ValQueries), true)?,
            test_database: count_images(&self.bucket_dir(Bucket::TestDatabase), false)?,
            test_queries: count_images(&self.test_queries_dir(), true)?,
            sections,
        })
    }
}

fn count_images(dir: &Path, recursive: bool) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    if recursive {
        return Ok(list_files_recursive(dir, PROCESSED_EXTENSION)?.len());
    }
    Ok(list_files(dir)?
        .iter()
        .filter(|path| has_extension(path, &[PROCESSED_EXTENSION]))
        .count())
}

pub fn write_tree(output: &mut impl Write, root_name: &str, counts: &DatasetCounts) -> Result<()> {
    writeln!(output, "-- Organized Tree : --")?;
    writeln!(output, ".")?;
    writeln!(output, "└── {root_name}")?;
    let indent = "    ";
    if let Some(train) = counts.train {
        writeln!(output, "{indent}├── {TRAIN_DIR}  : {train}")?;
    }
    writeln!(output, "{indent}├── {VAL_DIR}  : {}", counts.val_total())?;
    writeln!(output, "{indent}│   ├── {DATABASE_DIR}  : {}", counts.val_database)?;
    writeln!(output, "{indent}│   └── {QUERIES_DIR}  : **/ {}", counts.val_queries)?;
    writeln!(output, "{indent}└── {TEST_DIR}  : {}", counts.test_total())?;
    writeln!(output, "{indent}    ├── {DATABASE_DIR}  : {}", counts.test_database)?;
    writeln!(
        output,
        "{indent}    └── {QUERIES_DIR}  : **/ {} in {} sections",
        counts.test_queries,
        counts.sections.values().filter(|count| **count > 0).count()
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scratch_dir;

    #[test]
    fn bucket_directories_follow_the_dataset_tree() {
        assert_eq!(Bucket::Train.relative_dir(), PathBuf::from("train"));
        assert_eq!(Bucket::ValQueries.relative_dir(), PathBuf::from("val/queries"));
        assert_eq!(
            Bucket::TestQueries(12).relative_dir(),
            PathBuf::from("test/queries/section_id_12")
        );
    }

    #[test]
    fn section_dir_names_parse_back() {
        let pattern = section_dir_regex().expect("regex");
        assert_eq!(parse_section_dir(&section_dir_name(7), &pattern), Some(7));
        assert_eq!(parse_section_dir("section_id_", &pattern), None);
        assert_eq!(parse_section_dir("section_id_3b", &pattern), None);
        assert_eq!(parse_section_dir("database", &pattern), None);
    }

    #[test]
    fn counts_rescan_every_bucket() {
        let root = scratch_dir("layout-counts");
        let layout = DatasetLayout::new(&root);
        layout.create_skeleton(false, [0, 2]).expect("skeleton");
        assert!(!root.join("train").exists());

        fs::write(layout.bucket_dir(Bucket::ValDatabase).join("a.jpg"), b"x").expect("write");
        fs::write(layout.bucket_dir(Bucket::TestDatabase).join("b.jpg"), b"x").expect("write");
        fs::write(layout.bucket_dir(Bucket::TestDatabase).join("c.jpg"), b"x").expect("write");
        fs::write(layout.bucket_dir(Bucket::TestQueries(2)).join("d.jpg"), b"x").expect("write");
        fs::write(layout.bucket_dir(Bucket::TestQueries(2)).join("notes.txt"), b"x").expect("write");

        let counts = layout.counts().expect("counts");
        assert_eq!(counts.train, None);
        assert_eq!(counts.val_total(), 1);
        assert_eq!(counts.test_database, 2);
        assert_eq!(counts.test_queries, 1);
        assert_eq!(counts.sections.get(&0), Some(&0));
        assert_eq!(counts.sections.get(&2), Some(&1));
        assert_eq!(counts.total(), 4);

        let mut rendered = Vec::new();
        write_tree(&mut rendered, "processed", &counts).expect("render");
        let rendered = String::from_utf8(rendered).expect("utf8");
        assert!(rendered.contains("└── test  : 3"));
        assert!(!rendered.contains("train"));
    }
}
