use std::fs;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::error::AlignError;
use crate::lineage::DEFAULT_LINEAGE_FILE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionSource {
    Prefix(PathBuf),
    Archive {
        path: PathBuf,
        extract_dir: Option<PathBuf>,
        keep_extracted: bool,
    },
}

#[derive(Debug)]
enum Extracted {
    Temp { _dir: TempDir },
    Dir { path: PathBuf, keep: bool },
}

#[derive(Debug)]
pub struct PreparedCollection {
    prefix: PathBuf,
    extracted: Option<Extracted>,
}

impl PreparedCollection {
    pub fn prepare(source: &CollectionSource) -> Result<Self, AlignError> {
        match source {
            CollectionSource::Prefix(prefix) => {
                validate_prefix(prefix)?;
                Ok(Self {
                    prefix: prefix.clone(),
                    extracted: None,
                })
            }
            CollectionSource::Archive {
                path,
                extract_dir,
                keep_extracted,
            } => extract_collection(path, extract_dir.as_deref(), *keep_extracted),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn directory(&self) -> &Path {
        self.prefix.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn bundled_lineage(&self) -> Option<PathBuf> {
        let candidate = self.directory().join(DEFAULT_LINEAGE_FILE);
        candidate.is_file().then_some(candidate)
    }
}

impl Drop for PreparedCollection {
    fn drop(&mut self) {
        if let Some(Extracted::Dir { path, keep: false }) = &self.extracted {
            if let Err(err) = fs::remove_dir_all(path) {
                warn!(path = %path.display(), error = %err, "could not remove extracted collection");
            }
        }
    }
}

pub fn archive_stem(path: &Path) -> Result<String, AlignError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| AlignError::Archive(format!("bad archive name {}", path.display())))?;
    let stem = name
        .strip_suffix(".tar.gz")
        .or_else(|| name.strip_suffix(".tgz"))
        .unwrap_or(name);
    if stem.is_empty() {
        return Err(AlignError::Archive(format!("bad archive name {}", path.display())));
    }
    Ok(stem.to_string())
}

fn extract_collection(
    archive: &Path,
    extract_dir: Option<&Path>,
    keep: bool,
) -> Result<PreparedCollection, AlignError> {
    if !archive.is_file() {
        return Err(AlignError::MissingCollection(archive.display().to_string()));
    }
    let stem = archive_stem(archive)?;

    let (base, extracted) = match extract_dir {
        Some(dir) => {
            let target = dir.join(&stem);
            fs::create_dir_all(&target)
                .map_err(|err| AlignError::Filesystem(format!("create {}: {err}", target.display())))?;
            (target.clone(), Extracted::Dir { path: target, keep })
        }
        None => {
            let temp = tempfile::Builder::new()
                .prefix("kira-ab-collection")
                .tempdir()
                .map_err(|err| AlignError::Filesystem(format!("create temp dir: {err}")))?;
            if keep {
                let path = temp.keep();
                (path.clone(), Extracted::Dir { path, keep: true })
            } else {
                (temp.path().to_path_buf(), Extracted::Temp { _dir: temp })
            }
        }
    };
    // Hand ownership over first so a failed unpack still cleans up.
    let mut prepared = PreparedCollection {
        prefix: base.join(&stem),
        extracted: Some(extracted),
    };

    info!(archive = %archive.display(), target = %base.display(), "extracting collection");
    let file = fs::File::open(archive)
        .map_err(|err| AlignError::Archive(format!("open {}: {err}", archive.display())))?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(&base)
        .map_err(|err| AlignError::Archive(format!("unpack {}: {err}", archive.display())))?;

    // Some archives wrap the files in a directory named after the collection.
    let nested = base.join(&stem).join(&stem);
    if !has_collection_files(&prepared.prefix) && has_collection_files(&nested) {
        prepared.prefix = nested;
    }
    validate_prefix(&prepared.prefix)?;
    if keep {
        info!(dir = %base.display(), "extracted collection will be kept");
    }
    Ok(prepared)
}

fn has_collection_files(prefix: &Path) -> bool {
    let Some(stem) = prefix.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    let dir = match prefix.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    let dotted = format!("{stem}.");
    entries.flatten().any(|entry| {
        entry.path().is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&dotted))
    })
}

pub fn validate_prefix(prefix: &Path) -> Result<(), AlignError> {
    if has_collection_files(prefix) {
        Ok(())
    } else {
        Err(AlignError::MissingCollection(prefix.display().to_string()))
    }
}
