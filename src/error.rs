use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AlignError {
    #[error("invalid accession: {0:?}")]
    InvalidAccession(String),

    #[error("batch size must be at least 1, got {0}")]
    InvalidBatchSize(i64),

    #[error("worker count must be at least 1, got {0}")]
    InvalidWorkerCount(i64),

    #[error("invalid column selector: {0}")]
    InvalidColumn(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("collection not found: {0}")]
    MissingCollection(String),

    #[error("lineage source not found: {0}")]
    MissingLineage(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("failed to read accession list {path}: {message}")]
    AccessionRead { path: PathBuf, message: String },

    #[error("archive extraction failed: {0}")]
    Archive(String),

    #[error("lineage load failed: {0}")]
    LineageLoad(String),

    #[error("catalog dump failed: {0}")]
    Catalog(String),

    #[error("output relation write failed: {0}")]
    OutputWrite(String),

    #[error("malformed relation {path}: {message}")]
    MalformedRelation { path: PathBuf, message: String },

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl AlignError {
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AlignError::InvalidAccession(_)
                | AlignError::InvalidBatchSize(_)
                | AlignError::InvalidWorkerCount(_)
                | AlignError::InvalidColumn(_)
                | AlignError::InvalidSetting(_)
                | AlignError::ConfigRead(_)
                | AlignError::ConfigParse(_)
                | AlignError::MissingCollection(_)
                | AlignError::MissingLineage(_)
                | AlignError::AccessionRead { .. }
        )
    }
}
