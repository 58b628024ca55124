use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::accessions::AccessionSource;
use crate::collection::CollectionSource;
use crate::domain::{
    BatchStrategy, CancelPolicy, ColumnSelector, Delimiter, EnrichMode, OrderPolicy,
};
use crate::error::AlignError;
use crate::partition::strategy_from_size;

pub const DEFAULT_CONFIG_FILE: &str = "kira-ab.json";
pub const DEFAULT_WORKERS: usize = 14;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_TARGET_SEQS: usize = 10;
pub const DEFAULT_OUTPUT: &str = "blastn_hits.tsv";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub collection: Option<CollectionEntry>,
    #[serde(default)]
    pub accessions: Option<AccessionEntry>,
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub workers: Option<i64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_target_seqs: Option<usize>,
    #[serde(default)]
    pub output: Option<Utf8PathBuf>,
    #[serde(default)]
    pub delimiter: Option<Delimiter>,
    #[serde(default)]
    pub enrich: Option<EnrichMode>,
    #[serde(default)]
    pub lineage: Option<Utf8PathBuf>,
    #[serde(default)]
    pub order: Option<OrderPolicy>,
    #[serde(default)]
    pub cancel_policy: Option<CancelPolicy>,
    #[serde(default)]
    pub max_failures: Option<usize>,
    #[serde(default)]
    pub scratch_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub tools: ToolPaths,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CollectionEntry {
    Shorthand(Utf8PathBuf),
    Detailed(CollectionObject),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CollectionObject {
    #[serde(default)]
    pub db: Option<Utf8PathBuf>,
    #[serde(default)]
    pub archive: Option<Utf8PathBuf>,
    #[serde(default)]
    pub extract_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub keep_extracted: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AccessionEntry {
    Shorthand(Utf8PathBuf),
    Detailed(AccessionObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AccessionObject {
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub column: Option<ColumnSelector>,
    #[serde(default)]
    pub delimiter: Option<Delimiter>,
    #[serde(default)]
    pub header: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolPaths {
    #[serde(default)]
    pub blastdbcmd: Option<Utf8PathBuf>,
    #[serde(default)]
    pub blastn: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub db: Option<Utf8PathBuf>,
    pub archive: Option<Utf8PathBuf>,
    pub extract_dir: Option<Utf8PathBuf>,
    pub keep_extracted: bool,
    pub accessions: Option<Utf8PathBuf>,
    pub column: Option<ColumnSelector>,
    pub accessions_delimiter: Option<Delimiter>,
    pub header: bool,
    pub batch_size: Option<i64>,
    pub workers: Option<i64>,
    pub timeout_secs: Option<u64>,
    pub max_target_seqs: Option<usize>,
    pub output: Option<Utf8PathBuf>,
    pub delimiter: Option<Delimiter>,
    pub enrich: Option<EnrichMode>,
    pub lineage: Option<Utf8PathBuf>,
    pub order: Option<OrderPolicy>,
    pub cancel_policy: Option<CancelPolicy>,
    pub max_failures: Option<usize>,
    pub scratch_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub collection: CollectionSource,
    pub accessions: Utf8PathBuf,
    pub accession_source: AccessionSource,
    pub strategy: BatchStrategy,
    pub workers: usize,
    pub timeout: Option<Duration>,
    pub max_target_seqs: usize,
    pub output: Utf8PathBuf,
    pub delimiter: Delimiter,
    pub enrich: EnrichMode,
    pub lineage: Option<Utf8PathBuf>,
    pub order: OrderPolicy,
    pub cancel_policy: CancelPolicy,
    pub max_failures: Option<usize>,
    pub scratch_dir: Option<Utf8PathBuf>,
    pub tools: ToolPaths,
}

impl RunConfig {
    pub fn new(collection: CollectionSource, accessions: Utf8PathBuf) -> Self {
        Self {
            collection,
            accessions,
            accession_source: AccessionSource::default(),
            strategy: BatchStrategy::Single,
            workers: DEFAULT_WORKERS,
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_target_seqs: DEFAULT_MAX_TARGET_SEQS,
            output: Utf8PathBuf::from(DEFAULT_OUTPUT),
            delimiter: Delimiter::Tab,
            enrich: EnrichMode::Auto,
            lineage: None,
            order: OrderPolicy::Completion,
            cancel_policy: CancelPolicy::Drain,
            max_failures: None,
            scratch_dir: None,
            tools: ToolPaths::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    // Without an explicit path a missing kira-ab.json is an empty config.
    pub fn load(path: Option<&str>) -> Result<Config, AlignError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AlignError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| AlignError::ConfigParse(err.to_string()))
    }

    pub fn resolve(path: Option<&str>, overrides: RunOverrides) -> Result<RunConfig, AlignError> {
        let config = Self::load(path)?;
        Self::resolve_config(config, overrides)
    }

    pub fn resolve_config(config: Config, overrides: RunOverrides) -> Result<RunConfig, AlignError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(AlignError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let collection = resolve_collection(config.collection.as_ref(), &overrides)?;

        let (file_accessions, file_column, file_delimiter, file_header) = match config.accessions {
            Some(AccessionEntry::Shorthand(path)) => (Some(path), None, None, None),
            Some(AccessionEntry::Detailed(obj)) => {
                (Some(obj.path), obj.column, obj.delimiter, obj.header)
            }
            None => (None, None, None, None),
        };
        let accessions = overrides
            .accessions
            .or(file_accessions)
            .ok_or_else(|| AlignError::InvalidSetting("no accession list configured".to_string()))?;
        let column = overrides.column.or(file_column).unwrap_or_default();
        let has_header = overrides.header
            || file_header.unwrap_or(false)
            || matches!(column, ColumnSelector::Name(_));
        let accession_source = AccessionSource {
            column,
            delimiter: overrides
                .accessions_delimiter
                .or(file_delimiter)
                .unwrap_or_default(),
            has_header,
        };

        let strategy = strategy_from_size(overrides.batch_size.or(config.batch_size))?;

        let workers = match overrides.workers.or(config.workers) {
            None => DEFAULT_WORKERS,
            Some(count) if count < 1 => return Err(AlignError::InvalidWorkerCount(count)),
            Some(count) => count as usize,
        };

        let timeout = match overrides
            .timeout_secs
            .or(config.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let max_target_seqs = overrides
            .max_target_seqs
            .or(config.max_target_seqs)
            .unwrap_or(DEFAULT_MAX_TARGET_SEQS);
        if max_target_seqs == 0 {
            return Err(AlignError::InvalidSetting(
                "max_target_seqs must be at least 1".to_string(),
            ));
        }

        let enrich = overrides.enrich.or(config.enrich).unwrap_or_default();
        let lineage = overrides.lineage.or(config.lineage);
        if enrich == EnrichMode::None && lineage.is_some() {
            tracing::debug!("lineage source ignored because enrichment is off");
        }

        Ok(RunConfig {
            collection,
            accessions,
            accession_source,
            strategy,
            workers,
            timeout,
            max_target_seqs,
            output: overrides
                .output
                .or(config.output)
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_OUTPUT)),
            delimiter: overrides.delimiter.or(config.delimiter).unwrap_or_default(),
            enrich,
            lineage,
            order: overrides.order.or(config.order).unwrap_or_default(),
            cancel_policy: overrides
                .cancel_policy
                .or(config.cancel_policy)
                .unwrap_or_default(),
            max_failures: overrides.max_failures.or(config.max_failures),
            scratch_dir: overrides.scratch_dir.or(config.scratch_dir),
            tools: config.tools,
        })
    }
}

pub fn resolve_collection(
    entry: Option<&CollectionEntry>,
    overrides: &RunOverrides,
) -> Result<CollectionSource, AlignError> {
    let archive_source = |path: &Utf8Path, extract_dir: Option<&Utf8Path>, keep: bool| {
        CollectionSource::Archive {
            path: path.as_std_path().to_path_buf(),
            extract_dir: extract_dir.map(|dir| dir.as_std_path().to_path_buf()),
            keep_extracted: keep,
        }
    };

    match (&overrides.db, &overrides.archive) {
        (Some(_), Some(_)) => {
            return Err(AlignError::InvalidSetting(
                "use either a database prefix or an archive, not both".to_string(),
            ));
        }
        (Some(db), None) => return Ok(CollectionSource::Prefix(db.as_std_path().to_path_buf())),
        (None, Some(archive)) => {
            return Ok(archive_source(
                archive,
                overrides.extract_dir.as_deref(),
                overrides.keep_extracted,
            ));
        }
        (None, None) => {}
    }

    match entry {
        Some(CollectionEntry::Shorthand(db)) => {
            Ok(CollectionSource::Prefix(db.as_std_path().to_path_buf()))
        }
        Some(CollectionEntry::Detailed(obj)) => match (&obj.db, &obj.archive) {
            (Some(db), None) => Ok(CollectionSource::Prefix(db.as_std_path().to_path_buf())),
            (None, Some(archive)) => Ok(archive_source(
                archive,
                overrides.extract_dir.as_deref().or(obj.extract_dir.as_deref()),
                overrides.keep_extracted || obj.keep_extracted,
            )),
            (Some(_), Some(_)) => Err(AlignError::InvalidSetting(
                "collection sets both db and archive".to_string(),
            )),
            (None, None) => Err(AlignError::MissingCollection(
                "collection entry has neither db nor archive".to_string(),
            )),
        },
        None => Err(AlignError::MissingCollection("no collection configured".to_string())),
    }
}
