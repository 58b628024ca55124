use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::accessions::read_accessions;
use crate::collection::{CollectionSource, PreparedCollection};
use crate::config::RunConfig;
use crate::dispatch::{self, CancelToken, DispatchConfig, Dispatcher, Stage, UnitStatus};
use crate::domain::{ColumnSelector, EnrichMode, OrderPolicy};
use crate::error::AlignError;
use crate::hits::{self, HitRow};
use crate::lineage::{self, Enricher, LineageMap};
use crate::partition::partition;
use crate::relation::{AppendBlock, RelationLayout, RelationWriter, reorder_by_unit};
use crate::tools::SequenceTools;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Dispatch,
    Unit,
    Finalize,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub message: String,
    pub progress: Option<(usize, usize)>,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    fn phase(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            progress: None,
            elapsed: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub unit: usize,
    pub accessions: Vec<String>,
    pub stage: Stage,
    pub diagnostic: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub collection: String,
    pub output: String,
    pub strategy: String,
    pub workers: usize,
    pub enrichment: String,
    pub accessions: usize,
    pub units_total: usize,
    pub units_attempted: usize,
    pub units_completed: usize,
    pub units_skipped: usize,
    pub units_failed: usize,
    pub units_abandoned: usize,
    pub units_cancelled: usize,
    pub rows_written: usize,
    pub missing_accessions: Vec<String>,
    pub rejected_accessions: Vec<String>,
    // Failure budget exceeded.
    pub cancelled: bool,
    // Cancelled from outside the run, e.g. by an operator interrupt.
    pub interrupted: bool,
    pub failures: Vec<UnitFailure>,
}

impl RunSummary {
    fn start(config: &RunConfig) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            elapsed_secs: 0.0,
            collection: match &config.collection {
                CollectionSource::Prefix(prefix) => prefix.display().to_string(),
                CollectionSource::Archive { path, .. } => path.display().to_string(),
            },
            output: config.output.to_string(),
            strategy: config.strategy.to_string(),
            workers: config.workers,
            enrichment: "none".to_string(),
            accessions: 0,
            units_total: 0,
            units_attempted: 0,
            units_completed: 0,
            units_skipped: 0,
            units_failed: 0,
            units_abandoned: 0,
            units_cancelled: 0,
            rows_written: 0,
            missing_accessions: Vec::new(),
            rejected_accessions: Vec::new(),
            cancelled: false,
            interrupted: false,
            failures: Vec::new(),
        }
    }

    fn units_finished(&self) -> usize {
        self.units_completed
            + self.units_skipped
            + self.units_failed
            + self.units_abandoned
            + self.units_cancelled
    }

    fn units_started(&self) -> usize {
        self.units_finished() - self.units_cancelled
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("run aborted: {source}")]
pub struct RunAborted {
    pub summary: Box<RunSummary>,
    pub source: AlignError,
}

enum Enrichment {
    None,
    Inline(Arc<LineageMap>),
    Post(Arc<LineageMap>),
}

impl Enrichment {
    fn label(&self) -> &'static str {
        match self {
            Enrichment::None => "none",
            Enrichment::Inline(_) => "inline",
            Enrichment::Post(_) => "post",
        }
    }
}

pub struct Runner<T: SequenceTools> {
    config: RunConfig,
    tools: T,
    cancel: CancelToken,
}

impl<T: SequenceTools> Runner<T> {
    pub fn new(config: RunConfig, tools: T) -> Self {
        Self {
            config,
            tools,
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&self, sink: &dyn ProgressSink) -> Result<RunSummary, RunAborted> {
        let started = Instant::now();
        let mut summary = RunSummary::start(&self.config);
        let result = self.execute(sink, &mut summary);

        summary.finished_at = Utc::now();
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        summary.units_attempted = summary.units_started();
        summary.interrupted = result.is_ok() && !summary.cancelled && self.cancel.is_cancelled();
        if summary.interrupted {
            warn!(
                cancelled = summary.units_cancelled,
                "run interrupted, remaining units were not dispatched"
            );
        }
        sink.event(ProgressEvent {
            elapsed: Some(started.elapsed()),
            ..ProgressEvent::phase(Phase::Finalize, "run finished")
        });

        match result {
            Ok(()) => {
                info!(
                    completed = summary.units_completed,
                    skipped = summary.units_skipped,
                    failed = summary.units_failed,
                    rows = summary.rows_written,
                    elapsed_secs = summary.elapsed_secs,
                    "run finished"
                );
                Ok(summary)
            }
            Err(source) => {
                error!(error = %source, "run aborted");
                Err(RunAborted {
                    summary: Box::new(summary),
                    source,
                })
            }
        }
    }

    // Every transient resource is a local here, released on every return path.
    fn execute(&self, sink: &dyn ProgressSink, summary: &mut RunSummary) -> Result<(), AlignError> {
        let config = &self.config;
        sink.event(ProgressEvent::phase(Phase::Prepare, "preparing collection"));
        let collection = PreparedCollection::prepare(&config.collection)?;
        summary.collection = collection.prefix().display().to_string();

        let enrichment = self.resolve_enrichment(&collection)?;
        summary.enrichment = enrichment.label().to_string();

        let list = read_accessions(config.accessions.as_std_path(), &config.accession_source)?;
        summary.accessions = list.accessions.len();
        summary.rejected_accessions = list.rejected;
        let units = partition(&list.accessions, config.strategy)?;
        summary.units_total = units.len();

        let scratch_parent = match &config.scratch_dir {
            Some(dir) => dir.as_std_path().to_path_buf(),
            None => std::env::temp_dir(),
        };
        let scratch = dispatch::scratch_dir(&scratch_parent)?;

        let output = config.output.as_std_path();
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| AlignError::OutputWrite(format!("create {}: {err}", parent.display())))?;
        }
        let reorder = config.order == OrderPolicy::Input;
        let post = matches!(enrichment, Enrichment::Post(_));
        let primary: PathBuf = if reorder || post {
            scratch.path().join("hits.primary")
        } else {
            output.to_path_buf()
        };

        let inline = match &enrichment {
            Enrichment::Inline(map) => Some(Enricher::new(
                Arc::clone(map),
                hits::column_index(hits::SUBJECT_TAXID_COLUMN).unwrap_or(34),
            )),
            _ => None,
        };
        let writer = RelationWriter::create(&primary, RelationLayout::hits(), config.delimiter, inline)?;

        let dispatcher = Dispatcher::new(
            &self.tools,
            DispatchConfig {
                collection: collection.prefix().to_path_buf(),
                workers: config.workers,
                max_target_seqs: config.max_target_seqs,
                cancel_policy: config.cancel_policy,
                scratch_dir: scratch.path().to_path_buf(),
            },
            self.cancel.clone(),
        );

        sink.event(ProgressEvent::phase(
            Phase::Dispatch,
            format!("dispatching {} units on {} workers", units.len(), config.workers),
        ));
        let total = units.len();
        let mut blocks: Vec<AppendBlock> = Vec::new();
        let dispatched = dispatcher.run(units, |outcome| {
            let unit = outcome.unit;
            match outcome.status {
                UnitStatus::Completed { rows, missing } => {
                    let written = writer.append(rows.iter().map(HitRow::values))?;
                    if written > 0 {
                        blocks.push(AppendBlock {
                            unit_seq: unit.seq(),
                            rows: written,
                        });
                    }
                    summary.units_completed += 1;
                    summary.rows_written += written;
                    summary
                        .missing_accessions
                        .extend(missing.iter().map(ToString::to_string));
                }
                UnitStatus::Skipped { missing } => {
                    summary.units_skipped += 1;
                    summary
                        .missing_accessions
                        .extend(missing.iter().map(ToString::to_string));
                }
                UnitStatus::Failed { stage, diagnostic } => {
                    summary.units_failed += 1;
                    summary.failures.push(UnitFailure {
                        unit: unit.seq(),
                        accessions: unit.accessions().iter().map(ToString::to_string).collect(),
                        stage,
                        diagnostic,
                    });
                    if let Some(budget) = config.max_failures
                        && summary.units_failed > budget
                        && !summary.cancelled
                    {
                        warn!(budget, "failure budget exceeded, cancelling remaining units");
                        summary.cancelled = true;
                        self.cancel.cancel();
                    }
                }
                UnitStatus::Abandoned => summary.units_abandoned += 1,
                UnitStatus::Cancelled => summary.units_cancelled += 1,
            }
            sink.event(ProgressEvent {
                phase: Phase::Unit,
                message: unit.label(),
                progress: Some((summary.units_finished(), total)),
                elapsed: Some(outcome.elapsed),
            });
            Ok(())
        });
        let primary_rows = writer.finish();
        dispatched?;
        let mut rows = primary_rows?;

        sink.event(ProgressEvent::phase(Phase::Finalize, "writing output relation"));
        let mut current = primary;
        if reorder {
            let target = if post {
                scratch.path().join("hits.ordered")
            } else {
                output.to_path_buf()
            };
            let quoted = quoted_hit_columns();
            rows = reorder_by_unit(&current, &target, &blocks, config.delimiter, &quoted)?;
            current = target;
        }
        if let Enrichment::Post(map) = enrichment {
            rows = lineage::enrich_relation(
                &current,
                output,
                map,
                &ColumnSelector::Name(hits::SUBJECT_TAXID_COLUMN.to_string()),
                config.delimiter,
                &quoted_hit_columns(),
            )?;
        }
        summary.rows_written = rows;
        summary.output = output.display().to_string();
        Ok(())
    }

    fn resolve_enrichment(&self, collection: &PreparedCollection) -> Result<Enrichment, AlignError> {
        let configured = self.config.lineage.as_ref().map(|path| path.as_std_path().to_path_buf());
        let source = configured.or_else(|| collection.bundled_lineage());
        let load = |path: &Path| LineageMap::load(path).map(Arc::new);

        match (self.config.enrich, source) {
            (EnrichMode::None, _) => Ok(Enrichment::None),
            (EnrichMode::Auto, None) => {
                info!("no lineage source found, parent taxids will not be added");
                Ok(Enrichment::None)
            }
            (EnrichMode::Auto | EnrichMode::Inline, Some(path)) => Ok(Enrichment::Inline(load(&path)?)),
            (EnrichMode::Post, Some(path)) => Ok(Enrichment::Post(load(&path)?)),
            (EnrichMode::Inline | EnrichMode::Post, None) => Err(AlignError::MissingLineage(
                "no lineage source configured or bundled with the collection".to_string(),
            )),
        }
    }
}

fn quoted_hit_columns() -> Vec<&'static str> {
    hits::QUOTED_COLUMNS.to_vec()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::dispatch::tests::ScriptedTools;
    use crate::domain::BatchStrategy;
    use crate::relation::read_relation;

    struct Fixture {
        _temp: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new(ids: &str) -> Self {
            let temp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
            fs::create_dir_all(root.join("db")).unwrap();
            fs::write(root.join("db/ITS.nsq"), b"").unwrap();
            fs::write(root.join("ids.txt"), ids).unwrap();
            fs::create_dir_all(root.join("scratch")).unwrap();
            Self { _temp: temp, root }
        }

        fn config(&self) -> RunConfig {
            let mut config = RunConfig::new(
                CollectionSource::Prefix(self.root.join("db/ITS").into_std_path_buf()),
                self.root.join("ids.txt"),
            );
            config.workers = 2;
            config.output = self.root.join("out/hits.tsv");
            config.scratch_dir = Some(self.root.join("scratch"));
            config
        }
    }

    #[test]
    fn failed_fetch_is_counted_and_excluded() {
        let fixture = Fixture::new("A1\nA2\nA3\n");
        let runner = Runner::new(fixture.config(), ScriptedTools::failing_fetch(&["A2"]));

        let summary = runner.run(&NullProgress).unwrap();
        assert_eq!(summary.units_total, 3);
        assert_eq!(summary.units_completed, 2);
        assert_eq!(summary.units_failed, 1);
        assert_eq!(summary.failures[0].accessions, vec!["A2"]);
        assert_eq!(summary.failures[0].stage, Stage::Fetch);
        assert_eq!(summary.rows_written, 2);
        assert_eq!(summary.enrichment, "none");

        let (_, rows) = read_relation(fixture.root.join("out/hits.tsv").as_std_path(), Default::default()).unwrap();
        let mut queries: Vec<&str> = rows.iter().map(|row| row[2].as_str()).collect();
        queries.sort();
        assert_eq!(queries, vec!["A1", "A3"]);
        assert_eq!(fs::read_dir(fixture.root.join("scratch")).unwrap().count(), 0);
    }

    #[test]
    fn input_order_and_post_enrichment() {
        let fixture = Fixture::new("A1\nA2\nA3\nA4\nA5\n");
        fs::write(fixture.root.join("lineage.tsv"), "10\t1\n").unwrap();
        let mut config = fixture.config();
        config.order = OrderPolicy::Input;
        config.enrich = EnrichMode::Post;
        config.lineage = Some(fixture.root.join("lineage.tsv"));
        config.strategy = BatchStrategy::Batch(2);
        let tools = ScriptedTools {
            delay: Duration::from_millis(3),
            ..ScriptedTools::default()
        };
        let runner = Runner::new(config, tools);

        let summary = runner.run(&NullProgress).unwrap();
        assert_eq!(summary.units_total, 3);
        assert_eq!(summary.rows_written, 5);
        assert_eq!(summary.enrichment, "post");

        let (header, rows) = read_relation(fixture.root.join("out/hits.tsv").as_std_path(), Default::default()).unwrap();
        assert_eq!(header.last().map(String::as_str), Some("taxid_parent"));
        let queries: Vec<&str> = rows.iter().map(|row| row[2].as_str()).collect();
        assert_eq!(queries, vec!["A1", "A2", "A3", "A4", "A5"]);
        assert!(rows.iter().all(|row| row[hits::FIELD_COUNT] == "1"));
        assert_eq!(fs::read_dir(fixture.root.join("scratch")).unwrap().count(), 0);
    }

    #[test]
    fn failure_budget_cancels_remaining_units() {
        let ids: Vec<String> = (0..12).map(|i| format!("F{i}")).collect();
        let fixture = Fixture::new(&ids.join("\n"));
        let mut config = fixture.config();
        config.workers = 1;
        config.max_failures = Some(1);
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let runner = Runner::new(config, ScriptedTools::failing_fetch(&refs));

        let summary = runner.run(&NullProgress).unwrap();
        assert!(summary.cancelled);
        assert!(summary.units_failed >= 2);
        assert!(summary.units_cancelled > 0);
        assert_eq!(summary.units_failed + summary.units_cancelled, 12);
        assert_eq!(summary.units_attempted, summary.units_failed);
    }

    #[test]
    fn attempted_counts_only_recorded_outcomes() {
        let fixture = Fixture::new("");
        let mut summary = RunSummary::start(&fixture.config());
        // Ten units, but a fatal write left only six outcomes recorded.
        summary.units_total = 10;
        summary.units_completed = 3;
        summary.units_failed = 1;
        summary.units_cancelled = 2;
        assert_eq!(summary.units_started(), 4);
    }

    #[test]
    fn configuration_errors_abort_before_dispatch() {
        let fixture = Fixture::new("A1\n");
        let mut config = fixture.config();
        config.enrich = EnrichMode::Inline;
        let runner = Runner::new(config, ScriptedTools::default());

        let aborted = runner.run(&NullProgress).unwrap_err();
        assert_matches!(aborted.source, AlignError::MissingLineage(_));
        assert_eq!(aborted.summary.units_total, 0);
        assert!(runner.tools.fetch_calls.lock().is_empty());
    }

    #[test]
    fn empty_accession_list_writes_header_only() {
        let fixture = Fixture::new("");
        let runner = Runner::new(fixture.config(), ScriptedTools::default());

        let summary = runner.run(&NullProgress).unwrap();
        assert_eq!(summary.units_total, 0);
        let text = fs::read_to_string(fixture.root.join("out/hits.tsv")).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
