use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::{AccessionId, CancelPolicy, WorkUnit};
use crate::error::AlignError;
use crate::hits::{self, HitRow};
use crate::tools::{
    AlignRequest, FetchRequest, QueryInput, SequenceTools, ToolFailure, ToolKind, ToolOutput,
};

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Align,
    Parse,
    Scratch,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::Fetch => "fetch",
            Stage::Align => "align",
            Stage::Parse => "parse",
            Stage::Scratch => "scratch",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    Completed {
        rows: Vec<HitRow>,
        missing: Vec<AccessionId>,
    },
    Skipped { missing: Vec<AccessionId> },
    Failed { stage: Stage, diagnostic: String },
    Abandoned,
    Cancelled,
}

impl UnitStatus {
    pub fn label(&self) -> &'static str {
        match self {
            UnitStatus::Completed { .. } => "completed",
            UnitStatus::Skipped { .. } => "skipped",
            UnitStatus::Failed { .. } => "failed",
            UnitStatus::Abandoned => "abandoned",
            UnitStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: WorkUnit,
    pub status: UnitStatus,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub collection: PathBuf,
    pub workers: usize,
    pub max_target_seqs: usize,
    pub cancel_policy: CancelPolicy,
    pub scratch_dir: PathBuf,
}

pub struct Dispatcher<'a, T: SequenceTools> {
    tools: &'a T,
    config: DispatchConfig,
    cancel: CancelToken,
}

impl<'a, T: SequenceTools> Dispatcher<'a, T> {
    pub fn new(tools: &'a T, config: DispatchConfig, cancel: CancelToken) -> Self {
        Self {
            tools,
            config,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    // `collect` runs on the calling thread only. After it fails, the rest are drained uncollected.
    pub fn run<F>(&self, units: Vec<WorkUnit>, mut collect: F) -> Result<(), AlignError>
    where
        F: FnMut(UnitOutcome) -> Result<(), AlignError>,
    {
        if self.config.workers == 0 {
            return Err(AlignError::InvalidWorkerCount(0));
        }
        if units.is_empty() {
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|index| format!("kira-ab-worker-{index}"))
            .build()
            .map_err(|err| AlignError::WorkerPool(err.to_string()))?;

        let (sender, receiver) = crossbeam_channel::bounded::<UnitOutcome>(self.config.workers * 2);
        info!(
            units = units.len(),
            workers = self.config.workers,
            "dispatching units"
        );

        thread::scope(|scope| {
            scope.spawn(move || {
                pool.install(|| {
                    units.into_par_iter().for_each_with(sender, |sender, unit| {
                        let outcome = self.process(unit);
                        // The receiver lives until every sender is dropped.
                        let _ = sender.send(outcome);
                    });
                });
            });

            let mut fatal: Option<AlignError> = None;
            for outcome in receiver.iter() {
                if fatal.is_some() {
                    continue;
                }
                if let Err(err) = collect(outcome) {
                    error!(error = %err, "collector failed, stopping dispatch");
                    self.cancel.cancel();
                    fatal = Some(err);
                }
            }
            match fatal {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn interrupt(&self) -> Option<&CancelToken> {
        match self.config.cancel_policy {
            CancelPolicy::Abandon => Some(&self.cancel),
            CancelPolicy::Drain => None,
        }
    }

    fn process(&self, unit: WorkUnit) -> UnitOutcome {
        let started = Instant::now();
        let status = if self.cancel.is_cancelled() {
            UnitStatus::Cancelled
        } else {
            match unit.accessions() {
                [single] => self.run_single(single),
                _ => self.run_batch(&unit),
            }
        };

        match &status {
            UnitStatus::Completed { rows, missing } => info!(
                unit = unit.seq(),
                hits = rows.len(),
                missing = missing.len(),
                "{} completed",
                unit.label()
            ),
            UnitStatus::Skipped { .. } => {
                warn!(unit = unit.seq(), "{} skipped: no sequence in collection", unit.label())
            }
            UnitStatus::Failed { stage, diagnostic } => warn!(
                unit = unit.seq(),
                stage = %stage,
                "{} failed: {diagnostic}",
                unit.label()
            ),
            UnitStatus::Abandoned => warn!(unit = unit.seq(), "{} abandoned", unit.label()),
            UnitStatus::Cancelled => {}
        }

        UnitOutcome {
            unit,
            status,
            elapsed: started.elapsed(),
        }
    }

    fn run_single(&self, id: &AccessionId) -> UnitStatus {
        let fetched = match self.fetch_one(id) {
            Ok(Some(output)) => output,
            Ok(None) => {
                return UnitStatus::Skipped {
                    missing: vec![id.clone()],
                };
            }
            Err(status) => return status,
        };
        self.align(QueryInput::Bytes(&fetched.stdout), Vec::new())
    }

    fn run_batch(&self, unit: &WorkUnit) -> UnitStatus {
        let mut query = match tempfile::Builder::new()
            .prefix(&format!("unit-{}-", unit.seq()))
            .suffix(".fasta")
            .tempfile_in(&self.config.scratch_dir)
        {
            Ok(file) => file,
            Err(err) => {
                return UnitStatus::Failed {
                    stage: Stage::Scratch,
                    diagnostic: format!("create query file: {err}"),
                };
            }
        };

        let mut missing = Vec::new();
        let mut fetch_errors = Vec::new();
        let mut fetched = 0usize;
        for id in unit.accessions() {
            if self.interrupt().is_some_and(CancelToken::is_cancelled) {
                return UnitStatus::Abandoned;
            }
            match self.fetch_one(id) {
                Ok(Some(output)) => {
                    if let Err(err) = query.write_all(&output.stdout) {
                        return UnitStatus::Failed {
                            stage: Stage::Scratch,
                            diagnostic: format!("write query file: {err}"),
                        };
                    }
                    fetched += 1;
                }
                Ok(None) => {
                    warn!(accession = %id, "no sequence in collection");
                    missing.push(id.clone());
                }
                Err(UnitStatus::Failed { diagnostic, .. }) => {
                    warn!(accession = %id, "could not fetch sequence: {diagnostic}");
                    fetch_errors.push(format!("{id}: {diagnostic}"));
                    missing.push(id.clone());
                }
                Err(status) => return status,
            }
        }

        if fetched == 0 {
            if fetch_errors.is_empty() {
                return UnitStatus::Skipped { missing };
            }
            return UnitStatus::Failed {
                stage: Stage::Fetch,
                diagnostic: fetch_errors.join("; "),
            };
        }
        if let Err(err) = query.flush() {
            return UnitStatus::Failed {
                stage: Stage::Scratch,
                diagnostic: format!("flush query file: {err}"),
            };
        }
        // `query` is removed when it goes out of scope, whatever the outcome.
        self.align(QueryInput::File(query.path()), missing)
    }

    fn fetch_one(&self, id: &AccessionId) -> Result<Option<ToolOutput>, UnitStatus> {
        let output = self
            .tools
            .fetch(
                &self.config.collection,
                &FetchRequest::fasta(id),
                self.interrupt(),
            )
            .and_then(|output| output.require_success(ToolKind::Fetch))
            .map_err(|failure| failure_status(Stage::Fetch, failure))?;
        if output.has_output() {
            Ok(Some(output))
        } else {
            Ok(None)
        }
    }

    fn align(&self, query: QueryInput<'_>, missing: Vec<AccessionId>) -> UnitStatus {
        let request = AlignRequest {
            query,
            max_target_seqs: self.config.max_target_seqs,
        };
        let output = match self
            .tools
            .align(&self.config.collection, &request, self.interrupt())
            .and_then(|output| output.require_success(ToolKind::Align))
        {
            Ok(output) => output,
            Err(failure) => return failure_status(Stage::Align, failure),
        };
        match hits::parse_hits(&output.stdout) {
            Ok(rows) => UnitStatus::Completed { rows, missing },
            Err(err) => UnitStatus::Failed {
                stage: Stage::Parse,
                diagnostic: err.to_string(),
            },
        }
    }
}

fn failure_status(stage: Stage, failure: ToolFailure) -> UnitStatus {
    match failure {
        ToolFailure::Interrupted { .. } => UnitStatus::Abandoned,
        other => UnitStatus::Failed {
            stage,
            diagnostic: other.to_string(),
        },
    }
}

pub fn scratch_dir(parent: &Path) -> Result<tempfile::TempDir, AlignError> {
    tempfile::Builder::new()
        .prefix("kira-ab-scratch")
        .tempdir_in(parent)
        .map_err(|err| AlignError::Filesystem(format!("create scratch dir: {err}")))
}
