use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_align_batch::collection::CollectionSource;
use kira_align_batch::config::RunConfig;
use kira_align_batch::dispatch::{CancelToken, Stage};
use kira_align_batch::domain::{BatchStrategy, Delimiter, EnrichMode};
use kira_align_batch::error::AlignError;
use kira_align_batch::hits::{ALIGN_FIELDS, FIELD_COUNT};
use kira_align_batch::relation::read_relation;
use kira_align_batch::run::{NullProgress, ProgressEvent, ProgressSink, Runner};
use kira_align_batch::tools::{
    AlignRequest, EntrySelector, FetchRequest, QueryInput, SequenceTools, ToolFailure, ToolInfo,
    ToolOutput,
};

// Every accession has a sequence and two hits, except those in `broken`,
// whose fetch exits non-zero.
#[derive(Default)]
struct FakeBlast {
    broken: HashSet<String>,
    stats: Arc<Stats>,
    interrupt_at: Option<(String, CancelToken)>,
}

#[derive(Default)]
struct Stats {
    align_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeBlast {
    fn with_broken(ids: &[&str]) -> Self {
        Self {
            broken: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }
}

fn hit_line(query: &str, subject: &str, taxid: &str) -> String {
    ALIGN_FIELDS
        .iter()
        .map(|field| match field.specifier {
            "qseqid" | "qacc" | "qaccver" => query.to_string(),
            "sseqid" | "sacc" | "saccver" => subject.to_string(),
            "staxid" => taxid.to_string(),
            "stitle" => format!("{subject} Penicillium sp., strain \"X-1\""),
            "salltitles" => format!("{subject} Penicillium sp."),
            _ => "1".to_string(),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

impl SequenceTools for FakeBlast {
    fn fetch(
        &self,
        _collection: &Path,
        request: &FetchRequest<'_>,
        _interrupt: Option<&CancelToken>,
    ) -> Result<ToolOutput, ToolFailure> {
        let EntrySelector::One(id) = request.selector else {
            panic!("unexpected selector");
        };
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some((at, token)) = &self.interrupt_at
            && at == id.as_str()
        {
            token.cancel();
        }
        if self.broken.contains(id.as_str()) {
            return Ok(ToolOutput::failed(1, "Error: Entry not found in BLAST database"));
        }
        Ok(ToolOutput::success(format!(">{id}\nACGTTGCA\n")))
    }

    fn align(
        &self,
        _collection: &Path,
        request: &AlignRequest<'_>,
        _interrupt: Option<&CancelToken>,
    ) -> Result<ToolOutput, ToolFailure> {
        self.stats.align_calls.fetch_add(1, Ordering::SeqCst);
        let query = match request.query {
            QueryInput::Bytes(bytes) => String::from_utf8_lossy(bytes).to_string(),
            QueryInput::File(path) => fs::read_to_string(path).unwrap(),
        };
        let mut out = String::new();
        for id in query.lines().filter_map(|line| line.strip_prefix('>')) {
            out.push_str(&hit_line(id, &format!("{id}-self"), "5073"));
            out.push('\n');
            out.push_str(&hit_line(id, "NR_000001.1", "10"));
            out.push('\n');
        }
        Ok(ToolOutput::success(out))
    }

    fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            blastdbcmd: Some("fake".to_string()),
            blastdbcmd_version: None,
            blastn: Some("fake".to_string()),
            blastn_version: None,
        }
    }
}

struct Workspace {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn new(accessions: &[&str]) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("db")).unwrap();
        fs::write(root.join("db/ITS_RefSeq_Fungi.nsq"), b"").unwrap();
        fs::write(root.join("ids.txt"), accessions.join("\n")).unwrap();
        Self { _temp: temp, root }
    }

    fn config(&self, workers: usize, strategy: BatchStrategy) -> RunConfig {
        let mut config = RunConfig::new(
            CollectionSource::Prefix(self.root.join("db/ITS_RefSeq_Fungi").into_std_path_buf()),
            self.root.join("ids.txt"),
        );
        config.workers = workers;
        config.strategy = strategy;
        config.output = self.root.join("hits.tsv");
        config.scratch_dir = Some(self.root.clone());
        config
    }

    fn rows(&self, delimiter: Delimiter) -> (Vec<String>, Vec<Vec<String>>) {
        read_relation(self.root.join("hits.tsv").as_std_path(), delimiter).unwrap()
    }
}

#[test]
fn one_bad_accession_does_not_stop_the_run() {
    let workspace = Workspace::new(&["A1", "A2", "A3"]);
    let runner = Runner::new(
        workspace.config(2, BatchStrategy::Batch(1)),
        FakeBlast::with_broken(&["A2"]),
    );

    let summary = runner.run(&NullProgress).unwrap();

    assert_eq!(summary.units_completed, 2);
    assert_eq!(summary.units_failed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].accessions, vec!["A2"]);
    assert_eq!(summary.failures[0].stage, Stage::Fetch);

    let (header, rows) = workspace.rows(Delimiter::Tab);
    assert_eq!(header.len(), FIELD_COUNT);
    let queries: HashSet<&str> = rows.iter().map(|row| row[2].as_str()).collect();
    assert_eq!(queries, HashSet::from(["A1", "A3"]));
    assert_eq!(rows.len(), 4);
}

#[test]
fn concurrency_stays_within_worker_count() {
    let ids: Vec<String> = (0..24).map(|i| format!("NR_{i:06}.1")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let workspace = Workspace::new(&refs);
    let tools = FakeBlast::default();
    let stats = Arc::clone(&tools.stats);
    let runner = Runner::new(workspace.config(3, BatchStrategy::Single), tools);

    let summary = runner.run(&NullProgress).unwrap();
    assert_eq!(summary.units_completed, 24);
    assert_eq!(summary.rows_written, 48);
    assert_eq!(stats.align_calls.load(Ordering::SeqCst), 24);
    let peak = stats.peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak concurrency {peak}");
}

#[test]
fn repeated_runs_produce_the_same_rows() {
    let ids: Vec<String> = (0..12).map(|i| format!("ACC{i}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let workspace = Workspace::new(&refs);
    let runner = Runner::new(workspace.config(2, BatchStrategy::Single), FakeBlast::default());

    runner.run(&NullProgress).unwrap();
    let (_, first) = workspace.rows(Delimiter::Tab);
    runner.run(&NullProgress).unwrap();
    let (_, second) = workspace.rows(Delimiter::Tab);

    let mut first = first;
    let mut second = second;
    first.sort();
    second.sort();
    assert_eq!(first, second);
}

#[test]
fn header_written_exactly_once_with_batches() {
    let workspace = Workspace::new(&["B1", "B2", "B3", "B4", "B5"]);
    let runner = Runner::new(
        workspace.config(2, BatchStrategy::Batch(2)),
        FakeBlast::default(),
    );
    runner.run(&NullProgress).unwrap();

    let text = fs::read_to_string(workspace.root.join("hits.tsv")).unwrap();
    let header_lines = text
        .lines()
        .filter(|line| line.starts_with("query_sequence_id"))
        .count();
    assert_eq!(header_lines, 1);
    assert_eq!(text.lines().count(), 1 + 10);
}

#[test]
fn bundled_lineage_enriches_inline() {
    let workspace = Workspace::new(&["A1"]);
    lineage_fixture(&workspace.root.join("db/taxonomy4blast.sqlite3"));
    let mut config = workspace.config(1, BatchStrategy::Single);
    config.delimiter = Delimiter::Comma;
    let runner = Runner::new(config, FakeBlast::default());

    let summary = runner.run(&NullProgress).unwrap();
    assert_eq!(summary.enrichment, "inline");

    let (header, rows) = workspace.rows(Delimiter::Comma);
    assert_eq!(header[FIELD_COUNT], "taxid_parent");
    let parents: HashSet<(&str, &str)> = rows
        .iter()
        .map(|row| (row[34].as_str(), row[FIELD_COUNT].as_str()))
        .collect();
    assert_eq!(parents, HashSet::from([("5073", ""), ("10", "1")]));
    assert_eq!(rows[0][48].matches('"').count(), 2);
}

fn lineage_fixture(path: &Utf8PathBuf) {
    let conn = rusqlite::Connection::open(path.as_std_path()).unwrap();
    conn.execute_batch(
        "CREATE TABLE TaxidInfo (taxid INTEGER, parent INTEGER);
         INSERT INTO TaxidInfo VALUES (10, 1), (33208, 2759);",
    )
    .unwrap();
}

#[test]
fn explicit_post_enrichment_without_lineage_fails_early() {
    let workspace = Workspace::new(&["A1"]);
    let mut config = workspace.config(1, BatchStrategy::Single);
    config.enrich = EnrichMode::Post;
    let runner = Runner::new(config, FakeBlast::default());

    let aborted = runner.run(&NullProgress).unwrap_err();
    assert_matches!(aborted.source, AlignError::MissingLineage(_));
    assert!(aborted.source.is_configuration());
}

#[test]
fn unwritable_output_aborts_with_summary() {
    let workspace = Workspace::new(&["A1"]);
    let mut config = workspace.config(1, BatchStrategy::Single);
    fs::write(workspace.root.join("blocker"), b"").unwrap();
    config.output = workspace.root.join("blocker/hits.tsv");
    let runner = Runner::new(config, FakeBlast::default());

    let aborted = runner.run(&NullProgress).unwrap_err();
    assert_matches!(aborted.source, AlignError::OutputWrite(_));
    assert_eq!(aborted.summary.units_completed, 0);
}

#[test]
fn cancelled_runner_dispatches_nothing() {
    let workspace = Workspace::new(&["A1", "A2"]);
    let runner = Runner::new(workspace.config(1, BatchStrategy::Single), FakeBlast::default());
    runner.cancel_token().cancel();

    let summary = runner.run(&NullProgress).unwrap();
    assert_eq!(summary.units_cancelled, 2);
    assert_eq!(summary.units_attempted, 0);
    assert_eq!(workspace.rows(Delimiter::Tab).1.len(), 0);
}

struct CountingSink {
    units: AtomicUsize,
}

impl ProgressSink for CountingSink {
    fn event(&self, event: ProgressEvent) {
        if event.progress.is_some() {
            self.units.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn progress_reports_every_unit() {
    let workspace = Workspace::new(&["A1", "A2", "A3"]);
    let runner = Runner::new(
        workspace.config(2, BatchStrategy::Single),
        FakeBlast::with_broken(&["A3"]),
    );
    let sink = CountingSink {
        units: AtomicUsize::new(0),
    };
    runner.run(&sink).unwrap();
    assert_eq!(sink.units.load(Ordering::SeqCst), 3);
}

#[test]
fn malformed_accession_is_reported_not_fatal() {
    let workspace = Workspace::new(&["A1", "A2 x", "A3"]);
    let runner = Runner::new(workspace.config(2, BatchStrategy::Single), FakeBlast::default());

    let summary = runner.run(&NullProgress).unwrap();
    assert_eq!(summary.accessions, 2);
    assert_eq!(summary.units_completed, 2);
    assert_eq!(summary.rejected_accessions, vec!["A2 x"]);

    let (_, rows) = workspace.rows(Delimiter::Tab);
    let queries: HashSet<&str> = rows.iter().map(|row| row[2].as_str()).collect();
    assert_eq!(queries, HashSet::from(["A1", "A3"]));
}

#[test]
fn interrupt_mid_run_stops_dispatch_and_cleans_up() {
    let workspace = Workspace::new(&["A1", "A2", "A3", "A4", "A5", "A6"]);
    let token = CancelToken::new();
    let tools = FakeBlast {
        interrupt_at: Some(("A2".to_string(), token.clone())),
        ..FakeBlast::default()
    };
    let runner = Runner::new(workspace.config(1, BatchStrategy::Single), tools)
        .with_cancel_token(token);

    let summary = runner.run(&NullProgress).unwrap();
    assert!(summary.interrupted);
    assert!(!summary.cancelled);
    assert!(summary.units_cancelled > 0);
    assert_eq!(summary.units_completed + summary.units_cancelled, 6);
    assert_eq!(summary.units_attempted, summary.units_completed);

    let (_, rows) = workspace.rows(Delimiter::Tab);
    assert_eq!(rows.len(), summary.units_completed * 2);
    let leftovers = fs::read_dir(&workspace.root)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("kira-ab-scratch"))
        .count();
    assert_eq!(leftovers, 0);
}
