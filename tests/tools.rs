#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_align_batch::collection::CollectionSource;
use kira_align_batch::config::RunConfig;
use kira_align_batch::dispatch::Stage;
use kira_align_batch::domain::{AccessionId, BatchStrategy, Delimiter, OrderPolicy};
use kira_align_batch::hits::FIELD_COUNT;
use kira_align_batch::relation::read_relation;
use kira_align_batch::run::{NullProgress, Runner};
use kira_align_batch::tools::{
    AlignRequest, FetchRequest, QueryInput, SequenceTools, SystemBlastTools, ToolFailure,
    ToolKind, run_tool,
};

const FAKE_BLASTDBCMD: &str = r#"#!/bin/sh
entry=""
while [ $# -gt 0 ]; do
  case "$1" in
    -entry) entry="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$entry" in
  MISSING*) echo "Error: [blastdbcmd] Entry not found: $entry" >&2; exit 1 ;;
  EMPTY*) exit 0 ;;
esac
printf '>%s\nACGTACGTTGCA\n' "$entry"
"#;

const FAKE_BLASTN: &str = r#"#!/bin/sh
query=""
while [ $# -gt 0 ]; do
  case "$1" in
    -query) query="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if [ -n "$query" ]; then exec < "$query"; fi
awk '/^>/ {
  id = substr($1, 2)
  line = ""
  for (i = 1; i <= 50; i++) {
    v = "0"
    if (i == 1 || i == 3 || i == 4) v = id
    if (i == 35) v = "10"
    if (i == 49) v = id " Aspergillus sp., ITS region"
    line = line (i > 1 ? "\t" : "") v
  }
  print line
}'
"#;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Bench {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
    tools: SystemBlastTools,
}

impl Bench {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let fetch = script(root.as_std_path(), "blastdbcmd", FAKE_BLASTDBCMD);
        let align = script(root.as_std_path(), "blastn", FAKE_BLASTN);
        fs::create_dir_all(root.join("db")).unwrap();
        fs::write(root.join("db/ITS_RefSeq_Fungi.nsq"), b"").unwrap();
        let tools =
            SystemBlastTools::with_paths(Some(fetch), Some(align), Some(Duration::from_secs(30)));
        Self {
            _temp: temp,
            root,
            tools,
        }
    }

    fn collection(&self) -> PathBuf {
        self.root.join("db/ITS_RefSeq_Fungi").into_std_path_buf()
    }

    fn config(&self, accessions: &[&str]) -> RunConfig {
        fs::write(self.root.join("ids.txt"), accessions.join("\n")).unwrap();
        let mut config = RunConfig::new(
            CollectionSource::Prefix(self.collection()),
            self.root.join("ids.txt"),
        );
        config.workers = 2;
        config.output = self.root.join("out/hits.tsv");
        config.scratch_dir = Some(self.root.clone());
        config
    }
}

#[test]
fn fetch_reports_non_zero_exit_as_output() {
    let bench = Bench::new();
    let id: AccessionId = "MISSING_1".parse().unwrap();
    let output = bench
        .tools
        .fetch(&bench.collection(), &FetchRequest::fasta(&id), None)
        .unwrap();
    assert_eq!(output.exit_code, 1);
    assert!(output.stderr.contains("Entry not found"));
    assert_matches!(
        output.require_success(ToolKind::Fetch),
        Err(ToolFailure::NonZeroExit { code: 1, .. })
    );
}

#[test]
fn align_reads_the_query_from_stdin() {
    let bench = Bench::new();
    let request = AlignRequest {
        query: QueryInput::Bytes(b">NR_111.1\nACGT\n>NR_222.1\nTTGA\n"),
        max_target_seqs: 10,
    };
    let output = bench.tools.align(&bench.collection(), &request, None).unwrap();
    let text = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1].split('\t').count(), FIELD_COUNT);
    assert!(lines[1].starts_with("NR_222.1\t"));
}

#[test]
fn slow_tool_is_killed_at_the_deadline() {
    let temp = tempfile::tempdir().unwrap();
    let slow = script(temp.path(), "slow", "#!/bin/sh\nexec sleep 30\n");
    let started = Instant::now();
    let result = run_tool(
        ToolKind::Align,
        &slow,
        &[],
        None,
        Some(Duration::from_millis(200)),
        None,
    );
    assert_matches!(result, Err(ToolFailure::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn missing_configured_path_falls_back_to_path_lookup() {
    let tools = SystemBlastTools::with_paths(
        Some(PathBuf::from("/nonexistent/blastdbcmd")),
        Some(PathBuf::from("/nonexistent/blastn")),
        None,
    );
    let info = tools.tool_info();
    assert_ne!(info.blastdbcmd.as_deref(), Some("/nonexistent/blastdbcmd"));
    assert_ne!(info.blastn.as_deref(), Some("/nonexistent/blastn"));
}

#[test]
fn full_run_with_process_tools() {
    let bench = Bench::new();
    let config = bench.config(&["NR_1.1", "MISSING_2", "EMPTY_3", "NR_4.1"]);
    let runner = Runner::new(config, bench.tools.clone());

    let summary = runner.run(&NullProgress).unwrap();
    assert_eq!(summary.units_completed, 2);
    assert_eq!(summary.units_failed, 1);
    assert_eq!(summary.units_skipped, 1);
    assert_eq!(summary.missing_accessions, vec!["EMPTY_3"]);
    assert_eq!(summary.failures[0].stage, Stage::Fetch);
    assert!(summary.failures[0].diagnostic.contains("Entry not found"));

    let (header, rows) =
        read_relation(bench.root.join("out/hits.tsv").as_std_path(), Delimiter::Tab).unwrap();
    assert_eq!(header[0], "query_sequence_id");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][48].split(", ").count(), 2);
}

#[test]
fn batched_run_keeps_input_order() {
    let bench = Bench::new();
    let mut config = bench.config(&["B1", "B2", "MISSING_3", "B4", "B5"]);
    config.strategy = BatchStrategy::Batch(2);
    config.order = OrderPolicy::Input;
    let runner = Runner::new(config, bench.tools.clone());

    let summary = runner.run(&NullProgress).unwrap();
    assert_eq!(summary.units_total, 3);
    assert_eq!(summary.units_completed, 3);
    assert_eq!(summary.missing_accessions, vec!["MISSING_3"]);

    let (_, rows) =
        read_relation(bench.root.join("out/hits.tsv").as_std_path(), Delimiter::Tab).unwrap();
    let queries: Vec<&str> = rows.iter().map(|row| row[2].as_str()).collect();
    assert_eq!(queries, vec!["B1", "B2", "B4", "B5"]);
    let leftovers = fs::read_dir(&bench.root)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("kira-ab-scratch"))
        .count();
    assert_eq!(leftovers, 0);
}
