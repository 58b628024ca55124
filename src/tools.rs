use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::dispatch::CancelToken;
use crate::domain::AccessionId;
use crate::error::AlignError;
use crate::hits;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Fetch,
    Align,
}

impl ToolKind {
    pub fn program_name(self) -> &'static str {
        match self {
            ToolKind::Fetch => "blastdbcmd",
            ToolKind::Align => "blastn",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program_name())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum EntrySelector<'a> {
    One(&'a AccessionId),
    Many(&'a [AccessionId]),
    All,
}

impl EntrySelector<'_> {
    fn entry_argument(&self) -> String {
        match self {
            EntrySelector::One(id) => id.as_str().to_string(),
            EntrySelector::Many(ids) => ids
                .iter()
                .map(AccessionId::as_str)
                .collect::<Vec<_>>()
                .join(","),
            EntrySelector::All => "all".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub selector: EntrySelector<'a>,
    pub template: Option<&'a str>,
}

impl<'a> FetchRequest<'a> {
    pub fn fasta(id: &'a AccessionId) -> Self {
        Self {
            selector: EntrySelector::One(id),
            template: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum QueryInput<'a> {
    Bytes(&'a [u8]),
    File(&'a Path),
}

#[derive(Debug, Clone, Copy)]
pub struct AlignRequest<'a> {
    pub query: QueryInput<'a>,
    pub max_target_seqs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl ToolOutput {
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn has_output(&self) -> bool {
        self.stdout.iter().any(|byte| !byte.is_ascii_whitespace())
    }

    pub fn require_success(self, tool: ToolKind) -> Result<Self, ToolFailure> {
        if self.is_success() {
            return Ok(self);
        }
        Err(ToolFailure::NonZeroExit {
            tool,
            code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        })
    }

    pub fn require_output(self, tool: ToolKind) -> Result<Self, ToolFailure> {
        let output = self.require_success(tool)?;
        if !output.has_output() {
            return Err(ToolFailure::EmptyOutput { tool });
        }
        Ok(output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolFailure {
    #[error("{tool} not found")]
    NotFound { tool: ToolKind },

    #[error("{tool} could not be started: {message}")]
    Spawn { tool: ToolKind, message: String },

    #[error("{tool} exited with status {code}: {stderr}")]
    NonZeroExit {
        tool: ToolKind,
        code: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {}s", .after.as_secs())]
    Timeout { tool: ToolKind, after: Duration },

    #[error("{tool} returned no output")]
    EmptyOutput { tool: ToolKind },

    #[error("{tool} was stopped by cancellation")]
    Interrupted { tool: ToolKind },
}

impl ToolFailure {
    pub fn tool(&self) -> ToolKind {
        match self {
            ToolFailure::NotFound { tool }
            | ToolFailure::Spawn { tool, .. }
            | ToolFailure::NonZeroExit { tool, .. }
            | ToolFailure::Timeout { tool, .. }
            | ToolFailure::EmptyOutput { tool }
            | ToolFailure::Interrupted { tool } => *tool,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub blastdbcmd: Option<String>,
    pub blastdbcmd_version: Option<String>,
    pub blastn: Option<String>,
    pub blastn_version: Option<String>,
}

// `interrupt` is only passed when in-flight calls may be abandoned.
pub trait SequenceTools: Send + Sync {
    fn fetch(
        &self,
        collection: &Path,
        request: &FetchRequest<'_>,
        interrupt: Option<&CancelToken>,
    ) -> Result<ToolOutput, ToolFailure>;

    fn align(
        &self,
        collection: &Path,
        request: &AlignRequest<'_>,
        interrupt: Option<&CancelToken>,
    ) -> Result<ToolOutput, ToolFailure>;

    fn tool_info(&self) -> ToolInfo;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    Ready,
    Missing { message: String },
}

#[derive(Debug, Clone)]
pub struct SystemBlastTools {
    blastdbcmd: Option<PathBuf>,
    blastn: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl SystemBlastTools {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            blastdbcmd: find_in_path(ToolKind::Fetch.program_name()),
            blastn: find_in_path(ToolKind::Align.program_name()),
            timeout,
        }
    }

    pub fn with_paths(
        blastdbcmd: Option<PathBuf>,
        blastn: Option<PathBuf>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            blastdbcmd: blastdbcmd
                .filter(|path| path.exists())
                .or_else(|| find_in_path(ToolKind::Fetch.program_name())),
            blastn: blastn
                .filter(|path| path.exists())
                .or_else(|| find_in_path(ToolKind::Align.program_name())),
            timeout,
        }
    }

    pub fn tool_status(&self) -> ToolStatus {
        let missing: Vec<&str> = [
            (ToolKind::Fetch, &self.blastdbcmd),
            (ToolKind::Align, &self.blastn),
        ]
        .iter()
        .filter(|(_, path)| path.is_none())
        .map(|(tool, _)| tool.program_name())
        .collect();
        if missing.is_empty() {
            ToolStatus::Ready
        } else {
            ToolStatus::Missing {
                message: format!("missing {} (BLAST+)", missing.join(", ")),
            }
        }
    }

    pub fn require_ready(&self) -> Result<(), AlignError> {
        match self.tool_status() {
            ToolStatus::Ready => Ok(()),
            ToolStatus::Missing { message } => Err(AlignError::MissingTool(message)),
        }
    }

    fn program(&self, tool: ToolKind) -> Result<&Path, ToolFailure> {
        let path = match tool {
            ToolKind::Fetch => &self.blastdbcmd,
            ToolKind::Align => &self.blastn,
        };
        path.as_deref().ok_or(ToolFailure::NotFound { tool })
    }
}

impl SequenceTools for SystemBlastTools {
    fn fetch(
        &self,
        collection: &Path,
        request: &FetchRequest<'_>,
        interrupt: Option<&CancelToken>,
    ) -> Result<ToolOutput, ToolFailure> {
        let program = self.program(ToolKind::Fetch)?;
        let args = fetch_args(collection, request);
        run_tool(ToolKind::Fetch, program, &args, None, self.timeout, interrupt)
    }

    fn align(
        &self,
        collection: &Path,
        request: &AlignRequest<'_>,
        interrupt: Option<&CancelToken>,
    ) -> Result<ToolOutput, ToolFailure> {
        let program = self.program(ToolKind::Align)?;
        let args = align_args(collection, request);
        let input = match request.query {
            QueryInput::Bytes(bytes) => Some(bytes),
            QueryInput::File(_) => None,
        };
        run_tool(ToolKind::Align, program, &args, input, self.timeout, interrupt)
    }

    fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            blastdbcmd: self.blastdbcmd.as_ref().map(|p| p.display().to_string()),
            blastdbcmd_version: self
                .blastdbcmd
                .as_ref()
                .and_then(|path| tool_version(path, &["-version"])),
            blastn: self.blastn.as_ref().map(|p| p.display().to_string()),
            blastn_version: self
                .blastn
                .as_ref()
                .and_then(|path| tool_version(path, &["-version"])),
        }
    }
}

pub fn fetch_args(collection: &Path, request: &FetchRequest<'_>) -> Vec<String> {
    let mut args = vec![
        "-db".to_string(),
        collection.to_string_lossy().to_string(),
        "-entry".to_string(),
        request.selector.entry_argument(),
    ];
    if let Some(template) = request.template {
        args.push("-outfmt".to_string());
        args.push(template.to_string());
    }
    args
}

pub fn align_args(collection: &Path, request: &AlignRequest<'_>) -> Vec<String> {
    let mut args = vec!["-db".to_string(), collection.to_string_lossy().to_string()];
    if let QueryInput::File(path) = request.query {
        args.push("-query".to_string());
        args.push(path.to_string_lossy().to_string());
    }
    args.push("-outfmt".to_string());
    args.push(hits::outfmt_argument());
    args.push("-max_target_seqs".to_string());
    args.push(request.max_target_seqs.to_string());
    args
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Interrupted,
    Failed(String),
}

// Pipes are drained on helper threads so a chatty child never blocks on a full pipe.
pub fn run_tool(
    tool: ToolKind,
    program: &Path,
    args: &[String],
    input: Option<&[u8]>,
    timeout: Option<Duration>,
    interrupt: Option<&CancelToken>,
) -> Result<ToolOutput, ToolFailure> {
    debug!(tool = %tool, command = %format!("{} {}", program.display(), args.join(" ")), "spawning");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => ToolFailure::NotFound { tool },
        _ => ToolFailure::Spawn {
            tool,
            message: err.to_string(),
        },
    })?;

    let stdin = child.stdin.take();
    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(ToolFailure::Spawn {
            tool,
            message: "output pipes were not captured".to_string(),
        });
    };

    let (outcome, stdout, stderr) = thread::scope(|scope| {
        if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
            // A child that exits early closes its end; the broken pipe is expected.
            scope.spawn(move || {
                let _ = pipe.write_all(bytes);
            });
        }
        let out_reader = scope.spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        });
        let err_reader = scope.spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        });
        let outcome = wait_bounded(&mut child, timeout, interrupt);
        (
            outcome,
            out_reader.join().unwrap_or_default(),
            err_reader.join().unwrap_or_default(),
        )
    });

    match outcome {
        WaitOutcome::Exited(status) => Ok(ToolOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            // Killed by a signal: no code, report as -1.
            exit_code: status.code().unwrap_or(-1),
        }),
        WaitOutcome::TimedOut => Err(ToolFailure::Timeout {
            tool,
            after: timeout.unwrap_or_default(),
        }),
        WaitOutcome::Interrupted => Err(ToolFailure::Interrupted { tool }),
        WaitOutcome::Failed(message) => Err(ToolFailure::Spawn { tool, message }),
    }
}

fn wait_bounded(
    child: &mut Child,
    timeout: Option<Duration>,
    interrupt: Option<&CancelToken>,
) -> WaitOutcome {
    let deadline = timeout.map(|limit| Instant::now() + limit);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return WaitOutcome::Exited(status),
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return WaitOutcome::Failed(err.to_string());
            }
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let _ = child.kill();
            let _ = child.wait();
            return WaitOutcome::TimedOut;
        }
        if interrupt.is_some_and(CancelToken::is_cancelled) {
            let _ = child.kill();
            let _ = child.wait();
            return WaitOutcome::Interrupted;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let candidates = [name.to_string(), format!("{name}.exe")];
    std::env::split_paths(&std::env::var_os("PATH")?)
        .flat_map(|dir| candidates.iter().map(move |file| dir.join(file)))
        .find(|candidate| candidate.is_file())
}

fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next()?.trim().to_string();
    if first.is_empty() { None } else { Some(first) }
}
