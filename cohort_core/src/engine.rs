//! External generation engine.
//!
//! The engine is an opaque program that reads module files and writes one
//! patient record per file under `<base>/fhir`. [`GenerationEngine`] is the
//! seam the orchestrator drives; [`SubprocessEngine`] runs the real one.

use crate::config::EngineConfig;
use crate::{Error, Gender, Result};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lines of engine output kept in a failure diagnostic
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Directory the engine creates under its output base for patient records
pub const RECORDS_SUBDIR: &str = "fhir";

/// Engine flag naming the output base directory
pub const OUTPUT_BASE_FLAG: &str = "--exporter.baseDirectory";

/// How long output readers may keep draining after the engine exits.
/// Grandchildren can hold the pipes open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Cloneable cancellation flag shared between a caller and a running job
#[derive(Clone, Debug, Default)]
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

/// Patients simulated so far out of the requested population
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

/// Callback receiving [`Progress`] while the engine runs. Called from
/// output reader threads.
#[derive(Clone)]
pub struct ProgressHook(Arc<dyn Fn(Progress) + Send + Sync>);

impl ProgressHook {
    pub fn new(f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn report(&self, progress: Progress) {
        (self.0)(progress)
    }
}

impl fmt::Debug for ProgressHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressHook")
    }
}

/// Inputs of a single engine invocation
#[derive(Clone, Debug)]
pub struct EngineParams {
    pub count: u32,
    pub seed: Option<u64>,
    pub gender: Option<Gender>,
    pub modules_dir: PathBuf,
    /// Where patient records land; must be `<base>/fhir` for the subprocess engine
    pub output_dir: PathBuf,
    pub age_range: Option<(u32, u32)>,
    pub only_alive: bool,
    pub progress: Option<ProgressHook>,
}

/// Result of an engine invocation that exited successfully
#[derive(Clone, Debug, Default)]
pub struct EngineOutcome {
    pub exit_code: Option<i32>,
    pub log: Vec<String>,
    /// Population size announced by the engine, if it printed one
    pub reported_records: Option<u64>,
}

pub trait GenerationEngine: Send + Sync {
    /// Check that the engine can run with `params`. Called before any module
    /// is calibrated.
    fn preflight(&self, _params: &EngineParams) -> Result<()> {
        Ok(())
    }

    /// Run the engine to completion, honouring `cancel`
    fn generate(&self, params: &EngineParams, cancel: &CancelToken) -> Result<EngineOutcome>;

    fn name(&self) -> &str;
}

/// Runs the engine as a child process
#[derive(Clone, Debug)]
pub struct SubprocessEngine {
    program: String,
    args: Vec<String>,
    extra_args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl SubprocessEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            extra_args: Vec::new(),
            working_dir: None,
            timeout: None,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            extra_args: config.extra_args.clone(),
            working_dir: config.working_dir.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Arguments passed to the program, in order
    pub fn command_line(&self, params: &EngineParams) -> Vec<String> {
        let mut line = self.args.clone();
        line.push("-p".into());
        line.push(params.count.to_string());
        if let Some(gender) = params.gender {
            line.push("-g".into());
            line.push(gender.as_flag().into());
        }
        if let Some(seed) = params.seed {
            line.push("-s".into());
            line.push(seed.to_string());
        }
        if let Some((min, max)) = params.age_range {
            line.push("-a".into());
            line.push(format!("{}-{}", min, max));
        }
        line.push("-d".into());
        line.push(params.modules_dir.display().to_string());
        line.push(format!(
            "{}={}",
            OUTPUT_BASE_FLAG,
            output_base(&params.output_dir).display()
        ));
        line.extend(self.extra_args.iter().cloned());
        if params.only_alive {
            line.push("--generate.only_alive_patients=true".into());
        }
        line
    }

    /// `path` as the child sees it: relative paths are taken from the
    /// working directory
    fn in_working_dir(&self, path: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn program_exists(&self) -> bool {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            return self.in_working_dir(program).is_file();
        }
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    }

    fn spawn(&self, params: &EngineParams) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(self.command_line(params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("JAVA_TOOL_OPTIONS", "-Dfile.encoding=UTF-8");
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        // Own process group: a terminal Ctrl-C reaches us, and we stop the engine
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command.spawn().map_err(|e| Error::Subprocess {
            exit_code: None,
            diagnostic: format!("failed to start '{}': {}", self.program, e),
        })
    }

    /// Kill a running child and reap it. Reader threads are left detached
    /// since grandchildren may still hold the pipes open.
    fn terminate(&self, child: &mut Child) {
        if let Err(e) = child.kill() {
            tracing::warn!("Failed to kill engine process {}: {}", child.id(), e);
        }
        if let Err(e) = child.wait() {
            tracing::warn!("Failed to reap engine process {}: {}", child.id(), e);
        }
    }
}

impl GenerationEngine for SubprocessEngine {
    fn preflight(&self, params: &EngineParams) -> Result<()> {
        let mut problems = Vec::new();

        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                problems.push(format!("working directory {:?} does not exist", dir));
            }
        }
        if !self.program_exists() {
            problems.push(format!("program '{}' not found", self.program));
        }
        for pair in self.args.windows(2) {
            if pair[0] == "-jar" {
                let jar = self.in_working_dir(Path::new(&pair[1]));
                if !jar.is_file() {
                    problems.push(format!("jar {:?} not found", jar));
                }
            }
        }
        if !params.modules_dir.is_dir() {
            problems.push(format!(
                "modules directory {:?} does not exist",
                params.modules_dir
            ));
        }
        if params.output_dir.file_name().and_then(|n| n.to_str()) != Some(RECORDS_SUBDIR) {
            problems.push(format!(
                "output directory {:?} must end in '{}', where the engine writes records",
                params.output_dir, RECORDS_SUBDIR
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::EngineUnavailable(problems.join("; ")))
        }
    }

    fn generate(&self, params: &EngineParams, cancel: &CancelToken) -> Result<EngineOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tracing::info!(
            "Starting engine: {} {}",
            self.program,
            self.command_line(params).join(" ")
        );
        let mut child = self.spawn(params)?;
        let log = Arc::new(Mutex::new(Vec::new()));
        let total = u64::from(params.count);
        let readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|out| drain(out, Arc::clone(&log), params.progress.clone(), total)),
            child
                .stderr
                .take()
                .map(|err| drain(err, Arc::clone(&log), None, total)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let started = Instant::now();
        let status: ExitStatus = loop {
            if cancel.is_cancelled() {
                tracing::warn!("Cancelling engine process {}", child.id());
                self.terminate(&mut child);
                return Err(Error::Cancelled);
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    tracing::warn!(
                        "Engine process {} exceeded {:?}, killing it",
                        child.id(),
                        timeout
                    );
                    self.terminate(&mut child);
                    return Err(Error::Timeout { after: timeout });
                }
            }

            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(self.poll_interval),
            }
        };

        finish_readers(readers, READER_GRACE);
        let log = take_log(&log);

        if !status.success() {
            return Err(Error::Subprocess {
                exit_code: status.code(),
                diagnostic: log_tail(&log),
            });
        }

        let reported_records = log.iter().filter_map(|line| parse_records(line)).last();
        tracing::info!(
            "Engine finished in {:.1}s ({} output lines)",
            started.elapsed().as_secs_f64(),
            log.len()
        );
        Ok(EngineOutcome {
            exit_code: status.code(),
            log,
            reported_records,
        })
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Base directory handed to the engine for `output_dir`
pub fn output_base(output_dir: &Path) -> &Path {
    match (output_dir.file_name(), output_dir.parent()) {
        (Some(name), Some(parent)) if name == RECORDS_SUBDIR => parent,
        _ => output_dir,
    }
}

fn drain<R: Read + Send + 'static>(
    stream: R,
    log: Arc<Mutex<Vec<String>>>,
    progress: Option<ProgressHook>,
    total: u64,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            tracing::debug!(target: "engine", "{}", line);
            if let (Some(hook), Some(current)) = (&progress, parse_progress(&line)) {
                hook.report(Progress { current, total });
            }
            if let Ok(mut log) = log.lock() {
                log.push(line);
            }
        }
    })
}

/// Join readers that finish within `grace`; detach the rest
fn finish_readers(readers: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    while readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    for reader in readers {
        if reader.is_finished() {
            if reader.join().is_err() {
                tracing::warn!("Engine output reader panicked");
            }
        } else {
            tracing::debug!("Engine output still open after exit, detaching reader");
        }
    }
}

fn take_log(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    match log.lock() {
        Ok(mut lines) => std::mem::take(&mut *lines),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

fn log_tail(log: &[String]) -> String {
    let start = log.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    log[start..].join("\n")
}

fn leading_number(text: &str) -> Option<u64> {
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Population size from a `Records: N` summary line
fn parse_records(line: &str) -> Option<u64> {
    let rest = &line[line.find("Records:")? + "Records:".len()..];
    let rest = rest.trim_start();
    leading_number(rest.strip_prefix("total=").unwrap_or(rest))
}

/// Patients finished so far, from a per-patient line (`12 -- Jane Doe ...`)
/// or a `Running N` status line
fn parse_progress(line: &str) -> Option<u64> {
    let trimmed = line.trim_start();
    if let Some((head, _)) = trimmed.split_once(" -- ") {
        if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()) {
            return head.parse().ok();
        }
    }
    let rest = &trimmed[trimmed.find("Running")? + "Running".len()..];
    let start = rest.find(|c: char| c.is_ascii_digit())?;
    leading_number(&rest[start..])
}
