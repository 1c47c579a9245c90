use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TranscodeConfig;
use crate::error::{FfpilotError, Result};
use super::command::{self, CommandPlan};
use super::events::{
    EventBus, EventKind, ListenerId, ProgressEvent, RunOutput, TranscodeEvent, WritingInfo,
};
use super::parser::{self, FinalSizes, ParseState, StatusLine};
use super::sink::{Fanout, SinkWriter};
use super::spec::{has_sequence_placeholder, InputSource, InputSpec, OutputSpec, OutputTarget};
use super::watchdog::StallWatchdog;

/// Termination signals deliverable to the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
    Kill,
}

/// Lifecycle phases. `Stopped`/`Failed` are absorbed into `Idle` plus the
/// retained error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Draining,
}

/// Primary output descriptor returned by `done()`.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub file: Option<String>,
    pub sizes: Option<FinalSizes>,
}

/// Non-throwing settlement report returned by `exit()`.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub error: Option<String>,
}

enum Control {
    Signal(StopSignal),
}

/// Drives one external transcoding process at a time: builds the argument
/// vector, spawns, feeds status text through the parser, fans events out to
/// subscribers, and enforces the stall timeout.
pub struct Transcoder {
    config: TranscodeConfig,
    initial_config: TranscodeConfig,
    inputs: Vec<InputSpec>,
    outputs: Vec<OutputSpec>,
    stdin_feed: Option<Box<dyn AsyncRead + Send + Unpin>>,
    sinks: Vec<SinkWriter>,
    last_args: Vec<String>,
    shared: Arc<Shared>,
    supervisor: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<RunState>,
    phase: watch::Sender<Phase>,
    events: Arc<EventBus>,
}

impl Shared {
    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }
}

#[derive(Default)]
struct RunState {
    control: Option<mpsc::UnboundedSender<Control>>,
    log: String,
    parse: ParseState,
    current_file: Option<String>,
    sizes: Option<FinalSizes>,
    results: Vec<RunOutput>,
    error: Option<FfpilotError>,
    error_emitted: bool,
    exit_code: Option<i32>,
    watchdog: Option<StallWatchdog>,
}

/// Facts about the output collection a run needs after spawn, snapshotted so
/// the pump tasks never reach back into the (mutable) configuration.
struct RunShape {
    tee_active: bool,
    output_count: usize,
    destinations: Vec<Option<String>>,
}

impl RunShape {
    fn resolve(plan: &CommandPlan, outputs: &[OutputSpec]) -> Self {
        let destinations = outputs
            .iter()
            .map(|output| match &output.target {
                OutputTarget::Path(path) if !has_sequence_placeholder(path) => Some(path.clone()),
                _ => None,
            })
            .collect();
        Self {
            tee_active: plan.tee_active,
            output_count: outputs.len(),
            destinations,
        }
    }

    fn initial_file(&self) -> Option<String> {
        self.destinations.iter().flatten().next().cloned()
    }

    fn results(&self, current_file: &Option<String>, sizes: &Option<FinalSizes>) -> Vec<RunOutput> {
        if self.tee_active {
            (0..self.output_count)
                .map(|index| RunOutput {
                    file: self.destinations[index].clone(),
                    sizes: sizes.clone(),
                    output_index: index,
                })
                .collect()
        } else {
            vec![RunOutput {
                file: current_file.clone(),
                sizes: sizes.clone(),
                output_index: 0,
            }]
        }
    }
}

impl Transcoder {
    pub fn new(config: TranscodeConfig) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            initial_config: config.clone(),
            config,
            inputs: Vec::new(),
            outputs: Vec::new(),
            stdin_feed: None,
            sinks: Vec::new(),
            last_args: Vec::new(),
            shared: Arc::new(Shared {
                state: Mutex::new(RunState::default()),
                phase,
                events: Arc::new(EventBus::new()),
            }),
            supervisor: None,
        }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    /// Configuration is mutable between runs only; changing it while a
    /// subprocess is attached affects the next run, not the current one.
    pub fn config_mut(&mut self) -> &mut TranscodeConfig {
        &mut self.config
    }

    /// Replace the inputs with a single spec. Refuses when several inputs
    /// are already configured; call `clear_inputs` first.
    pub fn set_input(&mut self, input: InputSpec) -> Result<&mut Self> {
        if self.inputs.len() > 1 {
            return Err(FfpilotError::Config(
                "multiple inputs are configured; clear_inputs() before set_input()".to_string(),
            ));
        }
        self.inputs = vec![input];
        Ok(self)
    }

    pub fn set_inputs(&mut self, inputs: Vec<InputSpec>) -> &mut Self {
        self.inputs = inputs;
        self
    }

    pub fn clear_inputs(&mut self) -> &mut Self {
        self.inputs.clear();
        self
    }

    /// Replace the outputs with a single spec. Refuses when several outputs
    /// are already configured; call `clear_outputs` first.
    pub fn set_output(&mut self, output: OutputSpec) -> Result<&mut Self> {
        if self.outputs.len() > 1 {
            return Err(FfpilotError::Config(
                "multiple outputs are configured; clear_outputs() before set_output()".to_string(),
            ));
        }
        self.outputs = vec![output];
        Ok(self)
    }

    pub fn set_outputs(&mut self, outputs: Vec<OutputSpec>) -> &mut Self {
        self.outputs = outputs;
        self
    }

    pub fn clear_outputs(&mut self) -> &mut Self {
        self.outputs.clear();
        self.sinks.clear();
        self
    }

    /// Shorthand: make the writer the only destination.
    pub fn pipe(&mut self, writer: SinkWriter) -> &mut Self {
        self.outputs = vec![OutputSpec::pipe()];
        self.sinks = vec![writer];
        self
    }

    /// Attach an additional sink to the pipe-backed output, appending that
    /// output if none exists yet.
    pub fn add_sink(&mut self, writer: SinkWriter) -> &mut Self {
        if !self.outputs.iter().any(OutputSpec::is_pipe) {
            self.outputs.push(OutputSpec::pipe());
        }
        self.sinks.push(writer);
        self
    }

    /// Pass-through handle: returns the read side of an in-memory pipe that
    /// receives the subprocess's media bytes alongside any other sinks.
    pub fn tap(&mut self) -> tokio::io::DuplexStream {
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.add_sink(Box::new(near));
        far
    }

    /// Attach the reader backing a `Stdin` input. Consumed by the next run.
    pub fn feed_stdin<R>(&mut self, reader: R) -> &mut Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.stdin_feed = Some(Box::new(reader));
        self
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&TranscodeEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.phase() != Phase::Idle
    }

    /// The most recently built argument vector.
    pub fn last_args(&self) -> &[String] {
        &self.last_args
    }

    /// The file currently being written, as tracked from writing notices.
    pub fn current_file(&self) -> Option<String> {
        self.shared.state.lock().unwrap().current_file.clone()
    }

    /// Build the argument vector, spawn, and supervise. Idempotent while a
    /// run is active. Configuration and validation problems surface here;
    /// anything after the spawn attempt travels the event path and is
    /// re-raised by `done()`.
    pub async fn run(&mut self) -> Result<()> {
        if self.is_running() {
            debug!("run() requested while already running");
            return Ok(());
        }

        let plan = command::plan(&self.config, &self.inputs, &self.outputs)?;
        let needs_stdin = self
            .inputs
            .iter()
            .any(|input| matches!(input.source, InputSource::Stdin));
        if needs_stdin && self.stdin_feed.is_none() {
            return Err(FfpilotError::Stream(
                "a stdin input is configured but no feeder is attached".to_string(),
            ));
        }
        let pipes_stdout = self.outputs.iter().any(OutputSpec::is_pipe);

        self.last_args = plan.args.clone();
        let shape = Arc::new(RunShape::resolve(&plan, &self.outputs));
        {
            let mut state = self.shared.state.lock().unwrap();
            *state = RunState::default();
            state.current_file = shape.initial_file();
        }

        self.shared.set_phase(Phase::Starting);
        self.shared.events.emit(&TranscodeEvent::Start {
            args: plan.args.clone(),
        });

        info!(
            "Starting {} with {} input(s), {} output(s){}",
            self.config.binary_path,
            self.inputs.len(),
            self.outputs.len(),
            if shape.tee_active { ", tee" } else { "" }
        );
        debug!("Process arguments: {:?}", plan.args);

        let mut command = Command::new(&self.config.binary_path);
        command
            .args(&plan.args)
            .stdin(if needs_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if pipes_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }

        match command.spawn() {
            Ok(child) => self.attach(child, shape),
            Err(e) => {
                // The failure still travels the deferred exit path so event
                // ordering stays symmetric with real runs.
                warn!("Failed to spawn {}: {}", self.config.binary_path, e);
                {
                    let mut state = self.shared.state.lock().unwrap();
                    state.error = Some(FfpilotError::Process(format!(
                        "Failed to spawn {}: {}",
                        self.config.binary_path, e
                    )));
                }
                let shared = self.shared.clone();
                self.supervisor = Some(tokio::spawn(async move {
                    settle(&shared, None, &shape);
                }));
            }
        }
        Ok(())
    }

    fn attach(&mut self, mut child: Child, shape: Arc<RunShape>) {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state.lock().unwrap();
            state.control = Some(control_tx.clone());
            if self.config.timeout_ms > 0 {
                let shared = self.shared.clone();
                let control = control_tx.clone();
                state.watchdog = Some(StallWatchdog::spawn(
                    self.config.timeout_ms,
                    move |timeout_ms| on_stall(&shared, &control, timeout_ms),
                ));
            }
        }

        let status_pump = child.stderr.take().map(|stderr| {
            let shared = self.shared.clone();
            let shape = shape.clone();
            tokio::spawn(pump_status(stderr, shared, shape))
        });

        if let Some(stdin) = child.stdin.take() {
            if let Some(feeder) = self.stdin_feed.take() {
                tokio::spawn(feed_stdin_channel(feeder, stdin));
            }
        }

        if let Some(stdout) = child.stdout.take() {
            let fanout = Fanout::new(std::mem::take(&mut self.sinks), self.shared.events.clone());
            tokio::spawn(fanout.pump(stdout));
        }

        self.shared.set_phase(Phase::Running);

        let shared = self.shared.clone();
        self.supervisor = Some(tokio::spawn(async move {
            enum Watched {
                Exited(std::io::Result<std::process::ExitStatus>),
                Control(Option<Control>),
            }

            let status = loop {
                // The wait future borrows the child; confine it so the
                // control arm can signal between polls. `wait` is cancel
                // safe, no exit status is lost by re-creating it.
                let watched = {
                    let wait = child.wait();
                    tokio::pin!(wait);
                    tokio::select! {
                        status = &mut wait => Watched::Exited(status),
                        message = control_rx.recv() => Watched::Control(message),
                    }
                };
                match watched {
                    Watched::Exited(status) => break status,
                    Watched::Control(Some(Control::Signal(signal))) => {
                        deliver_signal(&mut child, signal);
                    }
                    Watched::Control(None) => break child.wait().await,
                }
            };

            // Let the status pump reach EOF so the accumulated log is
            // complete before the diagnostic scan.
            if let Some(pump) = status_pump {
                let _ = tokio::time::timeout(Duration::from_secs(2), pump).await;
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to collect the exit status: {}", e);
                    let mut state = shared.state.lock().unwrap();
                    if state.error.is_none() {
                        state.error = Some(FfpilotError::Process(format!(
                            "Failed to collect the exit status: {}",
                            e
                        )));
                    }
                    None
                }
            };
            settle(&shared, code, &shape);
        }));
    }

    /// Send a termination signal and await settlement. No-op while idle; the
    /// lifecycle state is cleared even when signal delivery fails.
    pub async fn stop(&mut self, signal: StopSignal) {
        if !self.is_running() {
            return;
        }
        info!("Stopping the process with {:?}", signal);
        let control = self.shared.state.lock().unwrap().control.clone();
        if let Some(control) = control {
            if control.send(Control::Signal(signal)).is_err() {
                debug!("process is already settling");
            }
        }
        self.wait_idle().await;
    }

    /// Await completion and surface the outcome. A captured error is raised
    /// exactly once; asking again reports the last summary.
    pub async fn done(&mut self) -> Result<RunSummary> {
        self.wait_idle().await;
        let mut state = self.shared.state.lock().unwrap();
        if let Some(error) = state.error.take() {
            return Err(error);
        }
        let primary = state.results.first();
        Ok(RunSummary {
            file: primary.and_then(|result| result.file.clone()),
            sizes: primary.and_then(|result| result.sizes.clone()),
        })
    }

    /// Non-throwing settlement report. Unlike `done()`, the stored error is
    /// reported but not consumed.
    pub async fn exit(&mut self) -> ExitReport {
        self.wait_idle().await;
        let state = self.shared.state.lock().unwrap();
        ExitReport {
            code: state.exit_code,
            error: state.error.as_ref().map(FfpilotError::message),
        }
    }

    /// Stop if running, then restore every field to its construction-time
    /// value.
    pub async fn reset(&mut self) {
        if self.is_running() {
            self.stop(StopSignal::Kill).await;
        }
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
        self.config = self.initial_config.clone();
        self.inputs.clear();
        self.outputs.clear();
        self.stdin_feed = None;
        self.sinks.clear();
        self.last_args.clear();
        let mut state = self.shared.state.lock().unwrap();
        *state = RunState::default();
    }

    /// First line of the tool's `-version` output.
    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.config.binary_path)
            .arg("-version")
            .output()
            .await
            .map_err(|e| {
                FfpilotError::Process(format!(
                    "Failed to execute {}: {}",
                    self.config.binary_path, e
                ))
            })?;
        if !output.status.success() {
            return Err(FfpilotError::Process(format!(
                "{} version check failed",
                self.config.binary_path
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or("unknown version").to_string())
    }

    async fn wait_idle(&self) {
        let mut phase_rx = self.shared.phase.subscribe();
        while *phase_rx.borrow_and_update() != Phase::Idle {
            if phase_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new(TranscodeConfig::default())
    }
}

#[cfg(unix)]
fn deliver_signal(child: &mut Child, signal: StopSignal) {
    use nix::sys::signal as sys;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        debug!("{:?} requested but the process has already settled", signal);
        return;
    };
    let sys_signal = match signal {
        StopSignal::Interrupt => sys::Signal::SIGINT,
        StopSignal::Terminate => sys::Signal::SIGTERM,
        StopSignal::Kill => sys::Signal::SIGKILL,
    };
    if let Err(e) = sys::kill(Pid::from_raw(pid as i32), sys_signal) {
        warn!("Failed to deliver {:?} to pid {}: {}", signal, pid, e);
    }
}

#[cfg(not(unix))]
fn deliver_signal(child: &mut Child, signal: StopSignal) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill the process for {:?}: {}", signal, e);
    }
}

fn on_stall(shared: &Shared, control: &mpsc::UnboundedSender<Control>, timeout_ms: u64) {
    let emit = {
        let mut state = shared.state.lock().unwrap();
        // A tick that waited on this lock may land after settlement, which
        // clears `control`; a settled run must not gain a timeout.
        if state.control.is_none() {
            return;
        }
        if state.error.is_none() {
            state.error = Some(FfpilotError::Timeout(timeout_ms));
        }
        let emit = !state.error_emitted && shared.events.has_listeners(EventKind::Error);
        if emit {
            state.error_emitted = true;
        }
        emit
    };
    if emit {
        shared.events.emit(&TranscodeEvent::Error {
            message: FfpilotError::Timeout(timeout_ms).message(),
        });
    }
    let _ = control.send(Control::Signal(StopSignal::Kill));
}

async fn pump_status(mut stderr: ChildStderr, shared: Arc<Shared>, shape: Arc<RunShape>) {
    // Framing happens on raw bytes; decoding waits for a complete line so a
    // multi-byte character split across reads stays intact.
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                // The tool terminates progress updates with carriage returns.
                while let Some(split) = pending.iter().position(|&b| b == b'\r' || b == b'\n') {
                    let line = String::from_utf8_lossy(&pending[..split]).into_owned();
                    pending.drain(..=split);
                    if !line.trim().is_empty() {
                        handle_status_line(&shared, &shape, &line);
                    }
                }
            }
            Err(e) => {
                debug!("status channel read ended: {}", e);
                break;
            }
        }
    }
    let tail = String::from_utf8_lossy(&pending);
    if !tail.trim().is_empty() {
        handle_status_line(&shared, &shape, tail.trim());
    }
}

fn handle_status_line(shared: &Shared, shape: &RunShape, line: &str) {
    let mut to_emit: Vec<TranscodeEvent> = Vec::new();
    {
        let mut state = shared.state.lock().unwrap();
        state.log.push_str(line);
        state.log.push('\n');

        let Some(parsed) = parser::parse_line(&mut state.parse, line) else {
            return;
        };
        match parsed {
            StatusLine::Header(header) => {
                debug!("stream header: duration {:.2}s", header.duration_seconds);
            }
            StatusLine::Progress(sample) => {
                if let Some(watchdog) = &state.watchdog {
                    watchdog.touch();
                }
                let duration = state.parse.duration_seconds;
                let percent = sample
                    .time_seconds
                    .map(|time| parser::percent(time, duration))
                    .unwrap_or(0.0);
                if shape.tee_active {
                    for index in 0..shape.output_count {
                        to_emit.push(TranscodeEvent::Progress(ProgressEvent {
                            sample: sample.clone(),
                            duration_seconds: duration,
                            percent,
                            output_index: index,
                            file: shape.destinations[index].clone(),
                        }));
                    }
                } else {
                    to_emit.push(TranscodeEvent::Progress(ProgressEvent {
                        sample,
                        duration_seconds: duration,
                        percent,
                        output_index: 0,
                        file: state.current_file.clone(),
                    }));
                }
            }
            StatusLine::Writing { file } => {
                debug!("now writing {}", file);
                if !has_sequence_placeholder(&file) && !file.starts_with("pipe:") {
                    state.current_file = Some(file.clone());
                }
                let infos = if shape.tee_active {
                    (0..shape.output_count)
                        .map(|index| WritingInfo {
                            file: shape.destinations[index].clone().unwrap_or_else(|| file.clone()),
                            output_index: index,
                        })
                        .collect()
                } else {
                    vec![WritingInfo {
                        file,
                        output_index: 0,
                    }]
                };
                to_emit.push(TranscodeEvent::Writing(infos));
            }
            StatusLine::Sizes(sizes) => {
                state.sizes = Some(sizes);
            }
        }
    }
    for event in to_emit {
        shared.events.emit(&event);
    }
}

async fn feed_stdin_channel(mut feeder: Box<dyn AsyncRead + Send + Unpin>, mut stdin: ChildStdin) {
    match tokio::io::copy(&mut feeder, &mut stdin).await {
        Ok(bytes) => debug!("fed {} bytes to the subprocess", bytes),
        Err(e) => debug!("stdin feed ended early: {}", e),
    }
    if let Err(e) = stdin.shutdown().await {
        debug!("could not close the subprocess stdin: {}", e);
    }
}

/// Two-phase completion: resolve and publish the outcome, then the terminal
/// exit notification, then go idle.
fn settle(shared: &Shared, code: Option<i32>, shape: &RunShape) {
    let (results, error_message, emit_error) = {
        let mut state = shared.state.lock().unwrap();
        state.exit_code = code;
        if state.error.is_none() && code == Some(1) {
            let diagnostic = extract_diagnostic(&state.log);
            state.error = Some(FfpilotError::Process(diagnostic));
        }
        if state.error.is_none() {
            let results = shape.results(&state.current_file, &state.sizes);
            state.results = results;
        }
        let error_message = state.error.as_ref().map(FfpilotError::message);
        let emit_error = state.error.is_some()
            && !state.error_emitted
            && shared.events.has_listeners(EventKind::Error);
        if emit_error {
            state.error_emitted = true;
        }
        if let Some(watchdog) = state.watchdog.take() {
            watchdog.cancel();
        }
        state.control = None;
        (state.results.clone(), error_message, emit_error)
    };

    info!("Process settled (code {:?})", code);
    shared.set_phase(Phase::Draining);

    match (&error_message, emit_error) {
        (None, _) => shared.events.emit(&TranscodeEvent::Done(results)),
        (Some(message), true) => shared.events.emit(&TranscodeEvent::Error {
            message: message.clone(),
        }),
        (Some(_), false) => {}
    }
    shared.events.emit(&TranscodeEvent::Exit {
        code,
        error: error_message,
    });

    shared.set_phase(Phase::Idle);
}

const DIAGNOSTIC_LIMIT: usize = 400;

/// Best-effort extraction of the last meaningful diagnostic from the
/// accumulated status text.
fn extract_diagnostic(log: &str) -> String {
    const KEYWORDS: [&str; 9] = [
        "error",
        "invalid",
        "fail",
        "could not",
        "unable to",
        "no such",
        "not found",
        "denied",
        "unrecognized",
    ];

    let lines: Vec<&str> = log
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    for index in (0..lines.len()).rev() {
        let lowered = lines[index].to_lowercase();
        if KEYWORDS.iter().any(|keyword| lowered.contains(keyword)) {
            let message = if index > 0 {
                format!("{}\n{}", lines[index - 1], lines[index])
            } else {
                lines[index].to_string()
            };
            return truncate_message(message);
        }
    }

    match lines.last() {
        Some(line) => truncate_message((*line).to_string()),
        None => "transcoding failed with exit code 1".to_string(),
    }
}

fn truncate_message(mut message: String) -> String {
    if message.len() > DIAGNOSTIC_LIMIT {
        let mut cut = DIAGNOSTIC_LIMIT;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stand-in for the real encoder: a shell script that ignores the
    /// appended argument vector and plays back a canned status transcript.
    #[cfg(unix)]
    fn scripted(dir: &tempfile::TempDir, script: &str) -> Transcoder {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("fake-encoder.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = TranscodeConfig::default();
        config.binary_path = path.to_string_lossy().into_owned();
        config.overwrite_existing = false;
        config.hide_banner = false;
        Transcoder::new(config)
    }

    fn touch(dir: &tempfile::TempDir, name: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, b"").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_diagnostic_scan_picks_the_last_keyword_line() {
        let log = "Input #0, matroska\n\
                   Press [q] to stop\n\
                   [libx264] something harmless\n\
                   x.mkv: Invalid argument\n\
                   final plain line\n";
        let message = extract_diagnostic(log);
        assert!(message.contains("Invalid argument"));
        assert!(message.contains("[libx264] something harmless"));
    }

    #[test]
    fn test_diagnostic_scan_falls_back_to_the_last_line() {
        assert_eq!(extract_diagnostic("just noise\nlast line\n"), "last line");
        assert_eq!(
            extract_diagnostic(""),
            "transcoding failed with exit code 1"
        );
    }

    #[test]
    fn test_diagnostic_is_bounded() {
        let log = format!("Error: {}\n", "x".repeat(1000));
        assert!(extract_diagnostic(&log).len() <= DIAGNOSTIC_LIMIT);
    }

    #[test]
    fn test_stall_after_settlement_is_ignored() {
        let (phase, _phase_rx) = watch::channel(Phase::Idle);
        let shared = Shared {
            state: Mutex::new(RunState::default()),
            phase,
            events: Arc::new(EventBus::new()),
        };
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        shared.events.subscribe(EventKind::Error, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let (control, mut control_rx) = mpsc::unbounded_channel();

        // Settled run: no control sender registered. A late tick leaves the
        // state untouched and sends nothing.
        on_stall(&shared, &control, 100);
        assert!(shared.state.lock().unwrap().error.is_none());
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(control_rx.try_recv().is_err());

        // Attached run: the same tick installs the timeout and asks for a
        // kill.
        shared.state.lock().unwrap().control = Some(control.clone());
        on_stall(&shared, &control, 100);
        assert!(matches!(
            shared.state.lock().unwrap().error,
            Some(FfpilotError::Timeout(100))
        ));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(matches!(
            control_rx.try_recv(),
            Ok(Control::Signal(StopSignal::Kill))
        ));
    }

    #[tokio::test]
    async fn test_stop_and_reset_are_idempotent_while_idle() {
        let mut transcoder = Transcoder::default();
        transcoder.stop(StopSignal::Kill).await;
        transcoder.stop(StopSignal::Kill).await;
        transcoder.reset().await;
        assert!(!transcoder.is_running());
        assert_eq!(transcoder.phase(), Phase::Idle);
    }

    #[test]
    fn test_set_input_refuses_over_a_configured_collection() {
        let mut transcoder = Transcoder::default();
        transcoder.set_inputs(vec![InputSpec::path("a.mp4"), InputSpec::path("b.mp4")]);
        assert!(matches!(
            transcoder.set_input(InputSpec::path("c.mp4")),
            Err(FfpilotError::Config(_))
        ));

        transcoder.clear_inputs();
        assert!(transcoder.set_input(InputSpec::path("c.mp4")).is_ok());
    }

    #[test]
    fn test_set_output_refuses_over_a_configured_collection() {
        let mut transcoder = Transcoder::default();
        transcoder.set_outputs(vec![OutputSpec::path("a.mkv"), OutputSpec::path("b.mkv")]);
        assert!(matches!(
            transcoder.set_output(OutputSpec::path("c.mkv")),
            Err(FfpilotError::Config(_))
        ));

        transcoder.clear_outputs();
        assert!(transcoder.set_output(OutputSpec::path("c.mkv")).is_ok());
    }

    #[tokio::test]
    async fn test_config_error_raises_before_any_event() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut transcoder = Transcoder::default();
        let seen = started.clone();
        transcoder.subscribe(EventKind::Start, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        transcoder
            .set_input(InputSpec::stdin())
            .unwrap()
            .set_outputs(vec![OutputSpec::pipe(), OutputSpec::path("b.mkv")]);
        let err = transcoder.run().await.unwrap_err();
        assert!(matches!(err, FfpilotError::Config(_)));
        assert!(!transcoder.is_running());
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_stdin_feeder_is_a_stream_error() {
        let mut transcoder = Transcoder::default();
        transcoder
            .set_input(InputSpec::stdin())
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();

        let err = transcoder.run().await.unwrap_err();
        assert!(matches!(err, FfpilotError::Stream(_)));
        assert!(!transcoder.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run_emits_done_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(&dir, "in.mp4");
        let output = dir.path().join("out.mkv").to_string_lossy().into_owned();

        let script = "printf '%s\\n' \
            'Duration: 00:00:10.00, start: 0.000000, bitrate: 1365 kb/s' \
            'frame=  125 fps= 25 q=28.0 size=     512kB time=00:00:05.00 bitrate= 838.9kbits/s speed=1.00x' \
            'video:400kB audio:100kB subtitle:0kB other streams:0kB global headers:0kB muxing overhead: 0.5%' 1>&2\nexit 0";
        let mut transcoder = scripted(&dir, script);
        transcoder
            .set_input(InputSpec::path(&input))
            .unwrap()
            .set_output(OutputSpec::path(&output).with_options(["-c copy"]))
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::<String>::new()));
        let exit_code = Arc::new(Mutex::new(None::<Option<i32>>));
        let percents = Arc::new(Mutex::new(Vec::<f64>::new()));

        let seen = order.clone();
        transcoder.subscribe(EventKind::Done, move |_| {
            seen.lock().unwrap().push("done".to_string());
        });
        let seen = order.clone();
        let code_slot = exit_code.clone();
        transcoder.subscribe(EventKind::Exit, move |event| {
            seen.lock().unwrap().push("exit".to_string());
            if let TranscodeEvent::Exit { code, .. } = event {
                *code_slot.lock().unwrap() = Some(*code);
            }
        });
        let seen = percents.clone();
        transcoder.subscribe(EventKind::Progress, move |event| {
            if let TranscodeEvent::Progress(progress) = event {
                seen.lock().unwrap().push(progress.percent);
            }
        });

        transcoder.run().await.unwrap();
        let summary = transcoder.done().await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["done", "exit"]);
        assert_eq!(*exit_code.lock().unwrap(), Some(Some(0)));
        assert_eq!(summary.file.as_deref(), Some(output.as_str()));
        let sizes = summary.sizes.unwrap();
        assert_eq!(sizes.video_bytes, 400 * 1024);
        assert_eq!(sizes.audio_bytes, 100 * 1024);
        assert_eq!(*percents.lock().unwrap(), vec![50.0]);
        assert!(!transcoder.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tee_run_reports_each_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(&dir, "in.mp4");

        let mut transcoder = scripted(&dir, "exit 0");
        transcoder.config_mut().tee = true;
        transcoder
            .set_input(InputSpec::path(&input))
            .unwrap()
            .set_outputs(vec![
                OutputSpec::path("b.mkv").with_options(["-c copy"]),
                OutputSpec::path("c.mkv").with_options(["-c copy"]),
            ]);

        let results = Arc::new(Mutex::new(Vec::<RunOutput>::new()));
        let seen = results.clone();
        transcoder.subscribe(EventKind::Done, move |event| {
            if let TranscodeEvent::Done(outputs) = event {
                seen.lock().unwrap().extend(outputs.iter().cloned());
            }
        });

        transcoder.run().await.unwrap();
        assert!(transcoder.last_args().contains(&"tee".to_string()));
        assert!(
            transcoder
                .last_args()
                .contains(&"b.mkv|c.mkv".to_string())
        );

        transcoder.done().await.unwrap();
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].file.as_deref(), Some("b.mkv"));
        assert_eq!(results[1].file.as_deref(), Some("c.mkv"));
        assert_eq!(results[0].output_index, 0);
        assert_eq!(results[1].output_index, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_run_extracts_the_last_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(&dir, "in.mp4");

        let script = "printf '%s\\n' 'Stream mapping ok' 'out.mkv: Invalid argument' 1>&2\nexit 1";
        let mut transcoder = scripted(&dir, script);
        transcoder
            .set_input(InputSpec::path(&input))
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();

        let errors = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = errors.clone();
        transcoder.subscribe(EventKind::Error, move |event| {
            if let TranscodeEvent::Error { message } = event {
                seen.lock().unwrap().push(message.clone());
            }
        });

        transcoder.run().await.unwrap();
        let err = transcoder.done().await.unwrap_err();
        assert!(matches!(err, FfpilotError::Process(_)));
        assert!(err.to_string().contains("Invalid argument"));

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Invalid argument"));

        // consumed by the first done(); the next inspection is clean
        assert!(transcoder.done().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_reports_without_consuming_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(&dir, "in.mp4");

        let mut transcoder = scripted(&dir, "printf 'boom: Invalid data\\n' 1>&2\nexit 1");
        transcoder
            .set_input(InputSpec::path(&input))
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();

        transcoder.run().await.unwrap();
        let report = transcoder.exit().await;
        assert_eq!(report.code, Some(1));
        assert!(report.error.unwrap().contains("Invalid data"));

        // still raised by done()
        assert!(transcoder.done().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_a_stalled_run() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(&dir, "in.mp4");

        let mut transcoder = scripted(&dir, "exec sleep 5");
        transcoder.config_mut().timeout_ms = 100;
        transcoder
            .set_input(InputSpec::path(&input))
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();

        let errors = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = errors.clone();
        transcoder.subscribe(EventKind::Error, move |event| {
            if let TranscodeEvent::Error { message } = event {
                seen.lock().unwrap().push(message.clone());
            }
        });

        let started = std::time::Instant::now();
        transcoder.run().await.unwrap();
        let err = transcoder.done().await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, FfpilotError::Timeout(100)));
        assert!(err.to_string().to_lowercase().contains("timed out"));
        assert!(
            elapsed < Duration::from_secs(2),
            "stalled run survived for {elapsed:?}"
        );
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_lowercase().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_feeds_and_sinks_receive_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcoder = scripted(&dir, "exec cat");
        transcoder
            .set_input(InputSpec::stdin())
            .unwrap()
            .feed_stdin(&b"hello pipeline"[..]);
        let mut tap = transcoder.tap();
        let (near, mut far) = tokio::io::duplex(1024);
        transcoder.add_sink(Box::new(near));

        transcoder.run().await.unwrap();
        let summary = transcoder.done().await.unwrap();
        assert_eq!(summary.file, None);

        let mut tapped = Vec::new();
        tap.read_to_end(&mut tapped).await.unwrap();
        assert_eq!(tapped, b"hello pipeline");

        let mut sunk = Vec::new();
        far.read_to_end(&mut sunk).await.unwrap();
        assert_eq!(sunk, b"hello pipeline");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_writing_notice_advances_the_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(&dir, "in.mp4");

        let script = "printf '%s\\n' \
            \"Opening 'x.mkv' for writing\" \
            \"Opening 'seg_%03d.ts' for writing\" 1>&2\nexit 0";
        let mut transcoder = scripted(&dir, script);
        transcoder
            .set_input(InputSpec::path(&input))
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();

        let writings = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = writings.clone();
        transcoder.subscribe(EventKind::Writing, move |event| {
            if let TranscodeEvent::Writing(infos) = event {
                seen.lock()
                    .unwrap()
                    .extend(infos.iter().map(|info| info.file.clone()));
            }
        });

        transcoder.run().await.unwrap();
        let summary = transcoder.done().await.unwrap();

        // the placeholder path is reported but never promoted
        assert_eq!(summary.file.as_deref(), Some("x.mkv"));
        assert_eq!(
            *writings.lock().unwrap(),
            vec!["x.mkv".to_string(), "seg_%03d.ts".to_string()]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_multibyte_writing_path_survives_chunked_reads() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(&dir, "in.mp4");

        // Sized so the two-byte character sits astride the pump's 8 KiB
        // reads.
        let long_path = format!("{}é.mkv", "x".repeat(8182));
        let script = format!("printf \"Opening '{long_path}' for writing\\n\" 1>&2\nexit 0");
        let mut transcoder = scripted(&dir, &script);
        transcoder
            .set_input(InputSpec::path(&input))
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();

        let writings = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = writings.clone();
        transcoder.subscribe(EventKind::Writing, move |event| {
            if let TranscodeEvent::Writing(infos) = event {
                seen.lock()
                    .unwrap()
                    .extend(infos.iter().map(|info| info.file.clone()));
            }
        });

        transcoder.run().await.unwrap();
        let summary = transcoder.done().await.unwrap();

        assert_eq!(summary.file.as_deref(), Some(long_path.as_str()));
        assert_eq!(*writings.lock().unwrap(), vec![long_path]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_is_idempotent_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(&dir, "in.mp4");

        let starts = Arc::new(AtomicUsize::new(0));
        let mut transcoder = scripted(&dir, "sleep 0.2\nexit 0");
        transcoder
            .set_input(InputSpec::path(&input))
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();
        let seen = starts.clone();
        transcoder.subscribe(EventKind::Start, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        transcoder.run().await.unwrap();
        assert!(transcoder.is_running());
        transcoder.run().await.unwrap();
        transcoder.done().await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_clears_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(&dir, "in.mp4");

        let mut transcoder = scripted(&dir, "exec sleep 5");
        transcoder
            .set_input(InputSpec::path(&input))
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();

        transcoder.run().await.unwrap();
        assert!(transcoder.is_running());

        let started = std::time::Instant::now();
        transcoder.stop(StopSignal::Kill).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!transcoder.is_running());

        // second stop is a no-op
        transcoder.stop(StopSignal::Kill).await;
        assert!(!transcoder.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_travels_the_event_path() {
        let order = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut transcoder = Transcoder::default();
        transcoder.config_mut().binary_path = "/nonexistent/encoder-binary".to_string();
        transcoder
            .set_input(InputSpec::path("testsrc"))
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();

        let seen = order.clone();
        transcoder.subscribe(EventKind::Error, move |_| {
            seen.lock().unwrap().push("error".to_string());
        });
        let seen = order.clone();
        transcoder.subscribe(EventKind::Exit, move |_| {
            seen.lock().unwrap().push("exit".to_string());
        });

        transcoder.run().await.unwrap();
        let err = transcoder.done().await.unwrap_err();
        assert!(matches!(err, FfpilotError::Process(_)));
        assert!(err.to_string().contains("Failed to spawn"));
        assert_eq!(*order.lock().unwrap(), vec!["error", "exit"]);
        assert!(!transcoder.is_running());
    }

    #[tokio::test]
    async fn test_reset_restores_construction_defaults() {
        let mut config = TranscodeConfig::default();
        config.timeout_ms = 7_000;
        let mut transcoder = Transcoder::new(config);

        transcoder.config_mut().timeout_ms = 99;
        transcoder.config_mut().tee = true;
        transcoder
            .set_input(InputSpec::path("testsrc"))
            .unwrap()
            .set_output(OutputSpec::path("out.mkv"))
            .unwrap();

        transcoder.reset().await;
        assert_eq!(transcoder.config().timeout_ms, 7_000);
        assert!(!transcoder.config().tee);
        assert!(transcoder.last_args().is_empty());
        assert_eq!(transcoder.current_file(), None);
        assert!(!transcoder.is_running());
    }
}
