//! Native provider process runner
//!
//! Starts a long-lived provider plugin process, waits for the handshake line
//! it prints on stdout and turns the announced socket address into a
//! reattach descriptor. Tool invocations that export the descriptor as
//! `TF_REATTACH_PROVIDERS` talk to this process instead of launching their
//! own plugin.

use crate::error::{ExecError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;

/// Environment variable carrying the reattach descriptor to the tool
pub const ENV_REATTACH_PROVIDERS: &str = "TF_REATTACH_PROVIDERS";
/// The plugin refuses to serve unless this variable holds the magic cookie
pub const ENV_MAGIC_COOKIE: &str = "TF_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str =
    "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";
pub const DEFAULT_PROTOCOL_VERSION: u32 = 5;
pub const DEFAULT_REATTACH_TIMEOUT: Duration = Duration::from_secs(60);

static REATTACH_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".*unix\|(.*)\|grpc.*").expect("reattach pattern is valid"));

/// Starts and stops a provider process
#[async_trait]
pub trait ProviderRunner: Send + Sync {
    /// Starts the process if needed and returns its reattach descriptor.
    /// Calling it while the process runs returns the cached descriptor.
    async fn start(&self) -> Result<String>;

    /// Asks the process to terminate. Returns once the request is sent.
    fn stop(&self) -> Result<()>;
}

/// How to launch a native provider
#[derive(Debug, Clone)]
pub struct NativeProviderConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Provider source address, the key of the reattach descriptor
    pub name: String,
    pub protocol_version: u32,
    pub reattach_timeout: Duration,
}

impl NativeProviderConfig {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            name: name.into(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            reattach_timeout: DEFAULT_REATTACH_TIMEOUT,
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

    pub fn with_reattach_timeout(mut self, timeout: Duration) -> Self {
        self.reattach_timeout = timeout;
        self
    }
}

/// Extracts the socket address from a plugin handshake line
pub fn parse_reattach_address(line: &str) -> Option<String> {
    REATTACH_LINE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Builds the `TF_REATTACH_PROVIDERS` value for one provider
pub fn reattach_descriptor(name: &str, protocol_version: u32, pid: u32, addr: &str) -> String {
    serde_json::json!({
        name: {
            "Protocol": "grpc",
            "ProtocolVersion": protocol_version,
            "Pid": pid,
            "Test": true,
            "Addr": {
                "Network": "unix",
                "String": addr,
            },
        }
    })
    .to_string()
}

#[derive(Default)]
struct RunnerState {
    reattach_config: Option<String>,
    stop_tx: Option<oneshot::Sender<()>>,
    started: bool,
    generation: u64,
}

/// [`ProviderRunner`] supervising one OS process
pub struct NativeProviderRunner {
    config: NativeProviderConfig,
    start_lock: tokio::sync::Mutex<()>,
    state: Arc<Mutex<RunnerState>>,
}

impl NativeProviderRunner {
    pub fn new(config: NativeProviderConfig) -> Self {
        Self {
            config,
            start_lock: tokio::sync::Mutex::new(()),
            state: Arc::new(Mutex::new(RunnerState::default())),
        }
    }

    /// Descriptor of the running process, if any
    pub fn reattach_config(&self) -> Option<String> {
        self.state.lock().reattach_config.clone()
    }

    fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.config.path);
        cmd.args(&self.config.args);
        cmd.env(ENV_MAGIC_COOKIE, MAGIC_COOKIE_VALUE);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        Ok(cmd.spawn()?)
    }
}

#[async_trait]
impl ProviderRunner for NativeProviderRunner {
    async fn start(&self) -> Result<String> {
        let _serial = self.start_lock.lock().await;
        if let Some(config) = self.reattach_config() {
            tracing::debug!(
                path = %self.config.path.display(),
                reattach_config = %config,
                "Native provider is already running"
            );
            return Ok(config);
        }

        let mut child = self.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::ProviderExited("stdout was not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let path = self.config.path.display().to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(path = %path, "{}", line);
                }
            });
        }

        let (addr_tx, mut addr_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.started = true;
            state.stop_tx = Some(stop_tx);
            state.generation
        };

        tracing::debug!(
            path = %self.config.path.display(),
            args = ?self.config.args,
            pid = ?child.id(),
            "Started native provider"
        );

        let supervisor = Supervisor {
            child,
            stdout,
            addr_tx: Some(addr_tx),
            exit_tx,
            stop_rx,
            state: Arc::clone(&self.state),
            generation,
            name: self.config.name.clone(),
            protocol_version: self.config.protocol_version,
        };
        tokio::spawn(supervisor.run());

        let timeout = self.config.reattach_timeout;
        tokio::select! {
            Ok(config) = &mut addr_rx => Ok(config),
            res = &mut exit_rx => Err(res.unwrap_or_else(|_| {
                ExecError::ProviderExited("stopped before announcing its address".to_string())
            })),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    path = %self.config.path.display(),
                    ?timeout,
                    "Native provider did not announce its address, stopping it"
                );
                self.stop()?;
                Err(ExecError::ReattachTimeout(timeout))
            }
        }
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(ExecError::ProviderNotStarted);
        }
        if let Some(tx) = state.stop_tx.take() {
            // the supervisor may already be gone if the process exited
            let _ = tx.send(());
        }
        Ok(())
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Stopped,
}

/// Background worker owning the child process.
///
/// Races the handshake scan, the process exit and the stop request; the
/// first of exit or stop ends the worker.
struct Supervisor {
    child: Child,
    stdout: ChildStdout,
    addr_tx: Option<oneshot::Sender<String>>,
    exit_tx: oneshot::Sender<ExecError>,
    stop_rx: oneshot::Receiver<()>,
    state: Arc<Mutex<RunnerState>>,
    generation: u64,
    name: String,
    protocol_version: u32,
}

impl Supervisor {
    async fn run(mut self) {
        let mut lines = BufReader::new(self.stdout).lines();
        let mut stdout_open = true;

        let outcome = loop {
            tokio::select! {
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if self.addr_tx.is_none() {
                            continue;
                        }
                        if let Some(addr) = parse_reattach_address(&line) {
                            let pid = self.child.id().unwrap_or_default();
                            let config =
                                reattach_descriptor(&self.name, self.protocol_version, pid, &addr);
                            {
                                let mut state = self.state.lock();
                                if state.generation == self.generation {
                                    state.reattach_config = Some(config.clone());
                                }
                            }
                            if let Some(tx) = self.addr_tx.take() {
                                let _ = tx.send(config);
                            }
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::debug!(error = %e, "Cannot read native provider output");
                        stdout_open = false;
                    }
                },
                status = self.child.wait() => break Outcome::Exited(status),
                _ = &mut self.stop_rx => break Outcome::Stopped,
            }
        };

        match outcome {
            Outcome::Exited(status) => {
                let reason = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                tracing::info!(provider = %self.name, %reason, "Native provider process exited");
                let _ = self.exit_tx.send(ExecError::ProviderExited(reason));
            }
            Outcome::Stopped => {
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(provider = %self.name, error = %e, "Cannot kill native provider");
                }
                tracing::debug!(provider = %self.name, "Stopped the provider runner");
            }
        }

        let mut state = self.state.lock();
        if state.generation == self.generation {
            state.reattach_config = None;
        }
    }
}
