//! Engine process supervision
//!
//! Generic primitives each backend composes into its own startup sequence:
//! - [`launch`]: check paths, then spawn detached (daemon) or attached (interactive)
//! - [`EngineProcess::interact`]: wait for a prompt, answer it with a line
//! - [`wait_until_ready`]: poll a readiness probe with a ceiling
//! - [`terminate_matching`]: signal every process started from a binary

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How a launched engine relates to our own lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Own process group, output appended to log files; survives us
    Detached,
    /// Piped stdin/stdout/stderr; killed when the handle is dropped
    Attached,
}

/// Everything needed to start one engine process
#[derive(Clone)]
pub struct LaunchSpec {
    /// Short name for logs and log files ("monerod", "electrum")
    pub name: String,
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Created if missing; detached output logs go here
    pub datastore: PathBuf,
    /// Must exist before the engine is started
    pub wallet_file: Option<PathBuf>,
    pub mode: LaunchMode,
    /// Positions in `args` rendered as `***` by [`LaunchSpec::display`]
    secret_positions: Vec<usize>,
}

impl LaunchSpec {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>, datastore: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            args: Vec::new(),
            datastore: datastore.into(),
            wallet_file: None,
            mode: LaunchMode::Attached,
            secret_positions: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an argument that must never reach logs or error messages
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_positions.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn wallet_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.wallet_file = Some(path.into());
        self
    }

    pub fn detached(mut self) -> Self {
        self.mode = LaunchMode::Detached;
        self
    }

    /// Command line for logs and errors, secret arguments masked
    pub fn display(&self) -> String {
        let mut parts = vec![self.binary.display().to_string()];
        parts.extend(self.args.iter().enumerate().map(|(i, arg)| {
            if self.secret_positions.contains(&i) {
                "***".to_string()
            } else {
                arg.clone()
            }
        }));
        parts.join(" ")
    }
}

impl std::fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("name", &self.name)
            .field("command", &self.display())
            .field("mode", &self.mode)
            .finish()
    }
}

/// Output and exit status of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Verify the binary and wallet file, creating the datastore if needed
pub fn check_paths(binary: &Path, datastore: &Path, wallet_file: Option<&Path>) -> Result<()> {
    let metadata = std::fs::metadata(binary)
        .map_err(|e| Error::MissingBinary(format!("{}: {}", binary.display(), e)))?;

    if !metadata.is_file() {
        return Err(Error::MissingBinary(format!(
            "{} is not a file",
            binary.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(Error::MissingBinary(format!(
                "{} is not executable",
                binary.display()
            )));
        }
    }

    if !datastore.exists() {
        info!("Creating datastore directory {}", datastore.display());
        std::fs::create_dir_all(datastore)?;
    }

    if let Some(wallet) = wallet_file {
        if !wallet.is_file() {
            return Err(Error::MissingWalletFile(format!(
                "{} (create the wallet or change the path)",
                wallet.display()
            )));
        }
    }

    Ok(())
}

/// Check paths and spawn the engine
pub fn launch(spec: &LaunchSpec) -> Result<EngineProcess> {
    check_paths(&spec.binary, &spec.datastore, spec.wallet_file.as_deref())?;

    let mut command = Command::new(&spec.binary);
    command.args(&spec.args);

    match spec.mode {
        LaunchMode::Detached => {
            let (out, err) = open_logs(&spec.datastore, &spec.name)?;
            command
                .stdin(Stdio::null())
                .stdout(out)
                .stderr(err)
                .kill_on_drop(false);
            // Own process group so signals aimed at us do not reach the daemon
            #[cfg(unix)]
            command.process_group(0);
        }
        LaunchMode::Attached => {
            command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
        }
    }

    info!("Launching {} ({:?}): {}", spec.name, spec.mode, spec.display());

    let mut child = command
        .spawn()
        .map_err(|e| Error::Spawn(format!("{}: {}", spec.display(), e)))?;

    let (stdin, output) = match spec.mode {
        LaunchMode::Detached => (None, None),
        LaunchMode::Attached => {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(stdout) = child.stdout.take() {
                forward_output(stdout, tx.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                forward_output(stderr, tx);
            }
            (child.stdin.take(), Some(rx))
        }
    };

    Ok(EngineProcess {
        name: spec.name.clone(),
        child,
        stdin,
        output,
        buffer: String::new(),
    })
}

fn open_logs(datastore: &Path, name: &str) -> Result<(Stdio, Stdio)> {
    let open = |suffix: &str| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(datastore.join(format!("{}.{}", name, suffix)))
    };
    Ok((Stdio::from(open("out")?), Stdio::from(open("err")?)))
}

/// Pump a child stream into the merged output channel, like a terminal would
fn forward_output<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(String::from_utf8_lossy(&buf[..n]).into_owned()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Handle to a launched engine process
pub struct EngineProcess {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    /// Merged stdout+stderr; `None` once drained or for detached processes
    output: Option<mpsc::UnboundedReceiver<String>>,
    /// Output read but not yet consumed by `expect_any`
    buffer: String,
}

impl EngineProcess {
    /// Wait until one of `markers` shows up in the output; returns its index
    pub async fn expect_any(&mut self, markers: &[&str], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let expected = markers.join(" | ");

        loop {
            if let Some((index, end)) = find_first(&self.buffer, markers) {
                debug!("{}: matched {:?}", self.name, markers[index]);
                self.buffer.drain(..end);
                return Ok(index);
            }

            let output = self.output.as_mut().ok_or_else(|| Error::UnexpectedProcessOutput {
                expected: expected.clone(),
                output: format!("{} has no readable output", self.name),
            })?;

            match timeout_at(deadline, output.recv()).await {
                Ok(Some(chunk)) => self.buffer.push_str(&chunk),
                Ok(None) => {
                    return Err(Error::UnexpectedProcessOutput {
                        expected,
                        output: format!("EOF after {:?}", self.buffer),
                    });
                }
                Err(_) => {
                    return Err(Error::UnexpectedProcessOutput {
                        expected,
                        output: format!("timed out after {:?}, saw {:?}", timeout, self.buffer),
                    });
                }
            }
        }
    }

    /// Write `line` plus a newline to the process input
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Spawn(format!("{} has no writable input", self.name)))?;

        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Wait for `prompt`, then answer with `line`
    pub async fn interact(&mut self, prompt: &str, line: &str, timeout: Duration) -> Result<()> {
        self.expect_any(&[prompt], timeout).await?;
        self.send_line(line).await?;
        debug!("{}: answered {:?}", self.name, prompt);
        Ok(())
    }

    /// Close the input stream (commands that read until EOF)
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Collect remaining output and wait for exit
    pub async fn finish(mut self, timeout: Duration) -> Result<CommandOutput> {
        self.close_stdin();
        let deadline = Instant::now() + timeout;

        if let Some(mut output) = self.output.take() {
            loop {
                match timeout_at(deadline, output.recv()).await {
                    Ok(Some(chunk)) => self.buffer.push_str(&chunk),
                    Ok(None) => break,
                    Err(_) => {
                        let _ = self.child.kill().await;
                        return Err(Error::UnexpectedProcessOutput {
                            expected: "process exit".to_string(),
                            output: format!("{} still running after {:?}", self.name, timeout),
                        });
                    }
                }
            }
        }

        let status = match timeout_at(deadline, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = self.child.kill().await;
                return Err(Error::UnexpectedProcessOutput {
                    expected: "process exit".to_string(),
                    output: format!("{} still running after {:?}", self.name, timeout),
                });
            }
        };

        debug!("{} exited with {}: {}", self.name, status, self.buffer.trim());

        Ok(CommandOutput {
            status,
            output: self.buffer,
        })
    }

    /// Keep draining output into the debug log for a long-running attached process
    pub fn log_output(&mut self) {
        if let Some(mut output) = self.output.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                while let Some(chunk) = output.recv().await {
                    for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
                        debug!("[{}] {}", name, line);
                    }
                }
            });
        }
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already exited
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::ShutdownFailed(format!("{}: {}", self.name, e))),
        }
    }
}

fn find_first(haystack: &str, markers: &[&str]) -> Option<(usize, usize)> {
    markers
        .iter()
        .enumerate()
        .filter_map(|(i, m)| haystack.find(m).map(|pos| (i, pos, pos + m.len())))
        .min_by_key(|&(_, pos, _)| pos)
        .map(|(i, _, end)| (i, end))
}

/// Run a short-lived engine command to completion
pub async fn run_command(spec: &LaunchSpec, timeout: Duration) -> Result<CommandOutput> {
    let process = launch(spec)?;
    process.finish(timeout).await
}

/// Polling policy for [`wait_until_ready`]
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(120),
        }
    }
}

impl ReadinessPolicy {
    /// Default interval, custom ceiling (known-slow engines)
    pub fn with_max_wait(max_wait: Duration) -> Self {
        Self {
            max_wait,
            ..Self::default()
        }
    }
}

/// Poll `probe` until it reports ready
///
/// The probe runs once per interval. Once the ceiling has elapsed, the next
/// failing probe ends the wait with `ReadinessTimeout`.
pub async fn wait_until_ready<F, Fut>(
    mut probe: F,
    description: &str,
    policy: ReadinessPolicy,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if probe().await {
            info!(
                "{} ready after {:.1}s ({} probes)",
                description,
                started.elapsed().as_secs_f64(),
                attempts
            );
            return Ok(());
        }

        if started.elapsed() >= policy.max_wait {
            warn!("{} not ready after {:?}", description, policy.max_wait);
            return Err(Error::ReadinessTimeout(description.to_string()));
        }

        debug!("Waiting for {} (probe {})", description, attempts);
        sleep(policy.interval).await;
    }
}

/// `pkill -f` pattern matching command lines that start with `binary`
///
/// pkill reads POSIX extended regexes, so every metacharacter in the path is
/// escaped and the match is anchored to argv[0].
fn command_line_pattern(binary: &Path) -> String {
    let mut pattern = String::from("^");
    for c in binary.display().to_string().chars() {
        if ".[]()*+?{}|^$\\".contains(c) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str("( |$)");
    pattern
}

/// Send SIGTERM to every process started from `binary`
///
/// Returns `false` when nothing matched (already stopped).
pub async fn terminate_matching(binary: &Path) -> Result<bool> {
    info!("Terminating processes matching {}", binary.display());

    let output = Command::new("pkill")
        .arg("-f")
        .arg(command_line_pattern(binary))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::ShutdownFailed(format!("pkill unavailable: {}", e)))?;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    match output.status.code() {
        Some(0) if stderr.is_empty() => Ok(true),
        Some(1) if stderr.is_empty() => {
            warn!("No running process matched {}", binary.display());
            Ok(false)
        }
        _ => Err(Error::ShutdownFailed(format!(
            "pkill -f {} exited with {}: {}",
            binary.display(),
            output.status,
            stderr
        ))),
    }
}
