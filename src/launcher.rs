//! Engine process launching
//!
//! [`EngineLauncher`] is the seam between the supervisor and the operating
//! system. [`ProcessLauncher`] runs the real engine binary with
//! `tokio::process`; tests substitute an in-process simulated engine.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::supervisor::EngineLog;
use crate::{BridgeError, Result};

/// Starts engine processes.
#[async_trait::async_trait]
pub trait EngineLauncher: Send + 'static {
    /// Start an engine that will connect to `127.0.0.1:<port>`.
    ///
    /// Diagnostic output from the process should be appended to `log`.
    async fn launch(&mut self, port: u16, log: &EngineLog) -> Result<Box<dyn EngineProcess>>;
}

/// A running engine process.
#[async_trait::async_trait]
pub trait EngineProcess: Send + 'static {
    /// Operating system process id, if known
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit.
    ///
    /// Returns the exit code, or `None` when the process was terminated by a signal.
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Terminate the process
    async fn kill(&mut self) -> Result<()>;
}

/// Launches the engine binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessLauncher {
    /// Resolve the engine binary from the configuration
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let binary = find_engine_binary(&config.engine_binary_path)?;
        info!("Using engine binary {}", binary.display());
        Ok(Self { binary, extra_args: config.extra_engine_args.clone() })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Command line arguments for a given port, excluding the binary
    pub fn arguments(&self, port: u16) -> Vec<String> {
        let mut args =
            vec!["--socket".to_string(), port.to_string(), "--command-socket".to_string()];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait::async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&mut self, port: u16, log: &EngineLog) -> Result<Box<dyn EngineProcess>> {
        let args = self.arguments(port);
        debug!("Spawning {} {}", self.binary.display(), args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn { path: self.binary.clone(), source })?;

        if let Some(stderr) = child.stderr.take() {
            let log = log.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            debug!(target: "engine", "{}", line);
                            log.push(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Reading engine stderr failed: {}", e);
                            break;
                        }
                    }
                }
            });
        }

        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait::async_trait]
impl EngineProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let status =
            self.child.wait().await.map_err(|e| BridgeError::io_error("waiting for engine", e))?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(BridgeError::io_error("killing engine", e)),
        }
    }
}

/// Locate the engine executable.
///
/// An existing file path is used as is. Otherwise the file name is looked up
/// next to the running executable, in its `bin/` and `../Resources`
/// directories, and finally on `PATH`.
pub fn find_engine_binary(configured: &Path) -> Result<PathBuf> {
    if configured.is_file() {
        return Ok(configured.to_path_buf());
    }
    let not_found = || BridgeError::EngineNotFound { path: configured.to_path_buf() };
    let name = configured.file_name().ok_or_else(not_found)?;

    let mut candidates = Vec::new();
    let exe_dir = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf));
    if let Some(exe_dir) = exe_dir {
        candidates.push(exe_dir.join(name));
        candidates.push(exe_dir.join("bin").join(name));
        candidates.push(exe_dir.join("..").join("Resources").join(name));
    }
    if let Some(path) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path).map(|dir| dir.join(name)));
    }

    for candidate in candidates {
        if candidate.is_file() {
            debug!("Found engine binary at {}", candidate.display());
            return Ok(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Ok(exe);
            }
        }
    }
    Err(not_found())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_file_is_used_directly() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(find_engine_binary(file.path()).unwrap(), file.path());
    }

    #[test]
    fn missing_binary_is_engine_not_found() {
        let err =
            find_engine_binary(Path::new("/nonexistent/slicebridge-no-such-engine")).unwrap_err();
        assert!(matches!(err, BridgeError::EngineNotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn arguments_carry_port_and_command_socket_flag() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut config = BridgeConfig::new(file.path());
        config.extra_engine_args = vec!["-v".to_string()];
        let launcher = ProcessLauncher::new(&config).unwrap();
        assert_eq!(launcher.arguments(5123), vec!["--socket", "5123", "--command-socket", "-v"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_exit_code_and_stderr_are_captured() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-engine");
        {
            let mut file = std::fs::File::create(&script).unwrap();
            writeln!(file, "#!/bin/sh\necho \"started with $*\" >&2\nexit 3").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut launcher = ProcessLauncher::new(&BridgeConfig::new(&script)).unwrap();
        let log = EngineLog::new(10);
        let mut process = launcher.launch(4000, &log).await.unwrap();
        assert!(process.id().is_some());
        assert_eq!(process.wait().await.unwrap(), Some(3));

        // stderr is drained by a separate task
        for _ in 0..50 {
            if !log.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(log.lines(), vec!["started with --socket 4000 --command-socket"]);
    }
}
