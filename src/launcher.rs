//! Starting local IPython kernels.
//!
//! A kernel is started as `<program> kernel` bound to a connection file, in its own
//! process group, so it outlives the client and ignores the client's Ctrl+C.
//! Its PID is written to `jupyter-kernel-<pid>.pid` in the runtime directory
//! and its stdout/stderr go to log files next to it.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{runtime_dir, LauncherConfig};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Connection file not found: {}", .0.display())]
    ConnectionFileMissing(PathBuf),

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Kernel failed to start (exit code: {code:?})\nStdout: {stdout}\nStderr: {stderr}")]
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Runtime {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A kernel process that survived its startup window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelProcess {
    pub pid: u32,
    pub pid_file: PathBuf,
    pub connection_file: PathBuf,
}

impl std::fmt::Display for KernelProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Kernel started with PID: {}\nConnection file: {}",
            self.pid,
            self.connection_file.display()
        )
    }
}

pub struct KernelLauncher {
    config: LauncherConfig,
    runtime_dir: PathBuf,
}

impl KernelLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            runtime_dir: runtime_dir(),
        }
    }

    /// Keep PID and log files under `dir` instead of [`runtime_dir`].
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// The command that starts a kernel bound to `connection_file`.
    pub fn command(&self, connection_file: &Path) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .arg("kernel")
            .arg(format!(
                "--ConnectionFileMixin.connection_file={}",
                connection_file.display()
            ))
            .stdin(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command
    }

    /// Start a kernel and wait out the startup delay.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Exited`] with the captured output if the
    /// process is already gone when the delay ends.
    pub async fn start(&self, connection_file: &Path) -> Result<KernelProcess, LaunchError> {
        if !connection_file.exists() {
            return Err(LaunchError::ConnectionFileMissing(connection_file.to_path_buf()));
        }

        fs::create_dir_all(&self.runtime_dir).map_err(|source| LaunchError::Runtime {
            path: self.runtime_dir.clone(),
            source,
        })?;

        let stem = connection_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("kernel");
        let stdout_log = self.runtime_dir.join(format!("{}.stdout.log", stem));
        let stderr_log = self.runtime_dir.join(format!("{}.stderr.log", stem));

        let mut command = self.command(connection_file);
        command
            .stdout(create_log(&stdout_log)?)
            .stderr(create_log(&stderr_log)?);

        info!("Starting kernel {} with {}", self.config.program, connection_file.display());
        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        let pid = child.id();

        let pid_file = self.runtime_dir.join(format!("jupyter-kernel-{}.pid", pid));
        fs::write(&pid_file, pid.to_string()).map_err(|source| LaunchError::Runtime {
            path: pid_file.clone(),
            source,
        })?;

        tokio::time::sleep(self.config.startup_delay).await;

        match child.try_wait() {
            Ok(None) => {
                info!("Kernel running with PID {}", pid);
                Ok(KernelProcess {
                    pid,
                    pid_file,
                    connection_file: connection_file.to_path_buf(),
                })
            }
            Ok(Some(status)) => {
                if let Err(e) = fs::remove_file(&pid_file) {
                    warn!("Failed to remove PID file {}: {}", pid_file.display(), e);
                }
                Err(LaunchError::Exited {
                    code: status.code(),
                    stdout: read_log(&stdout_log),
                    stderr: read_log(&stderr_log),
                })
            }
            Err(source) => Err(LaunchError::Spawn {
                program: self.config.program.clone(),
                source,
            }),
        }
    }
}

fn create_log(path: &Path) -> Result<File, LaunchError> {
    File::create(path).map_err(|source| LaunchError::Runtime {
        path: path.to_path_buf(),
        source,
    })
}

fn read_log(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!("jkc-{}-{}-{}", name, std::process::id(), nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn launcher(program: &str, dir: &Path) -> KernelLauncher {
        KernelLauncher::new(LauncherConfig {
            program: program.to_string(),
            startup_delay: Duration::from_millis(300),
        })
        .with_runtime_dir(dir)
    }

    #[test]
    fn test_command_line() {
        let launcher = KernelLauncher::new(LauncherConfig::default());
        let command = launcher.command(Path::new("/tmp/kernel-1.json"));

        assert_eq!(command.get_program(), "ipython");
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["kernel", "--ConnectionFileMixin.connection_file=/tmp/kernel-1.json"]
        );
    }

    #[tokio::test]
    async fn test_missing_connection_file() {
        let dir = scratch_dir("missing");
        let err = launcher("ipython", &dir)
            .start(&dir.join("absent.json"))
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::ConnectionFileMissing(_)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_unknown_program() {
        let dir = scratch_dir("spawn");
        let connection = dir.join("kernel.json");
        fs::write(&connection, "{}").unwrap();

        let err = launcher("jkc-definitely-not-a-program", &dir)
            .start(&connection)
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::Spawn { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_reported() {
        let dir = scratch_dir("exit");
        let connection = dir.join("kernel.json");
        fs::write(&connection, "{}").unwrap();

        let err = launcher("false", &dir).start(&connection).await.unwrap_err();

        match err {
            LaunchError::Exited { code, .. } => assert_eq!(code, Some(1)),
            other => panic!("Expected Exited, got {:?}", other),
        }
        let leftover_pids = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".pid"))
            .count();
        assert_eq!(leftover_pids, 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_process_display() {
        let process = KernelProcess {
            pid: 4242,
            pid_file: PathBuf::from("/run/jupyter-kernel-4242.pid"),
            connection_file: PathBuf::from("/tmp/kernel.json"),
        };
        assert_eq!(
            process.to_string(),
            "Kernel started with PID: 4242\nConnection file: /tmp/kernel.json"
        );
    }
}
