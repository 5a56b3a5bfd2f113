//! Remote command execution over the system `ssh` client.
//!
//! The engine only sees [`RemoteShell`]: a plain command that returns its
//! captured output, or a PTY-backed command whose streams stay open while it
//! runs. [`SshShell`] implements both by spawning `ssh`; tests substitute a
//! scripted shell.

use std::ffi::OsString;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::process::Stdio;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::debug;

use crate::config::{SshConfig, expand_tilde};

/// Future returned by remote operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Writable end of a remote session.
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable end of a remote session.
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Resolves to the remote exit code once the session ends.
pub type ExitFuture = Pin<Box<dyn Future<Output = Result<Option<i32>, RemoteError>> + Send>>;

/// Errors surfaced while talking to a remote host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// The SSH client could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// A spawned session did not expose one of its standard streams.
    #[error("remote session is missing its {0} stream")]
    MissingStream(&'static str),
    /// Waiting for the session failed.
    #[error("remote session failed: {0}")]
    Io(String),
}

/// Output captured from a remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Exit code, absent when the command was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RemoteCommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// A command running inside a remote pseudo-terminal.
pub struct PtyChild {
    /// Keystrokes written here reach the remote program.
    pub stdin: RemoteWriter,
    /// Raw terminal output.
    pub stdout: RemoteReader,
    /// Diagnostic output of the transport.
    pub stderr: RemoteReader,
    /// Completes with the exit code when the remote program ends.
    pub exit: ExitFuture,
}

impl std::fmt::Debug for PtyChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyChild").finish_non_exhaustive()
    }
}

/// Connection to one remote host.
pub trait RemoteShell: Send + Sync {
    /// Runs `command` and captures its output.
    fn run<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, RemoteCommandOutput>;

    /// Starts `command` attached to a pseudo-terminal.
    fn open_pty<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, PtyChild>;
}

/// Opens shells to freshly provisioned servers.
pub trait ShellConnector: Send + Sync {
    /// TCP port probed before the first command.
    fn port(&self) -> u16;

    /// Returns a shell for the host at `ip`.
    fn connect(&self, ip: IpAddr) -> Box<dyn RemoteShell>;
}

/// Wraps a step script so it runs under a login shell and stops at the first
/// failing command.
#[must_use]
pub fn build_step_command(script: &str) -> String {
    let body = format!("set -e\n{script}");
    format!("bash -lc {}", escape(body.into()))
}

/// [`RemoteShell`] backed by the system `ssh` binary.
#[derive(Clone, Debug)]
pub struct SshShell {
    config: SshConfig,
    host: IpAddr,
}

impl SshShell {
    /// Creates a shell for `host`.
    #[must_use]
    pub const fn new(config: SshConfig, host: IpAddr) -> Self {
        Self { config, host }
    }

    /// Arguments passed to `ssh` for `command`.
    #[must_use]
    pub fn ssh_args(&self, command: &str, tty: bool) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.port.to_string()),
        ];

        if let Some(ref identity_file) = self.config.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.config.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        if tty {
            args.push(OsString::from("-tt"));
        }

        args.push(OsString::from(format!("{}@{}", self.config.user, self.host)));
        args.push(OsString::from(command));
        args
    }

    fn command(&self, command: &str, tty: bool) -> Command {
        let mut process = Command::new(&self.config.bin);
        process.args(self.ssh_args(command, tty)).kill_on_drop(true);
        process
    }

    fn spawn_error(&self, err: &std::io::Error) -> RemoteError {
        RemoteError::Spawn {
            program: self.config.bin.clone(),
            message: err.to_string(),
        }
    }
}

impl RemoteShell for SshShell {
    fn run<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, RemoteCommandOutput> {
        Box::pin(async move {
            debug!(host = %self.host, "running remote command");
            let output = self
                .command(command, false)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| self.spawn_error(&err))?;
            Ok(RemoteCommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn open_pty<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, PtyChild> {
        Box::pin(async move {
            debug!(host = %self.host, "opening remote terminal");
            let mut child = self
                .command(command, true)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|err| self.spawn_error(&err))?;
            let stdin = child.stdin.take().ok_or(RemoteError::MissingStream("stdin"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or(RemoteError::MissingStream("stdout"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or(RemoteError::MissingStream("stderr"))?;
            let exit = Box::pin(async move {
                child
                    .wait()
                    .await
                    .map(|status| status.code())
                    .map_err(|err| RemoteError::Io(err.to_string()))
            });
            Ok(PtyChild {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
                exit,
            })
        })
    }
}

/// [`ShellConnector`] producing [`SshShell`]s.
#[derive(Clone, Debug, Default)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    /// Creates a connector using `config` for every host.
    #[must_use]
    pub const fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

impl ShellConnector for SshConnector {
    fn port(&self) -> u16 {
        self.config.port
    }

    fn connect(&self, ip: IpAddr) -> Box<dyn RemoteShell> {
        Box::new(SshShell::new(self.config.clone(), ip))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rstest::rstest;

    use super::*;

    const HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));

    fn rendered(args: &[OsString]) -> String {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[rstest]
    #[case("apt-get update", "bash -lc 'set -e\napt-get update'")]
    #[case("echo 'hi'", "bash -lc 'set -e\necho '\\''hi'\\'''")]
    fn wraps_step_scripts(#[case] script: &str, #[case] expected: &str) {
        assert_eq!(build_step_command(script), expected);
    }

    #[test]
    fn builds_default_ssh_arguments() {
        let shell = SshShell::new(SshConfig::default(), HOST);
        assert_eq!(
            rendered(&shell.ssh_args("uptime", false)),
            "-p 22 -o BatchMode=yes -o StrictHostKeyChecking=no \
             -o UserKnownHostsFile=/dev/null root@203.0.113.9 uptime"
        );
    }

    #[test]
    fn terminal_sessions_force_tty_allocation() {
        let config = SshConfig {
            port: 2222,
            batch_mode: false,
            strict_host_key_checking: true,
            known_hosts_file: String::new(),
            identity_file: Some(String::from("/keys/id_ed25519")),
            ..SshConfig::default()
        };
        let shell = SshShell::new(config, HOST);
        assert_eq!(
            rendered(&shell.ssh_args("top", true)),
            "-p 2222 -i /keys/id_ed25519 -tt root@203.0.113.9 top"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let config = SshConfig {
            bin: String::from("/nonexistent/ssh"),
            ..SshConfig::default()
        };
        let shell = SshShell::new(config, HOST);
        let err = shell.run("true").await.expect_err("spawn should fail");
        assert!(matches!(err, RemoteError::Spawn { ref program, .. } if program == "/nonexistent/ssh"));
    }

    #[test]
    fn connector_exposes_configured_port() {
        let connector = SshConnector::new(SshConfig {
            port: 2200,
            ..SshConfig::default()
        });
        assert_eq!(connector.port(), 2200);
    }
}
