//! Remote execution capability
//!
//! Machine phases talk to hosts only through [`RemoteExec`]. The transport
//! (SSH client, agent tunnel) is supplied by the caller through a
//! [`RemoteConnector`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use keel_common::crd::SshSpec;
use keel_common::Error;

/// Exit code recorded when the transport failed before the command finished
pub const TRANSPORT_FAILURE_EXIT: i32 = -1;

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Remote exit code
    pub exit_code: i32,
}

impl ExecOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A handle to one remote host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// IP of the host this handle talks to
    fn host_ip(&self) -> String;

    /// Run a command and capture its output and exit code
    ///
    /// `Err` means the transport failed; a non-zero exit is reported in
    /// [`ExecOutput::exit_code`].
    async fn exec(&self, cmd: &str) -> Result<ExecOutput, Error>;

    /// Run a command and return stdout and stderr interleaved
    ///
    /// Fails on transport errors and on non-zero exit.
    async fn combined_output(&self, cmd: &str) -> Result<String, Error>;

    /// Copy a local file to `dst` on the host
    async fn copy_file(&self, src: &str, dst: &str) -> Result<(), Error>;
}

/// Opens [`RemoteExec`] handles from machine connection descriptors
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect to the host, failing with `Error::Connection` when unreachable
    async fn connect(&self, ssh: &SshSpec) -> Result<Arc<dyn RemoteExec>, Error>;
}

/// Run a command, turning transport failures and non-zero exits into
/// `Error::RemoteCommand`
pub async fn run_checked(remote: &dyn RemoteExec, cmd: &str) -> Result<ExecOutput, Error> {
    let host = remote.host_ip();
    debug!(host = %host, command = %cmd, "running remote command");

    let output = remote
        .exec(cmd)
        .await
        .map_err(|e| Error::remote_command(&host, cmd, TRANSPORT_FAILURE_EXIT, e.to_string()))?;

    if !output.success() {
        return Err(Error::remote_command(
            host,
            cmd,
            output.exit_code,
            output.stderr.trim(),
        ));
    }
    Ok(output)
}

/// Quote a value for a POSIX shell command line
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(mock: &mut MockRemoteExec) {
        mock.expect_host_ip().return_const("10.0.0.5".to_string());
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr_and_code() {
        let mut mock = MockRemoteExec::new();
        host(&mut mock);
        mock.expect_exec().returning(|_| {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: "no such file\n".to_string(),
                exit_code: 127,
            })
        });

        let err = run_checked(&mock, "/opt/missing.sh").await.unwrap_err();
        match err {
            Error::RemoteCommand {
                host,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(host, "10.0.0.5");
                assert_eq!(exit_code, 127);
                assert_eq!(stderr, "no such file");
            }
            other => panic!("expected RemoteCommand, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_is_a_remote_command_error() {
        let mut mock = MockRemoteExec::new();
        host(&mut mock);
        mock.expect_exec()
            .returning(|_| Err(Error::connection("10.0.0.5", "broken pipe")));

        let err = run_checked(&mock, "true").await.unwrap_err();
        assert!(matches!(
            err,
            Error::RemoteCommand { exit_code: TRANSPORT_FAILURE_EXIT, .. }
        ));
    }

    #[tokio::test]
    async fn zero_exit_returns_output() {
        let mut mock = MockRemoteExec::new();
        host(&mut mock);
        mock.expect_exec().returning(|_| {
            Ok(ExecOutput {
                stdout: "ok".to_string(),
                ..Default::default()
            })
        });
        assert_eq!(run_checked(&mock, "echo ok").await.unwrap().stdout, "ok");
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
