use std::ffi::OsStr;

use tokio::process::Command;
use tracing::trace;

/// Error from a failed host command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Whether a host command runs with privilege escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    User,
}

impl Privilege {
    /// Map a daemon's `root_required` flag to a privilege.
    pub fn from_root(root: bool) -> Self {
        if root { Self::Sudo } else { Self::User }
    }

    /// A command running `program` with `env` set, behind `sudo` when escalated.
    ///
    /// `sudo` resets the environment, so escalated variables are passed
    /// through `env` instead.
    pub fn command(self, program: impl AsRef<OsStr>, env: &[(&str, &str)]) -> Command {
        match self {
            Self::Sudo => {
                let mut cmd = Command::new("sudo");
                if !env.is_empty() {
                    cmd.arg("env")
                        .args(env.iter().map(|(key, value)| format!("{key}={value}")));
                }
                cmd.arg(program);
                cmd
            }
            Self::User => {
                let mut cmd = Command::new(program);
                cmd.envs(env.iter().copied());
                cmd
            }
        }
    }

    fn display(self, program: &str, args: &[&str]) -> String {
        let mut parts = Vec::with_capacity(args.len() + 2);
        if self == Self::Sudo {
            parts.push("sudo");
        }
        parts.push(program);
        parts.extend_from_slice(args);
        parts.join(" ")
    }
}

/// Run a host command and return its trimmed stdout.
///
/// A non-zero exit becomes a [`CommandError`] carrying trimmed stderr.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let shown = privilege.display(program, args);
    trace!(command = %shown, "exec");

    let mut cmd = privilege.command(program, &[]);
    let output = cmd
        .args(args)
        .output()
        .await
        .map_err(|e| CommandError {
            command: shown.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: shown,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
