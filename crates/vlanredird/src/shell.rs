//! Shell command execution for the one thing netlink cannot do: toggling
//! NIC VLAN offloads through `ethtool`.
//!
//! Interface names are always passed through [`shellquote`].

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{Result, VlanRedirError};

/// Path to the `ethtool` command for offload configuration.
pub const ETHTOOL_CMD: &str = "/sbin/ethtool";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// The string is wrapped in double quotes and `$`, `` ` ``, `"`, `\` and
/// newline are escaped.
///
/// ```
/// use vlanredird::shell::shellquote;
///
/// assert_eq!(shellquote("eth0"), "\"eth0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// VLAN offload feature names understood by `ethtool -K`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanOffload {
    /// Tag stripping on receive. Must be off on inputs or the program never
    /// sees the tag.
    Rx,
    /// Tag insertion on transmit. Must be off on outputs so redirected
    /// frames leave untouched.
    Tx,
}

impl VlanOffload {
    pub const fn feature(&self) -> &'static str {
        match self {
            VlanOffload::Rx => "rx-vlan-offload",
            VlanOffload::Tx => "tx-vlan-offload",
        }
    }
}

/// Builds the `ethtool` command line disabling `offload` on `ifname`.
pub fn disable_offload_cmd(ifname: &str, offload: VlanOffload) -> String {
    format!(
        "{} -K {} {} off",
        ETHTOOL_CMD,
        shellquote(ifname),
        offload.feature()
    )
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a command through `/bin/sh -c`.
///
/// Returns `Err` only when the shell could not be spawned; a non-zero exit
/// is reported in the [`ExecResult`].
pub async fn exec(cmd: &str) -> Result<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| VlanRedirError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a command and turns a non-zero exit into
/// [`VlanRedirError::ShellCommandFailed`].
pub async fn exec_or_throw(cmd: &str) -> Result<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(VlanRedirError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
