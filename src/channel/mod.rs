//! Call Channel Client: the only code that talks to the qrexec call mechanism.
//!
//! One `invoke` is one cross-domain call. Payload is streamed in, stdout is
//! streamed out to the caller's sink, stderr is captured. A remote exit
//! status and a failure of the channel itself are reported separately.

pub mod qrexec;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{QopsError, TimeoutKind};

/// Run a shell command line read from stdin.
pub const VM_SHELL: &str = "qubes.VMShell";
/// Run an argv encoded in the service argument, without a shell.
pub const VM_EXEC: &str = "qubes.VMExec";
/// Block until the guest user session is up.
pub const WAIT_FOR_SESSION: &str = "qubes.WaitForSession";

/// The Qubes default user inside a qube.
pub const DEFAULT_USER: &str = "user";

pub const ROOT_USER: &str = "root";

/// Exit status of a call whose service or command is missing in the qube.
pub const NOT_FOUND_STATUS: i32 = 127;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub target: String,
    /// Full service descriptor, including a `+ARG` suffix if any.
    pub service: String,
    pub user: String,
    pub timeout: Duration,
}

impl CallRequest {
    pub fn new(target: &str, service: impl Into<String>, user: &str, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            service: service.into(),
            user: user.into(),
            timeout,
        }
    }
}

/// Why the channel itself failed, as opposed to the remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFault {
    /// Target not running, qrexec daemon unreachable, or call torn down.
    Unavailable(String),
    /// qrexec policy refused the call.
    PolicyDenied(String),
    TimedOut(Duration),
}

impl ChannelFault {
    pub fn into_error(self, qube: &str, operation: &str) -> QopsError {
        match self {
            ChannelFault::Unavailable(cause) => QopsError::ChannelUnavailable {
                qube: qube.into(),
                operation: operation.into(),
                cause,
            },
            ChannelFault::PolicyDenied(cause) => QopsError::PolicyDenied {
                qube: qube.into(),
                operation: operation.into(),
                cause,
            },
            ChannelFault::TimedOut(after) => QopsError::Timeout {
                qube: qube.into(),
                operation: operation.into(),
                kind: TimeoutKind::Call,
                secs: after.as_secs(),
            },
        }
    }
}

impl fmt::Display for ChannelFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelFault::Unavailable(cause) => write!(f, "channel unavailable: {cause}"),
            ChannelFault::PolicyDenied(cause) => write!(f, "policy denied: {cause}"),
            ChannelFault::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallExit {
    /// The remote service ran and exited with this status.
    Exited(i32),
    Failed(ChannelFault),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub exit: CallExit,
    /// Captured stderr, possibly partial when the channel failed.
    pub stderr: Vec<u8>,
}

impl CallOutcome {
    pub fn exited(status: i32, stderr: Vec<u8>) -> Self {
        Self {
            exit: CallExit::Exited(status),
            stderr,
        }
    }

    pub fn failed(fault: ChannelFault, stderr: Vec<u8>) -> Self {
        Self {
            exit: CallExit::Failed(fault),
            stderr,
        }
    }
}

#[async_trait]
pub trait CallChannel: Send + Sync {
    /// Issue one call. Stdout bytes already written to `stdout` stay there
    /// even when the outcome is a channel failure.
    async fn invoke(
        &self,
        request: &CallRequest,
        payload: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> CallOutcome;
}

// ── qubes.VMExec argument encoding ──────────────────────────────────

/// Encode an argv into a `qubes.VMExec` service argument.
///
/// Elements are joined with `+`. `[A-Za-z0-9_.]` pass through, `-` becomes
/// `--` and every other byte becomes `-HH`.
pub fn encode_vmexec_args<S: AsRef<[u8]>>(argv: &[S]) -> String {
    let mut out = String::new();
    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            out.push('+');
        }
        for &b in arg.as_ref() {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'.' => out.push(b as char),
                b'-' => out.push_str("--"),
                other => out.push_str(&format!("-{other:02X}")),
            }
        }
    }
    out
}

/// Service descriptor for running `argv` through `qubes.VMExec`.
pub fn vmexec_service<S: AsRef<[u8]>>(argv: &[S]) -> String {
    format!("{VM_EXEC}+{}", encode_vmexec_args(argv))
}
