use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};

use crate::config::ChannelConfig;
use crate::util::stderr_summary;

use super::{CallChannel, CallExit, CallOutcome, CallRequest, ChannelFault, DEFAULT_USER};

/// qrexec's exit status for a call refused by policy.
const POLICY_DENIED_STATUS: i32 = 126;

const FEED_CHUNK: usize = 64 * 1024;

/// Markers qvm-run/qrexec print when the call itself could not be made.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "is not running",
    "no such domain",
    "not found",
    "qrexec-daemon",
    "failed to connect",
];

/// Calls into qubes through `qvm-run --pass-io --service`.
pub struct QrexecChannel {
    program: String,
    /// Arguments placed before the qvm-run options (wrapper scripts).
    prefix_args: Vec<String>,
}

impl QrexecChannel {
    pub fn new(config: &ChannelConfig) -> Self {
        Self::with_program(&config.qvm_run, Vec::new())
    }

    pub fn with_program(program: &str, prefix_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args,
        }
    }

    fn command(&self, request: &CallRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args);
        cmd.args([
            "--pass-io",
            "--no-autostart",
            "--no-filter-escape-chars",
            "--no-color-output",
            "--no-color-stderr",
            "--service",
        ]);
        if request.user != DEFAULT_USER {
            cmd.args(["-u", request.user.as_str()]);
        }
        cmd.arg("--").arg(&request.target).arg(&request.service);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        request: &CallRequest,
        payload: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut Vec<u8>,
    ) -> Result<CallExit, ChannelFault> {
        let mut child = self.command(request).spawn().map_err(|e| {
            ChannelFault::Unavailable(format!("failed to spawn {}: {e}", self.program))
        })?;

        let (Some(mut child_in), Some(mut child_out), Some(mut child_err)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ChannelFault::Unavailable("qvm-run pipes not available".into()));
        };

        let target = request.target.as_str();
        let child_ref = &mut child;
        let feed = async move {
            let fed = feed_payload(payload, &mut child_in, target).await;
            if fed.is_err() {
                // Kill before stdin closes so the remote side never sees a
                // clean EOF after a truncated payload.
                let _ = child_ref.start_kill();
            }
            drop(child_in);
            fed
        };
        let drain_out = tokio::io::copy(&mut child_out, stdout);
        let drain_err = child_err.read_to_end(stderr);

        let (fed, drained, _) = tokio::join!(feed, drain_out, drain_err);

        if let Err(e) = fed {
            let _ = child.wait().await;
            return Err(ChannelFault::Unavailable(format!("reading payload: {e}")));
        }
        drained.map_err(|e| ChannelFault::Unavailable(format!("reading call output: {e}")))?;

        let status = child
            .wait()
            .await
            .map_err(|e| ChannelFault::Unavailable(format!("waiting for qvm-run: {e}")))?;

        match status.code() {
            Some(code) => Ok(classify(code, stderr)),
            None => Err(ChannelFault::Unavailable(
                "qvm-run terminated by signal".into(),
            )),
        }
    }
}

/// Copy `payload` into the child's stdin.
///
/// Only a failure to read the local payload is an error. A write failure
/// means the remote side stopped reading, and its exit status decides.
async fn feed_payload(
    payload: &mut (dyn AsyncRead + Send + Unpin),
    child_in: &mut ChildStdin,
    target: &str,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; FEED_CHUNK];
    loop {
        let n = payload.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if let Err(e) = child_in.write_all(&buf[..n]).await {
            tracing::debug!(qube = target, error = %e, "payload not fully consumed");
            return Ok(());
        }
    }
}

/// Lines qrexec or qvm-run print themselves, as opposed to the remote
/// command's stderr passed through.
fn channel_lines(stderr: &[u8]) -> impl Iterator<Item = String> + '_ {
    stderr
        .split(|&b| b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim().to_ascii_lowercase())
        .filter(|line| {
            line == "request refused" || line.starts_with("qvm-run:") || line.starts_with("qrexec")
        })
}

/// Tell a refused or failed call apart from the remote command's own exit.
fn classify(code: i32, stderr: &[u8]) -> CallExit {
    if code == 0 {
        return CallExit::Exited(0);
    }
    if code == POLICY_DENIED_STATUS
        && channel_lines(stderr).any(|line| line.contains("request refused"))
    {
        return CallExit::Failed(ChannelFault::PolicyDenied(stderr_summary(stderr)));
    }
    if channel_lines(stderr).any(|line| UNAVAILABLE_MARKERS.iter().any(|m| line.contains(m))) {
        return CallExit::Failed(ChannelFault::Unavailable(stderr_summary(stderr)));
    }
    CallExit::Exited(code)
}

#[async_trait]
impl CallChannel for QrexecChannel {
    async fn invoke(
        &self,
        request: &CallRequest,
        payload: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> CallOutcome {
        tracing::debug!(
            qube = %request.target,
            service = %request.service,
            user = %request.user,
            "qrexec call"
        );

        let mut stderr = Vec::new();
        let result = tokio::time::timeout(
            request.timeout,
            self.run(request, payload, stdout, &mut stderr),
        )
        .await;

        let exit = match result {
            Ok(Ok(exit)) => exit,
            Ok(Err(fault)) => CallExit::Failed(fault),
            Err(_) => {
                // The child is killed when the timed-out future is dropped.
                tracing::warn!(
                    qube = %request.target,
                    service = %request.service,
                    timeout_secs = request.timeout.as_secs(),
                    "qrexec call timed out"
                );
                CallExit::Failed(ChannelFault::TimedOut(request.timeout))
            }
        };

        if let CallExit::Failed(fault) = &exit {
            tracing::debug!(qube = %request.target, %fault, "qrexec call failed");
        }
        CallOutcome { exit, stderr }
    }
}
