//! Execution Transport: connect, run commands and move files inside a qube.
//!
//! Commands go through `qubes.VMShell` with the command line on stdin.
//! Files go through `qubes.VMExec` with the remote path carried as an
//! encoded argv element, so no path ever reaches a shell.

use std::io::{Cursor, SeekFrom};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, AsyncWrite};
use tokio::time::{Instant, sleep};

use crate::admin::AdminApi;
use crate::channel::{
    CallChannel, CallExit, CallOutcome, CallRequest, ChannelFault, NOT_FOUND_STATUS, ROOT_USER,
    VM_SHELL, WAIT_FOR_SESSION, vmexec_service,
};
use crate::config::Config;
use crate::error::{QopsError, TimeoutKind};
use crate::qube::{PowerState, validate_qube_name};
use crate::reconcile::Reconciler;
use crate::util::stderr_summary;

/// Exit status reported when the call channel itself failed.
pub const CHANNEL_FAILURE_STATUS: i32 = 255;

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// User to run as inside the qube. Defaults to `connect.default_user`.
    pub user: Option<String>,
    /// Overrides `connect.auto_start`.
    pub auto_start: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSession {
    qube: String,
    user: String,
    open: bool,
}

impl ExecutionSession {
    pub fn qube(&self) -> &str {
        &self.qube
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The call channel failed; `status` is `CHANNEL_FAILURE_STATUS` and the
    /// streams hold whatever arrived before the failure.
    pub channel_failed: bool,
    pub fault: Option<ChannelFault>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        !self.channel_failed && self.status == 0
    }

    /// Turn a channel failure into its error; remote exits pass through.
    pub fn into_result(self, qube: &str) -> Result<Self, QopsError> {
        match self.fault {
            Some(fault) => Err(fault.into_error(qube, "exec")),
            None => Ok(self),
        }
    }
}

/// The lifecycle an automation engine drives a remote-execution transport
/// through.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(
        &self,
        qube: &str,
        options: &ConnectOptions,
    ) -> Result<ExecutionSession, QopsError>;

    /// Run `command` through the qube's shell. A non-zero remote exit is a
    /// successful call; only argument errors return `Err`.
    async fn exec_command(
        &self,
        session: &ExecutionSession,
        command: &str,
        env: &[(String, String)],
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult, QopsError>;

    async fn put_file(
        &self,
        session: &ExecutionSession,
        data: &[u8],
        remote_path: &str,
    ) -> Result<(), QopsError>;

    async fn fetch_file(
        &self,
        session: &ExecutionSession,
        remote_path: &str,
    ) -> Result<Vec<u8>, QopsError>;

    /// Idempotent.
    async fn close(&self, session: &mut ExecutionSession);
}

pub struct QubesTransport<C, A> {
    channel: C,
    reconciler: Reconciler<A>,
    auto_start: bool,
    wait_for_session: bool,
    retries: u32,
    backoff: Duration,
    connect_timeout: Duration,
    call_timeout: Duration,
    default_user: String,
}

impl<C: CallChannel, A: AdminApi> QubesTransport<C, A> {
    pub fn new(channel: C, reconciler: Reconciler<A>, config: &Config) -> Self {
        Self {
            channel,
            reconciler,
            auto_start: config.connect.auto_start,
            wait_for_session: config.connect.wait_for_session,
            retries: config.connect.retries,
            backoff: config.connect_backoff(),
            connect_timeout: config.connect_timeout(),
            call_timeout: config.call_timeout(),
            default_user: config.connect.default_user.clone(),
        }
    }

    /// `connect`, abandoned with `Timeout(Deadline)` at `deadline`.
    pub async fn connect_until(
        &self,
        qube: &str,
        options: &ConnectOptions,
        deadline: Instant,
    ) -> Result<ExecutionSession, QopsError> {
        let started = Instant::now();
        match tokio::time::timeout_at(deadline, self.connect(qube, options)).await {
            Ok(result) => result,
            Err(_) => Err(QopsError::Timeout {
                qube: qube.into(),
                operation: "connect".into(),
                kind: TimeoutKind::Deadline,
                secs: started.elapsed().as_secs(),
            }),
        }
    }

    /// Stream `reader` into `remote_path`, replacing any existing file.
    ///
    /// Writes as root first so root-owned paths work. If root execution is
    /// unavailable in the qube (exit 127), the reader is rewound and the
    /// write retried as the session user.
    pub async fn put_file_from<R>(
        &self,
        session: &ExecutionSession,
        reader: &mut R,
        remote_path: &str,
    ) -> Result<(), QopsError>
    where
        R: AsyncRead + AsyncSeek + Send + Unpin,
    {
        ensure_open(session)?;
        validate_remote_path(remote_path)?;

        let start = reader
            .stream_position()
            .await
            .map_err(|source| rewind_error(remote_path, source))?;
        tracing::debug!(qube = %session.qube, path = remote_path, "put file");

        let mut outcome = self.write_as(session, ROOT_USER, &mut *reader, remote_path).await;
        if outcome.exit == CallExit::Exited(NOT_FOUND_STATUS) && session.user != ROOT_USER {
            tracing::debug!(
                qube = %session.qube,
                user = %session.user,
                "root write unavailable, retrying as session user"
            );
            reader
                .seek(SeekFrom::Start(start))
                .await
                .map_err(|source| rewind_error(remote_path, source))?;
            outcome = self
                .write_as(session, &session.user, &mut *reader, remote_path)
                .await;
        }
        transfer_result(session, "put_file", remote_path, outcome.exit, &outcome.stderr)
    }

    async fn write_as<R>(
        &self,
        session: &ExecutionSession,
        user: &str,
        reader: &mut R,
        remote_path: &str,
    ) -> CallOutcome
    where
        R: AsyncRead + Send + Unpin,
    {
        let of = format!("of={remote_path}");
        let service = vmexec_service(&["dd", "status=none", of.as_str()]);
        let request = CallRequest::new(&session.qube, service, user, self.call_timeout);
        let mut sink = tokio::io::sink();
        self.channel.invoke(&request, &mut *reader, &mut sink).await
    }

    /// Stream `remote_path` into `writer`.
    pub async fn fetch_file_to(
        &self,
        session: &ExecutionSession,
        remote_path: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), QopsError> {
        ensure_open(session)?;
        validate_remote_path(remote_path)?;

        let request = self.request(session, vmexec_service(&["cat", "--", remote_path]));
        tracing::debug!(qube = %session.qube, path = remote_path, "fetch file");

        let mut empty: &[u8] = b"";
        let outcome = self.channel.invoke(&request, &mut empty, writer).await;
        transfer_result(session, "fetch_file", remote_path, outcome.exit, &outcome.stderr)
    }

    fn request(&self, session: &ExecutionSession, service: String) -> CallRequest {
        CallRequest::new(&session.qube, service, &session.user, self.call_timeout)
    }

    /// Wait for `qube` to be running, starting it if allowed.
    async fn connect_once(&self, qube: &str, auto_start: bool) -> Result<(), QopsError> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut start_requested = false;

        loop {
            match self.reconciler.admin().power_state(qube).await? {
                None => {
                    return Err(QopsError::TargetNotFound {
                        qube: qube.into(),
                        operation: "connect".into(),
                    });
                }
                Some(PowerState::Running) => break,
                Some(PowerState::Halted | PowerState::Paused) if !auto_start => {
                    return Err(QopsError::TargetNotRunning {
                        qube: qube.into(),
                        operation: "connect".into(),
                    });
                }
                Some(PowerState::Halted | PowerState::Paused) if !start_requested => {
                    self.reconciler.start(qube).await?;
                    start_requested = true;
                }
                Some(state) => {
                    tracing::debug!(qube, %state, "waiting for qube to run");
                }
            }
            if Instant::now() >= deadline {
                return Err(connect_timeout(qube, self.connect_timeout));
            }
            sleep(self.reconciler.poll_interval()).await;
        }

        if self.wait_for_session {
            self.await_session(qube, deadline).await?;
        }
        Ok(())
    }

    async fn await_session(&self, qube: &str, deadline: Instant) -> Result<(), QopsError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let request = CallRequest::new(qube, WAIT_FOR_SESSION, &self.default_user, remaining);
        tracing::debug!(qube, "waiting for guest session");

        let mut empty: &[u8] = b"";
        let mut sink = tokio::io::sink();
        let outcome = self.channel.invoke(&request, &mut empty, &mut sink).await;
        match outcome.exit {
            CallExit::Exited(0) => Ok(()),
            CallExit::Exited(code) => Err(QopsError::ChannelUnavailable {
                qube: qube.into(),
                operation: "connect".into(),
                cause: format!(
                    "{WAIT_FOR_SESSION} exited with {code}: {}",
                    stderr_summary(&outcome.stderr)
                ),
            }),
            CallExit::Failed(ChannelFault::TimedOut(_)) => {
                Err(connect_timeout(qube, self.connect_timeout))
            }
            CallExit::Failed(fault) => Err(fault.into_error(qube, "connect")),
        }
    }
}

#[async_trait]
impl<C: CallChannel, A: AdminApi> Connection for QubesTransport<C, A> {
    async fn connect(
        &self,
        qube: &str,
        options: &ConnectOptions,
    ) -> Result<ExecutionSession, QopsError> {
        validate_qube_name(qube)?;
        let auto_start = options.auto_start.unwrap_or(self.auto_start);

        let mut attempt = 1;
        loop {
            match self.connect_once(qube, auto_start).await {
                Ok(()) => break,
                Err(e) if e.is_timeout() && attempt <= self.retries => {
                    let backoff = self.backoff * attempt;
                    tracing::warn!(
                        qube,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "connect timed out, retrying"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let user = options
            .user
            .clone()
            .unwrap_or_else(|| self.default_user.clone());
        tracing::info!(qube, user = %user, "connected");
        Ok(ExecutionSession {
            qube: qube.into(),
            user,
            open: true,
        })
    }

    async fn exec_command(
        &self,
        session: &ExecutionSession,
        command: &str,
        env: &[(String, String)],
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult, QopsError> {
        ensure_open(session)?;
        let payload = shell_payload(command, env, stdin)?;
        let request = self.request(session, VM_SHELL.to_string());
        tracing::debug!(qube = %session.qube, user = %session.user, command, "exec");

        let mut reader = payload.as_slice();
        let mut stdout = Vec::new();
        let outcome = self.channel.invoke(&request, &mut reader, &mut stdout).await;

        Ok(match outcome.exit {
            CallExit::Exited(status) => {
                tracing::debug!(qube = %session.qube, status, "command exited");
                CommandResult {
                    status,
                    stdout,
                    stderr: outcome.stderr,
                    channel_failed: false,
                    fault: None,
                }
            }
            CallExit::Failed(fault) => {
                tracing::warn!(qube = %session.qube, %fault, "command channel failed");
                CommandResult {
                    status: CHANNEL_FAILURE_STATUS,
                    stdout,
                    stderr: outcome.stderr,
                    channel_failed: true,
                    fault: Some(fault),
                }
            }
        })
    }

    async fn put_file(
        &self,
        session: &ExecutionSession,
        data: &[u8],
        remote_path: &str,
    ) -> Result<(), QopsError> {
        let mut reader = Cursor::new(data);
        self.put_file_from(session, &mut reader, remote_path).await
    }

    async fn fetch_file(
        &self,
        session: &ExecutionSession,
        remote_path: &str,
    ) -> Result<Vec<u8>, QopsError> {
        let mut content = Vec::new();
        self.fetch_file_to(session, remote_path, &mut content)
            .await?;
        Ok(content)
    }

    async fn close(&self, session: &mut ExecutionSession) {
        if session.open {
            tracing::debug!(qube = %session.qube, "session closed");
            session.open = false;
        }
    }
}

fn ensure_open(session: &ExecutionSession) -> Result<(), QopsError> {
    if session.open {
        Ok(())
    } else {
        Err(QopsError::SessionClosed {
            qube: session.qube.clone(),
        })
    }
}

fn connect_timeout(qube: &str, after: Duration) -> QopsError {
    QopsError::Timeout {
        qube: qube.into(),
        operation: "connect".into(),
        kind: TimeoutKind::Connect,
        secs: after.as_secs(),
    }
}

fn rewind_error(path: &str, source: std::io::Error) -> QopsError {
    QopsError::Io {
        context: format!("rewinding upload source for {path}"),
        source,
    }
}

fn transfer_result(
    session: &ExecutionSession,
    operation: &str,
    path: &str,
    exit: CallExit,
    stderr: &[u8],
) -> Result<(), QopsError> {
    match exit {
        CallExit::Exited(0) => Ok(()),
        CallExit::Exited(status) => Err(QopsError::TransferFailed {
            qube: session.qube.clone(),
            operation: operation.into(),
            path: path.into(),
            status,
            stderr: stderr_summary(stderr),
        }),
        CallExit::Failed(fault) => Err(fault.into_error(&session.qube, operation)),
    }
}

// ── payloads and argument safety ────────────────────────────────────

/// Command line for `qubes.VMShell`: exports, the command, then stdin.
fn shell_payload(
    command: &str,
    env: &[(String, String)],
    stdin: Option<&[u8]>,
) -> Result<Vec<u8>, QopsError> {
    let mut script = String::new();
    for (key, value) in env {
        validate_env_key(key)?;
        script.push_str(&format!("export {key}={}\n", shell_quote(value)));
    }
    script.push_str(command);
    script.push('\n');

    let mut payload = script.into_bytes();
    if let Some(input) = stdin {
        payload.extend_from_slice(input);
    }
    Ok(payload)
}

fn validate_env_key(key: &str) -> Result<(), QopsError> {
    let valid = key.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(QopsError::InvalidValue {
            field: "env".into(),
            message: format!("'{key}' is not a valid environment variable name"),
        });
    }
    Ok(())
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Remote paths must be absolute, free of control characters and `..`.
pub fn validate_remote_path(path: &str) -> Result<(), QopsError> {
    let reason = if !path.starts_with('/') {
        Some("path must be absolute")
    } else if path.chars().any(|c| c.is_control()) {
        Some("path contains control characters")
    } else if path.split('/').any(|part| part == "..") {
        Some("path must not contain '..'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(QopsError::InvalidPath {
            path: path.escape_debug().to_string(),
            reason: reason.into(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::VM_EXEC;
    use crate::qube::QubeClass;
    use crate::testing::FakeHost;

    fn transport_with(host: &FakeHost, config: &Config) -> QubesTransport<FakeHost, FakeHost> {
        let reconciler = Reconciler::new(host.clone(), config).unwrap();
        QubesTransport::new(host.clone(), reconciler, config)
    }

    fn transport(host: &FakeHost) -> QubesTransport<FakeHost, FakeHost> {
        transport_with(host, &Config::default())
    }

    fn running_work() -> FakeHost {
        FakeHost::new().with_qube("work", QubeClass::AppVM, PowerState::Running)
    }

    async fn session(t: &QubesTransport<FakeHost, FakeHost>) -> ExecutionSession {
        t.connect("work", &ConnectOptions::default()).await.unwrap()
    }

    // ── connect ──

    #[tokio::test]
    async fn connect_to_running_qube() {
        let host = running_work();
        let s = session(&transport(&host)).await;
        assert_eq!(s.qube(), "work");
        assert_eq!(s.user(), "user");
        assert!(s.is_open());
        assert!(host.mutations().is_empty());
    }

    #[tokio::test]
    async fn connect_to_missing_qube_is_not_found() {
        let host = FakeHost::new();
        let err = transport(&host)
            .connect("ghost", &ConnectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TargetNotFound");
    }

    #[tokio::test]
    async fn halted_qube_without_auto_start_is_not_running() {
        let host = FakeHost::new().with_qube("work", QubeClass::AppVM, PowerState::Halted);
        let options = ConnectOptions {
            auto_start: Some(false),
            ..Default::default()
        };
        let err = transport(&host).connect("work", &options).await.unwrap_err();
        assert_eq!(err.kind(), "TargetNotRunning");
        assert!(host.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn halted_qube_is_auto_started() {
        let host = FakeHost::new().with_qube("work", QubeClass::AppVM, PowerState::Halted);
        let s = session(&transport(&host)).await;
        assert!(s.is_open());
        assert_eq!(host.mutations(), ["start work"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_transient_qube_times_out() {
        let host = FakeHost::new().with_qube("work", QubeClass::AppVM, PowerState::Transient);
        let mut config = Config::default();
        config.timeouts.connect_secs = 5;
        config.connect.retries = 2;
        let t = transport_with(&host, &config);

        let started = Instant::now();
        let err = t
            .connect("work", &ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QopsError::Timeout {
                kind: TimeoutKind::Connect,
                ..
            }
        ));
        // Three attempts of 5s plus 2s and 4s of backoff.
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_deadline_cuts_retries_short() {
        let host = FakeHost::new().with_qube("work", QubeClass::AppVM, PowerState::Transient);
        let t = transport(&host);
        let deadline = Instant::now() + Duration::from_secs(3);
        let err = t
            .connect_until("work", &ConnectOptions::default(), deadline)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QopsError::Timeout {
                kind: TimeoutKind::Deadline,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn session_wait_is_optional() {
        let host = running_work();
        session(&transport(&host)).await;
        assert!(host.calls().is_empty());

        let mut config = Config::default();
        config.connect.wait_for_session = true;
        session(&transport_with(&host, &config)).await;
        let calls = host.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].service, WAIT_FOR_SESSION);
    }

    // ── exec ──

    #[tokio::test]
    async fn remote_exit_status_is_not_a_channel_failure() {
        let host = running_work();
        host.on_shell(|_, _| (3, b"out".to_vec(), b"err".to_vec()));
        let t = transport(&host);
        let s = session(&t).await;

        let result = t.exec_command(&s, "false", &[], None).await.unwrap();
        assert_eq!(result.status, 3);
        assert!(!result.channel_failed);
        assert_eq!(result.stdout, b"out");
        assert_eq!(result.stderr, b"err");
        assert!(result.into_result("work").is_ok());
    }

    #[tokio::test]
    async fn channel_failure_is_flagged_with_partial_output() {
        let host = running_work();
        let t = transport(&host);
        let s = session(&t).await;
        host.fail_channel(ChannelFault::Unavailable("connection lost".into()), b"partial");

        let result = t.exec_command(&s, "true", &[], None).await.unwrap();
        assert!(result.channel_failed);
        assert_eq!(result.status, CHANNEL_FAILURE_STATUS);
        assert_eq!(result.stdout, b"partial");
        let err = result.into_result("work").unwrap_err();
        assert_eq!(err.kind(), "ChannelUnavailable");
    }

    #[tokio::test]
    async fn env_and_stdin_are_framed_into_the_shell_payload() {
        let host = running_work();
        host.on_shell(|_, payload| (0, payload.to_vec(), Vec::new()));
        let t = transport(&host);
        let s = session(&t).await;

        let env = vec![("GREETING".to_string(), "it's $HOME".to_string())];
        let result = t
            .exec_command(&s, "cat", &env, Some(b"input\0bytes"))
            .await
            .unwrap();
        assert_eq!(
            result.stdout,
            b"export GREETING='it'\\''s $HOME'\ncat\ninput\0bytes"
        );
    }

    #[tokio::test]
    async fn bad_env_key_is_rejected_before_any_call() {
        let host = running_work();
        let t = transport(&host);
        let s = session(&t).await;

        let env = vec![("A;rm".to_string(), "x".to_string())];
        let err = t.exec_command(&s, "true", &env, None).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidValue");
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn session_user_is_passed_to_calls() {
        let host = running_work();
        let t = transport(&host);
        let options = ConnectOptions {
            user: Some("root".into()),
            ..Default::default()
        };
        let s = t.connect("work", &options).await.unwrap();
        t.exec_command(&s, "id", &[], None).await.unwrap();
        assert_eq!(host.calls()[0].user, "root");
        assert_eq!(host.calls()[0].service, VM_SHELL);
    }

    #[tokio::test]
    async fn closed_session_refuses_work_and_close_is_idempotent() {
        let host = running_work();
        let t = transport(&host);
        let mut s = session(&t).await;

        t.close(&mut s).await;
        t.close(&mut s).await;
        assert!(!s.is_open());
        let err = t.exec_command(&s, "true", &[], None).await.unwrap_err();
        assert_eq!(err.kind(), "SessionClosed");
    }

    // ── files ──

    #[tokio::test]
    async fn put_then_fetch_is_byte_exact() {
        let host = running_work();
        let t = transport(&host);
        let s = session(&t).await;

        let binary: Vec<u8> = (0..=255u8).rev().cycle().take(4096).collect();
        let payloads: [&[u8]; 3] = [&binary, b"", b"$(rm -rf /); `id` 'x' \"y\"\n"];
        for payload in payloads {
            t.put_file(&s, payload, "/home/user/data.bin").await.unwrap();
            let fetched = t.fetch_file(&s, "/home/user/data.bin").await.unwrap();
            assert_eq!(fetched, payload);
        }
    }

    #[tokio::test]
    async fn metacharacters_in_path_stay_one_argument() {
        let host = running_work();
        let t = transport(&host);
        let s = session(&t).await;

        let path = "/tmp/a b;touch x";
        t.put_file(&s, b"data", path).await.unwrap();
        assert_eq!(host.file("work", path).unwrap(), b"data");

        let service = &host.calls()[0].service;
        assert!(service.starts_with(VM_EXEC));
        assert!(!service.contains(' '));
        assert!(!service.contains(';'));
    }

    #[tokio::test]
    async fn put_writes_as_root_first() {
        let host = running_work();
        let t = transport(&host);
        let s = session(&t).await;

        t.put_file(&s, b"nameserver 10.139.1.1\n", "/etc/resolv.conf")
            .await
            .unwrap();
        let users: Vec<_> = host.calls().into_iter().map(|c| c.user).collect();
        assert_eq!(users, ["root"]);
    }

    #[tokio::test]
    async fn put_retries_as_session_user_without_root() {
        let host = running_work();
        host.without_root("work");
        let t = transport(&host);
        let s = session(&t).await;

        t.put_file(&s, b"payload", "/home/user/notes").await.unwrap();
        let users: Vec<_> = host.calls().into_iter().map(|c| c.user).collect();
        assert_eq!(users, ["root", "user"]);
        assert_eq!(host.file("work", "/home/user/notes").unwrap(), b"payload");
    }

    #[tokio::test]
    async fn root_session_does_not_retry_a_missing_root() {
        let host = running_work();
        host.without_root("work");
        let t = transport(&host);
        let options = ConnectOptions {
            user: Some("root".into()),
            ..Default::default()
        };
        let s = t.connect("work", &options).await.unwrap();

        let err = t.put_file(&s, b"x", "/etc/x").await.unwrap_err();
        assert!(matches!(err, QopsError::TransferFailed { status: 127, .. }));
        assert_eq!(host.calls().len(), 1);
    }

    #[tokio::test]
    async fn unsafe_paths_are_rejected_before_any_call() {
        let host = running_work();
        let t = transport(&host);
        let s = session(&t).await;

        for path in ["relative/file", "/tmp/../etc/shadow", "/tmp/a\nb", ""] {
            let err = t.put_file(&s, b"x", path).await.unwrap_err();
            assert_eq!(err.kind(), "InvalidPath", "{path:?}");
        }
        assert!(t.fetch_file(&s, "../x").await.is_err());
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn fetching_missing_file_is_transfer_failure() {
        let host = running_work();
        let t = transport(&host);
        let s = session(&t).await;

        let err = t.fetch_file(&s, "/nope").await.unwrap_err();
        match err {
            QopsError::TransferFailed { status, stderr, .. } => {
                assert_eq!(status, 1);
                assert!(stderr.contains("No such file"));
            }
            other => panic!("expected TransferFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transfer_to_halted_qube_is_channel_unavailable() {
        let host = running_work();
        let t = transport(&host);
        let s = session(&t).await;
        host.set_power("work", PowerState::Halted);

        let err = t.put_file(&s, b"x", "/tmp/x").await.unwrap_err();
        assert_eq!(err.kind(), "ChannelUnavailable");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
