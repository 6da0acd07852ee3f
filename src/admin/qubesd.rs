use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::Config;
use crate::error::{QopsError, TimeoutKind};
use crate::property::{Property, PropertyValue};
use crate::qube::{ObservedState, PowerState, QubeClass};
use crate::util::stderr_summary;

use super::{AdminApi, CreateRequest, PowerAction, QubeSummary};

/// How requests reach qubesd.
#[derive(Debug, Clone)]
enum Route {
    /// `qubesd-query -c SOCKET dom0 METHOD DEST [ARG]`, from dom0.
    Socket { program: String, socket: String },
    /// `qrexec-client-vm DEST METHOD[+ARG]`, from a management qube.
    Qrexec { program: String },
}

/// Admin API client speaking the qubesd request/response protocol.
pub struct QubesdAdmin {
    route: Route,
    timeout: Duration,
}

impl QubesdAdmin {
    pub fn new(config: &Config) -> Self {
        let route = match config.admin.mode.as_str() {
            "qrexec" => Route::Qrexec {
                program: config.admin.qrexec_client_vm.clone(),
            },
            _ => Route::Socket {
                program: config.admin.qubesd_query.clone(),
                socket: config.admin.socket.clone(),
            },
        };
        Self {
            route,
            timeout: config.call_timeout(),
        }
    }

    fn command(&self, method: &str, dest: &str, arg: Option<&str>) -> Command {
        let mut cmd = match &self.route {
            Route::Socket { program, socket } => {
                let mut cmd = Command::new(program);
                cmd.args(["-c", socket.as_str(), "dom0", method, dest]);
                if let Some(arg) = arg {
                    cmd.arg(arg);
                }
                cmd
            }
            Route::Qrexec { program } => {
                let service = match arg {
                    Some(arg) => format!("{method}+{arg}"),
                    None => method.to_string(),
                };
                let mut cmd = Command::new(program);
                cmd.args([dest, service.as_str()]);
                cmd
            }
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Issue one request and return the success body.
    async fn call(
        &self,
        method: &str,
        dest: &str,
        arg: Option<&str>,
        payload: &[u8],
    ) -> Result<Vec<u8>, QopsError> {
        tracing::debug!(method, dest, arg = arg.unwrap_or(""), "admin call");

        let unavailable = |cause: String| QopsError::ChannelUnavailable {
            qube: dest.to_string(),
            operation: method.to_string(),
            cause,
        };

        let exchange = async {
            let mut child = self
                .command(method, dest, arg)
                .spawn()
                .map_err(|e| unavailable(format!("failed to reach qubesd: {e}")))?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(payload)
                    .await
                    .map_err(|e| unavailable(format!("sending request: {e}")))?;
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| unavailable(format!("reading response: {e}")))
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| QopsError::Timeout {
                qube: dest.to_string(),
                operation: method.to_string(),
                kind: TimeoutKind::Call,
                secs: self.timeout.as_secs(),
            })??;

        if output.stdout.is_empty() {
            let cause = stderr_summary(&output.stderr);
            if cause.to_ascii_lowercase().contains("request refused") {
                return Err(QopsError::PolicyDenied {
                    qube: dest.to_string(),
                    operation: method.to_string(),
                    cause,
                });
            }
            return Err(unavailable(format!(
                "empty response (exit {:?}): {cause}",
                output.status.code()
            )));
        }

        parse_response(method, dest, &output.stdout)
    }

    async fn call_text(
        &self,
        method: &str,
        dest: &str,
        arg: Option<&str>,
    ) -> Result<String, QopsError> {
        let body = self.call(method, dest, arg, b"").await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl AdminApi for QubesdAdmin {
    async fn list(&self) -> Result<Vec<QubeSummary>, QopsError> {
        let body = self.call_text("admin.vm.List", "dom0", None).await?;
        Ok(parse_list(&body))
    }

    async fn get_properties(&self, name: &str) -> Result<Option<ObservedState>, QopsError> {
        let Some(summary) = self.list().await?.into_iter().find(|q| q.name == name) else {
            return Ok(None);
        };

        let body = self
            .call_text("admin.vm.property.GetAll", name, None)
            .await?;

        let mut properties = BTreeMap::new();
        for (prop_name, raw) in parse_property_lines(&body) {
            // Properties outside the known set are not observed at all.
            let Ok(property) = prop_name.parse::<Property>() else {
                continue;
            };
            properties.insert(property, property.parse_observed(&raw)?);
        }

        Ok(Some(ObservedState {
            name: summary.name,
            class: summary.class,
            power: summary.power,
            properties,
        }))
    }

    async fn set_property(
        &self,
        name: &str,
        property: Property,
        value: &PropertyValue,
    ) -> Result<(), QopsError> {
        tracing::info!(qube = name, field = %property, %value, "setting property");
        self.call(
            "admin.vm.property.Set",
            name,
            Some(property.name()),
            value.to_wire().as_bytes(),
        )
        .await?;
        Ok(())
    }

    async fn create(&self, request: &CreateRequest) -> Result<(), QopsError> {
        tracing::info!(
            qube = %request.name,
            class = %request.class,
            template = request.template.as_deref().unwrap_or(""),
            "creating qube"
        );
        let method = format!("admin.vm.Create.{}", request.class);
        let payload = format!("name={} label={}", request.name, request.label);
        self.call(
            &method,
            "dom0",
            request.template.as_deref(),
            payload.as_bytes(),
        )
        .await
        .map_err(|e| retarget(e, &request.name))?;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<(), QopsError> {
        tracing::info!(qube = name, "removing qube");
        self.call("admin.vm.Remove", name, None, b"").await?;
        Ok(())
    }

    async fn set_power_state(&self, name: &str, action: PowerAction) -> Result<(), QopsError> {
        tracing::info!(qube = name, %action, "power action");
        self.call(action.method(), name, None, b"").await?;
        Ok(())
    }
}

/// Errors from a create call are addressed to dom0; name the new qube instead.
fn retarget(err: QopsError, qube: &str) -> QopsError {
    match err {
        QopsError::AdminApi {
            method,
            exception,
            message,
            ..
        } => QopsError::AdminApi {
            qube: qube.into(),
            method,
            exception,
            message,
        },
        other => other,
    }
}

// ── wire format ─────────────────────────────────────────────────────

/// Split a qubesd response into its success body or a mapped error.
///
/// Success is `0\0<body>`; failure is
/// `2\0<exception type>\0<traceback>\0<message>\0`.
pub fn parse_response(method: &str, qube: &str, raw: &[u8]) -> Result<Vec<u8>, QopsError> {
    if let Some(body) = raw.strip_prefix(b"0\0") {
        return Ok(body.to_vec());
    }

    if let Some(rest) = raw.strip_prefix(b"2\0") {
        let mut parts = rest.split(|b| *b == 0);
        let exception = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
        let _traceback = parts.next();
        let message = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
        return Err(map_exception(method, qube, exception, message));
    }

    Err(QopsError::AdminApi {
        qube: qube.into(),
        method: method.into(),
        exception: "ProtocolError".into(),
        message: format!("malformed response: {}", stderr_summary(raw)),
    })
}

fn map_exception(method: &str, qube: &str, exception: String, message: String) -> QopsError {
    let qube = qube.to_string();
    let operation = method.to_string();
    match exception.as_str() {
        "QubesVMNotFoundError" => QopsError::TargetNotFound { qube, operation },
        "QubesVMNotHaltedError" => QopsError::Busy {
            qube,
            operation,
            cause: message,
        },
        "QubesVMNotStartedError" | "QubesVMNotRunningError" => {
            QopsError::TargetNotRunning { qube, operation }
        }
        "PermissionDenied" => QopsError::PolicyDenied {
            qube,
            operation,
            cause: message,
        },
        _ => QopsError::AdminApi {
            qube,
            method: operation,
            exception,
            message,
        },
    }
}

/// Parse `admin.vm.List` lines: `NAME class=CLASS state=STATE`.
pub fn parse_list(body: &str) -> Vec<QubeSummary> {
    body.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let name = tokens.next()?;
            let mut class = None;
            let mut power = None;
            for token in tokens {
                if let Some(c) = token.strip_prefix("class=") {
                    class = c.parse::<QubeClass>().ok();
                } else if let Some(s) = token.strip_prefix("state=") {
                    power = PowerState::from_qubesd(s);
                }
            }
            let (Some(class), Some(power)) = (class, power) else {
                tracing::debug!(line, "skipping unparseable admin.vm.List line");
                return None;
            };
            Some(QubeSummary {
                name: name.to_string(),
                class,
                power,
            })
        })
        .collect()
}

/// Parse `admin.vm.property.GetAll` lines:
/// `NAME default=BOOL type=TYPE VALUE`, value escaped.
pub fn parse_property_lines(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, ' ');
            let name = parts.next()?;
            let default = parts.next()?;
            let ty = parts.next()?;
            if !default.starts_with("default=") || !ty.starts_with("type=") {
                return None;
            }
            let value = parts.next().unwrap_or("");
            Some((name.to_string(), unescape(value)))
        })
        .collect()
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
