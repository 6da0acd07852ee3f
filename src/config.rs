use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use facet::Facet;

use crate::diff::PreconditionTable;
use crate::error::QopsError;
use crate::paths;
use crate::property::LABELS;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub timeouts: TimeoutsConfig,
    #[facet(default)]
    pub connect: ConnectConfig,
    #[facet(default)]
    pub channel: ChannelConfig,
    #[facet(default)]
    pub admin: AdminConfig,
    #[facet(default)]
    pub reconcile: ReconcileConfig,
    /// Property name -> `live` | `requires-halted` | `immutable`.
    #[facet(default)]
    pub preconditions: BTreeMap<String, String>,
    #[facet(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct TimeoutsConfig {
    #[facet(default = 120)]
    pub connect_secs: u64,
    #[facet(default = 120)]
    pub shutdown_secs: u64,
    #[facet(default = 60)]
    pub verify_secs: u64,
    /// Upper bound for one qrexec call. First-boot services can be slow.
    #[facet(default = 600)]
    pub call_secs: u64,
    #[facet(default = 500)]
    pub poll_interval_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_secs: 120,
            shutdown_secs: 120,
            verify_secs: 60,
            call_secs: 600,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ConnectConfig {
    #[facet(default = true)]
    pub auto_start: bool,
    /// Also wait for the guest session (`qubes.WaitForSession`), not just
    /// for the `Running` power state.
    #[facet(default)]
    pub wait_for_session: bool,
    #[facet(default = 3)]
    pub retries: u32,
    #[facet(default = 2)]
    pub backoff_secs: u64,
    #[facet(default = "user")]
    pub default_user: String,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            wait_for_session: false,
            retries: 3,
            backoff_secs: 2,
            default_user: "user".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ChannelConfig {
    #[facet(default = "qvm-run")]
    pub qvm_run: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            qvm_run: "qvm-run".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct AdminConfig {
    /// `dom0` talks to the qubesd socket directly; `qrexec` goes through
    /// `qrexec-client-vm` from a management qube.
    #[facet(default = "dom0")]
    pub mode: String,
    #[facet(default = "/var/run/qubesd.sock")]
    pub socket: String,
    #[facet(default = "qubesd-query")]
    pub qubesd_query: String,
    #[facet(default = "qrexec-client-vm")]
    pub qrexec_client_vm: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            mode: "dom0".into(),
            socket: "/var/run/qubesd.sock".into(),
            qubesd_query: "qubesd-query".into(),
            qrexec_client_vm: "qrexec-client-vm".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ReconcileConfig {
    /// Label given to new qubes that do not declare one.
    #[facet(default = "red")]
    pub default_label: String,
    /// Kill a qube whose graceful shutdown timed out instead of failing.
    #[facet(default)]
    pub force_kill_on_timeout: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            default_label: "red".into(),
            force_kill_on_timeout: false,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct LogConfig {
    /// Append debug logs to this file when set.
    #[facet(default)]
    pub file: String,
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.verify_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.call_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.poll_interval_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_secs(self.connect.backoff_secs)
    }

    /// Precondition table with the `[preconditions]` overrides applied.
    pub fn precondition_table(&self) -> Result<PreconditionTable, QopsError> {
        PreconditionTable::with_overrides(&self.preconditions)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), QopsError> {
    let t = &config.timeouts;
    for (name, secs) in [
        ("timeouts.connect_secs", t.connect_secs),
        ("timeouts.shutdown_secs", t.shutdown_secs),
        ("timeouts.verify_secs", t.verify_secs),
        ("timeouts.call_secs", t.call_secs),
    ] {
        if secs == 0 {
            return Err(QopsError::Validation {
                message: format!("{name} must be at least 1"),
            });
        }
    }
    if t.poll_interval_ms < 10 {
        return Err(QopsError::Validation {
            message: "timeouts.poll_interval_ms must be at least 10".into(),
        });
    }

    if config.connect.default_user.is_empty() {
        return Err(QopsError::Validation {
            message: "connect.default_user must not be empty".into(),
        });
    }

    if config.channel.qvm_run.is_empty() {
        return Err(QopsError::Validation {
            message: "channel.qvm_run must not be empty".into(),
        });
    }

    match config.admin.mode.as_str() {
        "dom0" | "qrexec" => {}
        other => {
            return Err(QopsError::Validation {
                message: format!("admin.mode must be 'dom0' or 'qrexec' (got '{other}')"),
            });
        }
    }

    if !LABELS.contains(&config.reconcile.default_label.as_str()) {
        return Err(QopsError::Validation {
            message: format!(
                "reconcile.default_label must be one of {} (got '{}')",
                LABELS.join(", "),
                config.reconcile.default_label
            ),
        });
    }

    config.precondition_table()?;

    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load the config from `path`, or from the default location when `None`.
///
/// A missing default file yields the built-in defaults; a missing explicit
/// file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config, QopsError> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (paths::default_config_path(), false),
    };

    if !explicit && !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(&path).map_err(|source| QopsError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    parse_config(&path, &contents)
}

fn parse_config(path: &Path, contents: &str) -> Result<Config, QopsError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| QopsError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config)?;
    Ok(config)
}
