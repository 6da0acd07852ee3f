use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use qops::admin::qubesd::QubesdAdmin;
use qops::channel::qrexec::QrexecChannel;
use qops::cli::{Cli, Command};
use qops::config::{self, Config};
use qops::error::QopsError;
use qops::logging;
use qops::module::{self, ModuleResult};
use qops::reconcile::Reconciler;
use qops::transport::{ConnectOptions, Connection, QubesTransport};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let file_log = logging::init(cli.verbose, cli.quiet);
    let config = config::load_config(cli.config.as_deref())?;
    if !config.log.file.is_empty()
        && let Err(e) = file_log.set_file(Path::new(&config.log.file))
    {
        tracing::warn!(path = %config.log.file, error = %e, "cannot open log file");
    }

    let code = match cli.command {
        Command::Exec {
            qube,
            user,
            env,
            stdin,
            no_start,
            command,
        } => {
            let options = ConnectOptions {
                user,
                auto_start: no_start.then_some(false),
            };
            run_exec(&config, &qube, &options, &env, stdin, &command.join(" ")).await?
        }
        Command::Put {
            qube,
            local,
            remote,
            user,
        } => {
            run_put(&config, &qube, user, &local, &remote).await?;
            0
        }
        Command::Fetch {
            qube,
            remote,
            local,
            user,
        } => {
            run_fetch(&config, &qube, user, &remote, &local).await?;
            0
        }
        Command::Apply {
            document,
            timeout_secs,
        } => run_module(&config, document, false, timeout_secs).await?,
        Command::Plan { document } => run_module(&config, document, true, None).await?,
        Command::State { qube } => {
            run_state(&config, &qube).await?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn reconciler(config: &Config) -> Result<Reconciler<QubesdAdmin>, QopsError> {
    Reconciler::new(QubesdAdmin::new(config), config)
}

fn transport(config: &Config) -> Result<QubesTransport<QrexecChannel, QubesdAdmin>, QopsError> {
    Ok(QubesTransport::new(
        QrexecChannel::new(&config.channel),
        reconciler(config)?,
        config,
    ))
}

fn io_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> QopsError {
    let context = context.into();
    move |source| QopsError::Io { context, source }
}

async fn run_exec(
    config: &Config,
    qube: &str,
    options: &ConnectOptions,
    env: &[(String, String)],
    forward_stdin: bool,
    command: &str,
) -> miette::Result<i32> {
    let transport = transport(config)?;
    let mut session = transport.connect(qube, options).await?;

    let input = if forward_stdin {
        let mut buf = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .map_err(io_error("reading stdin"))?;
        Some(buf)
    } else {
        None
    };

    let result = transport
        .exec_command(&session, command, env, input.as_deref())
        .await?;
    transport.close(&mut session).await;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(&result.stdout)
        .await
        .map_err(io_error("writing stdout"))?;
    stdout.flush().await.map_err(io_error("writing stdout"))?;
    let mut stderr = tokio::io::stderr();
    stderr
        .write_all(&result.stderr)
        .await
        .map_err(io_error("writing stderr"))?;
    stderr.flush().await.map_err(io_error("writing stderr"))?;

    if let Some(fault) = &result.fault {
        tracing::error!(qube, %fault, "call channel failed");
    }
    Ok(result.status)
}

async fn run_put(
    config: &Config,
    qube: &str,
    user: Option<String>,
    local: &Path,
    remote: &str,
) -> miette::Result<()> {
    let transport = transport(config)?;
    let mut file = tokio::fs::File::open(local)
        .await
        .map_err(io_error(format!("opening {}", local.display())))?;

    let options = ConnectOptions {
        user,
        ..Default::default()
    };
    let mut session = transport.connect(qube, &options).await?;
    transport.put_file_from(&session, &mut file, remote).await?;
    transport.close(&mut session).await;
    Ok(())
}

async fn run_fetch(
    config: &Config,
    qube: &str,
    user: Option<String>,
    remote: &str,
    local: &Path,
) -> miette::Result<()> {
    let transport = transport(config)?;
    let options = ConnectOptions {
        user,
        ..Default::default()
    };
    let mut session = transport.connect(qube, &options).await?;

    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(io_error(format!("creating {}", local.display())))?;
    let fetched = transport.fetch_file_to(&session, remote, &mut file).await;
    transport.close(&mut session).await;

    if let Err(e) = fetched {
        drop(file);
        // Do not leave a truncated copy behind.
        let _ = tokio::fs::remove_file(local).await;
        return Err(e.into());
    }
    file.flush()
        .await
        .map_err(io_error(format!("writing {}", local.display())))?;
    Ok(())
}

fn read_document(path: Option<&Path>) -> Result<String, QopsError> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(io_error(format!("reading {}", path.display()))),
        None => std::io::read_to_string(std::io::stdin()).map_err(io_error("reading stdin")),
    }
}

/// Module protocol: result JSON on stdout, exit 1 on failure.
async fn run_module(
    config: &Config,
    document: Option<PathBuf>,
    check: bool,
    timeout_secs: Option<u64>,
) -> miette::Result<i32> {
    let text = read_document(document.as_deref())?;

    let result = match module::parse_document(&text) {
        Err(e) => ModuleResult::from_error(&module::document_name(&text), &e),
        Ok(desired) => {
            let reconciler = reconciler(config)?;
            if check {
                match reconciler.plan(&desired).await {
                    Ok(plan) => ModuleResult::from_plan(&desired.name, &plan),
                    Err(e) => ModuleResult::from_error(&desired.name, &e),
                }
            } else {
                let outcome = match timeout_secs {
                    Some(secs) => {
                        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
                        reconciler.reconcile_until(&desired, deadline).await
                    }
                    None => reconciler.reconcile(&desired).await,
                };
                match outcome {
                    Ok(report) => ModuleResult::from_report(report),
                    Err(failure) => ModuleResult::from_failure(failure),
                }
            }
        }
    };

    println!("{}", result.to_json());
    Ok(if result.failed { 1 } else { 0 })
}

async fn run_state(config: &Config, qube: &str) -> miette::Result<()> {
    let reconciler = reconciler(config)?;
    let Some(observed) = reconciler.observe(qube).await? else {
        return Err(QopsError::TargetNotFound {
            qube: qube.into(),
            operation: "state".into(),
        }
        .into());
    };

    let properties: Map<String, Value> = observed
        .properties
        .iter()
        .map(|(p, v)| (p.name().to_string(), v.to_json()))
        .collect();
    let doc = json!({
        "name": observed.name,
        "class": observed.class.as_str(),
        "power_state": observed.power.as_str(),
        "properties": properties,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&doc).map_err(|e| QopsError::Validation {
            message: format!("cannot render state: {e}"),
        })?
    );
    Ok(())
}
