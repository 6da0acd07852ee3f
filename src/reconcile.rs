//! Lifecycle Reconciler.
//!
//! One reconciliation: fetch observed state, plan, apply the steps in order,
//! then verify the requested power state. Nothing is cached between runs, so
//! re-running after a failure only applies what is still missing.

use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::admin::{AdminApi, PowerAction};
use crate::config::Config;
use crate::diff::{self, Field, Plan, Precondition, PreconditionTable, Step};
use crate::error::{QopsError, TimeoutKind};
use crate::qube::{DesiredPower, DesiredState, ObservedState, PowerState};

/// What a reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub qube: String,
    pub changed: bool,
    pub changed_fields: Vec<String>,
    /// Applied steps, in order.
    pub steps: Vec<String>,
}

impl ReconcileReport {
    fn from_steps(qube: &str, steps: &[Step]) -> Self {
        Self {
            qube: qube.into(),
            changed: !steps.is_empty(),
            changed_fields: diff::changed_fields(steps),
            steps: steps.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A failed reconciliation and the steps that were applied before it failed.
#[derive(Debug)]
pub struct ReconcileFailure {
    pub report: ReconcileReport,
    pub error: QopsError,
}

pub struct Reconciler<A> {
    admin: A,
    table: PreconditionTable,
    default_label: String,
    shutdown_timeout: Duration,
    verify_timeout: Duration,
    poll_interval: Duration,
    force_kill: bool,
}

impl<A: AdminApi> Reconciler<A> {
    pub fn new(admin: A, config: &Config) -> Result<Self, QopsError> {
        Ok(Self {
            admin,
            table: config.precondition_table()?,
            default_label: config.reconcile.default_label.clone(),
            shutdown_timeout: config.shutdown_timeout(),
            verify_timeout: config.verify_timeout(),
            poll_interval: config.poll_interval(),
            force_kill: config.reconcile.force_kill_on_timeout,
        })
    }

    pub fn admin(&self) -> &A {
        &self.admin
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Fetch a fresh snapshot, waiting out a transient power state.
    pub async fn observe(&self, name: &str) -> Result<Option<ObservedState>, QopsError> {
        let deadline = Instant::now() + self.verify_timeout;
        loop {
            let observed = self.admin.get_properties(name).await?;
            match &observed {
                Some(o) if o.power == PowerState::Transient => {
                    if Instant::now() >= deadline {
                        return Err(QopsError::Timeout {
                            qube: name.into(),
                            operation: "observe".into(),
                            kind: TimeoutKind::Verify,
                            secs: self.verify_timeout.as_secs(),
                        });
                    }
                    tracing::debug!(qube = name, "qube is transient, waiting");
                    sleep(self.poll_interval).await;
                }
                _ => return Ok(observed),
            }
        }
    }

    /// The steps `reconcile` would take now, without applying any.
    pub async fn plan(&self, desired: &DesiredState) -> Result<Plan, QopsError> {
        desired.validate()?;
        let observed = self.observe(&desired.name).await?;
        diff::plan(
            observed.as_ref(),
            desired,
            &self.table,
            &self.default_label,
        )
    }

    pub async fn reconcile(
        &self,
        desired: &DesiredState,
    ) -> Result<ReconcileReport, ReconcileFailure> {
        let mut applied = Vec::new();
        let result = self.run(desired, &mut applied).await;
        finish(&desired.name, result, &applied)
    }

    /// Like `reconcile`, but abandons all in-flight work at `deadline`.
    pub async fn reconcile_until(
        &self,
        desired: &DesiredState,
        deadline: Instant,
    ) -> Result<ReconcileReport, ReconcileFailure> {
        let started = Instant::now();
        let mut applied = Vec::new();
        let result =
            match tokio::time::timeout_at(deadline, self.run(desired, &mut applied)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(qube = %desired.name, "reconcile deadline reached");
                    Err(QopsError::Timeout {
                        qube: desired.name.clone(),
                        operation: "reconcile".into(),
                        kind: TimeoutKind::Deadline,
                        secs: started.elapsed().as_secs(),
                    })
                }
            };
        finish(&desired.name, result, &applied)
    }

    /// Issue the start (or unpause) request for a stopped qube. Does not
    /// wait for it to come up.
    pub async fn start(&self, name: &str) -> Result<(), QopsError> {
        match self.admin.power_state(name).await? {
            None => Err(QopsError::TargetNotFound {
                qube: name.into(),
                operation: "start".into(),
            }),
            Some(PowerState::Halted) => {
                tracing::info!(qube = name, "starting qube");
                self.admin.set_power_state(name, PowerAction::Start).await
            }
            Some(PowerState::Paused) => {
                tracing::info!(qube = name, "unpausing qube");
                self.admin.set_power_state(name, PowerAction::Unpause).await
            }
            Some(PowerState::Running | PowerState::Transient) => Ok(()),
        }
    }

    /// Poll until `name` reports `target`, bounded by `timeout`.
    pub async fn wait_for_power(
        &self,
        name: &str,
        target: PowerState,
        timeout: Duration,
        kind: TimeoutKind,
    ) -> Result<(), QopsError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.admin.power_state(name).await? {
                Some(p) if p == target => return Ok(()),
                Some(p) => {
                    tracing::trace!(qube = name, current = %p, wanted = %target, "waiting for power state");
                }
                None => {
                    return Err(QopsError::TargetNotFound {
                        qube: name.into(),
                        operation: format!("wait for {target}"),
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(QopsError::Timeout {
                    qube: name.into(),
                    operation: format!("wait for {target}"),
                    kind,
                    secs: timeout.as_secs(),
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn run(&self, desired: &DesiredState, applied: &mut Vec<Step>) -> Result<(), QopsError> {
        desired.validate()?;
        let name = desired.name.as_str();

        tracing::debug!(qube = name, state = %desired.power, "fetching observed state");
        let observed = self.observe(name).await?;
        let plan = diff::plan(
            observed.as_ref(),
            desired,
            &self.table,
            &self.default_label,
        )?;

        if plan.is_empty() {
            tracing::info!(qube = name, "already in desired state");
            return Ok(());
        }

        tracing::info!(qube = name, steps = plan.steps.len(), "applying changes");
        for (i, step) in plan.steps.iter().enumerate() {
            let enforcing = matches!(step, Step::Shutdown)
                && matches!(
                    plan.steps.get(i + 1),
                    Some(Step::Set(c)) if c.precondition == Precondition::RequiresHalted
                );

            if let Err(e) = self.apply(name, step).await {
                // A qube that would not halt is a precondition failure; other
                // errors keep their own kind.
                let halt_failed =
                    e.is_timeout() || matches!(e, QopsError::TargetNotRunning { .. });
                if enforcing && halt_failed {
                    return Err(QopsError::PreconditionFailed {
                        qube: name.into(),
                        operation: "shutdown".into(),
                        cause: e.to_string(),
                        applied: applied.iter().map(|s| s.to_string()).collect(),
                    });
                }
                return Err(e);
            }
            applied.push(step.clone());
        }

        self.verify(desired).await
    }

    async fn apply(&self, name: &str, step: &Step) -> Result<(), QopsError> {
        tracing::info!(qube = name, %step, "apply");
        match step {
            Step::Create(request) => self.admin.create(request).await,
            Step::Shutdown => self.shutdown(name).await,
            Step::Set(change) => match change.field {
                Field::Property(property) => {
                    self.admin
                        .set_property(name, property, &change.new)
                        .await
                }
                Field::Class => Err(QopsError::Validation {
                    message: format!("class of '{name}' cannot change"),
                }),
            },
            Step::Start => {
                self.admin.set_power_state(name, PowerAction::Start).await?;
                self.wait_for_power(
                    name,
                    PowerState::Running,
                    self.verify_timeout,
                    TimeoutKind::Start,
                )
                .await
            }
            Step::Unpause => {
                self.admin
                    .set_power_state(name, PowerAction::Unpause)
                    .await
            }
            Step::Remove => self.admin.destroy(name).await,
        }
    }

    async fn shutdown(&self, name: &str) -> Result<(), QopsError> {
        self.admin
            .set_power_state(name, PowerAction::Shutdown)
            .await?;
        let waited = self
            .wait_for_power(
                name,
                PowerState::Halted,
                self.shutdown_timeout,
                TimeoutKind::Shutdown,
            )
            .await;

        match waited {
            Err(e) if e.is_timeout() && self.force_kill => {
                tracing::warn!(qube = name, "graceful shutdown timed out, killing");
                self.admin.set_power_state(name, PowerAction::Kill).await?;
                self.wait_for_power(
                    name,
                    PowerState::Halted,
                    self.shutdown_timeout,
                    TimeoutKind::Shutdown,
                )
                .await
            }
            other => other,
        }
    }

    async fn verify(&self, desired: &DesiredState) -> Result<(), QopsError> {
        let name = desired.name.as_str();
        let deadline = Instant::now() + self.verify_timeout;
        loop {
            let power = self.admin.power_state(name).await?;
            let reached = match desired.power {
                DesiredPower::Absent => power.is_none(),
                DesiredPower::Present => power.is_some(),
                DesiredPower::Running => power == Some(PowerState::Running),
                DesiredPower::Halted => power == Some(PowerState::Halted),
            };
            if reached {
                tracing::debug!(qube = name, state = %desired.power, "verified");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(QopsError::VerifyFailed {
                    qube: name.into(),
                    requested: desired.power.to_string(),
                    observed: power.map_or_else(|| "absent".to_string(), |p| p.to_string()),
                });
            }
            sleep(self.poll_interval).await;
        }
    }
}

fn finish(
    qube: &str,
    result: Result<(), QopsError>,
    applied: &[Step],
) -> Result<ReconcileReport, ReconcileFailure> {
    let report = ReconcileReport::from_steps(qube, applied);
    match result {
        Ok(()) => Ok(report),
        Err(error) => {
            tracing::error!(qube, kind = error.kind(), %error, "reconcile failed");
            Err(ReconcileFailure { report, error })
        }
    }
}
