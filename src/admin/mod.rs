//! Admin API Client: inspect and mutate qube objects through qubesd.
//!
//! Every mutating method is one request. Nothing here batches or retries;
//! the reconciler re-observes state before deciding to try again.

pub mod qubesd;

use std::fmt;

use async_trait::async_trait;

use crate::error::QopsError;
use crate::property::{Property, PropertyValue};
use crate::qube::{ObservedState, PowerState, QubeClass};

/// One entry of `admin.vm.List`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QubeSummary {
    pub name: String,
    pub class: QubeClass,
    pub power: PowerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub class: QubeClass,
    pub template: Option<String>,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Shutdown,
    Kill,
    Unpause,
}

impl PowerAction {
    pub fn method(self) -> &'static str {
        match self {
            PowerAction::Start => "admin.vm.Start",
            PowerAction::Shutdown => "admin.vm.Shutdown",
            PowerAction::Kill => "admin.vm.Kill",
            PowerAction::Unpause => "admin.vm.Unpause",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerAction::Start => "start",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Kill => "kill",
            PowerAction::Unpause => "unpause",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn list(&self) -> Result<Vec<QubeSummary>, QopsError>;

    /// Current attributes of `name`, or `None` if no such qube exists.
    async fn get_properties(&self, name: &str) -> Result<Option<ObservedState>, QopsError>;

    async fn set_property(
        &self,
        name: &str,
        property: Property,
        value: &PropertyValue,
    ) -> Result<(), QopsError>;

    async fn create(&self, request: &CreateRequest) -> Result<(), QopsError>;

    /// Fails with `Busy` if the qube is not halted.
    async fn destroy(&self, name: &str) -> Result<(), QopsError>;

    async fn set_power_state(&self, name: &str, action: PowerAction) -> Result<(), QopsError>;

    /// Power state of `name`, or `None` if no such qube exists.
    async fn power_state(&self, name: &str) -> Result<Option<PowerState>, QopsError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|q| q.name == name)
            .map(|q| q.power))
    }
}
