//! Shared vocabulary for qubes: class, power state, observed and desired state.
//!
//! `ObservedState` is always fetched fresh from qubesd at the start of a
//! reconciliation and never cached across calls. `DesiredState` is a plain
//! request value built from a caller's declaration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::QopsError;
use crate::property::{Property, PropertyValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QubeClass {
    /// Template-based qube; root filesystem comes from its template.
    AppVM,
    TemplateVM,
    StandaloneVM,
    /// Disposable; created from a disposable template.
    DispVM,
    /// The admin domain (dom0). Observable, never created.
    AdminVM,
}

impl QubeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            QubeClass::AppVM => "AppVM",
            QubeClass::TemplateVM => "TemplateVM",
            QubeClass::StandaloneVM => "StandaloneVM",
            QubeClass::DispVM => "DispVM",
            QubeClass::AdminVM => "AdminVM",
        }
    }

    /// Classes whose creation requires a template.
    pub fn requires_template(self) -> bool {
        matches!(self, QubeClass::AppVM | QubeClass::DispVM)
    }
}

impl FromStr for QubeClass {
    type Err = QopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "appvm" => Ok(QubeClass::AppVM),
            "templatevm" | "template" => Ok(QubeClass::TemplateVM),
            "standalonevm" | "standalone" => Ok(QubeClass::StandaloneVM),
            "dispvm" | "disposable" => Ok(QubeClass::DispVM),
            "adminvm" => Ok(QubeClass::AdminVM),
            _ => Err(QopsError::InvalidValue {
                field: "class".into(),
                message: format!(
                    "unknown class '{s}' (use AppVM, TemplateVM, StandaloneVM or DispVM)"
                ),
            }),
        }
    }
}

impl fmt::Display for QubeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power state as reported by qubesd, folded into the states we act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Halted,
    /// Starting, halting or dying. Not safe to mutate or call into.
    Transient,
    Running,
    Paused,
}

impl PowerState {
    /// Map a qubesd `state=` token.
    pub fn from_qubesd(s: &str) -> Option<Self> {
        match s {
            "Halted" | "Crashed" | "NA" => Some(PowerState::Halted),
            "Running" => Some(PowerState::Running),
            "Transient" | "Halting" | "Dying" => Some(PowerState::Transient),
            "Paused" | "Suspended" => Some(PowerState::Paused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::Halted => "halted",
            PowerState::Transient => "transient",
            PowerState::Running => "running",
            PowerState::Paused => "paused",
        }
    }

    /// States in which the qube's domain exists and must be shut down before
    /// halted-only properties can change.
    pub fn is_active(self) -> bool {
        !matches!(self, PowerState::Halted)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `state` a caller declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DesiredPower {
    Absent,
    #[default]
    Present,
    Running,
    Halted,
}

impl DesiredPower {
    pub fn as_str(self) -> &'static str {
        match self {
            DesiredPower::Absent => "absent",
            DesiredPower::Present => "present",
            DesiredPower::Running => "running",
            DesiredPower::Halted => "halted",
        }
    }
}

impl FromStr for DesiredPower {
    type Err = QopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(DesiredPower::Absent),
            "present" => Ok(DesiredPower::Present),
            "running" | "started" => Ok(DesiredPower::Running),
            "halted" | "stopped" => Ok(DesiredPower::Halted),
            _ => Err(QopsError::InvalidValue {
                field: "state".into(),
                message: format!("unknown state '{s}' (use absent, present, running or halted)"),
            }),
        }
    }
}

impl fmt::Display for DesiredPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an existing qube.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedState {
    pub name: String,
    pub class: QubeClass,
    pub power: PowerState,
    pub properties: BTreeMap<Property, PropertyValue>,
}

impl ObservedState {
    pub fn get(&self, property: Property) -> Option<&PropertyValue> {
        self.properties.get(&property)
    }
}

/// What the caller wants a qube to look like.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub name: String,
    /// Only meaningful at creation.
    pub class: Option<QubeClass>,
    /// Only meaningful at creation.
    pub template: Option<String>,
    /// In declaration order.
    pub properties: Vec<(Property, PropertyValue)>,
    pub power: DesiredPower,
}

impl DesiredState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: None,
            template: None,
            properties: Vec::new(),
            power: DesiredPower::Present,
        }
    }

    pub fn with_class(mut self, class: QubeClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_property(mut self, property: Property, value: PropertyValue) -> Self {
        self.properties.retain(|(p, _)| *p != property);
        self.properties.push((property, value));
        self
    }

    pub fn with_power(mut self, power: DesiredPower) -> Self {
        self.power = power;
        self
    }

    pub fn property(&self, property: Property) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|(p, _)| *p == property)
            .map(|(_, v)| v)
    }

    /// Check the declaration is self-consistent before any qubesd call.
    pub fn validate(&self) -> Result<(), QopsError> {
        validate_qube_name(&self.name)?;
        let admin_domain = self.name == "dom0" || self.class == Some(QubeClass::AdminVM);
        if admin_domain && self.power == DesiredPower::Absent {
            return Err(QopsError::Validation {
                message: format!("refusing to remove admin domain '{}'", self.name),
            });
        }
        if let Some(template) = &self.template {
            validate_qube_name(template)?;
        }
        Ok(())
    }
}

/// Qube names: `[a-zA-Z][a-zA-Z0-9_.-]*`, at most 31 characters.
pub fn validate_qube_name(name: &str) -> Result<(), QopsError> {
    let valid = !name.is_empty()
        && name.len() <= 31
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(QopsError::Validation {
            message: format!(
                "qube name must match [a-zA-Z][a-zA-Z0-9._-]* and be at most 31 characters (got '{name}')"
            ),
        });
    }
    Ok(())
}
