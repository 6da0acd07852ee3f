//! Closed set of qube properties this crate can observe and change.
//!
//! Property names are the qubesd names verbatim. Anything outside this set
//! is rejected with `UnknownProperty` instead of being passed through.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::QopsError;
use crate::util;

/// Colours qubesd accepts for the `label` property.
pub const LABELS: &[&str] = &[
    "red", "orange", "yellow", "green", "gray", "blue", "purple", "black",
];

const VIRT_MODES: &[&str] = &["pv", "pvh", "hvm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Property {
    Label,
    Memory,
    Maxmem,
    Vcpus,
    Netvm,
    Template,
    Autostart,
    ProvidesNetwork,
    VirtMode,
    Kernel,
    Kernelopts,
    IncludeInBackups,
    DefaultDispvm,
    TemplateForDispvms,
    QrexecTimeout,
    DefaultUser,
    Debug,
}

/// How a property's value is spelled and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Label,
    Int,
    Memory,
    Bool,
    QubeRef,
    Text,
    VirtMode,
}

impl Property {
    pub const ALL: &'static [Property] = &[
        Property::Label,
        Property::Memory,
        Property::Maxmem,
        Property::Vcpus,
        Property::Netvm,
        Property::Template,
        Property::Autostart,
        Property::ProvidesNetwork,
        Property::VirtMode,
        Property::Kernel,
        Property::Kernelopts,
        Property::IncludeInBackups,
        Property::DefaultDispvm,
        Property::TemplateForDispvms,
        Property::QrexecTimeout,
        Property::DefaultUser,
        Property::Debug,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Property::Label => "label",
            Property::Memory => "memory",
            Property::Maxmem => "maxmem",
            Property::Vcpus => "vcpus",
            Property::Netvm => "netvm",
            Property::Template => "template",
            Property::Autostart => "autostart",
            Property::ProvidesNetwork => "provides_network",
            Property::VirtMode => "virt_mode",
            Property::Kernel => "kernel",
            Property::Kernelopts => "kernelopts",
            Property::IncludeInBackups => "include_in_backups",
            Property::DefaultDispvm => "default_dispvm",
            Property::TemplateForDispvms => "template_for_dispvms",
            Property::QrexecTimeout => "qrexec_timeout",
            Property::DefaultUser => "default_user",
            Property::Debug => "debug",
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Property::Label => ValueKind::Label,
            Property::Memory | Property::Maxmem => ValueKind::Memory,
            Property::Vcpus | Property::QrexecTimeout => ValueKind::Int,
            Property::Netvm | Property::Template | Property::DefaultDispvm => ValueKind::QubeRef,
            Property::Autostart
            | Property::ProvidesNetwork
            | Property::IncludeInBackups
            | Property::TemplateForDispvms
            | Property::Debug => ValueKind::Bool,
            Property::VirtMode => ValueKind::VirtMode,
            Property::Kernel | Property::Kernelopts | Property::DefaultUser => ValueKind::Text,
        }
    }

    fn supported_list() -> String {
        Property::ALL
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Parse a declared value from a desired-state document.
    pub fn parse_desired(self, value: &Value) -> Result<PropertyValue, QopsError> {
        let field = self.name();
        let invalid = |message: String| QopsError::InvalidValue {
            field: field.into(),
            message,
        };

        match self.kind() {
            ValueKind::Bool => match value {
                Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
                Value::String(s) => parse_bool(s)
                    .map(PropertyValue::Bool)
                    .ok_or_else(|| invalid(format!("expected a boolean, got '{s}'"))),
                other => Err(invalid(format!("expected a boolean, got {other}"))),
            },
            ValueKind::Int => match value {
                Value::Number(n) => n
                    .as_u64()
                    .map(PropertyValue::Int)
                    .ok_or_else(|| invalid(format!("expected a non-negative integer, got {n}"))),
                Value::String(s) => s
                    .trim()
                    .parse()
                    .map(PropertyValue::Int)
                    .map_err(|_| invalid(format!("expected an integer, got '{s}'"))),
                other => Err(invalid(format!("expected an integer, got {other}"))),
            },
            ValueKind::Memory => match value {
                Value::Number(n) => n
                    .as_u64()
                    .map(PropertyValue::Int)
                    .ok_or_else(|| invalid(format!("expected MiB as an integer, got {n}"))),
                Value::String(s) => util::parse_memory_mib(field, s).map(PropertyValue::Int),
                other => Err(invalid(format!("expected a memory size, got {other}"))),
            },
            ValueKind::QubeRef => match value {
                Value::Null => Ok(PropertyValue::Unset),
                Value::String(s) if s.is_empty() || s.eq_ignore_ascii_case("none") => {
                    Ok(PropertyValue::Unset)
                }
                Value::String(s) => Ok(PropertyValue::Text(s.clone())),
                other => Err(invalid(format!("expected a qube name or null, got {other}"))),
            },
            ValueKind::Label => match value {
                Value::String(s) if LABELS.contains(&s.as_str()) => {
                    Ok(PropertyValue::Text(s.clone()))
                }
                other => Err(invalid(format!(
                    "expected one of {}, got {other}",
                    LABELS.join("/")
                ))),
            },
            ValueKind::VirtMode => match value {
                Value::String(s) if VIRT_MODES.contains(&s.as_str()) => {
                    Ok(PropertyValue::Text(s.clone()))
                }
                other => Err(invalid(format!("expected pv, pvh or hvm, got {other}"))),
            },
            ValueKind::Text => match value {
                Value::String(s) => Ok(PropertyValue::Text(s.clone())),
                Value::Number(n) => Ok(PropertyValue::Text(n.to_string())),
                other => Err(invalid(format!("expected a string, got {other}"))),
            },
        }
    }

    /// Parse the value part of an `admin.vm.property.Get` reply.
    pub fn parse_observed(self, raw: &str) -> Result<PropertyValue, QopsError> {
        let field = self.name();
        match self.kind() {
            ValueKind::Bool => parse_bool(raw)
                .map(PropertyValue::Bool)
                .ok_or_else(|| QopsError::InvalidValue {
                    field: field.into(),
                    message: format!("qubesd returned non-boolean '{raw}'"),
                }),
            ValueKind::Int | ValueKind::Memory => {
                raw.trim()
                    .parse()
                    .map(PropertyValue::Int)
                    .map_err(|_| QopsError::InvalidValue {
                        field: field.into(),
                        message: format!("qubesd returned non-integer '{raw}'"),
                    })
            }
            ValueKind::QubeRef if raw.is_empty() => Ok(PropertyValue::Unset),
            _ => Ok(PropertyValue::Text(raw.to_string())),
        }
    }
}

impl FromStr for Property {
    type Err = QopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Property::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| QopsError::UnknownProperty {
                name: s.to_string(),
                supported: Property::supported_list(),
            })
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// A typed property value. `Unset` is a qube reference pointing at no qube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    Int(u64),
    Bool(bool),
    Unset,
}

impl PropertyValue {
    /// Payload for `admin.vm.property.Set`.
    pub fn to_wire(&self) -> String {
        match self {
            PropertyValue::Text(s) => s.clone(),
            PropertyValue::Int(n) => n.to_string(),
            PropertyValue::Bool(true) => "True".into(),
            PropertyValue::Bool(false) => "False".into(),
            PropertyValue::Unset => String::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Text(s) => Value::String(s.clone()),
            PropertyValue::Int(n) => Value::from(*n),
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Unset => Value::Null,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(s) => f.write_str(s),
            PropertyValue::Int(n) => write!(f, "{n}"),
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Unset => f.write_str("none"),
        }
    }
}
