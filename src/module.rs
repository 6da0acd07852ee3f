//! Module interface: a JSON desired-state document in, a JSON result out.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::diff::Plan;
use crate::error::QopsError;
use crate::property::Property;
use crate::qube::{DesiredPower, DesiredState, QubeClass};
use crate::reconcile::{ReconcileFailure, ReconcileReport};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleArgs {
    pub name: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// Keeps document order; it decides the order changes are applied in.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl ModuleArgs {
    pub fn into_desired(self) -> Result<DesiredState, QopsError> {
        let mut desired = DesiredState::new(self.name);
        if let Some(class) = self.class {
            desired = desired.with_class(class.parse::<QubeClass>()?);
        }
        if let Some(template) = self.template {
            desired = desired.with_template(template);
        }
        if let Some(state) = self.state {
            desired = desired.with_power(state.parse::<DesiredPower>()?);
        }
        for (name, value) in &self.properties {
            let property: Property = name.parse()?;
            desired = desired.with_property(property, property.parse_desired(value)?);
        }
        desired.validate()?;
        Ok(desired)
    }
}

/// Parse a module document into a validated desired state.
pub fn parse_document(text: &str) -> Result<DesiredState, QopsError> {
    let args: ModuleArgs = serde_json::from_str(text).map_err(|e| QopsError::Validation {
        message: format!("invalid module document: {e}"),
    })?;
    args.into_desired()
}

/// Best-effort qube name from a document that failed to parse.
pub fn document_name(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleResult {
    pub qube: String,
    pub changed: bool,
    pub changed_fields: Vec<String>,
    pub steps: Vec<String>,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl ModuleResult {
    pub fn from_report(report: ReconcileReport) -> Self {
        Self {
            qube: report.qube,
            changed: report.changed,
            changed_fields: report.changed_fields,
            steps: report.steps,
            failed: false,
            error: None,
            msg: None,
        }
    }

    /// Failure result, still listing whatever was applied before it.
    pub fn from_failure(failure: ReconcileFailure) -> Self {
        Self {
            error: Some(failure.error.kind().to_string()),
            msg: Some(failure.error.to_string()),
            failed: true,
            ..Self::from_report(failure.report)
        }
    }

    pub fn from_error(qube: &str, error: &QopsError) -> Self {
        Self {
            qube: qube.into(),
            changed: false,
            changed_fields: Vec::new(),
            steps: Vec::new(),
            failed: true,
            error: Some(error.kind().to_string()),
            msg: Some(error.to_string()),
        }
    }

    /// Check-mode result: what would change, with nothing applied.
    pub fn from_plan(qube: &str, plan: &Plan) -> Self {
        Self {
            qube: qube.into(),
            changed: !plan.is_empty(),
            changed_fields: plan.changed_fields(),
            steps: plan.steps.iter().map(|s| s.to_string()).collect(),
            failed: false,
            error: None,
            msg: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!(r#"{{"failed": true, "msg": "result serialization failed: {e}"}}"#)
        })
    }
}
