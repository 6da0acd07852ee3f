//! Property Diff Engine.
//!
//! `diff` is pure: observed + desired in, ordered field changes out.
//! `plan` turns those changes into the ordered steps a reconciliation runs,
//! synthesizing the shutdown/start/remove steps around them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::admin::CreateRequest;
use crate::error::QopsError;
use crate::property::{Property, PropertyValue};
use crate::qube::{DesiredPower, DesiredState, ObservedState, PowerState, QubeClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precondition {
    /// Only applicable while the qube does not exist yet (creation).
    RequiresAbsent,
    /// Cannot change after creation; a mismatch is an error.
    Immutable,
    RequiresHalted,
    /// Applies live.
    None,
}

impl FromStr for Precondition {
    type Err = QopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" | "none" => Ok(Precondition::None),
            "requires-halted" | "halted" => Ok(Precondition::RequiresHalted),
            "immutable" => Ok(Precondition::Immutable),
            other => Err(QopsError::Validation {
                message: format!(
                    "precondition must be 'live', 'requires-halted' or 'immutable' (got '{other}')"
                ),
            }),
        }
    }
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Precondition::RequiresAbsent => "requires-absent",
            Precondition::Immutable => "immutable",
            Precondition::RequiresHalted => "requires-halted",
            Precondition::None => "live",
        };
        f.write_str(s)
    }
}

/// Which precondition each property's change needs.
///
/// Which properties need a halted qube depends on the hypervisor version, so
/// the defaults here can be overridden from the `[preconditions]` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionTable {
    entries: BTreeMap<Property, Precondition>,
}

impl Default for PreconditionTable {
    fn default() -> Self {
        let entries = Property::ALL
            .iter()
            .map(|&p| {
                let pre = match p {
                    Property::Template => Precondition::Immutable,
                    Property::VirtMode
                    | Property::Kernel
                    | Property::Kernelopts
                    | Property::Maxmem
                    | Property::Vcpus
                    | Property::ProvidesNetwork
                    | Property::TemplateForDispvms
                    | Property::Debug => Precondition::RequiresHalted,
                    _ => Precondition::None,
                };
                (p, pre)
            })
            .collect();
        Self { entries }
    }
}

impl PreconditionTable {
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Result<Self, QopsError> {
        let mut table = Self::default();
        for (name, pre) in overrides {
            let property: Property = name.parse()?;
            table.entries.insert(property, pre.parse()?);
        }
        Ok(table)
    }

    pub fn get(&self, property: Property) -> Precondition {
        self.entries
            .get(&property)
            .copied()
            .unwrap_or(Precondition::None)
    }
}

/// What a change touches: the class, or one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Class,
    Property(Property),
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Class => "class",
            Field::Property(p) => p.name(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub field: Field,
    /// `None` when the qube (or the property on it) does not exist.
    pub old: Option<PropertyValue>,
    pub new: PropertyValue,
    pub precondition: Precondition,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.old {
            Some(old) => write!(f, "{}: {old} -> {}", self.field, self.new),
            None => write!(f, "{}: {}", self.field, self.new),
        }
    }
}

/// Fields in the order the caller declared them. A top-level `template`
/// counts as a declaration of the `template` property.
fn declared(desired: &DesiredState) -> Vec<(Property, PropertyValue)> {
    let mut fields = Vec::with_capacity(desired.properties.len() + 1);
    if let Some(template) = &desired.template
        && desired.property(Property::Template).is_none()
    {
        fields.push((Property::Template, PropertyValue::Text(template.clone())));
    }
    fields.extend(desired.properties.iter().cloned());
    fields
}

fn group(pre: Precondition) -> u8 {
    match pre {
        Precondition::RequiresAbsent => 0,
        Precondition::Immutable => 1,
        Precondition::RequiresHalted => 2,
        Precondition::None => 3,
    }
}

/// Compute the field changes that move `observed` to `desired`.
///
/// Creation changes come first, halted-only changes next, live changes
/// last; inside each group the declaration order is kept.
pub fn diff(
    observed: Option<&ObservedState>,
    desired: &DesiredState,
    table: &PreconditionTable,
) -> Vec<Change> {
    if desired.power == DesiredPower::Absent {
        return Vec::new();
    }

    let mut changes = Vec::new();

    match observed {
        None => {
            changes.push(Change {
                field: Field::Class,
                old: None,
                new: PropertyValue::Text(desired.class.unwrap_or(QubeClass::AppVM).to_string()),
                precondition: Precondition::RequiresAbsent,
            });
            for (property, value) in declared(desired) {
                // A new qube is halted: everything else applies before start.
                let precondition = match table.get(property) {
                    Precondition::Immutable => Precondition::RequiresAbsent,
                    _ if property == Property::Label => Precondition::RequiresAbsent,
                    Precondition::RequiresHalted => Precondition::RequiresHalted,
                    _ => Precondition::None,
                };
                changes.push(Change {
                    field: Field::Property(property),
                    old: None,
                    new: value,
                    precondition,
                });
            }
        }
        Some(observed) => {
            if let Some(class) = desired.class
                && class != observed.class
            {
                changes.push(Change {
                    field: Field::Class,
                    old: Some(PropertyValue::Text(observed.class.to_string())),
                    new: PropertyValue::Text(class.to_string()),
                    precondition: Precondition::Immutable,
                });
            }
            for (property, value) in declared(desired) {
                let old = observed.get(property);
                if old == Some(&value) {
                    continue;
                }
                changes.push(Change {
                    field: Field::Property(property),
                    old: old.cloned(),
                    new: value,
                    precondition: table.get(property),
                });
            }
        }
    }

    changes.sort_by_key(|c| group(c.precondition));
    changes
}

// ── Plan ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Create(CreateRequest),
    Shutdown,
    Set(Change),
    Start,
    Unpause,
    Remove,
}

impl Step {
    /// Field names this step changes, as reported to the caller.
    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            Step::Create(req) => {
                let mut fields = vec!["class"];
                if req.template.is_some() {
                    fields.push("template");
                }
                fields.push("label");
                fields
            }
            Step::Set(change) => vec![change.field.name()],
            Step::Shutdown | Step::Start | Step::Unpause => vec!["power_state"],
            Step::Remove => vec!["state"],
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Create(req) => match &req.template {
                Some(t) => write!(f, "create {} from {t} (label {})", req.class, req.label),
                None => write!(f, "create {} (label {})", req.class, req.label),
            },
            Step::Shutdown => f.write_str("shutdown"),
            Step::Set(change) => write!(f, "set {change}"),
            Step::Start => f.write_str("start"),
            Step::Unpause => f.write_str("unpause"),
            Step::Remove => f.write_str("remove"),
        }
    }
}

/// Ordered steps for one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn changed_fields(&self) -> Vec<String> {
        changed_fields(&self.steps)
    }
}

/// Deduplicated field names of `steps`, in order.
pub fn changed_fields(steps: &[Step]) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for step in steps {
        for field in step.fields() {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }
    }
    fields
}

/// Turn the diff into executable steps.
///
/// Fails with `ImmutableFieldMismatch` before any step if an immutable
/// field differs, and with `Validation` for an impossible creation.
pub fn plan(
    observed: Option<&ObservedState>,
    desired: &DesiredState,
    table: &PreconditionTable,
    default_label: &str,
) -> Result<Plan, QopsError> {
    let mut steps = Vec::new();

    match (observed, desired.power) {
        (None, DesiredPower::Absent) => {}
        (Some(observed), DesiredPower::Absent) => {
            if observed.power.is_active() {
                steps.push(Step::Shutdown);
            }
            steps.push(Step::Remove);
        }
        (None, power) => {
            let changes = diff(None, desired, table);
            steps.push(Step::Create(create_request(desired, default_label)?));
            for change in changes {
                let consumed_by_create = matches!(
                    change.field,
                    Field::Class | Field::Property(Property::Template | Property::Label)
                );
                if !consumed_by_create {
                    steps.push(Step::Set(change));
                }
            }
            if power == DesiredPower::Running {
                steps.push(Step::Start);
            }
        }
        (Some(observed), power) => {
            let changes = diff(Some(observed), desired, table);

            if let Some(bad) = changes
                .iter()
                .find(|c| c.precondition == Precondition::Immutable)
            {
                return Err(QopsError::ImmutableFieldMismatch {
                    qube: desired.name.clone(),
                    field: bad.field.name().to_string(),
                    observed: bad
                        .old
                        .as_ref()
                        .map_or_else(|| "unset".to_string(), |v| v.to_string()),
                    desired: bad.new.to_string(),
                });
            }

            let needs_halt = changes
                .iter()
                .any(|c| c.precondition == Precondition::RequiresHalted);
            let shut_down = needs_halt && observed.power.is_active();
            if shut_down {
                // Live changes go in while the qube still runs, so they
                // never wait on the halt.
                let (live, halted): (Vec<_>, Vec<_>) = changes
                    .into_iter()
                    .partition(|c| c.precondition == Precondition::None);
                steps.extend(live.into_iter().map(Step::Set));
                steps.push(Step::Shutdown);
                steps.extend(halted.into_iter().map(Step::Set));
            } else {
                steps.extend(changes.into_iter().map(Step::Set));
            }

            let was_running = observed.power == PowerState::Running;
            match power {
                DesiredPower::Running => {
                    if shut_down || observed.power == PowerState::Halted {
                        steps.push(Step::Start);
                    } else if observed.power == PowerState::Paused {
                        steps.push(Step::Unpause);
                    }
                }
                DesiredPower::Halted => {
                    if !shut_down && observed.power.is_active() {
                        steps.push(Step::Shutdown);
                    }
                }
                DesiredPower::Present => {
                    // Put a qube we halted for the changes back the way it was.
                    if shut_down && was_running {
                        steps.push(Step::Start);
                    }
                }
                DesiredPower::Absent => {}
            }
        }
    }

    Ok(Plan { steps })
}

fn create_request(desired: &DesiredState, default_label: &str) -> Result<CreateRequest, QopsError> {
    let class = desired.class.unwrap_or(QubeClass::AppVM);
    if class == QubeClass::AdminVM {
        return Err(QopsError::Validation {
            message: format!("cannot create '{}' as an AdminVM", desired.name),
        });
    }

    let template = match desired.property(Property::Template) {
        Some(PropertyValue::Text(t)) => Some(t.clone()),
        _ => desired.template.clone(),
    };
    if class.requires_template() && template.is_none() {
        return Err(QopsError::Validation {
            message: format!("creating {class} '{}' requires a template", desired.name),
        });
    }

    let label = match desired.property(Property::Label) {
        Some(PropertyValue::Text(l)) => l.clone(),
        _ => default_label.to_string(),
    };

    Ok(CreateRequest {
        name: desired.name.clone(),
        class,
        template,
        label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(power: PowerState) -> ObservedState {
        let mut properties = BTreeMap::new();
        properties.insert(Property::Label, PropertyValue::Text("red".into()));
        properties.insert(Property::Memory, PropertyValue::Int(400));
        properties.insert(Property::Vcpus, PropertyValue::Int(2));
        properties.insert(Property::Template, PropertyValue::Text("fedora-40".into()));
        properties.insert(Property::Netvm, PropertyValue::Text("sys-firewall".into()));
        properties.insert(Property::Autostart, PropertyValue::Bool(false));
        ObservedState {
            name: "work".into(),
            class: QubeClass::AppVM,
            power,
            properties,
        }
    }

    fn table() -> PreconditionTable {
        PreconditionTable::default()
    }

    // ── diff ──

    #[test]
    fn equal_fields_produce_no_changes() {
        let desired = DesiredState::new("work")
            .with_property(Property::Memory, PropertyValue::Int(400))
            .with_property(Property::Label, PropertyValue::Text("red".into()));
        assert!(diff(Some(&observed(PowerState::Running)), &desired, &table()).is_empty());
    }

    #[test]
    fn halted_changes_precede_live_changes_in_declared_order() {
        let desired = DesiredState::new("work")
            .with_property(Property::Autostart, PropertyValue::Bool(true))
            .with_property(Property::Vcpus, PropertyValue::Int(4))
            .with_property(Property::Memory, PropertyValue::Int(800))
            .with_property(Property::VirtMode, PropertyValue::Text("hvm".into()));
        let changes = diff(Some(&observed(PowerState::Running)), &desired, &table());
        let order: Vec<_> = changes.iter().map(|c| c.field.name()).collect();
        assert_eq!(order, ["vcpus", "virt_mode", "autostart", "memory"]);
        assert_eq!(changes[0].precondition, Precondition::RequiresHalted);
        assert_eq!(changes[3].precondition, Precondition::None);
        assert_eq!(changes[0].old, Some(PropertyValue::Int(2)));
    }

    #[test]
    fn template_mismatch_is_immutable() {
        let desired = DesiredState::new("work").with_template("debian-12");
        let changes = diff(Some(&observed(PowerState::Halted)), &desired, &table());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, Field::Property(Property::Template));
        assert_eq!(changes[0].precondition, Precondition::Immutable);
    }

    #[test]
    fn class_mismatch_is_immutable() {
        let desired = DesiredState::new("work").with_class(QubeClass::StandaloneVM);
        let changes = diff(Some(&observed(PowerState::Halted)), &desired, &table());
        assert_eq!(changes[0].field, Field::Class);
        assert_eq!(changes[0].precondition, Precondition::Immutable);
    }

    #[test]
    fn absent_qube_diff_starts_with_creation_fields() {
        let desired = DesiredState::new("new")
            .with_template("fedora-40")
            .with_property(Property::Memory, PropertyValue::Int(800))
            .with_property(Property::Label, PropertyValue::Text("blue".into()));
        let changes = diff(None, &desired, &table());
        let order: Vec<_> = changes.iter().map(|c| (c.field.name(), c.precondition)).collect();
        assert_eq!(
            order,
            [
                ("class", Precondition::RequiresAbsent),
                ("template", Precondition::RequiresAbsent),
                ("label", Precondition::RequiresAbsent),
                ("memory", Precondition::None),
            ]
        );
    }

    #[test]
    fn overridden_table_changes_classification() {
        let mut overrides = BTreeMap::new();
        overrides.insert("template".to_string(), "requires-halted".to_string());
        let table = PreconditionTable::with_overrides(&overrides).unwrap();
        let desired = DesiredState::new("work").with_template("debian-12");
        let changes = diff(Some(&observed(PowerState::Running)), &desired, &table);
        assert_eq!(changes[0].precondition, Precondition::RequiresHalted);
    }

    // ── plan ──

    #[test]
    fn running_qube_shuts_down_before_halted_change_and_restarts() {
        let desired = DesiredState::new("work")
            .with_property(Property::Memory, PropertyValue::Int(800))
            .with_property(Property::Vcpus, PropertyValue::Int(4))
            .with_power(DesiredPower::Running);
        let plan = plan(Some(&observed(PowerState::Running)), &desired, &table(), "red").unwrap();
        let steps: Vec<_> = plan.steps.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            steps,
            ["set memory: 400 -> 800", "shutdown", "set vcpus: 2 -> 4", "start"]
        );
    }

    #[test]
    fn live_change_on_running_qube_needs_no_shutdown() {
        let desired = DesiredState::new("work")
            .with_property(Property::Label, PropertyValue::Text("blue".into()));
        let plan = plan(Some(&observed(PowerState::Running)), &desired, &table(), "red").unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(plan.steps[0], Step::Set(_)));
    }

    #[test]
    fn halted_only_change_on_halted_qube_needs_no_shutdown() {
        let desired = DesiredState::new("work")
            .with_property(Property::Vcpus, PropertyValue::Int(4))
            .with_power(DesiredPower::Halted);
        let plan = plan(Some(&observed(PowerState::Halted)), &desired, &table(), "red").unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn present_restores_running_after_halted_change() {
        let desired = DesiredState::new("work").with_property(Property::Vcpus, PropertyValue::Int(4));
        let plan = plan(Some(&observed(PowerState::Running)), &desired, &table(), "red").unwrap();
        assert_eq!(plan.steps.first(), Some(&Step::Shutdown));
        assert_eq!(plan.steps.last(), Some(&Step::Start));
    }

    #[test]
    fn halted_qube_keeps_diff_order() {
        let desired = DesiredState::new("work")
            .with_property(Property::Memory, PropertyValue::Int(800))
            .with_property(Property::Vcpus, PropertyValue::Int(4));
        let plan = plan(Some(&observed(PowerState::Halted)), &desired, &table(), "red").unwrap();
        let steps: Vec<_> = plan.steps.iter().map(|s| s.to_string()).collect();
        assert_eq!(steps, ["set vcpus: 2 -> 4", "set memory: 400 -> 800"]);
    }

    #[test]
    fn immutable_mismatch_aborts_planning() {
        let desired = DesiredState::new("work")
            .with_template("debian-12")
            .with_property(Property::Memory, PropertyValue::Int(800));
        let err = plan(Some(&observed(PowerState::Running)), &desired, &table(), "red").unwrap_err();
        assert_eq!(err.kind(), "ImmutableFieldMismatch");
        assert!(err.to_string().contains("fedora-40 -> debian-12"));
    }

    #[test]
    fn absent_existing_running_qube_is_shut_down_then_removed() {
        let desired = DesiredState::new("work").with_power(DesiredPower::Absent);
        let plan = plan(Some(&observed(PowerState::Running)), &desired, &table(), "red").unwrap();
        assert_eq!(plan.steps, [Step::Shutdown, Step::Remove]);
        assert_eq!(plan.changed_fields(), ["power_state", "state"]);
    }

    #[test]
    fn absent_missing_qube_is_a_no_op() {
        let desired = DesiredState::new("ghost").with_power(DesiredPower::Absent);
        assert!(plan(None, &desired, &table(), "red").unwrap().is_empty());
    }

    #[test]
    fn creation_plan_uses_default_label_and_sets_remaining_fields() {
        let desired = DesiredState::new("new")
            .with_template("fedora-40")
            .with_property(Property::Memory, PropertyValue::Int(800))
            .with_power(DesiredPower::Running);
        let plan = plan(None, &desired, &table(), "gray").unwrap();
        assert_eq!(
            plan.steps[0],
            Step::Create(CreateRequest {
                name: "new".into(),
                class: QubeClass::AppVM,
                template: Some("fedora-40".into()),
                label: "gray".into(),
            })
        );
        assert!(matches!(&plan.steps[1], Step::Set(c) if c.field == Field::Property(Property::Memory)));
        assert_eq!(plan.steps[2], Step::Start);
        assert_eq!(plan.changed_fields(), ["class", "template", "label", "memory", "power_state"]);
    }

    #[test]
    fn creating_appvm_without_template_is_rejected() {
        let desired = DesiredState::new("new");
        let err = plan(None, &desired, &table(), "red").unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }

    #[test]
    fn standalone_creation_needs_no_template() {
        let desired = DesiredState::new("new").with_class(QubeClass::StandaloneVM);
        let plan = plan(None, &desired, &table(), "red").unwrap();
        assert!(matches!(&plan.steps[0], Step::Create(r) if r.template.is_none()));
    }

    #[test]
    fn paused_qube_is_unpaused_for_running() {
        let desired = DesiredState::new("work").with_power(DesiredPower::Running);
        let plan = plan(Some(&observed(PowerState::Paused)), &desired, &table(), "red").unwrap();
        assert_eq!(plan.steps, [Step::Unpause]);
    }
}
