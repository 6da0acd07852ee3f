//! In-memory Qubes host for tests.
//!
//! `FakeHost` implements both `CallChannel` and `AdminApi` over one shared
//! state, so a transport and a reconciler built from clones of the same host
//! see each other's effects. Every mutating admin call is recorded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::admin::{AdminApi, CreateRequest, PowerAction, QubeSummary};
use crate::channel::{
    CallChannel, CallOutcome, CallRequest, ChannelFault, ROOT_USER, VM_EXEC, VM_SHELL,
    WAIT_FOR_SESSION,
};
use crate::diff::{Precondition, PreconditionTable};
use crate::error::QopsError;
use crate::property::{Property, PropertyValue};
use crate::qube::{ObservedState, PowerState, QubeClass};

/// `(user, payload) -> (status, stdout, stderr)` for `qubes.VMShell` calls.
pub type ShellHandler = Arc<dyn Fn(&str, &[u8]) -> (i32, Vec<u8>, Vec<u8>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FakeQube {
    pub class: QubeClass,
    pub power: PowerState,
    pub properties: BTreeMap<Property, PropertyValue>,
}

#[derive(Default)]
struct HostState {
    qubes: BTreeMap<String, FakeQube>,
    mutations: Vec<String>,
    calls: Vec<CallRequest>,
    files: BTreeMap<(String, String), Vec<u8>>,
    /// Power actions on these qubes are accepted and then ignored.
    frozen: BTreeSet<String>,
    /// Graceful shutdowns of these qubes are ignored; kills still work.
    stubborn: BTreeSet<String>,
    /// Calls as root into these qubes exit 127, as without a root service.
    rootless: BTreeSet<String>,
    /// Power actions on these qubes are refused by policy.
    denied: BTreeSet<String>,
    shell: Option<ShellHandler>,
    channel_fault: Option<(ChannelFault, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a qube with typical properties.
    pub fn with_qube(self, name: &str, class: QubeClass, power: PowerState) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(Property::Label, PropertyValue::Text("red".into()));
        properties.insert(Property::Memory, PropertyValue::Int(400));
        properties.insert(Property::Vcpus, PropertyValue::Int(2));
        properties.insert(Property::Netvm, PropertyValue::Text("sys-firewall".into()));
        properties.insert(Property::Autostart, PropertyValue::Bool(false));
        if class.requires_template() {
            properties.insert(Property::Template, PropertyValue::Text("fedora-40".into()));
        }
        self.lock().qubes.insert(
            name.into(),
            FakeQube {
                class,
                power,
                properties,
            },
        );
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn set_power(&self, name: &str, power: PowerState) {
        if let Some(q) = self.lock().qubes.get_mut(name) {
            q.power = power;
        }
    }

    pub fn freeze_power(&self, name: &str) {
        self.lock().frozen.insert(name.into());
    }

    pub fn ignore_shutdown(&self, name: &str) {
        self.lock().stubborn.insert(name.into());
    }

    pub fn without_root(&self, name: &str) {
        self.lock().rootless.insert(name.into());
    }

    pub fn deny_power(&self, name: &str) {
        self.lock().denied.insert(name.into());
    }

    pub fn power(&self, name: &str) -> Option<PowerState> {
        self.lock().qubes.get(name).map(|q| q.power)
    }

    pub fn property(&self, name: &str, property: Property) -> Option<PropertyValue> {
        self.lock()
            .qubes
            .get(name)
            .and_then(|q| q.properties.get(&property).cloned())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().qubes.contains_key(name)
    }

    pub fn on_shell(
        &self,
        handler: impl Fn(&str, &[u8]) -> (i32, Vec<u8>, Vec<u8>) + Send + Sync + 'static,
    ) {
        self.lock().shell = Some(Arc::new(handler));
    }

    /// Make every following call fail at the channel level after writing
    /// `partial_stdout`.
    pub fn fail_channel(&self, fault: ChannelFault, partial_stdout: &[u8]) {
        self.lock().channel_fault = Some((fault, partial_stdout.to_vec()));
    }

    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    pub fn calls(&self) -> Vec<CallRequest> {
        self.lock().calls.clone()
    }

    pub fn file(&self, qube: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(&(qube.to_string(), path.to_string()))
            .cloned()
    }

    fn record(&self, mutation: String) {
        self.lock().mutations.push(mutation);
    }

    fn not_found(name: &str, operation: &str) -> QopsError {
        QopsError::TargetNotFound {
            qube: name.into(),
            operation: operation.into(),
        }
    }
}

/// Inverse of the `qubes.VMExec` argument encoding.
pub fn decode_vmexec_args(encoded: &str) -> Vec<Vec<u8>> {
    encoded
        .split('+')
        .map(|part| {
            let bytes = part.as_bytes();
            let mut out = Vec::new();
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'-' {
                    if bytes.get(i + 1) == Some(&b'-') {
                        out.push(b'-');
                        i += 2;
                    } else {
                        let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
                        out.push(u8::from_str_radix(hex, 16).unwrap());
                        i += 3;
                    }
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            out
        })
        .collect()
}

enum Reply {
    Done(i32, Vec<u8>, Vec<u8>),
    Shell(ShellHandler),
    Fault(ChannelFault, Vec<u8>),
}

impl HostState {
    fn exec(&mut self, qube: &str, argv: &[Vec<u8>], input: Vec<u8>) -> Reply {
        let args: Vec<String> = argv
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["dd", "status=none", of] if of.starts_with("of=") => {
                self.files
                    .insert((qube.into(), of["of=".len()..].into()), input);
                Reply::Done(0, Vec::new(), Vec::new())
            }
            ["cat", "--", path] => match self.files.get(&(qube.to_string(), path.to_string())) {
                Some(content) => Reply::Done(0, content.clone(), Vec::new()),
                None => Reply::Done(
                    1,
                    Vec::new(),
                    format!("cat: {path}: No such file or directory\n").into_bytes(),
                ),
            },
            _ => Reply::Done(127, Vec::new(), b"command not found\n".to_vec()),
        }
    }
}

#[async_trait]
impl CallChannel for FakeHost {
    async fn invoke(
        &self,
        request: &CallRequest,
        payload: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> CallOutcome {
        let mut input = Vec::new();
        if let Err(e) = payload.read_to_end(&mut input).await {
            return CallOutcome::failed(ChannelFault::Unavailable(e.to_string()), Vec::new());
        }

        let reply = {
            let mut state = self.lock();
            state.calls.push(request.clone());
            let running = state
                .qubes
                .get(&request.target)
                .is_some_and(|q| q.power == PowerState::Running);
            if let Some((fault, partial)) = state.channel_fault.clone() {
                Reply::Fault(fault, partial)
            } else if !running {
                Reply::Fault(
                    ChannelFault::Unavailable(format!("domain '{}' is not running", request.target)),
                    Vec::new(),
                )
            } else if request.user == ROOT_USER && state.rootless.contains(&request.target) {
                Reply::Done(127, Vec::new(), b"sudo: command not found\n".to_vec())
            } else if request.service == VM_SHELL {
                match &state.shell {
                    Some(handler) => Reply::Shell(handler.clone()),
                    None => Reply::Done(0, Vec::new(), Vec::new()),
                }
            } else if let Some(arg) = request
                .service
                .strip_prefix(VM_EXEC)
                .and_then(|s| s.strip_prefix('+'))
            {
                state.exec(&request.target, &decode_vmexec_args(arg), input.clone())
            } else if request.service == WAIT_FOR_SESSION {
                Reply::Done(0, Vec::new(), Vec::new())
            } else {
                Reply::Fault(ChannelFault::PolicyDenied("Request refused".into()), Vec::new())
            }
        };

        let (exit, out, err) = match reply {
            Reply::Done(status, out, err) => (Ok(status), out, err),
            Reply::Shell(handler) => {
                let (status, out, err) = handler(&request.user, &input);
                (Ok(status), out, err)
            }
            Reply::Fault(fault, partial) => (Err(fault), partial, Vec::new()),
        };

        if let Err(e) = stdout.write_all(&out).await {
            return CallOutcome::failed(ChannelFault::Unavailable(e.to_string()), err);
        }
        match exit {
            Ok(status) => CallOutcome::exited(status, err),
            Err(fault) => CallOutcome::failed(fault, err),
        }
    }
}

#[async_trait]
impl AdminApi for FakeHost {
    async fn list(&self) -> Result<Vec<QubeSummary>, QopsError> {
        Ok(self
            .lock()
            .qubes
            .iter()
            .map(|(name, q)| QubeSummary {
                name: name.clone(),
                class: q.class,
                power: q.power,
            })
            .collect())
    }

    async fn get_properties(&self, name: &str) -> Result<Option<ObservedState>, QopsError> {
        Ok(self.lock().qubes.get(name).map(|q| ObservedState {
            name: name.into(),
            class: q.class,
            power: q.power,
            properties: q.properties.clone(),
        }))
    }

    async fn set_property(
        &self,
        name: &str,
        property: Property,
        value: &PropertyValue,
    ) -> Result<(), QopsError> {
        {
            let mut state = self.lock();
            let Some(qube) = state.qubes.get_mut(name) else {
                return Err(Self::not_found(name, "set property"));
            };
            let halted_only = property == Property::Template
                || PreconditionTable::default().get(property) == Precondition::RequiresHalted;
            if halted_only && qube.power != PowerState::Halted {
                return Err(QopsError::AdminApi {
                    qube: name.into(),
                    method: "admin.vm.property.Set".into(),
                    exception: "QubesVMNotHaltedError".into(),
                    message: format!("cannot change {property} of a running qube"),
                });
            }
            qube.properties.insert(property, value.clone());
        }
        self.record(format!("set {name} {property}={value}"));
        Ok(())
    }

    async fn create(&self, request: &CreateRequest) -> Result<(), QopsError> {
        {
            let mut state = self.lock();
            if state.qubes.contains_key(&request.name) {
                return Err(QopsError::AdminApi {
                    qube: request.name.clone(),
                    method: format!("admin.vm.Create.{}", request.class),
                    exception: "QubesValueError".into(),
                    message: "VM name already in use".into(),
                });
            }
            let mut properties = BTreeMap::new();
            properties.insert(Property::Label, PropertyValue::Text(request.label.clone()));
            if let Some(template) = &request.template {
                properties.insert(Property::Template, PropertyValue::Text(template.clone()));
            }
            state.qubes.insert(
                request.name.clone(),
                FakeQube {
                    class: request.class,
                    power: PowerState::Halted,
                    properties,
                },
            );
        }
        self.record(format!("create {}", request.name));
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<(), QopsError> {
        {
            let mut state = self.lock();
            let Some(qube) = state.qubes.get(name) else {
                return Err(Self::not_found(name, "remove"));
            };
            if qube.power.is_active() {
                return Err(QopsError::Busy {
                    qube: name.into(),
                    operation: "remove".into(),
                    cause: format!("qube is {}", qube.power),
                });
            }
            state.qubes.remove(name);
        }
        self.record(format!("remove {name}"));
        Ok(())
    }

    async fn set_power_state(&self, name: &str, action: PowerAction) -> Result<(), QopsError> {
        {
            let mut state = self.lock();
            if state.denied.contains(name) {
                return Err(QopsError::PolicyDenied {
                    qube: name.into(),
                    operation: action.to_string(),
                    cause: "Request refused".into(),
                });
            }
            let frozen = state.frozen.contains(name)
                || (action == PowerAction::Shutdown && state.stubborn.contains(name));
            let Some(qube) = state.qubes.get_mut(name) else {
                return Err(Self::not_found(name, &action.to_string()));
            };
            if !frozen {
                qube.power = match action {
                    PowerAction::Start | PowerAction::Unpause => PowerState::Running,
                    PowerAction::Shutdown | PowerAction::Kill => PowerState::Halted,
                };
            }
        }
        self.record(format!("{action} {name}"));
        Ok(())
    }
}
