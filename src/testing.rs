//! In-memory collaborators for tests
//!
//! `FakeNetwork` behaves like a cooperative network manager: writes are
//! applied after a short delay and announced with a change notification,
//! unless the action has been told to stall or to block. `FakeHost`
//! records every command and succeeds unless a failure was scripted for it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::network::{
    Ipv4Config, NetworkBackend, NetworkEvent, ServiceState, TechnologyProperty, TechnologyState,
};
use crate::system::{CommandOutput, HostControl};

pub const GADGET_SERVICE: &str = "/net/connman/service/gadget_1";

/// Delay before the fake network manager applies a write
const REACTION_DELAY: Duration = Duration::from_millis(200);

/// Assert that (paused) time advanced by `expected`, within timer granularity
pub fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected && elapsed <= expected + Duration::from_millis(5),
        "elapsed {:?}, expected {:?}",
        elapsed,
        expected
    );
}

#[derive(Default)]
struct NetworkState {
    technology: Option<TechnologyState>,
    services: Vec<ServiceState>,
    stalled: HashSet<String>,
    blocked: HashMap<String, Duration>,
    stall_all: bool,
}

impl NetworkState {
    fn stalls(&self, action: &str) -> bool {
        self.stall_all || self.stalled.contains(action)
    }
}

pub struct FakeNetwork {
    state: Arc<Mutex<NetworkState>>,
    events: broadcast::Sender<NetworkEvent>,
    calls: Mutex<Vec<String>>,
}

impl FakeNetwork {
    /// No technologies, no services
    pub fn empty() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            events,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Powered gadget technology, no services
    pub fn with_gadget() -> Self {
        let network = Self::empty();
        network.state.lock().technology = Some(gadget_technology());
        network
    }

    /// Powered gadget technology with one disconnected service
    pub fn with_gadget_service() -> Self {
        let network = Self::with_gadget();
        network.state.lock().services.push(gadget_service());
        network
    }

    pub fn notify(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }

    pub fn update_technology(&self, f: impl FnOnce(&mut TechnologyState)) {
        if let Some(tech) = self.state.lock().technology.as_mut() {
            f(tech);
        }
    }

    pub fn update_service(&self, f: impl FnOnce(&mut ServiceState)) {
        if let Some(service) = self.state.lock().services.first_mut() {
            f(service);
        }
    }

    pub fn technology_state(&self) -> Option<TechnologyState> {
        self.state.lock().technology.clone()
    }

    pub fn service_state(&self) -> Option<ServiceState> {
        self.state.lock().services.first().cloned()
    }

    /// Make every write a no-op (`false`) or apply writes again (`true`)
    pub fn set_responsive(&self, responsive: bool) {
        self.state.lock().stall_all = !responsive;
    }

    /// Ignore one kind of write: "Powered", "Tethering", "IPv4", "Connect" or "Disconnect"
    pub fn stall(&self, action: &str) {
        self.state.lock().stalled.insert(action.to_string());
    }

    /// Hold the reply to one kind of write for `delay`, then fail it
    ///
    /// Mimics a network manager that only answers once its own request
    /// timeout expires.
    pub fn block(&self, action: &str, delay: Duration) {
        self.state.lock().blocked.insert(action.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn add_gadget_after(&self, delay: Duration) {
        self.later(delay, NetworkEvent::TechnologiesChanged, |state| {
            state.technology = Some(gadget_technology());
        });
    }

    pub fn add_service_after(&self, delay: Duration) {
        self.later(delay, NetworkEvent::ServicesChanged, |state| {
            state.services.push(gadget_service());
        });
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn later(
        &self,
        delay: Duration,
        event: NetworkEvent,
        f: impl FnOnce(&mut NetworkState) + Send + 'static,
    ) {
        let state = self.state.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f(&mut state.lock());
            let _ = events.send(event);
        });
    }

    /// Reply to a write, late and failed if `action` is blocked
    async fn reply(&self, action: &str) -> Result<()> {
        let blocked = self.state.lock().blocked.get(action).copied();
        if let Some(delay) = blocked {
            tokio::time::sleep(delay).await;
            return Err(AppError::FailedRequest("net.connman.Error.Failed".to_string()));
        }
        Ok(())
    }

    /// Apply a write after the reaction delay, unless `action` is stalled
    fn react(
        &self,
        action: &str,
        event: NetworkEvent,
        f: impl FnOnce(&mut NetworkState) + Send + 'static,
    ) {
        if self.state.lock().stalls(action) {
            return;
        }
        self.later(REACTION_DELAY, event, f);
    }
}

#[async_trait]
impl NetworkBackend for FakeNetwork {
    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    async fn technology(&self, kind: &str) -> Result<Option<TechnologyState>> {
        Ok(self
            .state
            .lock()
            .technology
            .clone()
            .filter(|t| t.kind == kind))
    }

    async fn set_technology_property(
        &self,
        _kind: &str,
        property: TechnologyProperty,
    ) -> Result<()> {
        self.record(format!(
            "set_technology_property {}={}",
            property.name(),
            property.value()
        ));
        self.reply(property.name()).await?;
        self.react(property.name(), NetworkEvent::TechnologyChanged, move |state| {
            if let Some(tech) = state.technology.as_mut() {
                match property {
                    TechnologyProperty::Powered(v) => tech.powered = v,
                    TechnologyProperty::Tethering(v) => tech.tethering = v,
                }
            }
        });
        Ok(())
    }

    async fn services(&self, _kind: &str) -> Result<Vec<ServiceState>> {
        Ok(self.state.lock().services.clone())
    }

    async fn set_ipv4_config(&self, service: &str, config: &Ipv4Config) -> Result<()> {
        self.record(format!(
            "set_ipv4_config {} {} {}",
            service,
            config.method,
            config.address.as_deref().unwrap_or("-")
        ));
        self.reply("IPv4").await?;
        let config = config.clone();
        let path = service.to_string();
        self.react("IPv4", NetworkEvent::ServiceChanged, move |state| {
            if let Some(s) = state.services.iter_mut().find(|s| s.path == path) {
                s.ipv4 = config;
            }
        });
        Ok(())
    }

    async fn connect_service(&self, service: &str) -> Result<()> {
        self.record(format!("connect {}", service));
        self.reply("Connect").await?;
        let path = service.to_string();
        self.react("Connect", NetworkEvent::ServiceChanged, move |state| {
            if let Some(s) = state.services.iter_mut().find(|s| s.path == path) {
                s.connected = true;
            }
        });
        Ok(())
    }

    async fn disconnect_service(&self, service: &str) -> Result<()> {
        self.record(format!("disconnect {}", service));
        self.reply("Disconnect").await?;
        let path = service.to_string();
        self.react("Disconnect", NetworkEvent::ServiceChanged, move |state| {
            if let Some(s) = state.services.iter_mut().find(|s| s.path == path) {
                s.connected = false;
            }
        });
        Ok(())
    }
}

fn gadget_technology() -> TechnologyState {
    TechnologyState {
        path: "/net/connman/technology/gadget".to_string(),
        name: "Gadget".to_string(),
        kind: "gadget".to_string(),
        powered: true,
        tethering: false,
    }
}

fn gadget_service() -> ServiceState {
    ServiceState {
        path: GADGET_SERVICE.to_string(),
        name: "Wired".to_string(),
        connected: false,
        ipv4: Ipv4Config {
            method: "dhcp".to_string(),
            address: None,
            netmask: None,
        },
    }
}

#[derive(Default)]
struct HostState {
    loaded: Vec<String>,
    calls: Vec<String>,
    failures: HashMap<String, CommandOutput>,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module_loaded(name: &str) -> Self {
        let host = Self::new();
        host.state.lock().loaded.push(name.to_string());
        host
    }

    /// Script a failure for a call, e.g. "stop dnsmasq-usb-gadget.service"
    pub fn fail(&self, call: &str, code: i32, stderr: &str) {
        self.state
            .lock()
            .failures
            .insert(call.to_string(), CommandOutput::failed(code, stderr));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state.lock().loaded.iter().any(|m| m == name)
    }

    fn run(&self, call: String) -> Option<CommandOutput> {
        let mut state = self.state.lock();
        state.calls.push(call.clone());
        state.failures.get(&call).cloned()
    }
}

#[async_trait]
impl HostControl for FakeHost {
    async fn loaded_modules(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().loaded.clone())
    }

    async fn load_module(&self, name: &str) -> Result<CommandOutput> {
        if let Some(failure) = self.run(format!("modprobe {}", name)) {
            return Ok(failure);
        }
        self.state.lock().loaded.push(name.to_string());
        Ok(CommandOutput::ok(""))
    }

    async fn unload_module(&self, name: &str) -> Result<CommandOutput> {
        if let Some(failure) = self.run(format!("rmmod {}", name)) {
            return Ok(failure);
        }
        self.state.lock().loaded.retain(|m| m != name);
        Ok(CommandOutput::ok(""))
    }

    async fn start_unit(&self, unit: &str) -> Result<CommandOutput> {
        Ok(self
            .run(format!("start {}", unit))
            .unwrap_or_else(|| CommandOutput::ok("")))
    }

    async fn stop_unit(&self, unit: &str) -> Result<CommandOutput> {
        Ok(self
            .run(format!("stop {}", unit))
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}
