//! Network management subsystem interface
//!
//! The gadget operations only need a small capability surface from the
//! network manager: look up the gadget technology and its services, flip a
//! couple of properties, request (dis)connection and observe changes.
//!
//! ```text
//! GadgetOperation ──► dyn NetworkBackend ──► ConnmanBackend (D-Bus)
//!        ▲                    │
//!        └── NetworkEvent ◄───┘ (broadcast)
//! ```

pub mod connman;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

pub use connman::ConnmanBackend;

/// IPv4 method used for statically configured links
pub const IPV4_METHOD_MANUAL: &str = "manual";

/// Change notification emitted by the network backend
///
/// Notifications carry no payload; consumers re-read the state they care
/// about when one arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A technology appeared or disappeared
    TechnologiesChanged,
    /// The service list changed
    ServicesChanged,
    /// A property of some technology changed
    TechnologyChanged,
    /// A property of some service changed
    ServiceChanged,
}

/// Snapshot of a network technology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TechnologyState {
    /// Object path
    pub path: String,
    /// Human readable name, empty until properties are populated
    pub name: String,
    /// Technology type (e.g. "gadget")
    pub kind: String,
    pub powered: bool,
    pub tethering: bool,
}

/// IPv4 configuration of a service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ipv4Config {
    pub method: String,
    pub address: Option<String>,
    pub netmask: Option<String>,
}

impl Ipv4Config {
    /// Static configuration
    pub fn manual(address: impl Into<String>, netmask: impl Into<String>) -> Self {
        Self {
            method: IPV4_METHOD_MANUAL.to_string(),
            address: Some(address.into()),
            netmask: Some(netmask.into()),
        }
    }

    /// Whether `self`, as reported by the network manager, reflects `requested`
    pub fn applied(&self, requested: &Ipv4Config) -> bool {
        self.method == requested.method
            && (requested.address.is_none() || self.address == requested.address)
    }
}

/// Snapshot of a network service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceState {
    /// Object path
    pub path: String,
    pub name: String,
    pub connected: bool,
    pub ipv4: Ipv4Config,
}

/// Writable technology properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TechnologyProperty {
    Powered(bool),
    Tethering(bool),
}

impl TechnologyProperty {
    /// Property name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            TechnologyProperty::Powered(_) => "Powered",
            TechnologyProperty::Tethering(_) => "Tethering",
        }
    }

    pub fn value(&self) -> bool {
        match self {
            TechnologyProperty::Powered(v) | TechnologyProperty::Tethering(v) => *v,
        }
    }
}

/// Capability surface of the network management subsystem
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Subscribe to change notifications
    ///
    /// Subscribe before acting on the backend so that no change triggered by
    /// the action can be missed.
    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent>;

    /// Look up a technology by type
    async fn technology(&self, kind: &str) -> Result<Option<TechnologyState>>;

    /// Write a technology property
    async fn set_technology_property(&self, kind: &str, property: TechnologyProperty)
        -> Result<()>;

    /// List services belonging to a technology type
    async fn services(&self, kind: &str) -> Result<Vec<ServiceState>>;

    /// Write the IPv4 configuration of a service
    async fn set_ipv4_config(&self, service: &str, config: &Ipv4Config) -> Result<()>;

    /// Request a service to connect; completion is signalled via events
    async fn connect_service(&self, service: &str) -> Result<()>;

    /// Request a service to disconnect; completion is signalled via events
    async fn disconnect_service(&self, service: &str) -> Result<()>;
}
