//! ConnMan backend over D-Bus
//!
//! Technologies and services are looked up by their `Type` property. ConnMan
//! does not implement `org.freedesktop.DBus.Properties`; state is read with
//! `GetProperties` and tracked through `PropertyChanged` signals.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, MatchRule, MessageStream};

use super::{
    Ipv4Config, NetworkBackend, NetworkEvent, ServiceState, TechnologyProperty, TechnologyState,
};
use crate::error::{AppError, Result};

const CONNMAN_SERVICE: &str = "net.connman";
const TECHNOLOGY_INTERFACE: &str = "net.connman.Technology";
const SERVICE_INTERFACE: &str = "net.connman.Service";

/// Event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 64;

type PropertyMap = HashMap<String, OwnedValue>;

#[zbus::proxy(
    default_service = "net.connman",
    interface = "net.connman.Manager",
    default_path = "/"
)]
trait Manager {
    fn get_technologies(&self) -> zbus::Result<Vec<(OwnedObjectPath, PropertyMap)>>;

    fn get_services(&self) -> zbus::Result<Vec<(OwnedObjectPath, PropertyMap)>>;

    #[zbus(signal)]
    fn technology_added(&self, path: OwnedObjectPath, properties: PropertyMap)
        -> zbus::Result<()>;

    #[zbus(signal)]
    fn technology_removed(&self, path: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal)]
    fn services_changed(
        &self,
        changed: Vec<(OwnedObjectPath, PropertyMap)>,
        removed: Vec<OwnedObjectPath>,
    ) -> zbus::Result<()>;
}

#[zbus::proxy(default_service = "net.connman", interface = "net.connman.Technology")]
trait Technology {
    fn set_property(&self, name: &str, value: &Value<'_>) -> zbus::Result<()>;
}

#[zbus::proxy(default_service = "net.connman", interface = "net.connman.Service")]
trait Service {
    fn set_property(&self, name: &str, value: &Value<'_>) -> zbus::Result<()>;

    fn connect(&self) -> zbus::Result<()>;

    fn disconnect(&self) -> zbus::Result<()>;
}

/// ConnMan network backend
pub struct ConnmanBackend {
    conn: Connection,
    manager: ManagerProxy<'static>,
    events: broadcast::Sender<NetworkEvent>,
    forwarder: JoinHandle<()>,
}

impl ConnmanBackend {
    /// Connect to ConnMan on the system bus
    pub async fn system() -> Result<Self> {
        let conn = Connection::system().await?;
        Self::new(conn).await
    }

    /// Create a backend on an existing connection and start forwarding signals
    pub async fn new(conn: Connection) -> Result<Self> {
        let manager = ManagerProxy::new(&conn).await?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut stream = signal_stream(&conn, &manager).await?;
        let tx = events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                debug!("ConnMan change: {:?}", event);
                // No subscribers is normal outside of an operation
                let _ = tx.send(event);
            }
            warn!("ConnMan signal stream ended");
        });

        info!("Connected to ConnMan");
        Ok(Self {
            conn,
            manager,
            events,
            forwarder,
        })
    }

    async fn technology_path(&self, kind: &str) -> Result<String> {
        self.technology(kind)
            .await?
            .map(|t| t.path)
            .ok_or_else(|| AppError::FailedRequest(format!("Technology {} not found", kind)))
    }

    async fn service_proxy(&self, path: &str) -> Result<ServiceProxy<'static>> {
        Ok(ServiceProxy::builder(&self.conn)
            .path(path.to_string())?
            .build()
            .await?)
    }
}

impl Drop for ConnmanBackend {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[async_trait]
impl NetworkBackend for ConnmanBackend {
    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    async fn technology(&self, kind: &str) -> Result<Option<TechnologyState>> {
        let technologies = self.manager.get_technologies().await?;
        Ok(technologies
            .into_iter()
            .find(|(_, props)| prop_string(props, "Type").as_deref() == Some(kind))
            .map(|(path, props)| TechnologyState {
                path: path.to_string(),
                name: prop_string(&props, "Name").unwrap_or_default(),
                kind: kind.to_string(),
                powered: prop_bool(&props, "Powered"),
                tethering: prop_bool(&props, "Tethering"),
            }))
    }

    async fn set_technology_property(
        &self,
        kind: &str,
        property: TechnologyProperty,
    ) -> Result<()> {
        let path = self.technology_path(kind).await?;
        debug!("Setting {} = {} on {}", property.name(), property.value(), path);

        let proxy = TechnologyProxy::builder(&self.conn)
            .path(path)?
            .build()
            .await?;
        match proxy
            .set_property(property.name(), &Value::from(property.value()))
            .await
        {
            Ok(()) => Ok(()),
            // Requested state is already in effect
            Err(e) if is_already_error(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn services(&self, kind: &str) -> Result<Vec<ServiceState>> {
        let services = self.manager.get_services().await?;
        Ok(services
            .into_iter()
            .filter(|(_, props)| prop_string(props, "Type").as_deref() == Some(kind))
            .map(|(path, props)| ServiceState {
                path: path.to_string(),
                name: prop_string(&props, "Name").unwrap_or_default(),
                connected: matches!(
                    prop_string(&props, "State").as_deref(),
                    Some("ready") | Some("online")
                ),
                ipv4: props
                    .get("IPv4.Configuration")
                    .map(|v| ipv4_from_value(v))
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn set_ipv4_config(&self, service: &str, config: &Ipv4Config) -> Result<()> {
        let mut dict: HashMap<&str, Value<'_>> = HashMap::new();
        dict.insert("Method", Value::from(config.method.as_str()));
        if let Some(ref address) = config.address {
            dict.insert("Address", Value::from(address.as_str()));
        }
        if let Some(ref netmask) = config.netmask {
            dict.insert("Netmask", Value::from(netmask.as_str()));
        }

        let proxy = self.service_proxy(service).await?;
        proxy
            .set_property("IPv4.Configuration", &Value::from(dict))
            .await?;
        Ok(())
    }

    async fn connect_service(&self, service: &str) -> Result<()> {
        let proxy = self.service_proxy(service).await?;
        let path = service.to_string();
        // Connect() only returns once ConnMan is done, which can take much longer
        // than any step timeout. The outcome is observed through State changes.
        tokio::spawn(async move {
            if let Err(e) = proxy.connect().await {
                if !is_already_error(&e) {
                    warn!("Connect request for {} failed: {}", path, e);
                }
            }
        });
        Ok(())
    }

    async fn disconnect_service(&self, service: &str) -> Result<()> {
        let proxy = self.service_proxy(service).await?;
        let path = service.to_string();
        tokio::spawn(async move {
            if let Err(e) = proxy.disconnect().await {
                if !is_already_error(&e) {
                    warn!("Disconnect request for {} failed: {}", path, e);
                }
            }
        });
        Ok(())
    }
}

/// Merge all ConnMan signals relevant to gadget operations into one stream
async fn signal_stream(
    conn: &Connection,
    manager: &ManagerProxy<'static>,
) -> Result<BoxStream<'static, NetworkEvent>> {
    let technology_added = manager.receive_technology_added().await?;
    let technology_removed = manager.receive_technology_removed().await?;
    let services_changed = manager.receive_services_changed().await?;
    let technology_props = property_changed_stream(conn, TECHNOLOGY_INTERFACE).await?;
    let service_props = property_changed_stream(conn, SERVICE_INTERFACE).await?;

    let streams: Vec<BoxStream<'static, NetworkEvent>> = vec![
        technology_added
            .map(|_| NetworkEvent::TechnologiesChanged)
            .boxed(),
        technology_removed
            .map(|_| NetworkEvent::TechnologiesChanged)
            .boxed(),
        services_changed
            .map(|_| NetworkEvent::ServicesChanged)
            .boxed(),
        technology_props
            .filter_map(|msg| async move { msg.ok().map(|_| NetworkEvent::TechnologyChanged) })
            .boxed(),
        service_props
            .filter_map(|msg| async move { msg.ok().map(|_| NetworkEvent::ServiceChanged) })
            .boxed(),
    ];

    Ok(futures::stream::select_all(streams).boxed())
}

/// `PropertyChanged` signals of an interface, on any object path
async fn property_changed_stream(
    conn: &Connection,
    interface: &'static str,
) -> Result<MessageStream> {
    let rule = MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(CONNMAN_SERVICE)?
        .interface(interface)?
        .member("PropertyChanged")?
        .build();
    Ok(MessageStream::for_match_rule(rule, conn, Some(EVENT_CHANNEL_CAPACITY)).await?)
}

fn is_already_error(e: &zbus::Error) -> bool {
    let text = e.to_string();
    text.contains("AlreadyConnected")
        || text.contains("NotConnected")
        || text.contains("AlreadyEnabled")
        || text.contains("AlreadyDisabled")
}

fn value_string(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.to_string()),
        Value::Value(inner) => value_string(inner),
        _ => None,
    }
}

fn value_bool(value: &Value<'_>) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Value(inner) => value_bool(inner),
        _ => None,
    }
}

fn prop_string(props: &PropertyMap, key: &str) -> Option<String> {
    props.get(key).and_then(|v| value_string(v))
}

fn prop_bool(props: &PropertyMap, key: &str) -> bool {
    props.get(key).and_then(|v| value_bool(v)).unwrap_or(false)
}

fn ipv4_from_value(value: &Value<'_>) -> Ipv4Config {
    let dict = match value {
        Value::Dict(dict) => dict,
        Value::Value(inner) => return ipv4_from_value(inner),
        _ => return Ipv4Config::default(),
    };

    let mut config = Ipv4Config::default();
    for (key, value) in dict.iter() {
        let (Some(key), Some(value)) = (value_string(key), value_string(value)) else {
            continue;
        };
        match key.as_str() {
            "Method" => config.method = value,
            "Address" => config.address = Some(value),
            "Netmask" => config.netmask = Some(value),
            _ => {}
        }
    }
    config
}
