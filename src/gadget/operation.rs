//! Gadget mode operations
//!
//! One [`GadgetModeOperation`] brings a single mode up or down. Steps run
//! strictly in order; the first failing step aborts the operation with its
//! own error, and nothing is rolled back. Every wait on the network manager
//! is bounded by the configured step timeout.

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use super::address::{choose_address_block, render_dhcp_config, write_dhcp_config, AddressBlock};
use super::types::Mode;
use super::waiter::{technology_ready, ReadinessWaiter};
use crate::config::{DhcpConfig, GadgetConfig};
use crate::error::{AppError, Result};
use crate::network::{NetworkBackend, ServiceState, TechnologyProperty, TechnologyState};
use crate::system::HostControl;

const NO_SERVICES: &str = "No networking services found for the Gadget.";
const NO_SERVICES_UNPLUGGED: &str =
    "No networking services found for the Gadget. The cable is likely unplugged.";

/// Collaborators and settings shared by all operations
#[derive(Clone)]
pub struct GadgetContext {
    pub network: Arc<dyn NetworkBackend>,
    pub host: Arc<dyn HostControl>,
    pub gadget: GadgetConfig,
    pub dhcp: DhcpConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Activate,
    Deactivate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Activate => write!(f, "activate"),
            OperationKind::Deactivate => write!(f, "deactivate"),
        }
    }
}

/// Operation steps, in the order they can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Created,
    StopDhcp,
    LoadModule,
    TechnologyReady,
    AssignAddress,
    Connect,
    ProvisionDhcp,
    EnableTethering,
    Disconnect,
    DisableTethering,
    PowerDown,
    UnloadModule,
    Finished,
}

/// A single activation or deactivation attempt
///
/// Created for one validated request, run once, then dropped.
pub struct GadgetModeOperation {
    id: Uuid,
    kind: OperationKind,
    mode: Mode,
    step: Step,
    address: Option<AddressBlock>,
    ctx: Arc<GadgetContext>,
}

impl GadgetModeOperation {
    /// Prepare activation of `mode`, choosing the P2P address block up front
    pub fn activate<R: Rng + ?Sized>(ctx: Arc<GadgetContext>, mode: Mode, rng: &mut R) -> Self {
        let address = (mode == Mode::EthernetP2p).then(|| choose_address_block(rng));
        Self::new(ctx, OperationKind::Activate, mode, address)
    }

    /// Prepare deactivation of the currently active `mode`
    pub fn deactivate(ctx: Arc<GadgetContext>, mode: Mode) -> Self {
        Self::new(ctx, OperationKind::Deactivate, mode, None)
    }

    fn new(
        ctx: Arc<GadgetContext>,
        kind: OperationKind,
        mode: Mode,
        address: Option<AddressBlock>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            mode,
            step: Step::Created,
            address,
            ctx,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn address(&self) -> Option<AddressBlock> {
        self.address
    }

    /// Run every step to a terminal outcome
    pub async fn run(mut self) -> Result<()> {
        let span = info_span!(
            "gadget_operation",
            id = %self.id,
            operation = %self.kind,
            mode = %self.mode
        );

        async move {
            info!("Starting");
            let result = match self.kind {
                OperationKind::Activate => self.run_activate().await,
                OperationKind::Deactivate => self.run_deactivate().await,
            };
            match &result {
                Ok(()) => {
                    self.enter(Step::Finished);
                    info!("Completed");
                }
                Err(e) => error!("Failed during {:?}: {}", self.step, e),
            }
            result
        }
        .instrument(span)
        .await
    }

    fn enter(&mut self, step: Step) {
        debug!("Step {:?}", step);
        self.step = step;
    }

    async fn run_activate(&mut self) -> Result<()> {
        self.enter(Step::LoadModule);
        self.ensure_module_loaded().await?;

        self.enter(Step::TechnologyReady);
        self.technology().await?;

        match self.mode {
            Mode::EthernetP2p => {
                self.enter(Step::AssignAddress);
                let service = self.assign_address().await?;

                self.enter(Step::Connect);
                self.connect(&service).await?;

                self.enter(Step::ProvisionDhcp);
                self.provision_dhcp().await
            }
            Mode::EthernetTethering => {
                self.enter(Step::EnableTethering);
                self.set_technology(
                    TechnologyProperty::Tethering(true),
                    "Could not set up Tethering on the Gadget.",
                    |t| t.tethering,
                )
                .await
            }
            Mode::None => Err(AppError::Internal("Cannot activate mode none".to_string())),
        }
    }

    async fn run_deactivate(&mut self) -> Result<()> {
        if self.mode == Mode::EthernetP2p {
            self.enter(Step::StopDhcp);
            self.stop_dhcp().await?;
        }

        self.enter(Step::TechnologyReady);
        self.technology().await?;

        match self.mode {
            Mode::EthernetP2p => {
                self.enter(Step::Disconnect);
                self.disconnect().await?;
            }
            Mode::EthernetTethering => {
                self.enter(Step::DisableTethering);
                self.set_technology(
                    TechnologyProperty::Tethering(false),
                    "Could not bring down Tethering on the Gadget.",
                    |t| !t.tethering,
                )
                .await?;
            }
            Mode::None => {
                return Err(AppError::Internal("Cannot deactivate mode none".to_string()))
            }
        }

        self.enter(Step::PowerDown);
        self.power_down().await?;

        self.enter(Step::UnloadModule);
        self.unload_module().await
    }

    fn waiter(&self) -> ReadinessWaiter {
        ReadinessWaiter::new(self.ctx.network.as_ref(), self.ctx.gadget.step_timeout())
    }

    async fn technology(&self) -> Result<TechnologyState> {
        technology_ready(
            self.ctx.network.as_ref(),
            &self.ctx.gadget.technology,
            self.ctx.gadget.step_timeout(),
        )
        .await
    }

    async fn ensure_module_loaded(&self) -> Result<()> {
        let module = &self.ctx.gadget.kernel_module;
        let loaded = self.ctx.host.loaded_modules().await?;
        if loaded.iter().any(|m| m == module) {
            debug!("Kernel module {} already loaded", module);
            return Ok(());
        }

        info!("Loading kernel module {}", module);
        let output = self.ctx.host.load_module(module).await?;
        if !output.success() {
            return Err(AppError::FailedRequest(format!(
                "Could not load kernel module {}: {}",
                module,
                output.error_text()
            )));
        }
        Ok(())
    }

    async fn unload_module(&self) -> Result<()> {
        let module = &self.ctx.gadget.kernel_module;
        info!("Unloading kernel module {}", module);
        let output = self.ctx.host.unload_module(module).await?;
        if !output.success() {
            return Err(AppError::FailedRequest(format!(
                "Could not unload kernel module {}: {}",
                module,
                output.error_text()
            )));
        }
        Ok(())
    }

    /// Write a technology property and wait until `done` holds
    async fn set_technology<F>(
        &self,
        property: TechnologyProperty,
        failure: &str,
        done: F,
    ) -> Result<()>
    where
        F: Fn(&TechnologyState) -> bool + Sync,
    {
        let network = self.ctx.network.as_ref();
        let kind = self.ctx.gadget.technology.as_str();
        let done = &done;

        let mut waiter = self.waiter();
        info!("Setting {}={} on {}", property.name(), property.value(), kind);
        waiter
            .act_and_wait_for(
                network.set_technology_property(kind, property),
                failure,
                move || async move {
                    Ok(network.technology(kind).await?.filter(|t| done(t)).map(|_| ()))
                },
            )
            .await
    }

    async fn assign_address(&self) -> Result<ServiceState> {
        let network = self.ctx.network.as_ref();
        let kind = self.ctx.gadget.technology.as_str();
        let block = self
            .address
            .ok_or_else(|| AppError::Internal("No address block chosen".to_string()))?;

        let mut waiter = self.waiter();
        let service = waiter
            .wait_for(NO_SERVICES, move || async move {
                Ok(network.services(kind).await?.into_iter().next())
            })
            .await?;

        let requested = block.ipv4_config();
        info!(
            "Assigning {} to {} (block {})",
            block.device_address(),
            service.path,
            block
        );
        let path = service.path.as_str();
        let requested = &requested;
        waiter
            .act_and_wait_for(
                network.set_ipv4_config(path, requested),
                "Could not configure IPv4 for Gadget.",
                move || async move {
                    Ok(find_service(network, kind, path)
                        .await?
                        .filter(|s| s.ipv4.applied(requested)))
                },
            )
            .await
    }

    async fn connect(&self, service: &ServiceState) -> Result<()> {
        let network = self.ctx.network.as_ref();
        let kind = self.ctx.gadget.technology.as_str();
        let path = service.path.as_str();

        let mut waiter = self.waiter();
        info!("Connecting {}", path);
        waiter
            .act_and_wait_for(
                network.connect_service(path),
                "Could not connect Gadget to static network route.",
                move || async move {
                    Ok(find_service(network, kind, path)
                        .await?
                        .filter(|s| s.connected)
                        .map(|_| ()))
                },
            )
            .await
    }

    async fn disconnect(&self) -> Result<()> {
        let network = self.ctx.network.as_ref();
        let kind = self.ctx.gadget.technology.as_str();
        let service = network
            .services(kind)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::FailedRequest(NO_SERVICES_UNPLUGGED.to_string()))?;
        let path = service.path.as_str();

        let mut waiter = self.waiter();
        info!("Disconnecting {}", path);
        waiter
            .act_and_wait_for(
                network.disconnect_service(path),
                "Could not disconnect Gadget from static network route.",
                move || async move {
                    // A service that went away is as disconnected as it gets
                    let service = find_service(network, kind, path).await?;
                    Ok(match service {
                        Some(s) if s.connected => None,
                        _ => Some(()),
                    })
                },
            )
            .await
    }

    async fn power_down(&self) -> Result<()> {
        let network = self.ctx.network.as_ref();
        let kind = self.ctx.gadget.technology.as_str();
        match network.technology(kind).await? {
            Some(t) if t.powered => {
                self.set_technology(
                    TechnologyProperty::Powered(false),
                    "Could not power down Gadget on the Network Manager",
                    |t| !t.powered,
                )
                .await
            }
            _ => {
                debug!("Technology {} already powered down", kind);
                Ok(())
            }
        }
    }

    async fn provision_dhcp(&self) -> Result<()> {
        let block = self
            .address
            .ok_or_else(|| AppError::Internal("No address block chosen".to_string()))?;
        let dhcp = &self.ctx.dhcp;

        let content = render_dhcp_config(&block, &self.ctx.gadget.interface, &dhcp.lease_time);
        write_dhcp_config(&dhcp.config_path, &content).await?;
        info!("Wrote DHCP configuration to {}", dhcp.config_path.display());

        let output = self.ctx.host.start_unit(&dhcp.unit).await?;
        if !output.success() {
            return Err(AppError::FailedRequest(format!(
                "Could not start {}: {}",
                dhcp.unit,
                output.error_text()
            )));
        }
        Ok(())
    }

    async fn stop_dhcp(&self) -> Result<()> {
        let unit = &self.ctx.dhcp.unit;
        info!("Stopping {}", unit);
        let output = self.ctx.host.stop_unit(unit).await?;
        if !output.success() {
            return Err(AppError::FailedRequest(format!(
                "Could not stop {}: {}",
                unit,
                output.error_text()
            )));
        }
        Ok(())
    }
}

async fn find_service(
    network: &dyn NetworkBackend,
    kind: &str,
    path: &str,
) -> Result<Option<ServiceState>> {
    Ok(network
        .services(kind)
        .await?
        .into_iter()
        .find(|s| s.path == path))
}
