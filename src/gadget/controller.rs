//! Mode controller
//!
//! Single owner of the active mode and the exclusivity lock. Requests are
//! validated under the state mutex, then the operation runs on its own task
//! so that a caller going away cannot cancel it halfway. The active mode is
//! only committed once the operation succeeds.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::operation::{GadgetContext, GadgetModeOperation, OperationKind};
use super::types::{GadgetStatus, LockInfo, Mode, ModeSet};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};

#[derive(Debug, Default)]
struct ControllerState {
    active_mode: Mode,
    lock: Option<LockInfo>,
    /// An operation has been accepted and has not reached its outcome yet
    in_transition: bool,
    last_activity: Option<Instant>,
}

/// Gadget mode controller
pub struct ModeController {
    ctx: Arc<GadgetContext>,
    available: ModeSet,
    state: Mutex<ControllerState>,
    rng: Mutex<StdRng>,
    events: Arc<EventBus>,
}

/// Clears the in-transition flag however the operation task ends
struct TransitionGuard {
    controller: Arc<ModeController>,
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        self.controller.state.lock().in_transition = false;
    }
}

impl ModeController {
    pub fn new(ctx: GadgetContext, events: Arc<EventBus>) -> Arc<Self> {
        let rng = match ctx.gadget.address_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let available = ctx.gadget.available_modes;
        info!("Gadget modes available: {:?}", available.modes());

        Arc::new(Self {
            ctx: Arc::new(ctx),
            available,
            state: Mutex::new(ControllerState {
                last_activity: Some(Instant::now()),
                ..Default::default()
            }),
            rng: Mutex::new(rng),
            events,
        })
    }

    pub fn active_mode(&self) -> Mode {
        self.state.lock().active_mode
    }

    pub fn available_modes(&self) -> ModeSet {
        self.available
    }

    pub fn status(&self) -> GadgetStatus {
        let mut state = self.state.lock();
        state.last_activity = Some(Instant::now());
        GadgetStatus {
            active_mode: state.active_mode,
            available_modes: self.available.modes(),
            in_transition: state.in_transition,
            lock: state.lock.clone(),
            can_detect_cable_hotplugging: false,
            usb_cable_status: state.active_mode,
        }
    }

    /// Activate `mode` on behalf of `identity`
    ///
    /// Resolves once the activation has reached its outcome.
    pub async fn activate(
        self: &Arc<Self>,
        identity: &str,
        mode: Mode,
        options: HashMap<String, String>,
    ) -> Result<()> {
        let operation = {
            let mut state = self.state.lock();
            state.last_activity = Some(Instant::now());
            check_lock(&state, identity)?;
            if state.in_transition {
                return Err(AppError::OperationInProgress);
            }
            if !state.active_mode.is_none() {
                return Err(AppError::AlreadyActive);
            }
            if !self.available.contains(mode) {
                return Err(AppError::ModeUnavailable);
            }
            state.in_transition = true;
            GadgetModeOperation::activate(self.ctx.clone(), mode, &mut *self.rng.lock())
        };

        info!("{} requested activation of {}", identity, mode);
        if let Some(block) = operation.address() {
            debug!("Chose address block {}", block);
        }
        if !options.is_empty() {
            info!("Activation options are not interpreted: {:?}", options);
        }
        self.execute(operation, mode).await
    }

    /// Deactivate the active mode on behalf of `identity`
    pub async fn deactivate(self: &Arc<Self>, identity: &str) -> Result<()> {
        let operation = {
            let mut state = self.state.lock();
            state.last_activity = Some(Instant::now());
            check_lock(&state, identity)?;
            if state.in_transition {
                return Err(AppError::OperationInProgress);
            }
            if state.active_mode.is_none() {
                return Err(AppError::NoneActive);
            }
            state.in_transition = true;
            GadgetModeOperation::deactivate(self.ctx.clone(), state.active_mode)
        };

        info!("{} requested deactivation of {}", identity, operation.mode());
        self.execute(operation, Mode::None).await
    }

    /// Run an accepted operation and commit `target` on success
    async fn execute(self: &Arc<Self>, operation: GadgetModeOperation, target: Mode) -> Result<()> {
        let guard = TransitionGuard {
            controller: self.clone(),
        };
        let controller = self.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let kind = operation.kind();
            let mode = operation.mode();
            let result = operation.run().await;
            controller.complete(kind, mode, target, &result);
            result
        });

        task.await
            .map_err(|e| AppError::Internal(format!("Gadget operation task failed: {}", e)))?
    }

    fn complete(&self, kind: OperationKind, mode: Mode, target: Mode, result: &Result<()>) {
        match result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    state.active_mode = target;
                    state.in_transition = false;
                    state.last_activity = Some(Instant::now());
                }
                info!("Active gadget mode is now {}", target);
                self.events
                    .publish(SystemEvent::ActiveModeChanged { mode: target });
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.in_transition = false;
                    state.last_activity = Some(Instant::now());
                }
                warn!("Could not {} {}: {}", kind, mode, e);
                self.events.publish(SystemEvent::OperationFailed {
                    mode,
                    operation: kind.to_string(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Take the exclusivity lock
    pub fn acquire_lock(&self, identity: &str, reason: &str) -> Result<LockInfo> {
        let lock = {
            let mut state = self.state.lock();
            state.last_activity = Some(Instant::now());
            if let Some(held) = &state.lock {
                return Err(AppError::AlreadyLocked {
                    owner: held.owner.clone(),
                });
            }
            let lock = LockInfo::new(identity, reason);
            state.lock = Some(lock.clone());
            lock
        };

        info!("Gadget locked by {}: {}", identity, reason);
        self.events.publish(SystemEvent::LockChanged {
            lock: Some(lock.clone()),
        });
        Ok(lock)
    }

    /// Release the exclusivity lock, which only its holder may do
    pub fn release_lock(&self, identity: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.last_activity = Some(Instant::now());
            match &state.lock {
                None => return Err(AppError::NoLock),
                Some(held) if held.owner != identity => {
                    return Err(AppError::NotOwner {
                        caller: identity.to_string(),
                        owner: held.owner.clone(),
                    })
                }
                Some(_) => state.lock = None,
            }
        }

        info!("Gadget unlocked by {}", identity);
        self.events.publish(SystemEvent::LockChanged { lock: None });
        Ok(())
    }

    /// Resolve once the controller has been idle for `limit`
    ///
    /// Idle means no request for `limit`, no active mode, no lock held and
    /// no operation running.
    pub async fn wait_idle(&self, limit: Duration) {
        loop {
            let deadline = {
                let state = self.state.lock();
                let since = state.last_activity.unwrap_or_else(Instant::now);
                let busy =
                    !state.active_mode.is_none() || state.lock.is_some() || state.in_transition;
                if !busy && since.elapsed() >= limit {
                    return;
                }
                if busy {
                    Instant::now() + limit
                } else {
                    since + limit
                }
            };
            tokio::time::sleep_until(deadline).await;
        }
    }
}

fn check_lock(state: &ControllerState, identity: &str) -> Result<()> {
    match &state.lock {
        Some(held) if held.owner != identity => Err(AppError::LockHeld {
            owner: held.owner.clone(),
        }),
        _ => Ok(()),
    }
}
