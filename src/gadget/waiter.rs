//! Bounded waits on network manager state
//!
//! Every step of a gadget operation that depends on the network manager
//! reacting goes through [`ReadinessWaiter::wait_for`]: check the state, and
//! while the condition does not hold, sleep until the next change
//! notification. The whole wait, checks included, is bounded by one timeout.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::network::{NetworkBackend, NetworkEvent, TechnologyProperty, TechnologyState};

/// Scoped subscription to network change notifications
///
/// Create the waiter before triggering the change it is going to wait for,
/// so the notification cannot slip through. Dropping it unsubscribes.
pub struct ReadinessWaiter {
    events: broadcast::Receiver<NetworkEvent>,
    timeout: Duration,
}

impl ReadinessWaiter {
    pub fn new(network: &dyn NetworkBackend, timeout: Duration) -> Self {
        Self {
            events: network.subscribe(),
            timeout,
        }
    }

    /// Wait until `check` yields a value
    ///
    /// `check` runs once up front and again after every change notification.
    /// Fails with `Timeout(failure)` when nothing turns up in time; check
    /// errors are returned as they are.
    pub async fn wait_for<T, F, Fut>(&mut self, failure: &str, check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        self.act_and_wait_for(async { Ok(()) }, failure, check).await
    }

    /// Run `action`, then wait until `check` yields a value
    ///
    /// The action counts against the same timeout as the wait: a write to the
    /// network manager may not be answered until the change is done.
    pub async fn act_and_wait_for<T, A, F, Fut>(
        &mut self,
        action: A,
        failure: &str,
        mut check: F,
    ) -> Result<T>
    where
        A: Future<Output = Result<()>>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let events = &mut self.events;
        let wait = async {
            action.await?;
            loop {
                if let Some(value) = check().await? {
                    return Ok(value);
                }

                match events.recv().await {
                    Ok(event) => debug!("Re-checking after {:?}", event),
                    Err(RecvError::Lagged(missed)) => {
                        debug!("Missed {} network events, re-checking", missed)
                    }
                    // Nothing will ever change again; let the timeout fire
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                info!("Timed out after {:?}: {}", self.timeout, failure);
                Err(AppError::Timeout(failure.to_string()))
            }
        }
    }
}

/// Get a technology that exists, has its properties populated and is powered
///
/// Each of the three conditions gets its own full timeout.
pub async fn technology_ready(
    network: &dyn NetworkBackend,
    kind: &str,
    timeout: Duration,
) -> Result<TechnologyState> {
    let failure = format!("Could not retrieve {} on the Network Manager", kind);
    let mut waiter = ReadinessWaiter::new(network, timeout);

    let technology = waiter
        .wait_for(&failure, move || network.technology(kind))
        .await?;

    let technology = if technology.name.is_empty() {
        debug!("Technology {} found, waiting for its properties", kind);
        waiter
            .wait_for(&failure, move || async move {
                Ok(network.technology(kind).await?.filter(|t| !t.name.is_empty()))
            })
            .await?
    } else {
        technology
    };

    if technology.powered {
        return Ok(technology);
    }

    info!("Powering up technology {}", kind);
    waiter
        .act_and_wait_for(
            network.set_technology_property(kind, TechnologyProperty::Powered(true)),
            &failure,
            move || async move { Ok(network.technology(kind).await?.filter(|t| t.powered)) },
        )
        .await
}
