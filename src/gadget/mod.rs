//! USB gadget network modes
//!
//! ```text
//!   request ──► ModeController ──► GadgetModeOperation ──► NetworkBackend
//!                 (state, lock)      (ordered steps)        HostControl
//!                      │                    │
//!                      ▼                    ▼
//!                  EventBus          ReadinessWaiter
//! ```

pub mod address;
pub mod controller;
pub mod operation;
pub mod types;
pub mod waiter;

pub use address::{choose_address_block, AddressBlock};
pub use controller::ModeController;
pub use operation::{GadgetContext, GadgetModeOperation, OperationKind, Step};
pub use types::{GadgetStatus, LockInfo, Mode, ModeSet};
pub use waiter::{technology_ready, ReadinessWaiter};
