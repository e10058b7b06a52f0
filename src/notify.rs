//! Process supervisor notification
//!
//! Sends `KEY=value` datagrams to the socket named by `NOTIFY_SOCKET`.
//! Without that variable every call is a no-op.

use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::AppError;

pub const READY: &str = "READY=1\nSTATUS=USB Gadget Manager is active.";
pub const IDLE_SHUTDOWN: &str = "STATUS=USB Gadget Manager is shutting down due to inactivity.";

/// Exit code reported alongside a fatal initialization error
pub const INIT_FAILURE_ERRNO: i32 = 15;

/// Status message for a fatal initialization error
pub fn init_failure(error: &AppError) -> String {
    format!(
        "STATUS=Could not initialize USB Gadget Manager. Reported error was: {} - {}.\nERRNO={}",
        error.kind(),
        error,
        INIT_FAILURE_ERRNO
    )
}

#[derive(Debug, Clone)]
enum Target {
    Path(PathBuf),
    Abstract(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct Notifier {
    target: Option<Target>,
}

impl Notifier {
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("NOTIFY_SOCKET").map(PathBuf::from))
    }

    pub fn new(socket: Option<PathBuf>) -> Self {
        let target = socket.and_then(|path| {
            let raw = path.to_string_lossy().into_owned();
            match raw.strip_prefix('@') {
                Some(name) => Some(Target::Abstract(name.as_bytes().to_vec())),
                None if raw.is_empty() => None,
                None => Some(Target::Path(path)),
            }
        });
        Self { target }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Send one notification; failures are logged, never returned
    pub fn notify(&self, state: &str) {
        let Some(target) = &self.target else {
            return;
        };
        if let Err(e) = send(target, state) {
            warn!("Failed to notify supervisor: {}", e);
        } else {
            debug!("Notified supervisor: {}", state.replace('\n', " "));
        }
    }
}

fn send(target: &Target, state: &str) -> std::io::Result<usize> {
    let socket = UnixDatagram::unbound()?;
    match target {
        Target::Path(path) => socket.send_to(state.as_bytes(), path),
        Target::Abstract(name) => {
            let addr = abstract_addr(name)?;
            socket.send_to_addr(state.as_bytes(), &addr)
        }
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &[u8]) -> std::io::Result<SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    SocketAddr::from_abstract_name(name)
}

#[cfg(not(target_os = "linux"))]
fn abstract_addr(_name: &[u8]) -> std::io::Result<SocketAddr> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "abstract sockets are Linux only",
    ))
}
