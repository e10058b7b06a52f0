mod handlers;
mod identity;
mod routes;
mod ws;

pub use identity::{ClientIdentity, CLIENT_HEADER};
pub use routes::create_router;
pub use ws::ws_handler;
