//! SSH control plane: the per-connection handler, the listening server, the
//! forward controller, and the channel-opener adapter.

pub mod forward;
mod handler;
pub mod opener;
mod server;

pub use handler::GatewayHandler;
pub use server::GatewayServer;
