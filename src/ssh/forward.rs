//! Forward controller (§4.6): dispatches `tcpip-forward` and
//! `cancel-tcpip-forward` global requests against the registry and opener.

use std::net::SocketAddr;

use russh::server::Handle;

use crate::error::GatewayError;
use crate::fingerprint::ForwardInfo;
use crate::registry::{ConnId, ForwardRegistry};
use crate::ssh::opener::ForwardedTcpOpener;
use crate::terminal::Terminal;

/// Handles one `tcpip-forward` request. `port == 0` is rejected outright
/// (port selection is not supported); otherwise a subdomain is derived and
/// bound, and a status line is written to the terminal either way.
pub async fn handle_tcpip_forward(
    registry: &ForwardRegistry,
    terminal: &Terminal,
    conn: ConnId,
    handle: Handle,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    base_host: &str,
    fingerprint: &str,
    address: &str,
    port: u32,
) -> Result<bool, GatewayError> {
    if port == 0 {
        terminal
            .write(&format!("forward \"{address}:0\" failed: \"port not allowed\"\r\n"))
            .await;
        return Err(GatewayError::PortNotAllowed);
    }

    let info = ForwardInfo::parse(address, port, fingerprint);
    let opener = ForwardedTcpOpener::new(handle, local_addr, remote_addr, info.clone());

    match registry.bind(conn, info.subdomain.clone(), opener) {
        Ok(()) => {
            terminal
                .write(&format!(
                    "forward \"{address}:{port}\" to \"https://{}.{base_host}/\"\r\n",
                    info.subdomain
                ))
                .await;
            Ok(true)
        }
        Err(e) => {
            terminal
                .write(&format!(
                    "forward \"{address}:{port}\" failed: \"{e}\"\r\n"
                ))
                .await;
            Err(GatewayError::Registry(e))
        }
    }
}

/// Handles one `cancel-tcpip-forward` request. Unbinding is always reported
/// as a success, whether or not the subdomain was actually bound (§9).
pub async fn handle_cancel_tcpip_forward(
    registry: &ForwardRegistry,
    conn: ConnId,
    address: &str,
    port: u32,
    fingerprint: &str,
) -> bool {
    let info = ForwardInfo::parse(address, port, fingerprint);
    registry.unbind(conn, &info.subdomain);
    true
}
