//! SSH server (§4.1, §4.2): accepts connections on the configured endpoint
//! and hands each one a fresh [`GatewayHandler`].

use std::net::SocketAddr;
use std::time::Duration;

use log::{error, info};
use russh::server::{Handler, Server};
use russh_keys::PrivateKey;

use super::handler::GatewayHandler;
use crate::auth::AuthPolicy;
use crate::registry::ForwardRegistry;

/// Idle connections are dropped after 30 minutes of inactivity, matching the
/// teacher's timeout choice — forwards have no other liveness check.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(1800);

/// Fixed pre-auth banner (§4.5, §6).
const BANNER: &str = "\n ____       ___  ___  _   _ \n(  _ \\ ___ / __)/ __)( )_( )\n )   /(___)\\__ \\\\__ \\ ) _ ( \n(_)\\_)     (___/(___/(_) (_)\n";

#[derive(Clone)]
pub struct GatewayServer {
    registry: ForwardRegistry,
    auth_policy: AuthPolicy,
    base_host: String,
    listen_addr: SocketAddr,
}

impl GatewayServer {
    pub fn new(
        registry: ForwardRegistry,
        auth_policy: AuthPolicy,
        base_host: String,
        listen_addr: SocketAddr,
    ) -> Self {
        Self {
            registry,
            auth_policy,
            base_host,
            listen_addr,
        }
    }

    pub fn config(host_key: PrivateKey) -> std::sync::Arc<russh::server::Config> {
        std::sync::Arc::new(russh::server::Config {
            methods: russh::MethodSet::PUBLICKEY,
            server_id: russh::SshId::Standard("SSH-2.0-tunnelgate".to_string()),
            keys: vec![host_key],
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            auth_banner: Some(BANNER),
            ..Default::default()
        })
    }

    pub async fn run(mut self, config: std::sync::Arc<russh::server::Config>) -> anyhow::Result<()> {
        let addr = self.listen_addr;
        info!("ssh gateway listening on {addr}");
        self.run_on_address(config, addr).await?;
        Ok(())
    }
}

impl Server for GatewayServer {
    type Handler = GatewayHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(remote_addr = ?peer_addr; "new ssh connection accepted");
        GatewayHandler::new(
            self.registry.clone(),
            self.auth_policy.clone(),
            self.base_host.clone(),
            self.listen_addr,
            peer_addr,
        )
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        error!(error = %error; "ssh session error");
    }
}
