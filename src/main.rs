//! Entry point: loads configuration, loads or generates the host key, and
//! runs the SSH gateway alongside the HTTP(S) edge until one of them exits.

use std::sync::Arc;

use log::{error, info};
use tunnelgate::config;
use tunnelgate::http_edge::{self, ClientPool, EdgeState};
use tunnelgate::key;
use tunnelgate::{ForwardRegistry, GatewayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::init();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.effective_log_filter()),
    )
    .init();

    info!("starting tunnelgate reverse ssh tunneling gateway");
    info!("base host: {}", config.host);

    let host_key = key::load_or_generate(&config.host_key)?;
    info!(
        "host key fingerprint: {}",
        host_key.public_key().fingerprint(russh_keys::HashAlg::Sha256)
    );

    let registry = ForwardRegistry::new();
    let auth_policy = config.auth_policy();

    let gateway = GatewayServer::new(
        registry.clone(),
        auth_policy,
        config.host.clone(),
        config.ssh_endpoint,
    );
    let ssh_config = GatewayServer::config(host_key);

    let edge_state = Arc::new(EdgeState {
        registry,
        config,
        pool: ClientPool::new(),
    });

    let ssh_task = tokio::spawn(async move {
        if let Err(e) = gateway.run(ssh_config).await {
            error!("ssh gateway exited: {e}");
        }
    });

    let http_task = tokio::spawn(http_edge::run_http(config.web_endpoint, edge_state.clone()));

    let https_task = config.tls.clone().map(|tls| {
        let addr = config.ssl_web_endpoint;
        let edge_state = edge_state.clone();
        tokio::spawn(async move {
            if let Err(e) = http_edge::run_https(addr, edge_state, &tls).await {
                error!("https edge exited: {e}");
            }
        })
    });

    if config.ssl_redirect && config.tls.is_none() {
        info!(
            "SSL_REDIRECT is set but no CERT_FILE/KEY_FILE configured; \
             requests will redirect to a listener that is not running"
        );
    }

    tokio::select! {
        res = ssh_task => {
            if let Err(e) = res {
                error!("ssh task panicked: {e}");
            }
        }
        res = http_task => {
            if let Ok(Err(e)) = res {
                error!("http edge exited: {e}");
            }
        }
        res = async {
            match https_task {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = res {
                error!("https task panicked: {e}");
            }
        }
    }

    Ok(())
}
