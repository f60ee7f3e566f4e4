//! SSH handler for individual connections: public-key auth, port-forward
//! requests, and the session/terminal channel.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};

use crate::auth::AuthPolicy;
use crate::error::GatewayError;
use crate::fingerprint;
use crate::registry::{ConnId, ForwardRegistry};
use crate::terminal::{Terminal, CTRL_C, MULTIPLE_SESSION_MESSAGE};

use super::forward::{handle_cancel_tcpip_forward, handle_tcpip_forward};

/// Handler for a single SSH connection. One instance per accepted client,
/// created by [`super::server::GatewayServer::new_client`].
pub struct GatewayHandler {
    registry: ForwardRegistry,
    auth_policy: AuthPolicy,
    base_host: String,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    conn: ConnId,
    // Set once in `auth_publickey` and read from here downstream, rather
    // than recomputed: russh's `Auth::Accept` carries no extension slot.
    fingerprint: Option<String>,
    terminal: Arc<Terminal>,
    session_channel: Option<ChannelId>,
}

impl GatewayHandler {
    pub fn new(
        registry: ForwardRegistry,
        auth_policy: AuthPolicy,
        base_host: String,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            registry,
            auth_policy,
            base_host,
            local_addr,
            remote_addr,
            conn: ConnId::new(),
            fingerprint: None,
            terminal: Arc::new(Terminal::new()),
            session_channel: None,
        }
    }

    fn remote_addr_or_unspecified(&self) -> SocketAddr {
        self.remote_addr
            .unwrap_or_else(|| SocketAddr::new(self.local_addr.ip(), 0))
    }
}

#[async_trait]
impl Handler for GatewayHandler {
    type Error = GatewayError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fp = fingerprint::fingerprint(public_key);
        debug!(user = user, fingerprint = fp.as_str(), remote_addr = %self.remote_addr_or_unspecified(); "public-key auth attempt");

        if self.auth_policy.allow(&fp) {
            self.fingerprint = Some(fp);
            Ok(Auth::Accept)
        } else {
            info!(fingerprint = fp.as_str(), remote_addr = %self.remote_addr_or_unspecified(); "rejecting unauthorized public key");
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        info!(conn = ?self.conn, remote_addr = %self.remote_addr_or_unspecified(); "connection authenticated");
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let fp = self
            .fingerprint
            .clone()
            .ok_or(GatewayError::AuthNotAllowed)?;
        let handle = session.handle();

        match handle_tcpip_forward(
            &self.registry,
            &self.terminal,
            self.conn,
            handle,
            self.local_addr,
            self.remote_addr_or_unspecified(),
            &self.base_host,
            &fp,
            address,
            *port,
        )
        .await
        {
            Ok(accepted) => Ok(accepted),
            Err(GatewayError::PortNotAllowed) | Err(GatewayError::Registry(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let fp = self
            .fingerprint
            .clone()
            .ok_or(GatewayError::AuthNotAllowed)?;
        Ok(handle_cancel_tcpip_forward(&self.registry, self.conn, address, port, &fp).await)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        let handle = session.handle();

        if self.terminal.activate(handle.clone(), channel_id).await {
            self.session_channel = Some(channel_id);
            info!(channel = ?channel_id, conn = ?self.conn; "session channel opened");
        } else {
            warn!(conn = ?self.conn; "rejecting additional session channel");
            self.terminal
                .write(&format!("{MULTIPLE_SESSION_MESSAGE}\r\n"))
                .await;
            let _ = handle.close(channel_id).await;
        }
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.session_channel == Some(channel) {
            info!(channel = ?channel, conn = ?self.conn; "session channel closed");
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.session_channel == Some(channel) && data.contains(&CTRL_C) {
            info!(channel = ?channel; "ctrl-c received, closing session channel");
            let _ = session.handle().close(channel).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("eof on channel {:?}", channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }
}

/// The connection-lifecycle watcher (§4.5): a `GatewayHandler`'s lifetime is
/// exactly its connection's, so dropping it is the teardown signal. Revokes
/// every subdomain this connection ever bound.
impl Drop for GatewayHandler {
    fn drop(&mut self) {
        if self.registry.shutdown(self.conn).is_ok() {
            info!(conn = ?self.conn, remote_addr = %self.remote_addr_or_unspecified(); "connection closed, forwards revoked");
        }
    }
}
