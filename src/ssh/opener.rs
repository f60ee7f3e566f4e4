//! Channel-opener semantics (§4.7) and the SSH-channel-as-byte-stream
//! adapter it hands to the HTTP edge.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use russh::server::Handle;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::OpenerError;
use crate::fingerprint::ForwardInfo;

/// Anything that can be wrapped as hyper IO: `AsyncRead + AsyncWrite`,
/// `Unpin` and `Send` so it can cross an await point inside a spawned task.
trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncDuplex for T {}

/// An opened `forwarded-tcpip` channel, adapted into a bidirectional byte
/// stream. Local/remote addresses mirror the underlying SSH connection;
/// `set_deadline`-style operations have no equivalent here because deadlines
/// are enforced by the HTTP client instead (§4.7).
pub struct ChannelStream {
    inner: Box<dyn AsyncDuplex>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl ChannelStream {
    fn new(inner: Box<dyn AsyncDuplex>, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            inner,
            local_addr,
            remote_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Required by `hyper_util`'s legacy client connector machinery; a plain SSH
/// channel never reports itself as HTTP/2-capable or reused.
impl Connection for ChannelStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// `(stream, info)` pair handed to the HTTP edge on each successful open.
pub struct OpenedChannel {
    pub stream: ChannelStream,
    pub info: ForwardInfo,
}

/// A callable bound to one SSH connection and one `ForwardInfo`, producing
/// one `forwarded-tcpip` channel per call (§4.7, §9). `origin` is the raw
/// `host:port` of the incoming HTTP client; step 1 of the opener's own
/// invocation contract is to split it, so a malformed value fails here with
/// [`OpenerError::InvalidOrigin`] rather than further up the call stack.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, origin: &str) -> Result<OpenedChannel, OpenerError>;

    fn info(&self) -> &ForwardInfo;
}

pub type SharedOpener = Arc<dyn ChannelOpener>;

/// Parses `host:port` for the incoming HTTP client's remote address, per
/// step 1 of the opener's invocation contract.
fn parse_origin(origin: &str) -> Result<SocketAddr, OpenerError> {
    origin.parse().map_err(|_| OpenerError::InvalidOrigin)
}

pub struct ForwardedTcpOpener {
    handle: Handle,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    info: ForwardInfo,
}

impl ForwardedTcpOpener {
    pub fn new(
        handle: Handle,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        info: ForwardInfo,
    ) -> SharedOpener {
        Arc::new(Self {
            handle,
            local_addr,
            remote_addr,
            info,
        })
    }
}

#[async_trait]
impl ChannelOpener for ForwardedTcpOpener {
    async fn open(&self, origin: &str) -> Result<OpenedChannel, OpenerError> {
        let origin = parse_origin(origin)?;

        let channel = match self
            .handle
            .channel_open_forwarded_tcpip(
                &self.info.address,
                self.info.port,
                &origin.ip().to_string(),
                origin.port() as u32,
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let _ = self
                    .handle
                    .disconnect(russh::Disconnect::ByApplication, "channel refused", "en")
                    .await;
                return Err(match e {
                    russh::Error::Disconnect => OpenerError::ConnectionGone,
                    _ => OpenerError::ChannelRefused,
                });
            }
        };

        // `Channel::into_stream` forwards data messages as plain bytes and
        // absorbs every other channel message (requests, EOF, close) on its
        // own, so there is nothing left over here to discard separately.
        // Local/remote addresses mirror the SSH connection itself (§4.7),
        // not the HTTP client's origin address just parsed above.
        let stream = ChannelStream::new(
            Box::new(channel.into_stream()),
            self.local_addr,
            self.remote_addr,
        );

        Ok(OpenedChannel {
            stream,
            info: self.info.clone(),
        })
    }

    fn info(&self) -> &ForwardInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_origin_accepts_host_port() {
        assert!(parse_origin("127.0.0.1:54321").is_ok());
    }

    #[test]
    fn parse_origin_rejects_malformed_input() {
        assert_eq!(parse_origin("not-an-address").unwrap_err(), OpenerError::InvalidOrigin);
    }
}
