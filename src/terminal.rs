//! Terminal channel (§4.4): the per-connection interactive session.
//! Messages published before a `session` channel opens are buffered; the
//! first accepted `session` flushes them and takes over as a direct sink.

use log::warn;
use russh::server::Handle;
use russh::ChannelId;
use tokio::sync::Mutex;

enum TerminalState {
    Buffering(Vec<u8>),
    Streaming { handle: Handle, channel_id: ChannelId },
}

pub struct Terminal {
    state: Mutex<TerminalState>,
}

impl Terminal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TerminalState::Buffering(Vec::new())),
        }
    }

    /// Appends to the buffer, or writes straight through once a session
    /// channel is active. Serialized with the buffered/streaming transition
    /// by the same mutex, so a write can never interleave with a flush.
    pub async fn write(&self, text: &str) {
        let mut state = self.state.lock().await;
        match &mut *state {
            TerminalState::Buffering(buf) => buf.extend_from_slice(text.as_bytes()),
            TerminalState::Streaming { handle, channel_id } => {
                if let Err(e) = handle.data(*channel_id, text.as_bytes().to_vec().into()).await {
                    warn!("failed to write to terminal channel: {e:?}");
                }
            }
        }
    }

    /// Called when a `session` channel is opened. Returns `true` and flushes
    /// the buffer (atomically, under the same lock as `write`) if this is
    /// the first session; returns `false` if a session is already active, in
    /// which case the caller must reject this one (single-session policy).
    pub async fn activate(&self, handle: Handle, channel_id: ChannelId) -> bool {
        let mut state = self.state.lock().await;
        if matches!(&*state, TerminalState::Streaming { .. }) {
            return false;
        }

        let buffered = std::mem::replace(
            &mut *state,
            TerminalState::Streaming {
                handle: handle.clone(),
                channel_id,
            },
        );
        if let TerminalState::Buffering(buf) = buffered {
            if !buf.is_empty() {
                if let Err(e) = handle.data(channel_id, buf.into()).await {
                    warn!("failed to flush buffered terminal messages: {e:?}");
                }
            }
        }
        true
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

/// `"Multiple sessions not allowed"`, sent to every `session` channel after
/// the first, which is then closed.
pub const MULTIPLE_SESSION_MESSAGE: &str = "Multiple sessions not allowed";

/// Byte value of Ctrl-C; closes the session channel and ends the session.
pub const CTRL_C: u8 = 0x03;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_match_spec() {
        assert_eq!(MULTIPLE_SESSION_MESSAGE, "Multiple sessions not allowed");
        assert_eq!(CTRL_C, 3);
    }
}
