//! The quiescence state machine: the two-party "stop the flow, updates"
//! negotiation.

use crate::types::ChannelId;
use crate::wire::Stfu;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuiescerError {
    #[error("stfu already received for channel {0}")]
    AlreadyReceived(ChannelId),
    #[error("stfu already sent for channel {0}")]
    AlreadySent(ChannelId),
    #[error("quiescence already requested")]
    AlreadyRequested,
    #[error("failed to send stfu: {0}")]
    Send(String),
}

/// Sends our Stfu message to the peer.
pub type SendStfu = Box<dyn FnMut(Stfu) -> Result<(), String> + Send>;

/// True iff there are uncommitted updates on either commitment.
pub type PendingState = Box<dyn Fn() -> bool + Send>;

/// Tracks progression through the quiescence protocol for one channel.
pub struct Quiescer {
    chan_id: ChannelId,

    /// Whether we were the original opener of the channel. Breaks the tie
    /// when both sides claim to be the initiator.
    we_opened: bool,

    /// Whether our node initiated quiescence. Independent of `remote_init`.
    local_init: bool,

    /// Whether the peer's Stfu claimed to be the initiator.
    remote_init: bool,

    /// Whether we have emitted our Stfu.
    sent: bool,

    /// Whether we have received the peer's Stfu.
    received: bool,

    /// Resolved with the final initiator decision once quiescence is
    /// reached; present only when we initiated.
    resp: Option<oneshot::Sender<bool>>,

    send_stfu: SendStfu,
    pending_state: PendingState,

    resume_queue: Vec<Box<dyn FnOnce() + Send>>,
}

impl Quiescer {
    pub fn new(
        chan_id: ChannelId,
        we_opened: bool,
        send_stfu: SendStfu,
        pending_state: PendingState,
    ) -> Self {
        Self {
            chan_id,
            we_opened,
            local_init: false,
            remote_init: false,
            sent: false,
            received: false,
            resp: None,
            send_stfu,
            pending_state,
            resume_queue: Vec::new(),
        }
    }

    /// Begin a locally-initiated negotiation. The Stfu itself is not sent
    /// here; the link gives us a valid opportunity via `try_progress_state`.
    pub fn init_stfu(&mut self, resp: oneshot::Sender<bool>) -> Result<(), QuiescerError> {
        if self.local_init {
            return Err(QuiescerError::AlreadyRequested);
        }
        self.local_init = true;
        self.resp = Some(resp);
        self.try_progress_state()
    }

    /// Ingest the peer's Stfu.
    pub fn recv_stfu(&mut self, msg: Stfu) -> Result<(), QuiescerError> {
        if self.received {
            return Err(QuiescerError::AlreadyReceived(self.chan_id));
        }
        self.received = true;
        self.remote_init = msg.initiator;

        self.try_resolve_quiescence_requests();

        // If we can immediately send an Stfu response back, we will.
        self.try_progress_state()
    }

    /// Emit our Stfu when we owe one and no updates are pending.
    pub fn try_progress_state(&mut self) -> Result<(), QuiescerError> {
        if !self.owe_stfu() {
            return Ok(());
        }
        if (self.pending_state)() {
            return Ok(());
        }

        if self.sent {
            return Err(QuiescerError::AlreadySent(self.chan_id));
        }
        let stfu = Stfu {
            channel_id: self.chan_id,
            initiator: self.local_init,
        };
        self.sent = true;
        (self.send_stfu)(stfu).map_err(QuiescerError::Send)?;
        debug!(
            "sent stfu for channel {} (initiator: {})",
            self.chan_id, self.local_init
        );

        self.try_resolve_quiescence_requests();
        Ok(())
    }

    /// We owe the remote an Stfu once we have received one, or initiated,
    /// without having sent ours.
    fn owe_stfu(&self) -> bool {
        (self.received || self.local_init) && !self.sent
    }

    /// The remote owes us an Stfu when we have sent but not received.
    pub fn need_stfu(&self) -> bool {
        self.sent && !self.received
    }

    pub fn is_quiescent(&self) -> bool {
        self.sent && self.received
    }

    /// The final initiator for downstream protocols. When both (or neither)
    /// sides claimed initiator, the channel opener wins the tie.
    pub fn is_locally_initiated_final(&self) -> Option<bool> {
        if !self.is_quiescent() {
            return None;
        }
        if self.local_init == self.remote_init {
            return Some(self.we_opened);
        }
        Some(self.local_init)
    }

    pub fn can_send_updates(&self) -> bool {
        !self.sent && !self.local_init
    }

    pub fn can_recv_updates(&self) -> bool {
        !self.received
    }

    fn try_resolve_quiescence_requests(&mut self) {
        let Some(our_turn) = self.is_locally_initiated_final() else {
            return;
        };
        if let Some(resp) = self.resp.take() {
            // The initiator may have gone away; nothing to do then.
            let _ = resp.send(our_turn);
        }
    }

    /// Queue a closure to run when the quiescer is resumed.
    pub fn register_hook(&mut self, hook: Box<dyn FnOnce() + Send>) {
        self.resume_queue.push(hook);
    }

    /// Run the deferred actions accumulated while quiescent, then reset to
    /// the initial state. An Stfu received after the reset starts a fresh
    /// negotiation.
    pub fn resume(&mut self) {
        for hook in self.resume_queue.drain(..) {
            hook();
        }
        self.local_init = false;
        self.remote_init = false;
        self.sent = false;
        self.received = false;
        self.resp = None;
    }
}
