//! The per-channel link actor: it ingests peer messages, drives the
//! commitment update sequence, enforces forwarding policy, negotiates
//! quiescence, and dispatches relayed HTLCs into the switch.

use super::mailbox::{CommitmentSide, Mailbox};
use super::policy::ForwardingPolicy;
use super::quiescer::{Quiescer, QuiescerError};
use super::reputation::Endorsement;
use super::{
    CircuitKey, HtlcMsg, Keystone, LinkHandle, SwitchActorMessage, SwitchCommand, SwitchEvent,
    SwitchPacket,
};
use crate::blinded::BlindedForwardError;
use crate::onion::payload::HopPayload;
use crate::onion::{
    DecodeHopIteratorRequest, ErrorEncrypter, OnionProcessor, SharedSecretLogStore,
};
use crate::types::{ChannelId, Hash256, Pubkey, ShortChannelId};
use crate::wire::messages::SignatureBytes;
use crate::wire::{
    ChannelUpdate, CommitSig, FailureCode, FailureReason, Message, RevokeAndAck, UpdateAddHtlc,
    UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFee, UpdateFulfillHtlc,
};
use ractor::{call, Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use secp256k1::hashes::{sha256, Hash};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Which HTLC flow a gate applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkDirection {
    Incoming,
    Outgoing,
}

bitflags::bitflags! {
    /// Flow gates used while flushing a direction or holding quiescence.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    struct FlowFlags: u8 {
        const INCOMING_DISABLED = 1 << 0;
        const OUTGOING_DISABLED = 1 << 1;
    }
}

impl FlowFlags {
    fn for_direction(direction: LinkDirection) -> Self {
        match direction {
            LinkDirection::Incoming => FlowFlags::INCOMING_DISABLED,
            LinkDirection::Outgoing => FlowFlags::OUTGOING_DISABLED,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProcessingLinkError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("{0:?} adds are disabled")]
    FlowDisabled(LinkDirection),
    #[error("update violates quiescence")]
    QuiescenceViolation,
    #[error("policy violation: {0}")]
    PolicyViolation(FailureCode),
    #[error("insufficient bandwidth: {amount} > {available}")]
    InsufficientBandwidth { amount: u64, available: u64 },
    #[error("dust budget exceeded")]
    DustBudgetExceeded,
    #[error("commitment verification failed: {0}")]
    CommitmentVerification(String),
    #[error("failed to send to peer: {0}")]
    PeerSend(String),
    #[error("quiescer error: {0}")]
    Quiescer(#[from] QuiescerError),
    #[error("onion processing failed: {0:?}")]
    OnionFailure(FailureCode),
}

impl ProcessingLinkError {
    /// The wire failure code a violation maps to when it must travel back to
    /// the payment source.
    pub fn fail_code(&self) -> FailureCode {
        match self {
            ProcessingLinkError::PolicyViolation(code) => *code,
            ProcessingLinkError::OnionFailure(code) => *code,
            ProcessingLinkError::InsufficientBandwidth { .. }
            | ProcessingLinkError::DustBudgetExceeded
            | ProcessingLinkError::FlowDisabled(_)
            | ProcessingLinkError::QuiescenceViolation => FailureCode::TemporaryChannelFailure,
            ProcessingLinkError::CommitmentVerification(_) => FailureCode::PermanentChannelFailure,
            ProcessingLinkError::InvalidState(_)
            | ProcessingLinkError::InvalidParameter(_)
            | ProcessingLinkError::PeerSend(_)
            | ProcessingLinkError::Quiescer(_) => FailureCode::TemporaryNodeFailure,
        }
    }
}

pub type ProcessingLinkResult = Result<(), ProcessingLinkError>;

// ============================================================
// Capability interfaces
// ============================================================

/// The peer transport the link writes messages into.
pub trait PeerLink: Send + Sync {
    fn send_message(&self, msg: Message) -> Result<(), String>;
}

/// Commitment signing and verification, kept behind a trait because on-chain
/// machinery is outside this subsystem.
pub trait CommitmentVerifier: Send + Sync {
    fn sign_commitment(&self, channel_id: &ChannelId, commitment_number: u64) -> SignatureBytes;

    fn verify_commitment(
        &self,
        channel_id: &ChannelId,
        commitment_number: u64,
        sig: &CommitSig,
    ) -> Result<(), String>;

    /// The revocation secret and next point for our `revoke_and_ack`.
    fn revoke_commitment(
        &self,
        channel_id: &ChannelId,
        commitment_number: u64,
    ) -> (Hash256, Pubkey);
}

/// Lookup for HTLCs that terminate at this node.
pub trait InvoiceRegistry: Send + Sync {
    /// The preimage for a payment we should settle, if the invoice checks
    /// out at this amount.
    fn resolve_invoice(&self, payment_hash: Hash256, amount_msat: u64) -> Option<Hash256>;
}

// ============================================================
// HTLC ledger
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum InboundHtlcState {
    /// Announced by the peer, not yet covered by a commitment.
    Announced,
    /// Covered by the peer's commitment signature.
    Committed,
    /// Decoded and dispatched (forwarded or settled locally).
    Processed,
    /// A settle or fail for it has been sent to the peer.
    RemoveSent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OutboundHtlcState {
    /// We sent the add; not yet covered by our commitment signature.
    Announced,
    /// Covered by our commitment signature.
    Committed,
}

struct InboundHtlc {
    add: UpdateAddHtlc,
    state: InboundHtlcState,
    encrypter: Option<Arc<dyn ErrorEncrypter>>,
}

struct OutboundHtlc {
    add: UpdateAddHtlc,
    state: OutboundHtlcState,
    /// The incoming circuit this add forwards; `None` for HTLCs we
    /// originate.
    origin: Option<CircuitKey>,
    /// Whether the circuit keystone for this add has been opened.
    circuit_opened: bool,
}

// ============================================================
// Messages
// ============================================================

pub enum LinkCommand {
    /// A packet pulled from the mailbox by the pump task.
    ForwardPacket(SwitchPacket),
    InitQuiescence(RpcReplyPort<bool>),
    CheckHtlcForward {
        payment_hash: Hash256,
        incoming_amount: u64,
        outgoing_amount: u64,
        incoming_timeout: u32,
        outgoing_timeout: u32,
        reply: RpcReplyPort<Option<FailureReason>>,
    },
    CheckHtlcTransit {
        amount: u64,
        timeout: u32,
        reply: RpcReplyPort<Option<FailureReason>>,
    },
    MayAddOutgoingHtlc {
        amount: u64,
        reply: RpcReplyPort<bool>,
    },
    Bandwidth(RpcReplyPort<u64>),
    EnableAdds(LinkDirection),
    DisableAdds(LinkDirection),
    IsFlushing {
        direction: LinkDirection,
        reply: RpcReplyPort<bool>,
    },
    /// The funding transaction confirmed; promote the zero-conf channel.
    UpdateShortChanId(ShortChannelId),
}

impl std::fmt::Debug for LinkCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkCommand::ForwardPacket(pkt) => write!(f, "ForwardPacket({:?})", pkt),
            LinkCommand::InitQuiescence(_) => write!(f, "InitQuiescence"),
            LinkCommand::CheckHtlcForward { payment_hash, .. } => {
                write!(f, "CheckHtlcForward({})", payment_hash)
            }
            LinkCommand::CheckHtlcTransit { amount, .. } => {
                write!(f, "CheckHtlcTransit({})", amount)
            }
            LinkCommand::MayAddOutgoingHtlc { amount, .. } => {
                write!(f, "MayAddOutgoingHtlc({})", amount)
            }
            LinkCommand::Bandwidth(_) => write!(f, "Bandwidth"),
            LinkCommand::EnableAdds(dir) => write!(f, "EnableAdds({:?})", dir),
            LinkCommand::DisableAdds(dir) => write!(f, "DisableAdds({:?})", dir),
            LinkCommand::IsFlushing { direction, .. } => write!(f, "IsFlushing({:?})", direction),
            LinkCommand::UpdateShortChanId(scid) => write!(f, "UpdateShortChanId({})", scid),
        }
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    BlockHeightChanged(u32),
    /// Periodic scan for mailbox packets past their delivery deadline.
    CheckMailboxTimeouts,
}

#[derive(Debug)]
pub enum LinkActorMessage {
    Command(LinkCommand),
    Event(LinkEvent),
    PeerMessage(Message),
}

// ============================================================
// State
// ============================================================

pub struct LinkArguments {
    pub channel_id: ChannelId,
    pub short_channel_id: ShortChannelId,
    pub aliases: Vec<ShortChannelId>,
    pub we_opened: bool,
    pub local_balance_msat: u64,
    pub policy: ForwardingPolicy,
    pub current_height: u32,
    pub peer_supports_endorsement: bool,
    pub chain_hash: Hash256,
}

pub struct LinkState {
    channel_id: ChannelId,
    short_channel_id: ShortChannelId,
    aliases: Vec<ShortChannelId>,
    policy: ForwardingPolicy,
    current_height: u32,
    chain_hash: Hash256,
    peer_supports_endorsement: bool,

    local_balance_msat: u64,
    in_flight_msat: u64,
    /// Shared with the switch through the link handle.
    bandwidth_shared: Arc<AtomicU64>,
    policy_shared: Arc<RwLock<ForwardingPolicy>>,
    channel_update_shared: Arc<RwLock<ChannelUpdate>>,

    next_outgoing_id: u64,
    next_incoming_id: u64,
    inbound: BTreeMap<u64, InboundHtlc>,
    outbound: BTreeMap<u64, OutboundHtlc>,

    local_commitment_number: u64,
    remote_commitment_number: u64,
    waiting_ack: bool,
    feerate_per_kw: u32,

    quiescer: Quiescer,
    pending_updates_flag: Arc<AtomicBool>,
    flow: FlowFlags,
}

impl LinkState {
    pub fn bandwidth(&self) -> u64 {
        self.local_balance_msat.saturating_sub(self.in_flight_msat)
    }

    fn publish_bandwidth(&self) {
        self.bandwidth_shared
            .store(self.bandwidth(), Ordering::Release);
    }

    fn channel_update(&self) -> ChannelUpdate {
        self.channel_update_shared
            .read()
            .expect("update lock")
            .clone()
    }

    fn refresh_channel_update(&self) {
        let update = ChannelUpdate {
            signature: SignatureBytes::default(),
            chain_hash: self.chain_hash,
            short_channel_id: self.short_channel_id,
            timestamp: (crate::now_timestamp_as_millis_u64() / 1000) as u32,
            message_flags: 1,
            channel_flags: 0,
            cltv_expiry_delta: self.policy.cltv_delta,
            htlc_minimum_msat: self.policy.min_htlc_msat,
            fee_base_msat: self.policy.base_fee_msat as u32,
            fee_proportional_millionths: self.policy.fee_rate_ppm as u32,
            htlc_maximum_msat: self.policy.max_htlc_msat,
        };
        *self.channel_update_shared.write().expect("update lock") = update;
    }

    /// Uncommitted updates exist on either side.
    fn has_pending_updates(&self) -> bool {
        self.waiting_ack
            || self
                .inbound
                .values()
                .any(|h| h.state == InboundHtlcState::Announced)
            || self
                .outbound
                .values()
                .any(|h| h.state == OutboundHtlcState::Announced)
    }

    fn refresh_pending_flag(&self) {
        self.pending_updates_flag
            .store(self.has_pending_updates(), Ordering::SeqCst);
    }

    /// The decode batch for a remote commitment is identified by the channel
    /// and the commitment number that covered the adds.
    fn decode_batch_id(&self) -> Vec<u8> {
        let mut id = self.channel_id.as_ref().to_vec();
        id.extend_from_slice(&self.remote_commitment_number.to_be_bytes());
        id
    }
}

// ============================================================
// Actor
// ============================================================

pub struct ChannelLink<S> {
    switch: ActorRef<SwitchActorMessage>,
    onion: Arc<OnionProcessor<S>>,
    peer: Arc<dyn PeerLink>,
    signer: Arc<dyn CommitmentVerifier>,
    registry: Arc<dyn InvoiceRegistry>,
    mailbox: Arc<Mailbox>,
    dust_threshold_msat: u64,
    endorsement_enabled: bool,
}

impl<S> ChannelLink<S>
where
    S: SharedSecretLogStore + Clone + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        switch: ActorRef<SwitchActorMessage>,
        onion: Arc<OnionProcessor<S>>,
        peer: Arc<dyn PeerLink>,
        signer: Arc<dyn CommitmentVerifier>,
        registry: Arc<dyn InvoiceRegistry>,
        mailbox: Arc<Mailbox>,
        dust_threshold_msat: u64,
        endorsement_enabled: bool,
    ) -> Self {
        Self {
            switch,
            onion,
            peer,
            signer,
            registry,
            mailbox,
            dust_threshold_msat,
            endorsement_enabled,
        }
    }

    /// Construct a link with its dust and endorsement behavior taken from
    /// the node configuration.
    pub fn from_config(
        switch: ActorRef<SwitchActorMessage>,
        onion: Arc<OnionProcessor<S>>,
        peer: Arc<dyn PeerLink>,
        signer: Arc<dyn CommitmentVerifier>,
        registry: Arc<dyn InvoiceRegistry>,
        config: &crate::SwitchConfig,
    ) -> Self {
        let mailbox = Arc::new(Mailbox::new(std::time::Duration::from_millis(
            config.mailbox_delivery_timeout_ms(),
        )));
        Self::new(
            switch,
            onion,
            peer,
            signer,
            registry,
            mailbox,
            config.dust_threshold_msat(),
            config.endorsement_enabled(),
        )
    }

    /// The identity handle the switch holds for this link.
    pub fn handle_for_switch(
        &self,
        myself: &ActorRef<LinkActorMessage>,
        state: &LinkState,
    ) -> LinkHandle {
        LinkHandle {
            channel_id: state.channel_id,
            short_channel_id: state.short_channel_id,
            aliases: state.aliases.clone(),
            actor: myself.clone(),
            mailbox: Arc::clone(&self.mailbox),
            policy: Arc::clone(&state.policy_shared),
            bandwidth_msat: Arc::clone(&state.bandwidth_shared),
            channel_update: Arc::clone(&state.channel_update_shared),
        }
    }

    // ----- peer messages -----

    async fn handle_peer_message(
        &self,
        myself: &ActorRef<LinkActorMessage>,
        state: &mut LinkState,
        message: Message,
    ) -> ProcessingLinkResult {
        match message {
            Message::UpdateAddHtlc(add) => self.handle_add_htlc_peer_message(state, add),
            Message::CommitSig(commit_sig) => {
                self.handle_commit_sig_peer_message(myself, state, commit_sig)
                    .await
            }
            Message::RevokeAndAck(revoke) => {
                self.handle_revoke_peer_message(state, revoke).await
            }
            Message::UpdateFulfillHtlc(fulfill) => {
                self.handle_fulfill_peer_message(state, fulfill)
            }
            Message::UpdateFailHtlc(fail) => self.handle_fail_peer_message(state, fail),
            Message::UpdateFailMalformedHtlc(fail) => {
                self.handle_fail_malformed_peer_message(state, fail)
            }
            Message::UpdateFee(update_fee) => self.handle_update_fee(state, update_fee),
            Message::ChannelReady(ready) => {
                info!(
                    "channel {} ready (peer alias: {:?})",
                    state.channel_id, ready.alias
                );
                Ok(())
            }
            Message::ChannelReestablish(reestablish) => {
                self.handle_reestablish(state, reestablish.next_commitment_number)
            }
            Message::Stfu(stfu) => {
                state.quiescer.recv_stfu(stfu)?;
                if state.quiescer.is_quiescent() {
                    state.flow = FlowFlags::INCOMING_DISABLED | FlowFlags::OUTGOING_DISABLED;
                    info!("channel {} is quiescent", state.channel_id);
                }
                Ok(())
            }
            Message::Error(err) => {
                warn!(
                    "peer error on channel {}: {}",
                    state.channel_id,
                    String::from_utf8_lossy(&err.data)
                );
                Ok(())
            }
            Message::ChannelUpdate(_) => Ok(()),
        }
    }

    fn handle_add_htlc_peer_message(
        &self,
        state: &mut LinkState,
        add: UpdateAddHtlc,
    ) -> ProcessingLinkResult {
        if !state.quiescer.can_recv_updates() {
            return Err(ProcessingLinkError::QuiescenceViolation);
        }
        if state.flow.contains(FlowFlags::INCOMING_DISABLED) {
            return Err(ProcessingLinkError::FlowDisabled(LinkDirection::Incoming));
        }
        if add.id != state.next_incoming_id {
            return Err(ProcessingLinkError::InvalidParameter(format!(
                "unexpected htlc id {} (expecting {})",
                add.id, state.next_incoming_id
            )));
        }

        trace!(
            "received add {} for {} msat on {}",
            add.id,
            add.amount_msat,
            state.channel_id
        );
        state.inbound.insert(
            add.id,
            InboundHtlc {
                add,
                state: InboundHtlcState::Announced,
                encrypter: None,
            },
        );
        state.next_incoming_id += 1;
        state.refresh_pending_flag();
        Ok(())
    }

    async fn handle_commit_sig_peer_message(
        &self,
        _myself: &ActorRef<LinkActorMessage>,
        state: &mut LinkState,
        commit_sig: CommitSig,
    ) -> ProcessingLinkResult {
        self.signer
            .verify_commitment(&state.channel_id, state.remote_commitment_number, &commit_sig)
            .map_err(ProcessingLinkError::CommitmentVerification)?;

        state.remote_commitment_number += 1;
        let newly_committed: Vec<u64> = state
            .inbound
            .iter_mut()
            .filter(|(_, h)| h.state == InboundHtlcState::Announced)
            .map(|(id, h)| {
                h.state = InboundHtlcState::Committed;
                *id
            })
            .collect();

        let (secret, next_point) = self
            .signer
            .revoke_commitment(&state.channel_id, state.remote_commitment_number);
        self.peer
            .send_message(Message::RevokeAndAck(RevokeAndAck {
                channel_id: state.channel_id,
                per_commitment_secret: secret,
                next_per_commitment_point: next_point,
            }))
            .map_err(ProcessingLinkError::PeerSend)?;

        state.refresh_pending_flag();
        state.quiescer.try_progress_state()?;

        if !newly_committed.is_empty() {
            self.process_committed_adds(state, newly_committed).await;
        }
        Ok(())
    }

    async fn handle_revoke_peer_message(
        &self,
        state: &mut LinkState,
        _revoke: RevokeAndAck,
    ) -> ProcessingLinkResult {
        if !state.waiting_ack {
            return Err(ProcessingLinkError::InvalidState(
                "unexpected revoke_and_ack".to_string(),
            ));
        }
        state.waiting_ack = false;
        for htlc in state.outbound.values_mut() {
            if htlc.state == OutboundHtlcState::Announced {
                htlc.state = OutboundHtlcState::Committed;
            }
        }
        state.refresh_pending_flag();
        state.quiescer.try_progress_state()?;

        // More updates may have queued while the ack was outstanding.
        self.maybe_send_commit_sig(state).await?;
        Ok(())
    }

    fn handle_fulfill_peer_message(
        &self,
        state: &mut LinkState,
        fulfill: UpdateFulfillHtlc,
    ) -> ProcessingLinkResult {
        let htlc = state.outbound.remove(&fulfill.id).ok_or_else(|| {
            ProcessingLinkError::InvalidParameter(format!(
                "fulfill for unknown htlc id {}",
                fulfill.id
            ))
        })?;

        let preimage: [u8; 32] = fulfill.payment_preimage.into();
        let filled_hash: Hash256 = (*sha256::Hash::hash(&preimage).as_byte_array()).into();
        if filled_hash != htlc.add.payment_hash {
            state.outbound.insert(fulfill.id, htlc);
            return Err(ProcessingLinkError::InvalidParameter(
                "preimage does not match payment hash".to_string(),
            ));
        }

        state.local_balance_msat = state.local_balance_msat.saturating_sub(htlc.add.amount_msat);
        state.in_flight_msat = state.in_flight_msat.saturating_sub(htlc.add.amount_msat);
        state.publish_bandwidth();
        state.refresh_pending_flag();

        if htlc.origin.is_some() {
            self.switch
                .send_message(SwitchActorMessage::new_event(
                    SwitchEvent::ResponseReceived {
                        out_key: CircuitKey::new(state.short_channel_id, fulfill.id),
                        msg: HtlcMsg::Settle(fulfill),
                    },
                ))
                .map_err(|e| ProcessingLinkError::PeerSend(e.to_string()))?;
        } else {
            debug!(
                "originated payment {} settled",
                htlc.add.payment_hash
            );
        }
        Ok(())
    }

    fn handle_fail_peer_message(
        &self,
        state: &mut LinkState,
        fail: UpdateFailHtlc,
    ) -> ProcessingLinkResult {
        let htlc = state.outbound.remove(&fail.id).ok_or_else(|| {
            ProcessingLinkError::InvalidParameter(format!("fail for unknown htlc id {}", fail.id))
        })?;

        state.in_flight_msat = state.in_flight_msat.saturating_sub(htlc.add.amount_msat);
        state.publish_bandwidth();
        state.refresh_pending_flag();

        if htlc.origin.is_some() {
            self.switch
                .send_message(SwitchActorMessage::new_event(
                    SwitchEvent::ResponseReceived {
                        out_key: CircuitKey::new(state.short_channel_id, fail.id),
                        msg: HtlcMsg::Fail(fail),
                    },
                ))
                .map_err(|e| ProcessingLinkError::PeerSend(e.to_string()))?;
        } else {
            debug!("originated payment {} failed", htlc.add.payment_hash);
        }
        Ok(())
    }

    fn handle_fail_malformed_peer_message(
        &self,
        state: &mut LinkState,
        fail: UpdateFailMalformedHtlc,
    ) -> ProcessingLinkResult {
        let code = FailureCode::try_from(fail.failure_code).map_err(|_| {
            ProcessingLinkError::InvalidParameter(format!(
                "unknown failure code {}",
                fail.failure_code
            ))
        })?;
        if !code.is_bad_onion() {
            return Err(ProcessingLinkError::InvalidParameter(
                "malformed failure without badonion bit".to_string(),
            ));
        }
        let htlc = state.outbound.remove(&fail.id).ok_or_else(|| {
            ProcessingLinkError::InvalidParameter(format!(
                "malformed fail for unknown htlc id {}",
                fail.id
            ))
        })?;

        state.in_flight_msat = state.in_flight_msat.saturating_sub(htlc.add.amount_msat);
        state.publish_bandwidth();
        state.refresh_pending_flag();

        if htlc.origin.is_some() {
            self.switch
                .send_message(SwitchActorMessage::new_event(
                    SwitchEvent::ResponseReceived {
                        out_key: CircuitKey::new(state.short_channel_id, fail.id),
                        msg: HtlcMsg::FailMalformed(fail),
                    },
                ))
                .map_err(|e| ProcessingLinkError::PeerSend(e.to_string()))?;
        }
        Ok(())
    }

    fn handle_update_fee(
        &self,
        state: &mut LinkState,
        update_fee: UpdateFee,
    ) -> ProcessingLinkResult {
        if update_fee.feerate_per_kw == 0 {
            return Err(ProcessingLinkError::InvalidParameter(
                "zero feerate".to_string(),
            ));
        }
        state.feerate_per_kw = update_fee.feerate_per_kw;
        // The dust floor moves with the feerate: an HTLC is dust when its
        // value cannot pay for its own second-stage transaction.
        let dust_limit = self.dust_threshold_msat;
        let feerate = update_fee.feerate_per_kw as u64;
        self.mailbox
            .set_dust_closure(Box::new(move |amount, side| {
                let weight = match side {
                    CommitmentSide::Local => 703,
                    CommitmentSide::Remote => 663,
                };
                amount < dust_limit + feerate * weight / 1000 * 1000
            }));
        Ok(())
    }

    fn handle_reestablish(
        &self,
        state: &mut LinkState,
        next_commitment_number: u64,
    ) -> ProcessingLinkResult {
        info!(
            "reestablishing channel {} (peer expects commitment {})",
            state.channel_id, next_commitment_number
        );
        state.waiting_ack = false;
        // Quiescence does not survive a reconnection.
        state.quiescer.resume();
        state.flow = FlowFlags::empty();
        // Un-acked forwards replay ahead of fresh traffic.
        self.mailbox.reset_messages();
        self.mailbox.reset_packets();
        state.refresh_pending_flag();
        Ok(())
    }

    // ----- incoming add processing -----

    /// Decode the onion of every newly committed incoming add in one batch
    /// and dispatch each: settle locally, forward, or fail.
    async fn process_committed_adds(&self, state: &mut LinkState, ids: Vec<u64>) {
        let batch_id = state.decode_batch_id();
        let reqs: Vec<DecodeHopIteratorRequest> = ids
            .iter()
            .filter_map(|id| state.inbound.get(id))
            .map(|htlc| DecodeHopIteratorRequest {
                onion_blob: htlc.add.onion_blob.clone(),
                rhash: htlc.add.payment_hash,
                incoming_cltv: htlc.add.expiry,
                incoming_amount: htlc.add.amount_msat,
                blinding_point: htlc.add.blinding_point,
            })
            .collect();

        let responses = self.onion.decode_hop_iterators(&batch_id, reqs).await;

        for (id, response) in ids.into_iter().zip(responses) {
            let result = match response.fail_code {
                Some(code) => Err(ProcessingLinkError::OnionFailure(code)),
                None => {
                    let iterator = response.hop_iterator.expect("no fail code means iterator");
                    self.apply_committed_add(state, id, iterator)
                }
            };
            if let Err(err) = result {
                warn!("failed to process incoming add {}: {}", id, err);
                self.fail_incoming_htlc(state, id, &err);
            }
        }
        state.refresh_pending_flag();
    }

    fn apply_committed_add(
        &self,
        state: &mut LinkState,
        id: u64,
        iterator: crate::onion::HopIterator,
    ) -> ProcessingLinkResult {
        let (add, encrypter) = {
            let htlc = state.inbound.get_mut(&id).ok_or_else(|| {
                ProcessingLinkError::InvalidState(format!("no inbound htlc {}", id))
            })?;
            htlc.state = InboundHtlcState::Processed;
            let encrypter = iterator
                .extract_error_encrypter(&|key| self.onion.extract_error_encrypter(key))
                .ok();
            htlc.encrypter = encrypter.clone();
            (htlc.add.clone(), encrypter)
        };

        let is_final = iterator.is_final_hop();
        let payload = iterator.hop_payload().map_err(|err| {
            debug!("onion payload for add {} undecodable: {}", id, err);
            // An intermediate hop in a blinded route maps every processing
            // failure to invalid_onion_blinding to protect the recipient.
            if add.blinding_point.is_some() {
                ProcessingLinkError::OnionFailure(FailureCode::InvalidOnionBlinding)
            } else {
                ProcessingLinkError::OnionFailure(FailureCode::InvalidOnionPayload)
            }
        })?;

        if is_final {
            return self.settle_exit_hop(state, id, &add, &payload);
        }

        // Relay: derive the forwarding parameters, blinded or plain.
        let blinded = payload.encrypted_data().is_some() || add.blinding_point.is_some();
        let fwd_info = if blinded {
            let HopPayload::Tlv(tlv) = &payload else {
                return Err(ProcessingLinkError::OnionFailure(
                    FailureCode::InvalidOnionBlinding,
                ));
            };
            iterator
                .blinding_kit()
                .decrypt_and_validate_fwd_info(tlv, false, &tlv.parsed_types)
                .map_err(|err| {
                    debug!("blinded forward derivation failed: {}", err);
                    match err {
                        BlindedForwardError::InvalidBlinding(_) => {}
                        _ => trace!("mapping blinded failure to invalid_onion_blinding"),
                    }
                    ProcessingLinkError::OnionFailure(FailureCode::InvalidOnionBlinding)
                })?
        } else {
            let next_hop = payload.next_hop().ok_or(ProcessingLinkError::OnionFailure(
                FailureCode::InvalidOnionPayload,
            ))?;
            let amount = payload
                .amt_to_forward()
                .ok_or(ProcessingLinkError::OnionFailure(
                    FailureCode::InvalidOnionPayload,
                ))?;
            let outgoing_cltv =
                payload
                    .outgoing_cltv()
                    .ok_or(ProcessingLinkError::OnionFailure(
                        FailureCode::InvalidOnionPayload,
                    ))?;
            crate::onion::ForwardingInfo {
                next_hop,
                amount_to_forward: amount,
                outgoing_cltv,
                next_blinding: None,
            }
        };

        let mut next_onion = Vec::new();
        iterator.encode_next_hop(&mut next_onion).map_err(|err| {
            error!("cannot encode next onion for add {}: {}", id, err);
            ProcessingLinkError::OnionFailure(FailureCode::InvalidOnionPayload)
        })?;

        // Carry the endorsement signal over, defaulting to unendorsed when
        // the record is absent or malformed.
        let endorsement = if self.endorsement_enabled {
            Endorsement::from_custom_records(&add.custom_records)
                .unwrap_or(Endorsement::Unendorsed)
        } else {
            Endorsement::Unknown
        };

        let next_add = UpdateAddHtlc {
            channel_id: ChannelId::default(),
            id: 0,
            amount_msat: fwd_info.amount_to_forward,
            payment_hash: add.payment_hash,
            expiry: fwd_info.outgoing_cltv,
            onion_blob: next_onion,
            blinding_point: fwd_info.next_blinding,
            custom_records: add.custom_records.clone(),
            extra_data: Default::default(),
        };

        let packet = SwitchPacket {
            incoming_chan_id: state.short_channel_id,
            incoming_htlc_id: id,
            outgoing_chan_id: fwd_info.next_hop,
            outgoing_htlc_id: None,
            incoming_amount: add.amount_msat,
            amount: fwd_info.amount_to_forward,
            incoming_timeout: add.expiry,
            outgoing_timeout: fwd_info.outgoing_cltv,
            payment_hash: add.payment_hash,
            msg: HtlcMsg::Add(Box::new(next_add)),
            obfuscator: encrypter,
            sealed_encrypter: None,
            local_failure: false,
            endorsement,
        };

        self.switch
            .send_message(SwitchActorMessage::new_command(
                SwitchCommand::ForwardPackets(vec![packet]),
            ))
            .map_err(|e| ProcessingLinkError::PeerSend(e.to_string()))?;
        Ok(())
    }

    fn settle_exit_hop(
        &self,
        state: &mut LinkState,
        id: u64,
        add: &UpdateAddHtlc,
        payload: &HopPayload,
    ) -> ProcessingLinkResult {
        // The amount in the final payload must match the HTLC itself.
        if let Some(expected) = payload.amt_to_forward() {
            if expected != add.amount_msat {
                return Err(ProcessingLinkError::PolicyViolation(
                    FailureCode::FinalIncorrectHtlcAmount,
                ));
            }
        }
        if let Some(expected_cltv) = payload.outgoing_cltv() {
            if add.expiry < expected_cltv {
                return Err(ProcessingLinkError::PolicyViolation(
                    FailureCode::FinalIncorrectCltvExpiry,
                ));
            }
        }

        let Some(preimage) = self
            .registry
            .resolve_invoice(add.payment_hash, add.amount_msat)
        else {
            return Err(ProcessingLinkError::PolicyViolation(
                FailureCode::IncorrectOrUnknownPaymentDetails,
            ));
        };

        if let Some(htlc) = state.inbound.get_mut(&id) {
            htlc.state = InboundHtlcState::RemoveSent;
        }
        state.local_balance_msat += add.amount_msat;
        state.publish_bandwidth();

        debug!("settling exit-hop payment {}", add.payment_hash);
        self.peer
            .send_message(Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
                channel_id: state.channel_id,
                id,
                payment_preimage: preimage,
            }))
            .map_err(ProcessingLinkError::PeerSend)?;
        Ok(())
    }

    /// Send the upstream failure for an incoming HTLC. Onion-level failures
    /// and missing encrypters force the malformed path, which requires a
    /// badonion code.
    fn fail_incoming_htlc(&self, state: &mut LinkState, id: u64, err: &ProcessingLinkError) {
        let Some(htlc) = state.inbound.get_mut(&id) else {
            return;
        };
        htlc.state = InboundHtlcState::RemoveSent;
        let code = err.fail_code();

        let message = match (&htlc.encrypter, code.is_bad_onion()) {
            (Some(encrypter), false) => {
                let reason = match code {
                    FailureCode::TemporaryChannelFailure => {
                        FailureReason::TemporaryChannelFailure {
                            update: Some(state.channel_update()),
                        }
                    }
                    other => FailureReason::Code(other),
                };
                Message::UpdateFailHtlc(UpdateFailHtlc {
                    channel_id: state.channel_id,
                    id,
                    reason: encrypter.encrypt_first_hop(&reason.encode()),
                })
            }
            _ => {
                let wire_code = if code.is_bad_onion() {
                    code
                } else {
                    // No encrypter to speak through: only the malformed path
                    // remains, and it demands the badonion bit.
                    FailureCode::InvalidOnionVersion
                };
                Message::UpdateFailMalformedHtlc(UpdateFailMalformedHtlc {
                    channel_id: state.channel_id,
                    id,
                    sha256_of_onion: (*sha256::Hash::hash(&htlc.add.onion_blob).as_byte_array())
                        .into(),
                    failure_code: wire_code.into(),
                })
            }
        };

        if let Err(send_err) = self.peer.send_message(message) {
            error!("failed to send failure for htlc {}: {}", id, send_err);
        }
    }

    // ----- outgoing adds -----

    async fn handle_forward_packet(
        &self,
        state: &mut LinkState,
        packet: SwitchPacket,
    ) -> ProcessingLinkResult {
        match &packet.msg {
            HtlcMsg::Add(_) => self.handle_outgoing_add(state, packet.clone()).await,
            HtlcMsg::Settle(settle) => {
                self.respond_incoming(state, packet.incoming_htlc_id, |channel_id| {
                    Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
                        channel_id,
                        id: packet.incoming_htlc_id,
                        payment_preimage: settle.payment_preimage,
                    })
                })
            }
            HtlcMsg::Fail(fail) => {
                // Failures we originated carry a plaintext reason and get the
                // first-hop pass; downstream failures are re-encrypted as
                // they retrace the route.
                let encrypter = self.incoming_encrypter(state, &packet);
                let reason = match (&encrypter, packet.local_failure) {
                    (Some(encrypter), true) => encrypter.encrypt_first_hop(&fail.reason),
                    (Some(encrypter), false) => encrypter.reencrypt(&fail.reason),
                    (None, true) => {
                        // No encrypter to speak through: the malformed path
                        // is the only one left, and it demands badonion.
                        return self.respond_incoming(
                            state,
                            packet.incoming_htlc_id,
                            |channel_id| {
                                Message::UpdateFailMalformedHtlc(UpdateFailMalformedHtlc {
                                    channel_id,
                                    id: packet.incoming_htlc_id,
                                    sha256_of_onion: Hash256::default(),
                                    failure_code: FailureCode::InvalidOnionVersion.into(),
                                })
                            },
                        );
                    }
                    (None, false) => {
                        warn!(
                            "no encrypter for circuit {}; passing failure opaque",
                            packet.in_key()
                        );
                        fail.reason.clone()
                    }
                };
                self.respond_incoming(state, packet.incoming_htlc_id, |channel_id| {
                    Message::UpdateFailHtlc(UpdateFailHtlc {
                        channel_id,
                        id: packet.incoming_htlc_id,
                        reason,
                    })
                })
            }
            HtlcMsg::FailMalformed(fail) => {
                // A malformed report from downstream becomes an encrypted
                // failure from us; the downstream peer cannot produce one.
                let code = FailureCode::try_from(fail.failure_code)
                    .unwrap_or(FailureCode::InvalidOnionVersion);
                let encrypter = self.incoming_encrypter(state, &packet);
                match encrypter {
                    Some(encrypter) => {
                        let reason = FailureReason::Code(code);
                        let blob = encrypter.encrypt_first_hop(&reason.encode());
                        self.respond_incoming(state, packet.incoming_htlc_id, |channel_id| {
                            Message::UpdateFailHtlc(UpdateFailHtlc {
                                channel_id,
                                id: packet.incoming_htlc_id,
                                reason: blob,
                            })
                        })
                    }
                    None => self.respond_incoming(state, packet.incoming_htlc_id, |channel_id| {
                        Message::UpdateFailMalformedHtlc(UpdateFailMalformedHtlc {
                            channel_id,
                            id: packet.incoming_htlc_id,
                            sha256_of_onion: fail.sha256_of_onion,
                            failure_code: fail.failure_code,
                        })
                    }),
                }
            }
        }
    }

    /// The encrypter for a response packet's incoming hop: the live one kept
    /// on the inbound HTLC, or one re-armed from the circuit's sealed copy.
    fn incoming_encrypter(
        &self,
        state: &LinkState,
        packet: &SwitchPacket,
    ) -> Option<Arc<dyn ErrorEncrypter>> {
        if let Some(htlc) = state.inbound.get(&packet.incoming_htlc_id) {
            if let Some(encrypter) = &htlc.encrypter {
                return Some(Arc::clone(encrypter));
            }
        }
        if let Some(obfuscator) = &packet.obfuscator {
            return Some(Arc::clone(obfuscator));
        }
        packet
            .sealed_encrypter
            .as_ref()
            .and_then(|sealed| self.onion.reextract_encrypter(sealed).ok())
    }

    fn respond_incoming(
        &self,
        state: &mut LinkState,
        id: u64,
        build: impl FnOnce(ChannelId) -> Message,
    ) -> ProcessingLinkResult {
        let Some(htlc) = state.inbound.get_mut(&id) else {
            // The circuit was torn down and the htlc already resolved.
            debug!("response for unknown inbound htlc {}", id);
            return Ok(());
        };
        htlc.state = InboundHtlcState::RemoveSent;
        let message = build(state.channel_id);
        if let Message::UpdateFulfillHtlc(_) = &message {
            state.local_balance_msat += htlc.add.amount_msat;
            state.publish_bandwidth();
        }
        self.peer
            .send_message(message)
            .map_err(ProcessingLinkError::PeerSend)?;
        state.refresh_pending_flag();
        Ok(())
    }

    async fn handle_outgoing_add(
        &self,
        state: &mut LinkState,
        mut packet: SwitchPacket,
    ) -> ProcessingLinkResult {
        if !state.quiescer.can_send_updates() {
            return Err(ProcessingLinkError::QuiescenceViolation);
        }
        if state.flow.contains(FlowFlags::OUTGOING_DISABLED) {
            return Err(ProcessingLinkError::FlowDisabled(LinkDirection::Outgoing));
        }
        let available = state.bandwidth();
        if packet.amount > available {
            return Err(ProcessingLinkError::InsufficientBandwidth {
                amount: packet.amount,
                available,
            });
        }
        // Dust HTLCs are capped by the dust budget rather than bandwidth.
        if packet.amount < self.dust_threshold_msat {
            let dust_sum = self.mailbox.get_dust_sum(CommitmentSide::Remote);
            if dust_sum + packet.amount > self.dust_threshold_msat * 100 {
                return Err(ProcessingLinkError::DustBudgetExceeded);
            }
        }

        let id = state.next_outgoing_id;
        state.next_outgoing_id += 1;

        let HtlcMsg::Add(template) = &mut packet.msg else {
            unreachable!("checked by caller");
        };
        template.channel_id = state.channel_id;
        template.id = id;
        let mut records = template.custom_records.clone();
        packet
            .endorsement
            .apply(&mut records, state.peer_supports_endorsement);
        template.custom_records = records;
        let add = (**template).clone();

        state.outbound.insert(
            id,
            OutboundHtlc {
                add: add.clone(),
                state: OutboundHtlcState::Announced,
                origin: Some(packet.in_key()),
                circuit_opened: false,
            },
        );
        state.in_flight_msat += packet.amount;
        state.publish_bandwidth();
        state.refresh_pending_flag();
        packet.outgoing_htlc_id = Some(id);

        self.peer
            .send_message(Message::UpdateAddHtlc(add))
            .map_err(ProcessingLinkError::PeerSend)?;

        self.maybe_send_commit_sig(state).await
    }

    /// Sign the pending updates into a new commitment. Keystones for
    /// forwarded adds are made durable before the signature leaves us.
    async fn maybe_send_commit_sig(&self, state: &mut LinkState) -> ProcessingLinkResult {
        if state.waiting_ack {
            return Ok(());
        }
        let announced: Vec<u64> = state
            .outbound
            .iter()
            .filter(|(_, h)| h.state == OutboundHtlcState::Announced)
            .map(|(id, _)| *id)
            .collect();
        if announced.is_empty() {
            return Ok(());
        }

        let keystones: Vec<Keystone> = announced
            .iter()
            .filter_map(|id| {
                let htlc = state.outbound.get(id)?;
                if htlc.circuit_opened {
                    return None;
                }
                htlc.origin.map(|in_key| Keystone {
                    in_key,
                    out_key: CircuitKey::new(state.short_channel_id, *id),
                })
            })
            .collect();

        let opened_first_id = keystones.iter().map(|k| k.out_key.htlc_id).min();
        if !keystones.is_empty() {
            let first_id = opened_first_id.expect("nonempty");
            let opened = call!(self.switch, |reply| SwitchActorMessage::Command(
                SwitchCommand::OpenCircuits(keystones.clone(), reply)
            ))
            .map_err(|e| ProcessingLinkError::PeerSend(e.to_string()))?;
            if let Err(err) = opened {
                error!("failed to open circuits: {}", err);
                self.switch
                    .send_message(SwitchActorMessage::new_command(
                        SwitchCommand::TrimOpenCircuits {
                            chan_id: state.short_channel_id,
                            start_id: first_id,
                        },
                    ))
                    .ok();
                return Err(ProcessingLinkError::InvalidState(format!(
                    "open circuits failed: {}",
                    err
                )));
            }
            for keystone in &keystones {
                if let Some(htlc) = state.outbound.get_mut(&keystone.out_key.htlc_id) {
                    htlc.circuit_opened = true;
                }
            }
        }

        let signature = self
            .signer
            .sign_commitment(&state.channel_id, state.local_commitment_number + 1);
        state.local_commitment_number += 1;
        state.waiting_ack = true;
        state.refresh_pending_flag();

        self.peer
            .send_message(Message::CommitSig(CommitSig {
                channel_id: state.channel_id,
                signature,
                htlc_signatures: Vec::new(),
            }))
            .map_err(|err| {
                // The signature never left us; roll back the keystones opened
                // for this round so the circuits return to pending.
                if let Some(start_id) = opened_first_id {
                    self.switch
                        .send_message(SwitchActorMessage::new_command(
                            SwitchCommand::TrimOpenCircuits {
                                chan_id: state.short_channel_id,
                                start_id,
                            },
                        ))
                        .ok();
                }
                ProcessingLinkError::PeerSend(err)
            })?;
        Ok(())
    }

    // ----- commands -----

    async fn handle_command(
        &self,
        myself: &ActorRef<LinkActorMessage>,
        state: &mut LinkState,
        command: LinkCommand,
    ) -> ProcessingLinkResult {
        match command {
            LinkCommand::ForwardPacket(packet) => {
                let in_key = packet.in_key();
                let is_add = packet.is_add();
                if let Err(err) = self.handle_forward_packet(state, packet.clone()).await {
                    if is_add {
                        warn!("cannot carry forwarded add {}: {}", in_key, err);
                        self.switch
                            .send_message(SwitchActorMessage::new_event(
                                SwitchEvent::FailPacket {
                                    packet,
                                    code: err.fail_code(),
                                },
                            ))
                            .ok();
                    }
                    return Err(err);
                }
                Ok(())
            }
            LinkCommand::InitQuiescence(reply) => {
                let (tx, rx) = tokio::sync::oneshot::channel();
                state.quiescer.init_stfu(tx)?;
                tokio::spawn(async move {
                    if let Ok(our_turn) = rx.await {
                        if !reply.is_closed() {
                            let _ = reply.send(our_turn);
                        }
                    }
                });
                Ok(())
            }
            LinkCommand::CheckHtlcForward {
                incoming_amount,
                outgoing_amount,
                incoming_timeout,
                outgoing_timeout,
                reply,
                ..
            } => {
                let result = state
                    .policy
                    .check_htlc_forward(
                        incoming_amount,
                        outgoing_amount,
                        incoming_timeout,
                        outgoing_timeout,
                        state.current_height,
                        state.channel_update(),
                    )
                    .err();
                if !reply.is_closed() {
                    let _ = reply.send(result);
                }
                Ok(())
            }
            LinkCommand::CheckHtlcTransit {
                amount,
                timeout,
                reply,
            } => {
                let result = state
                    .policy
                    .check_htlc_transit(amount, timeout, state.current_height)
                    .err();
                if !reply.is_closed() {
                    let _ = reply.send(result);
                }
                Ok(())
            }
            LinkCommand::MayAddOutgoingHtlc { amount, reply } => {
                let allowed = amount <= state.bandwidth()
                    && !state.flow.contains(FlowFlags::OUTGOING_DISABLED);
                if !reply.is_closed() {
                    let _ = reply.send(allowed);
                }
                Ok(())
            }
            LinkCommand::Bandwidth(reply) => {
                if !reply.is_closed() {
                    let _ = reply.send(state.bandwidth());
                }
                Ok(())
            }
            LinkCommand::EnableAdds(direction) => {
                state.flow.remove(FlowFlags::for_direction(direction));
                Ok(())
            }
            LinkCommand::DisableAdds(direction) => {
                state.flow.insert(FlowFlags::for_direction(direction));
                Ok(())
            }
            LinkCommand::IsFlushing { direction, reply } => {
                let flushing = state.flow.contains(FlowFlags::for_direction(direction));
                if !reply.is_closed() {
                    let _ = reply.send(flushing);
                }
                Ok(())
            }
            LinkCommand::UpdateShortChanId(scid) => {
                info!(
                    "channel {} confirmed with scid {}",
                    state.channel_id, scid
                );
                state.short_channel_id = scid;
                state.refresh_channel_update();
                self.switch
                    .send_message(SwitchActorMessage::new_command(
                        SwitchCommand::UpdateLinkScid {
                            channel_id: state.channel_id,
                            short_channel_id: scid,
                        },
                    ))
                    .ok();
                let handle = self.handle_for_switch(myself, state);
                self.switch
                    .send_message(SwitchActorMessage::new_command(SwitchCommand::AddLink(
                        handle,
                    )))
                    .ok();
                Ok(())
            }
        }
    }

    fn handle_event(&self, state: &mut LinkState, event: LinkEvent) -> ProcessingLinkResult {
        match event {
            LinkEvent::BlockHeightChanged(height) => {
                state.current_height = height;
                Ok(())
            }
            LinkEvent::CheckMailboxTimeouts => {
                for packet in self.mailbox.take_expired(std::time::Instant::now()) {
                    warn!(
                        "packet {} exceeded mailbox delivery timeout",
                        packet.in_key()
                    );
                    self.switch
                        .send_message(SwitchActorMessage::new_event(SwitchEvent::FailPacket {
                            packet,
                            code: FailureCode::TemporaryChannelFailure,
                        }))
                        .ok();
                }
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl<S> Actor for ChannelLink<S>
where
    S: SharedSecretLogStore + Clone + Send + Sync + 'static,
{
    type Msg = LinkActorMessage;
    type State = LinkState;
    type Arguments = LinkArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let pending_updates_flag = Arc::new(AtomicBool::new(false));
        let quiescer_flag = Arc::clone(&pending_updates_flag);
        let peer = Arc::clone(&self.peer);
        let quiescer = Quiescer::new(
            args.channel_id,
            args.we_opened,
            Box::new(move |stfu| peer.send_message(Message::Stfu(stfu))),
            Box::new(move || quiescer_flag.load(Ordering::SeqCst)),
        );

        let state = LinkState {
            channel_id: args.channel_id,
            short_channel_id: args.short_channel_id,
            aliases: args.aliases,
            policy: args.policy,
            current_height: args.current_height,
            chain_hash: args.chain_hash,
            peer_supports_endorsement: args.peer_supports_endorsement,
            local_balance_msat: args.local_balance_msat,
            in_flight_msat: 0,
            bandwidth_shared: Arc::new(AtomicU64::new(args.local_balance_msat)),
            policy_shared: Arc::new(RwLock::new(args.policy)),
            channel_update_shared: Arc::new(RwLock::new(ChannelUpdate {
                signature: SignatureBytes::default(),
                chain_hash: args.chain_hash,
                short_channel_id: args.short_channel_id,
                timestamp: 0,
                message_flags: 1,
                channel_flags: 0,
                cltv_expiry_delta: args.policy.cltv_delta,
                htlc_minimum_msat: args.policy.min_htlc_msat,
                fee_base_msat: args.policy.base_fee_msat as u32,
                fee_proportional_millionths: args.policy.fee_rate_ppm as u32,
                htlc_maximum_msat: args.policy.max_htlc_msat,
            })),
            next_outgoing_id: 0,
            next_incoming_id: 0,
            inbound: BTreeMap::new(),
            outbound: BTreeMap::new(),
            local_commitment_number: 0,
            remote_commitment_number: 0,
            waiting_ack: false,
            feerate_per_kw: 0,
            quiescer,
            pending_updates_flag,
            flow: FlowFlags::empty(),
        };

        // The dust predicate starts from the configured threshold and is
        // refreshed when the channel feerate changes.
        let dust_limit = self.dust_threshold_msat;
        self.mailbox
            .set_dust_closure(Box::new(move |amount, _side| amount < dust_limit));

        // Register with the switch, then start the mailbox pump and the
        // delivery-timeout scan.
        let handle = self.handle_for_switch(&myself, &state);
        self.switch
            .send_message(SwitchActorMessage::new_command(SwitchCommand::AddLink(
                handle,
            )))
            .map_err(|e| ActorProcessingErr::from(e.to_string()))?;

        let mailbox = Arc::clone(&self.mailbox);
        let pump_target = myself.clone();
        tokio::spawn(async move {
            loop {
                let packet = mailbox.next_packet().await;
                if pump_target
                    .send_message(LinkActorMessage::Command(LinkCommand::ForwardPacket(
                        packet,
                    )))
                    .is_err()
                {
                    return;
                }
            }
        });

        let mailbox = Arc::clone(&self.mailbox);
        let message_target = myself.clone();
        tokio::spawn(async move {
            loop {
                let message = mailbox.next_message().await;
                if message_target
                    .send_message(LinkActorMessage::PeerMessage(message))
                    .is_err()
                {
                    return;
                }
            }
        });

        myself.send_interval(
            ractor::concurrency::Duration::from_millis(
                crate::config::DEFAULT_MAILBOX_EXPIRY_SCAN_INTERVAL_MS,
            ),
            || LinkActorMessage::Event(LinkEvent::CheckMailboxTimeouts),
        );

        info!(
            "link {} started (scid: {}, balance: {} msat)",
            state.channel_id, state.short_channel_id, state.local_balance_msat
        );
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            LinkActorMessage::PeerMessage(message) => {
                if let Err(error) = self
                    .handle_peer_message(&myself, state, message.clone())
                    .await
                {
                    error!(
                        "{} error while processing peer message: {} (message: {:?})",
                        state.channel_id, error, message
                    );
                }
            }
            LinkActorMessage::Command(command) => {
                if let Err(error) = self.handle_command(&myself, state, command).await {
                    error!(
                        "{} error while processing command: {}",
                        state.channel_id, error
                    );
                }
            }
            LinkActorMessage::Event(event) => {
                if let Err(error) = self.handle_event(state, event) {
                    error!(
                        "{} error while processing event: {}",
                        state.channel_id, error
                    );
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // Un-acked packets become mail for the next start.
        self.mailbox.reset_packets();
        info!("link {} stopped", state.channel_id);
        Ok(())
    }
}
