//! The switch: the central dispatcher that owns the circuit map, resolves
//! outgoing links by SCID or alias, and routes settlements and failures back
//! to their origin.

pub mod circuit;
pub mod circuit_map;
pub mod link;
pub mod mailbox;
pub mod policy;
pub mod quiescer;
pub mod reputation;

pub use circuit::{CircuitKey, Keystone, PaymentCircuit};
pub use circuit_map::{CircuitError, CircuitFwdActions, CircuitMap, CircuitStore};
pub use link::{ChannelLink, LinkActorMessage, LinkCommand, LinkEvent};
pub use mailbox::{CommitmentSide, DustClosure, Mailbox};
pub use policy::ForwardingPolicy;
pub use quiescer::Quiescer;
pub use reputation::Endorsement;

use crate::onion::{ErrorEncrypter, SealedEncrypter};
use crate::store::Store;
use crate::types::{ChannelId, Hash256, ShortChannelId};
use crate::wire::{
    ChannelUpdate, FailureCode, FailureReason, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFailMalformedHtlc, UpdateFulfillHtlc,
};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use secp256k1::hashes::{sha256, Hash};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

pub(crate) const ASSUME_LINK_ACTOR_ALIVE: &str = "link actor must be alive";

// ============================================================
// Packets
// ============================================================

/// The HTLC message a packet carries through the switch.
#[derive(Debug, Clone)]
pub enum HtlcMsg {
    Add(Box<UpdateAddHtlc>),
    Settle(UpdateFulfillHtlc),
    Fail(UpdateFailHtlc),
    FailMalformed(UpdateFailMalformedHtlc),
}

/// A unit of work travelling between links through the switch. For adds it
/// flows source→destination; for settles and fails it is the response
/// retracing the circuit.
#[derive(Clone)]
pub struct SwitchPacket {
    pub incoming_chan_id: ShortChannelId,
    pub incoming_htlc_id: u64,
    /// The requested next hop for adds; zero on responses.
    pub outgoing_chan_id: ShortChannelId,
    pub outgoing_htlc_id: Option<u64>,
    pub incoming_amount: u64,
    /// The amount to forward (adds) or the resolved amount (responses).
    pub amount: u64,
    pub incoming_timeout: u32,
    pub outgoing_timeout: u32,
    pub payment_hash: Hash256,
    pub msg: HtlcMsg,
    /// The error encrypter extracted at decode time; present on adds.
    pub obfuscator: Option<Arc<dyn ErrorEncrypter>>,
    /// The sealed encrypter recovered from the circuit; present on responses
    /// so a restarted link can re-arm it.
    pub sealed_encrypter: Option<SealedEncrypter>,
    /// Set on failure responses generated by this node rather than relayed
    /// from downstream: the reason is still plaintext and needs a first-hop
    /// encryption pass at the incoming link.
    pub local_failure: bool,
    pub endorsement: Endorsement,
}

impl std::fmt::Debug for SwitchPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchPacket")
            .field("incoming", &self.in_key())
            .field("outgoing_chan_id", &self.outgoing_chan_id)
            .field("amount", &self.amount)
            .field("payment_hash", &self.payment_hash)
            .field("msg", &self.msg)
            .finish_non_exhaustive()
    }
}

impl SwitchPacket {
    pub fn in_key(&self) -> CircuitKey {
        CircuitKey::new(self.incoming_chan_id, self.incoming_htlc_id)
    }

    pub fn out_key(&self) -> Option<CircuitKey> {
        self.outgoing_htlc_id
            .map(|id| CircuitKey::new(self.outgoing_chan_id, id))
    }

    pub fn is_add(&self) -> bool {
        matches!(self.msg, HtlcMsg::Add(_))
    }
}

// ============================================================
// Forwarding-event log
// ============================================================

/// A record of one completed forward, bulk-flushed to the store on a ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingEvent {
    pub timestamp_ms: u64,
    pub incoming_chan_id: ShortChannelId,
    pub incoming_htlc_id: u64,
    pub outgoing_chan_id: ShortChannelId,
    pub outgoing_htlc_id: u64,
    pub incoming_amount: u64,
    pub outgoing_amount: u64,
}

impl ForwardingEvent {
    pub fn fee_msat(&self) -> u64 {
        self.incoming_amount.saturating_sub(self.outgoing_amount)
    }
}

pub trait FwdEventStore: Send + Sync {
    fn append_forwarding_events(&self, events: &[ForwardingEvent]) -> Result<(), String>;
    fn load_forwarding_events(&self) -> Vec<ForwardingEvent>;
}

impl FwdEventStore for Store {
    fn append_forwarding_events(&self, events: &[ForwardingEvent]) -> Result<(), String> {
        let mut batch = self.batch();
        for (i, event) in events.iter().enumerate() {
            let mut key = vec![crate::store::FWD_EVENT_PREFIX];
            key.extend_from_slice(&event.timestamp_ms.to_be_bytes());
            key.extend_from_slice(&(i as u16).to_be_bytes());
            key.extend_from_slice(&event.incoming_htlc_id.to_be_bytes());
            batch.put(
                key,
                crate::store::serialize_to_vec(event, "forwarding event"),
            );
        }
        batch.commit()
    }

    fn load_forwarding_events(&self) -> Vec<ForwardingEvent> {
        self.prefix_iterator(&[crate::store::FWD_EVENT_PREFIX])
            .map(|(_, value)| crate::store::deserialize_from(&value, "forwarding event"))
            .collect()
    }
}

// ============================================================
// Link directory
// ============================================================

/// What the switch holds for a link: an identity handle and shared read-only
/// views of its policy and bandwidth, never an owning reference.
#[derive(Clone)]
pub struct LinkHandle {
    pub channel_id: ChannelId,
    /// The confirmed SCID; zero while the channel is zero-conf.
    pub short_channel_id: ShortChannelId,
    pub aliases: Vec<ShortChannelId>,
    pub actor: ActorRef<LinkActorMessage>,
    pub mailbox: Arc<Mailbox>,
    pub policy: Arc<RwLock<ForwardingPolicy>>,
    /// Committed outbound liquidity minus in-flight, maintained by the link.
    pub bandwidth_msat: Arc<AtomicU64>,
    /// The link's current channel_update snapshot, attached to UPDATE-class
    /// failures.
    pub channel_update: Arc<RwLock<ChannelUpdate>>,
}

impl LinkHandle {
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth_msat.load(Ordering::Acquire)
    }

    fn may_add_outgoing_htlc(&self, amount: u64) -> bool {
        self.bandwidth() >= amount
    }
}

// ============================================================
// Switch actor
// ============================================================

#[derive(Debug)]
pub enum SwitchCommand {
    AddLink(LinkHandle),
    RemoveLink(ChannelId),
    /// Funding confirmed for a zero-conf channel: index the confirmed SCID.
    UpdateLinkScid {
        channel_id: ChannelId,
        short_channel_id: ShortChannelId,
    },
    ForwardPackets(Vec<SwitchPacket>),
    OpenCircuits(Vec<Keystone>, RpcReplyPort<Result<(), CircuitError>>),
    TrimOpenCircuits {
        chan_id: ShortChannelId,
        start_id: u64,
    },
    GetLink(ChannelId, RpcReplyPort<Option<LinkHandle>>),
    /// The accumulated reputation score of an upstream channel.
    GetReputation(ShortChannelId, RpcReplyPort<i64>),
    UpdateBlockHeight(u32),
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("channel_id", &self.channel_id)
            .field("short_channel_id", &self.short_channel_id)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum SwitchEvent {
    /// A settle or fail arrived on the outgoing side of a circuit.
    ResponseReceived {
        out_key: CircuitKey,
        msg: HtlcMsg,
    },
    /// The outgoing link could not carry the packet; fail it upstream.
    FailPacket {
        packet: SwitchPacket,
        code: FailureCode,
    },
    FlushForwardingEvents,
}

#[derive(Debug)]
pub enum SwitchActorMessage {
    Command(SwitchCommand),
    Event(SwitchEvent),
}

impl SwitchActorMessage {
    pub fn new_command(command: SwitchCommand) -> Self {
        SwitchActorMessage::Command(command)
    }

    pub fn new_event(event: SwitchEvent) -> Self {
        SwitchActorMessage::Event(event)
    }
}

/// Resolves alias SCIDs to confirmed base SCIDs; implemented by the alias
/// manager.
pub trait AliasResolver: Send + Sync {
    fn resolve_alias(&self, scid: ShortChannelId) -> Option<ShortChannelId>;
}

impl<S: crate::alias::AliasStore> AliasResolver for crate::alias::AliasManager<S> {
    fn resolve_alias(&self, scid: ShortChannelId) -> Option<ShortChannelId> {
        self.find_base_scid(scid)
    }
}

pub struct SwitchArguments<S> {
    pub circuit_map: Arc<CircuitMap<S>>,
    pub aliases: Arc<dyn AliasResolver>,
    /// The store the forwarding-event log flushes into.
    pub event_store: S,
    pub current_height: u32,
    /// Resolution time under which a forward counts as fast for reputation.
    pub reasonable_resolution_ms: u64,
}

pub struct SwitchState<S> {
    circuit_map: Arc<CircuitMap<S>>,
    aliases: Arc<dyn AliasResolver>,
    event_store: S,
    links: HashMap<ChannelId, LinkHandle>,
    scid_index: HashMap<u64, ChannelId>,
    fwd_events: Vec<ForwardingEvent>,
    current_height: u32,
    reasonable_resolution_ms: u64,
    /// Accumulated reputation per upstream channel.
    reputation: HashMap<u64, i64>,
}

impl<S> SwitchState<S> {
    fn link_by_scid(&self, scid: ShortChannelId) -> Option<&LinkHandle> {
        let channel_id = self.scid_index.get(&scid.to_u64())?;
        self.links.get(channel_id)
    }

    fn index_link(&mut self, handle: &LinkHandle) {
        if !handle.short_channel_id.is_zero() {
            self.scid_index
                .insert(handle.short_channel_id.to_u64(), handle.channel_id);
        }
        for alias in &handle.aliases {
            self.scid_index.insert(alias.to_u64(), handle.channel_id);
        }
    }
}

/// The central router. Its serialized message loop is the single writer of
/// the circuit map.
pub struct Switch<S> {
    _store: std::marker::PhantomData<S>,
}

impl<S> Default for Switch<S> {
    fn default() -> Self {
        Self {
            _store: std::marker::PhantomData,
        }
    }
}

impl<S> Switch<S>
where
    S: CircuitStore + FwdEventStore + Send + Sync + 'static,
{
    /// Resolve the outgoing link for an add, consulting the alias directory
    /// first, then the confirmed SCID directory.
    fn resolve_outgoing<'a>(
        &self,
        state: &'a SwitchState<S>,
        scid: ShortChannelId,
    ) -> Option<(&'a LinkHandle, ShortChannelId)> {
        let base = state.aliases.resolve_alias(scid).unwrap_or(scid);
        state.link_by_scid(base).map(|handle| (handle, base))
    }

    /// Route a failure for an add back to its incoming link. The reason
    /// travels plaintext with `local_failure` set; the incoming link owns
    /// the hop's error encrypter and performs the first-hop encryption, or
    /// falls back to a malformed failure when it has none.
    fn fail_upstream(&self, state: &SwitchState<S>, packet: &SwitchPacket, reason: FailureReason) {
        let Some(incoming) = state.link_by_scid(packet.incoming_chan_id) else {
            warn!(
                "cannot fail packet upstream, no link for {}",
                packet.incoming_chan_id
            );
            return;
        };

        let sha = match &packet.msg {
            HtlcMsg::Add(add) => {
                Hash256::from(*sha256::Hash::hash(&add.onion_blob).as_byte_array())
            }
            _ => Hash256::default(),
        };
        let msg = if reason.code().is_bad_onion() {
            HtlcMsg::FailMalformed(UpdateFailMalformedHtlc {
                channel_id: incoming.channel_id,
                id: packet.incoming_htlc_id,
                sha256_of_onion: sha,
                failure_code: reason.code().into(),
            })
        } else {
            HtlcMsg::Fail(UpdateFailHtlc {
                channel_id: incoming.channel_id,
                id: packet.incoming_htlc_id,
                reason: reason.encode(),
            })
        };

        let response = SwitchPacket {
            incoming_chan_id: packet.incoming_chan_id,
            incoming_htlc_id: packet.incoming_htlc_id,
            outgoing_chan_id: ShortChannelId::default(),
            outgoing_htlc_id: None,
            incoming_amount: packet.incoming_amount,
            amount: packet.amount,
            incoming_timeout: packet.incoming_timeout,
            outgoing_timeout: packet.outgoing_timeout,
            payment_hash: packet.payment_hash,
            msg,
            obfuscator: packet.obfuscator.clone(),
            sealed_encrypter: None,
            local_failure: true,
            endorsement: packet.endorsement,
        };
        incoming.mailbox.add_packet(response);
    }

    fn handle_forward(&self, state: &mut SwitchState<S>, packet: SwitchPacket) {
        if !packet.is_add() {
            // A response from a link that resolved one of its received
            // HTLCs; route it back over the circuit.
            if let Some(out_key) = packet.out_key() {
                self.handle_response(state, out_key, packet.msg);
            }
            return;
        }

        let Some((outgoing, base_scid)) = self.resolve_outgoing(state, packet.outgoing_chan_id)
        else {
            debug!("unknown next peer {}", packet.outgoing_chan_id);
            self.fail_upstream(
                state,
                &packet,
                FailureReason::Code(FailureCode::UnknownNextPeer),
            );
            return;
        };

        // Transit policy of the outgoing channel.
        let update = outgoing.channel_update.read().expect("update lock").clone();
        let policy = *outgoing.policy.read().expect("policy lock");
        if let Err(reason) = policy.check_htlc_forward(
            packet.incoming_amount,
            packet.amount,
            packet.incoming_timeout,
            packet.outgoing_timeout,
            state.current_height,
            update,
        ) {
            debug!(
                "forward {} rejected by policy: {}",
                packet.in_key(),
                reason.code()
            );
            self.fail_upstream(state, &packet, reason);
            return;
        }

        // Admission control against the link's live bandwidth.
        if !outgoing.may_add_outgoing_htlc(packet.amount) {
            debug!(
                "forward {} rejected: insufficient bandwidth on {}",
                packet.in_key(),
                base_scid
            );
            let update = outgoing.channel_update.read().expect("update lock").clone();
            self.fail_upstream(
                state,
                &packet,
                FailureReason::TemporaryChannelFailure {
                    update: Some(update),
                },
            );
            return;
        }

        // Commit the circuit before the packet reaches the outgoing mailbox.
        let mut circuit = PaymentCircuit::new(
            packet.payment_hash,
            packet.in_key(),
            packet.incoming_amount,
            packet.amount,
            base_scid,
            packet
                .obfuscator
                .as_ref()
                .map(|o| SealedEncrypter::seal(o.as_ref())),
        );
        circuit.created_ms = crate::now_timestamp_as_millis_u64();
        circuit.endorsed = packet.endorsement == Endorsement::Endorsed;
        let actions = match state.circuit_map.commit_circuits(vec![circuit]) {
            Ok(actions) => actions,
            Err(err) => {
                error!("failed to commit circuit for {}: {}", packet.in_key(), err);
                self.fail_upstream(
                    state,
                    &packet,
                    FailureReason::TemporaryChannelFailure { update: None },
                );
                return;
            }
        };

        if !actions.drops.is_empty() {
            self.fail_upstream(
                state,
                &packet,
                FailureReason::TemporaryChannelFailure { update: None },
            );
            return;
        }
        if !actions.dups.is_empty() {
            // A replay of a circuit already in flight; the original forward
            // owns it.
            debug!("dropping replayed forward for {}", packet.in_key());
            return;
        }

        let mut packet = packet;
        packet.outgoing_chan_id = base_scid;
        outgoing.mailbox.add_packet(packet);
    }

    fn handle_response(&self, state: &mut SwitchState<S>, out_key: CircuitKey, msg: HtlcMsg) {
        let circuit = match state.circuit_map.close_circuit(out_key) {
            Ok(circuit) => circuit,
            Err(err) => {
                // No open circuit: a response replay after teardown is
                // dropped on the floor.
                debug!("ignoring response for {}: {}", out_key, err);
                return;
            }
        };

        let in_key = circuit.incoming;
        let Some(incoming) = state.link_by_scid(in_key.chan_id).cloned() else {
            warn!("no incoming link for circuit {}", in_key);
            return;
        };

        let response = SwitchPacket {
            incoming_chan_id: in_key.chan_id,
            incoming_htlc_id: in_key.htlc_id,
            outgoing_chan_id: out_key.chan_id,
            outgoing_htlc_id: Some(out_key.htlc_id),
            incoming_amount: circuit.incoming_amount,
            amount: circuit.outgoing_amount,
            incoming_timeout: 0,
            outgoing_timeout: 0,
            payment_hash: circuit.payment_hash,
            msg: msg.clone(),
            obfuscator: None,
            sealed_encrypter: circuit.encrypter.clone(),
            local_failure: false,
            endorsement: Endorsement::Unknown,
        };
        incoming.mailbox.add_packet(response);

        // Apply the resolution to the upstream peer's reputation and, for
        // settles, record the completed forward.
        let now = crate::now_timestamp_as_millis_u64();
        let success = matches!(msg, HtlcMsg::Settle(_));
        let fee = circuit
            .incoming_amount
            .saturating_sub(circuit.outgoing_amount) as i64;
        let resolution_ms = now.saturating_sub(circuit.created_ms);
        let delta = reputation::reputation_delta(
            circuit.endorsed,
            success,
            fee,
            resolution_ms,
            state.reasonable_resolution_ms,
        );
        if delta != 0 {
            *state
                .reputation
                .entry(in_key.chan_id.to_u64())
                .or_default() += delta;
            debug!(
                "reputation for {} adjusted by {} (resolution {} ms)",
                in_key.chan_id, delta, resolution_ms
            );
        }

        if success {
            state.fwd_events.push(ForwardingEvent {
                timestamp_ms: now,
                incoming_chan_id: in_key.chan_id,
                incoming_htlc_id: in_key.htlc_id,
                outgoing_chan_id: out_key.chan_id,
                outgoing_htlc_id: out_key.htlc_id,
                incoming_amount: circuit.incoming_amount,
                outgoing_amount: circuit.outgoing_amount,
            });
        }

        // The response is on its way to the originating link: tear the
        // circuit down and release the outgoing mailbox slot.
        if let Err(err) = state.circuit_map.delete_circuits(&[in_key]) {
            error!("failed to delete circuit {}: {}", in_key, err);
        }
        if let Some(outgoing) = state.link_by_scid(out_key.chan_id) {
            outgoing.mailbox.ack_packet(in_key);
        }
    }

    fn flush_forwarding_events(&self, state: &mut SwitchState<S>) {
        if state.fwd_events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut state.fwd_events);
        if let Err(err) = state.event_store.append_forwarding_events(&events) {
            error!("failed to flush {} forwarding events: {}", events.len(), err);
            state.fwd_events = events;
        }
    }
}

#[async_trait::async_trait]
impl<S> Actor for Switch<S>
where
    S: CircuitStore + FwdEventStore + Clone + Send + Sync + 'static,
{
    type Msg = SwitchActorMessage;
    type State = SwitchState<S>;
    type Arguments = SwitchArguments<S>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!("switch starting at height {}", args.current_height);
        myself.send_interval(
            ractor::concurrency::Duration::from_millis(
                crate::config::DEFAULT_FWD_EVENT_FLUSH_INTERVAL_MS,
            ),
            || SwitchActorMessage::new_event(SwitchEvent::FlushForwardingEvents),
        );
        Ok(SwitchState {
            circuit_map: args.circuit_map,
            aliases: args.aliases,
            event_store: args.event_store,
            links: HashMap::new(),
            scid_index: HashMap::new(),
            fwd_events: Vec::new(),
            current_height: args.current_height,
            reasonable_resolution_ms: args.reasonable_resolution_ms,
            reputation: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SwitchActorMessage::Command(command) => match command {
                SwitchCommand::AddLink(handle) => {
                    debug!("adding link {}", handle.channel_id);
                    state.index_link(&handle);
                    state.links.insert(handle.channel_id, handle);
                }
                SwitchCommand::RemoveLink(channel_id) => {
                    if let Some(handle) = state.links.remove(&channel_id) {
                        state
                            .scid_index
                            .retain(|_, mapped| *mapped != channel_id);
                        // Un-acked incoming adds stay in the mailbox as
                        // mail-for-next-start.
                        handle.mailbox.reset_packets();
                        info!("removed link {}", channel_id);
                    }
                }
                SwitchCommand::UpdateLinkScid {
                    channel_id,
                    short_channel_id,
                } => {
                    if let Some(handle) = state.links.get_mut(&channel_id) {
                        handle.short_channel_id = short_channel_id;
                        state
                            .scid_index
                            .insert(short_channel_id.to_u64(), channel_id);
                        info!(
                            "link {} promoted to confirmed scid {}",
                            channel_id, short_channel_id
                        );
                    }
                }
                SwitchCommand::ForwardPackets(packets) => {
                    for packet in packets {
                        self.handle_forward(state, packet);
                    }
                }
                SwitchCommand::OpenCircuits(keystones, reply) => {
                    let result = state.circuit_map.open_circuits(keystones);
                    if !reply.is_closed() {
                        let _ = reply.send(result);
                    }
                }
                SwitchCommand::TrimOpenCircuits { chan_id, start_id } => {
                    if let Err(err) = state.circuit_map.trim_open_circuits(chan_id, start_id) {
                        error!("failed to trim circuits on {}: {}", chan_id, err);
                    }
                }
                SwitchCommand::GetLink(channel_id, reply) => {
                    if !reply.is_closed() {
                        let _ = reply.send(state.links.get(&channel_id).cloned());
                    }
                }
                SwitchCommand::GetReputation(scid, reply) => {
                    let score = state
                        .reputation
                        .get(&scid.to_u64())
                        .copied()
                        .unwrap_or_default();
                    if !reply.is_closed() {
                        let _ = reply.send(score);
                    }
                }
                SwitchCommand::UpdateBlockHeight(height) => {
                    state.current_height = height;
                    for handle in state.links.values() {
                        handle
                            .actor
                            .send_message(LinkActorMessage::Event(
                                LinkEvent::BlockHeightChanged(height),
                            ))
                            .expect(ASSUME_LINK_ACTOR_ALIVE);
                    }
                }
            },
            SwitchActorMessage::Event(event) => match event {
                SwitchEvent::ResponseReceived { out_key, msg } => {
                    self.handle_response(state, out_key, msg);
                }
                SwitchEvent::FailPacket { packet, code } => {
                    let update = state
                        .link_by_scid(packet.outgoing_chan_id)
                        .map(|handle| handle.channel_update.read().expect("update lock").clone());
                    let reason = match code {
                        FailureCode::TemporaryChannelFailure => {
                            FailureReason::TemporaryChannelFailure { update }
                        }
                        other => FailureReason::Code(other),
                    };
                    // The circuit may have been committed already; a packet
                    // failed before its keystone is failed terminally.
                    if let Ok(circuit) = state.circuit_map.fail_circuit(packet.in_key()) {
                        let _ = state.circuit_map.delete_circuits(&[circuit.incoming]);
                    }
                    self.fail_upstream(state, &packet, reason);
                }
                SwitchEvent::FlushForwardingEvents => {
                    self.flush_forwarding_events(state);
                }
            },
        }
        Ok(())
    }
}
