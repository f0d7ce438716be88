//! Forwarding policy: the per-link gate every relayed or originated HTLC
//! passes before it is committed.

use crate::wire::{ChannelUpdate, FailureCode, FailureReason};
use serde::{Deserialize, Serialize};

/// The maximum number of blocks an outgoing HTLC may be locked for. HTLCs
/// beyond this horizon tie up liquidity for too long.
pub const MAX_CLTV_EXPIRY: u32 = 2016;

/// A channel's advertised forwarding parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingPolicy {
    pub min_htlc_msat: u64,
    pub max_htlc_msat: u64,
    pub base_fee_msat: u64,
    /// Fee in millionths of the forwarded amount.
    pub fee_rate_ppm: u64,
    /// Blocks the incoming expiry must exceed the outgoing expiry by.
    pub cltv_delta: u16,
    /// Minimum distance the outgoing expiry must keep from the chain tip.
    pub time_lock_buffer: u16,
}

impl Default for ForwardingPolicy {
    fn default() -> Self {
        Self {
            min_htlc_msat: 1_000,
            max_htlc_msat: 10_000_000_000,
            base_fee_msat: 1_000,
            fee_rate_ppm: 1_000,
            cltv_delta: 40,
            time_lock_buffer: 18,
        }
    }
}

impl ForwardingPolicy {
    /// The fee this policy charges for forwarding `amount`.
    pub fn expected_fee(&self, amount: u64) -> u64 {
        self.base_fee_msat + amount * self.fee_rate_ppm / 1_000_000
    }

    /// Gate for relayed HTLCs. On violation, returns a failure carrying
    /// `update` so the sender can re-route against our current policy.
    #[allow(clippy::too_many_arguments)]
    pub fn check_htlc_forward(
        &self,
        incoming_amount: u64,
        outgoing_amount: u64,
        incoming_timeout: u32,
        outgoing_timeout: u32,
        current_height: u32,
        update: ChannelUpdate,
    ) -> Result<(), FailureReason> {
        if outgoing_amount < self.min_htlc_msat {
            return Err(FailureReason::AmountBelowMinimum {
                htlc_msat: outgoing_amount,
                update,
            });
        }
        if outgoing_amount > self.max_htlc_msat {
            return Err(FailureReason::TemporaryChannelFailure {
                update: Some(update),
            });
        }

        let actual_fee = incoming_amount.saturating_sub(outgoing_amount);
        if incoming_amount < outgoing_amount || actual_fee < self.expected_fee(outgoing_amount) {
            return Err(FailureReason::FeeInsufficient {
                htlc_msat: incoming_amount,
                update,
            });
        }

        if incoming_timeout < outgoing_timeout
            || incoming_timeout - outgoing_timeout < self.cltv_delta as u32
        {
            return Err(FailureReason::IncorrectCltvExpiry {
                cltv_expiry: incoming_timeout,
                update,
            });
        }

        if outgoing_timeout <= current_height + self.time_lock_buffer as u32 {
            return Err(FailureReason::ExpiryTooSoon { update });
        }
        if outgoing_timeout > current_height + MAX_CLTV_EXPIRY {
            return Err(FailureReason::Code(FailureCode::ExpiryTooFar));
        }
        Ok(())
    }

    /// Gate for HTLCs we originate on this channel.
    pub fn check_htlc_transit(
        &self,
        amount: u64,
        timeout: u32,
        current_height: u32,
    ) -> Result<(), FailureReason> {
        if amount < self.min_htlc_msat {
            return Err(FailureReason::Code(FailureCode::AmountBelowMinimum));
        }
        if amount > self.max_htlc_msat {
            return Err(FailureReason::Code(FailureCode::TemporaryChannelFailure));
        }
        if timeout <= current_height + self.time_lock_buffer as u32 {
            return Err(FailureReason::Code(FailureCode::ExpiryTooSoon));
        }
        if timeout > current_height + MAX_CLTV_EXPIRY {
            return Err(FailureReason::Code(FailureCode::ExpiryTooFar));
        }
        Ok(())
    }
}
