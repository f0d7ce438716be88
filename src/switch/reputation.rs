//! The experimental endorsement signal, its retry policy, the reputation
//! deltas it feeds, and failure attribution for pathfinding feedback.

use crate::wire::{CustomRecords, FailureCode};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// The custom-record TLV type carrying the experimental endorsement value on
/// `update_add_htlc`.
pub const EXPERIMENTAL_ENDORSEMENT_TYPE: u64 = 106_823;

/// The per-HTLC endorsement signal. `Unknown` is the default for fresh
/// payments: start unendorsed, flip to endorsed on retry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Endorsement {
    #[default]
    Unknown,
    Endorsed,
    Unendorsed,
}

impl Endorsement {
    /// Read the endorsement record from an add's custom records. Values
    /// other than 0 or 1, and records of the wrong width, are ignored.
    pub fn from_custom_records(records: &CustomRecords) -> Option<Endorsement> {
        match records.get(EXPERIMENTAL_ENDORSEMENT_TYPE) {
            Some([1]) => Some(Endorsement::Endorsed),
            Some([0]) => Some(Endorsement::Unendorsed),
            Some(_) => None,
            None => None,
        }
    }

    /// The wire value for the outgoing add, if one should be set.
    pub fn wire_value(&self) -> Option<u8> {
        match self {
            Endorsement::Endorsed => Some(1),
            Endorsement::Unendorsed => Some(0),
            Endorsement::Unknown => None,
        }
    }

    /// Apply this signal to the outgoing add's custom records. When the
    /// outgoing peer does not understand the endorsement protocol the record
    /// is stripped instead of propagated.
    pub fn apply(&self, records: &mut CustomRecords, peer_supports_endorsement: bool) {
        records.remove(EXPERIMENTAL_ENDORSEMENT_TYPE);
        if !peer_supports_endorsement {
            trace!("peer does not advertise endorsement, dropping signal");
            return;
        }
        if let Some(value) = self.wire_value() {
            records.insert(EXPERIMENTAL_ENDORSEMENT_TYPE, vec![value]);
        }
    }
}

/// What the retry of a failed attempt must do with its route.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryRoute {
    /// Retry over the same outgoing channel.
    Same,
    /// Pick a different outgoing channel, or split into MPP parts.
    MustDiffer,
}

/// The endorsement and route constraint for retrying a retriable failure.
/// An unresolved (`Unknown`) request flips the next attempt to endorsed on
/// the same route; an explicit request keeps its value and changes route.
pub fn endorsement_for_retry(requested: Endorsement) -> (Endorsement, RetryRoute) {
    match requested {
        Endorsement::Unknown => (Endorsement::Endorsed, RetryRoute::Same),
        explicit => (explicit, RetryRoute::MustDiffer),
    }
}

// ============================================================
// Reputation
// ============================================================

/// The reputation delta applied to the upstream peer when one of its HTLCs
/// resolves.
///
/// Endorsed HTLCs earn the fee when they resolve fast and pay an opportunity
/// cost for every additional `reasonable` period they were held; failures
/// are charged symmetrically. Unendorsed HTLCs only ever earn, and only when
/// they succeed fast.
pub fn reputation_delta(
    endorsed: bool,
    success: bool,
    fees: i64,
    resolution_ms: u64,
    reasonable_ms: u64,
) -> i64 {
    let excess_ms = resolution_ms as i64 - reasonable_ms as i64;
    let opportunity_cost = if excess_ms <= 0 {
        0
    } else {
        // ceil(excess / reasonable) periods beyond the first.
        (excess_ms + reasonable_ms as i64 - 1) / reasonable_ms as i64 * fees
    };

    match (endorsed, success) {
        (true, true) => fees - opportunity_cost,
        (true, false) => -(fees + opportunity_cost),
        (false, true) if resolution_ms <= reasonable_ms => fees,
        (false, _) => 0,
    }
}

// ============================================================
// Failure attribution
// ============================================================

/// Which route element a failure is held against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Penalty {
    /// Penalize one node (hop index, 1-based from the sender).
    Node(usize),
    /// Penalize the channel pair between two adjacent hop indexes.
    Pair(usize, usize),
    None,
}

/// Route shape needed to attribute a failure.
#[derive(Debug, Copy, Clone)]
pub struct RouteContext {
    /// Number of hops, the final node included. Hop 0 is ourselves.
    pub route_len: usize,
    /// Index of the introduction node when the tail of the route is blinded.
    pub introduction_idx: Option<usize>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FailureInterpretation {
    pub penalty: Penalty,
    /// Whether the payment as a whole is failed rather than retried.
    pub terminal: bool,
}

/// Attribute a failure reported by hop `source_idx` (1-based; 1 is our
/// direct peer).
pub fn interpret_failure(
    ctx: &RouteContext,
    source_idx: usize,
    code: FailureCode,
) -> FailureInterpretation {
    let is_final = source_idx == ctx.route_len;

    if code == FailureCode::InvalidOnionBlinding {
        // The receiving node could not process a blinded payload. At the
        // final hop the payment is over: the recipient gave us a path we
        // cannot use again.
        if is_final {
            return FailureInterpretation {
                penalty: Penalty::Node(source_idx),
                terminal: true,
            };
        }
        // Inside a blinded route the code is expected and intentionally
        // uninformative; only the reporting pair is held against, so other
        // paths through the introduction remain usable.
        let in_blinded_route = ctx
            .introduction_idx
            .map_or(false, |intro| source_idx >= intro);
        if in_blinded_route {
            return FailureInterpretation {
                penalty: Penalty::Pair(source_idx, source_idx + 1),
                terminal: false,
            };
        }
        // An unexpected blinding error from a plain hop marks that node.
        return FailureInterpretation {
            penalty: Penalty::Node(source_idx),
            terminal: false,
        };
    }

    // An MPP assembly timeout is the sender's problem, never the final
    // node's.
    if code == FailureCode::MppTimeout {
        return FailureInterpretation {
            penalty: Penalty::None,
            terminal: false,
        };
    }

    if code.is_bad_onion() {
        // A malformed-onion report from our direct peer is on that peer: it
        // got exactly the onion we built. Deeper in the route we cannot tell
        // which side of the reporting channel corrupted it.
        let penalty = if source_idx == 1 {
            Penalty::Node(1)
        } else {
            Penalty::Pair(source_idx - 1, source_idx)
        };
        return FailureInterpretation {
            penalty,
            terminal: is_final,
        };
    }

    FailureInterpretation {
        penalty: Penalty::Pair(source_idx, source_idx + 1),
        terminal: is_final && code.is_perm(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endorsement_records() {
        let mut records = CustomRecords::new();
        assert_eq!(Endorsement::from_custom_records(&records), None);

        records.insert(EXPERIMENTAL_ENDORSEMENT_TYPE, vec![1]);
        assert_eq!(
            Endorsement::from_custom_records(&records),
            Some(Endorsement::Endorsed)
        );

        records.insert(EXPERIMENTAL_ENDORSEMENT_TYPE, vec![0]);
        assert_eq!(
            Endorsement::from_custom_records(&records),
            Some(Endorsement::Unendorsed)
        );

        // Out-of-range value is ignored.
        records.insert(EXPERIMENTAL_ENDORSEMENT_TYPE, vec![7]);
        assert_eq!(Endorsement::from_custom_records(&records), None);
    }

    #[test]
    fn test_endorsement_propagation() {
        let mut records = CustomRecords::new();
        records.insert(EXPERIMENTAL_ENDORSEMENT_TYPE, vec![1]);

        // Peer understands endorsement: signal propagates unchanged.
        let mut forwarded = records.clone();
        Endorsement::Endorsed.apply(&mut forwarded, true);
        assert_eq!(forwarded.get(EXPERIMENTAL_ENDORSEMENT_TYPE), Some(&[1u8][..]));

        // Peer does not: signal is stripped.
        let mut stripped = records.clone();
        Endorsement::Endorsed.apply(&mut stripped, false);
        assert_eq!(stripped.get(EXPERIMENTAL_ENDORSEMENT_TYPE), None);
    }

    #[test]
    fn test_retry_policy() {
        assert_eq!(
            endorsement_for_retry(Endorsement::Unknown),
            (Endorsement::Endorsed, RetryRoute::Same)
        );
        assert_eq!(
            endorsement_for_retry(Endorsement::Endorsed),
            (Endorsement::Endorsed, RetryRoute::MustDiffer)
        );
        assert_eq!(
            endorsement_for_retry(Endorsement::Unendorsed),
            (Endorsement::Unendorsed, RetryRoute::MustDiffer)
        );
    }

    #[test]
    fn test_reputation_delta() {
        const REASONABLE: u64 = 10_000;
        // Endorsed, fast success: earn the fee.
        assert_eq!(reputation_delta(true, true, 100, 1_000, REASONABLE), 100);
        // Endorsed, slow success: fee minus one period of opportunity cost.
        assert_eq!(reputation_delta(true, true, 100, 15_000, REASONABLE), 0);
        // Endorsed, very slow success goes negative.
        assert_eq!(
            reputation_delta(true, true, 100, 35_000, REASONABLE),
            100 - 3 * 100
        );
        // Endorsed fast failure: lose the fee.
        assert_eq!(reputation_delta(true, false, 100, 1_000, REASONABLE), -100);
        // Endorsed slow failure: fee plus opportunity cost.
        assert_eq!(
            reputation_delta(true, false, 100, 15_000, REASONABLE),
            -200
        );
        // Unendorsed fast success: earn the fee.
        assert_eq!(reputation_delta(false, true, 100, 1_000, REASONABLE), 100);
        // Unendorsed slow success or any failure: nothing.
        assert_eq!(reputation_delta(false, true, 100, 15_000, REASONABLE), 0);
        assert_eq!(reputation_delta(false, false, 100, 1_000, REASONABLE), 0);
    }

    #[test]
    fn test_malformed_onion_attribution() {
        let ctx = RouteContext {
            route_len: 3,
            introduction_idx: None,
        };
        // Direct peer reported: its fault entirely.
        assert_eq!(
            interpret_failure(&ctx, 1, FailureCode::InvalidOnionKey),
            FailureInterpretation {
                penalty: Penalty::Node(1),
                terminal: false,
            }
        );
        // Deeper hop reported: only the reporting pair is blamed.
        assert_eq!(
            interpret_failure(&ctx, 2, FailureCode::InvalidOnionHmac),
            FailureInterpretation {
                penalty: Penalty::Pair(1, 2),
                terminal: false,
            }
        );
    }

    #[test]
    fn test_invalid_blinding_attribution() {
        // Final hop that is not an introduction node: terminal, node
        // penalized.
        let plain = RouteContext {
            route_len: 2,
            introduction_idx: None,
        };
        assert_eq!(
            interpret_failure(&plain, 2, FailureCode::InvalidOnionBlinding),
            FailureInterpretation {
                penalty: Penalty::Node(2),
                terminal: true,
            }
        );

        // Intermediate hop inside the blinded section: pair failure only.
        let blinded = RouteContext {
            route_len: 4,
            introduction_idx: Some(3),
        };
        assert_eq!(
            interpret_failure(&blinded, 3, FailureCode::InvalidOnionBlinding),
            FailureInterpretation {
                penalty: Penalty::Pair(3, 4),
                terminal: false,
            }
        );

        // Unexpected blinding error from a plain intermediate hop: penalize
        // the reporting node, non-terminally.
        let three_hop = RouteContext {
            route_len: 3,
            introduction_idx: None,
        };
        assert_eq!(
            interpret_failure(&three_hop, 2, FailureCode::InvalidOnionBlinding),
            FailureInterpretation {
                penalty: Penalty::Node(2),
                terminal: false,
            }
        );
    }

    #[test]
    fn test_mpp_timeout_not_penalized() {
        let ctx = RouteContext {
            route_len: 3,
            introduction_idx: None,
        };
        let result = interpret_failure(&ctx, 3, FailureCode::MppTimeout);
        assert_eq!(result.penalty, Penalty::None);
        assert!(!result.terminal);
    }

    #[test]
    fn test_policy_failure_attribution() {
        let ctx = RouteContext {
            route_len: 4,
            introduction_idx: None,
        };
        let result = interpret_failure(&ctx, 2, FailureCode::FeeInsufficient);
        assert_eq!(result.penalty, Penalty::Pair(2, 3));
        assert!(!result.terminal);
    }
}
