use clap_serde_derive::{
    clap::{self},
    ClapSerde,
};
use std::path::PathBuf;

/// Default dust threshold for an HTLC, in millisatoshis. An HTLC below this
/// value is carried only in the commitment's off-chain balance.
pub const DEFAULT_DUST_THRESHOLD_MSAT: u64 = 354_000;

/// How long a packet may sit undelivered in a mailbox after the link becomes
/// eligible before it is failed upward, in milliseconds. [default: 1 hour]
pub const DEFAULT_MAILBOX_DELIVERY_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// The resolution time under which a forwarded HTLC is considered fast for
/// reputation purposes, in milliseconds. [default: 10 seconds]
pub const DEFAULT_REASONABLE_RESOLUTION_MS: u64 = 10 * 1000;

/// Whether the experimental endorsement signal is propagated by default.
pub const DEFAULT_ENDORSEMENT_ENABLED: bool = true;

/// The interval between bulk flushes of the forwarding-event log, in
/// milliseconds.
#[cfg(not(test))]
pub const DEFAULT_FWD_EVENT_FLUSH_INTERVAL_MS: u64 = 15 * 1000;
#[cfg(test)]
// Tests need timely flushes to observe forwarding events.
pub const DEFAULT_FWD_EVENT_FLUSH_INTERVAL_MS: u64 = 50;

/// The interval between scans for mailbox packets that have exceeded the
/// delivery timeout, in milliseconds.
#[cfg(not(test))]
pub const DEFAULT_MAILBOX_EXPIRY_SCAN_INTERVAL_MS: u64 = 60 * 1000;
#[cfg(test)]
pub const DEFAULT_MAILBOX_EXPIRY_SCAN_INTERVAL_MS: u64 = 25;

#[derive(ClapSerde, Debug, Clone)]
pub struct SwitchConfig {
    /// base directory for the switch store [default: $BASE_DIR/switch]
    #[arg(
        name = "SWITCH_BASE_DIR",
        long = "switch-base-dir",
        env,
        help = "base directory for the switch store [default: $BASE_DIR/switch]"
    )]
    pub base_dir: Option<PathBuf>,

    /// wire message types below the custom range that should nevertheless be
    /// treated as custom records (separated by `,`)
    #[arg(name = "SWITCH_CUSTOM_MESSAGE_OVERRIDES", long = "switch-custom-message-overrides", env, value_parser, num_args = 0.., value_delimiter = ',')]
    pub custom_message_overrides: Vec<u64>,

    /// feature bits advertised for custom protocol extensions (separated by `,`)
    #[arg(name = "SWITCH_CUSTOM_FEATURE_BITS", long = "switch-custom-feature-bits", env, value_parser, num_args = 0.., value_delimiter = ',')]
    pub custom_feature_bits: Vec<u16>,

    /// dust threshold for HTLCs, unit: millisatoshis [default: 354000]
    #[arg(
        name = "SWITCH_DUST_THRESHOLD_MSAT",
        long = "switch-dust-threshold-msat",
        env,
        help = "dust threshold for HTLCs, unit: millisatoshis [default: 354000]"
    )]
    pub dust_threshold_msat: Option<u64>,

    /// how long a packet may sit undelivered in a mailbox before it is failed
    /// upward, in milliseconds [default: 3600000 (1 hour)]
    #[arg(
        name = "SWITCH_MAILBOX_DELIVERY_TIMEOUT_MS",
        long = "switch-mailbox-delivery-timeout-ms",
        env,
        help = "mailbox delivery timeout, in milliseconds [default: 3600000 (1 hour)]"
    )]
    pub mailbox_delivery_timeout_ms: Option<u64>,

    /// whether to propagate the experimental endorsement signal [default: true]
    #[arg(
        name = "SWITCH_ENDORSEMENT_ENABLED",
        long = "switch-endorsement-enabled",
        env,
        help = "whether to propagate the experimental endorsement signal [default: true]"
    )]
    pub endorsement_enabled: Option<bool>,

    /// resolution time under which a forwarded HTLC is considered fast for
    /// reputation purposes, in milliseconds [default: 10000 (10 seconds)]
    #[arg(
        name = "SWITCH_REASONABLE_RESOLUTION_MS",
        long = "switch-reasonable-resolution-ms",
        env,
        help = "reasonable HTLC resolution time, in milliseconds [default: 10000 (10 seconds)]"
    )]
    pub reasonable_resolution_ms: Option<u64>,
}

impl SwitchConfig {
    pub fn dust_threshold_msat(&self) -> u64 {
        self.dust_threshold_msat
            .unwrap_or(DEFAULT_DUST_THRESHOLD_MSAT)
    }

    pub fn mailbox_delivery_timeout_ms(&self) -> u64 {
        self.mailbox_delivery_timeout_ms
            .unwrap_or(DEFAULT_MAILBOX_DELIVERY_TIMEOUT_MS)
    }

    pub fn endorsement_enabled(&self) -> bool {
        self.endorsement_enabled
            .unwrap_or(DEFAULT_ENDORSEMENT_ENABLED)
    }

    pub fn reasonable_resolution_ms(&self) -> u64 {
        self.reasonable_resolution_ms
            .unwrap_or(DEFAULT_REASONABLE_RESOLUTION_MS)
    }
}
