//! Configuration for the protocol engine and connection lifecycle

use crate::protocol::constants;

/// Latency/throughput trade-off knobs for the retransmission machinery.
#[derive(Debug, Clone)]
pub struct DelayConfig {
    /// No-delay mode: aggressive RTO floor and gentler backoff
    pub nodelay: bool,
    /// Internal update interval in milliseconds
    pub interval: u32,
    /// Fast-retransmit trigger: duplicate-ack count before resending (0 = off)
    pub resend: u32,
    /// Disable congestion control (flow control only)
    pub no_congestion_control: bool,
}

impl DelayConfig {
    /// Normal mode - balanced latency and reliability
    pub fn normal() -> Self {
        Self {
            nodelay: false,
            interval: 10,
            resend: 2,
            no_congestion_control: false,
        }
    }

    /// Fast mode - optimized for low latency
    pub fn fast() -> Self {
        Self {
            nodelay: true,
            interval: 8,
            resend: 2,
            no_congestion_control: false,
        }
    }

    /// Turbo mode - maximum responsiveness, congestion control off
    pub fn turbo() -> Self {
        Self {
            nodelay: true,
            interval: 4,
            resend: 1,
            no_congestion_control: true,
        }
    }

    /// Gaming mode - ultra-low jitter for real-time state updates
    pub fn gaming() -> Self {
        Self {
            nodelay: true,
            interval: 3,
            resend: 1,
            no_congestion_control: true,
        }
    }

    /// Custom configuration
    pub fn custom(nodelay: bool, interval: u32, resend: u32, no_congestion_control: bool) -> Self {
        Self {
            nodelay,
            interval,
            resend,
            no_congestion_control,
        }
    }
}

/// Protocol-only configuration for the ARQ engine and peer lifecycle.
///
/// Contains only what the sync core reads; no transport or I/O settings.
/// Validation happens at the runtime layer's public surface; the core
/// trusts the values it is given.
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Maximum transmission unit (header included)
    pub mtu: u32,
    /// Send window size in segments
    pub snd_wnd: u32,
    /// Receive window size in segments
    pub rcv_wnd: u32,
    /// Cap on queued-plus-inflight segments before `send` reports WouldBlock
    pub send_backlog: u32,
    /// Lower RTO clamp in milliseconds
    pub rto_min: u32,
    /// Upper RTO clamp in milliseconds
    pub rto_max: u32,
    /// Per-segment retransmission budget before the link is declared dead
    pub max_retries: u32,
    /// Delay before the first zero-window probe, in milliseconds
    pub probe_init_ms: u32,
    /// Latency mode
    pub delay: DelayConfig,

    /// Give up on `Connecting` after this long
    pub handshake_timeout_ms: u32,
    /// Declare the connection dead after this long without valid input
    pub idle_timeout_ms: u32,
    /// Keepalive ping cadence while connected
    pub ping_interval_ms: u32,
    /// How long `Disconnecting` waits for the goodbye to be acked
    pub close_grace_ms: u32,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            mtu: constants::MTU_DEF,
            snd_wnd: constants::WND_SND,
            rcv_wnd: constants::WND_RCV,
            send_backlog: constants::WND_SND * 4,
            rto_min: constants::RTO_MIN,
            rto_max: constants::RTO_MAX,
            max_retries: constants::DEADLINK,
            probe_init_ms: constants::PROBE_INIT,
            delay: DelayConfig::normal(),
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 10_000,
            ping_interval_ms: 1_000,
            close_grace_ms: 1_000,
        }
    }
}

impl ArqConfig {
    /// Maximum segment payload size
    pub fn mss(&self) -> u32 {
        self.mtu.saturating_sub(constants::OVERHEAD)
    }

    /// Largest reliable message the fragmenter will accept
    pub fn max_message_size(&self) -> usize {
        let max_fragments = constants::MAX_FRAGMENTS.min(self.rcv_wnd);
        (self.mss() * max_fragments) as usize
    }
}
