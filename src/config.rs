//! Configuration for the async transport.
//!
//! [`TetherConfig`] extends the core [`ArqConfig`] with runtime settings:
//! connect timeout, keepalive cadence, listener capacity. Built with chained
//! setters, checked once with [`TetherConfig::validate`] before any socket
//! is touched.

use crate::error::{Result, TetherError};
use std::net::SocketAddr;
use std::time::Duration;

// Re-export from tether-core so users see a single DelayConfig type.
pub use tether_core::config::DelayConfig;
use tether_core::ArqConfig;

// ── TetherConfig ────────────────────────────────────────────────────────

/// Full configuration: protocol tuning plus transport and runtime settings.
#[derive(Debug, Clone)]
pub struct TetherConfig {
    // Protocol settings (forwarded to the core engine)
    pub mtu: u32,
    pub snd_wnd: u32,
    pub rcv_wnd: u32,
    pub send_backlog: u32,
    pub delay: DelayConfig,
    pub rto_min: u32,
    pub rto_max: u32,
    pub max_retries: u32,
    pub probe_init_ms: u32,

    // Connection lifecycle
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub close_grace: Duration,

    // Listener settings
    pub max_connections: usize,
    pub cleanup_interval: Duration,
}

impl Default for TetherConfig {
    fn default() -> Self {
        let core = ArqConfig::default();
        Self {
            mtu: core.mtu,
            snd_wnd: core.snd_wnd,
            rcv_wnd: core.rcv_wnd,
            send_backlog: core.send_backlog,
            delay: core.delay,
            rto_min: core.rto_min,
            rto_max: core.rto_max,
            max_retries: core.max_retries,
            probe_init_ms: core.probe_init_ms,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(1),
            close_grace: Duration::from_secs(1),
            max_connections: 1024,
            cleanup_interval: Duration::from_secs(5),
        }
    }
}

/// Extracts the protocol fields the core engine reads.
impl From<TetherConfig> for ArqConfig {
    fn from(c: TetherConfig) -> Self {
        Self {
            mtu: c.mtu,
            snd_wnd: c.snd_wnd,
            rcv_wnd: c.rcv_wnd,
            send_backlog: c.send_backlog,
            rto_min: c.rto_min,
            rto_max: c.rto_max,
            max_retries: c.max_retries,
            probe_init_ms: c.probe_init_ms,
            delay: c.delay,
            handshake_timeout_ms: c.connect_timeout.as_millis() as u32,
            idle_timeout_ms: c.idle_timeout.as_millis() as u32,
            ping_interval_ms: c.ping_interval.as_millis() as u32,
            close_grace_ms: c.close_grace.as_millis() as u32,
        }
    }
}

// ── Builder methods ─────────────────────────────────────────────────────

impl TetherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Protocol tuning --

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn send_window(mut self, wnd: u32) -> Self {
        self.snd_wnd = wnd;
        self
    }

    pub fn recv_window(mut self, wnd: u32) -> Self {
        self.rcv_wnd = wnd;
        self
    }

    pub fn window_size(mut self, snd_wnd: u32, rcv_wnd: u32) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn send_backlog(mut self, backlog: u32) -> Self {
        self.send_backlog = backlog;
        self
    }

    pub fn normal_mode(mut self) -> Self {
        self.delay = DelayConfig::normal();
        self
    }

    pub fn fast_mode(mut self) -> Self {
        self.delay = DelayConfig::fast();
        self
    }

    pub fn turbo_mode(mut self) -> Self {
        self.delay = DelayConfig::turbo();
        self
    }

    pub fn delay_config(mut self, config: DelayConfig) -> Self {
        self.delay = config;
        self
    }

    pub fn rto_bounds(mut self, min_ms: u32, max_ms: u32) -> Self {
        self.rto_min = min_ms;
        self.rto_max = max_ms;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn probe_delay(mut self, ms: u32) -> Self {
        self.probe_init_ms = ms;
        self
    }

    // -- Lifecycle tuning --

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    // -- Listener tuning --

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    // -- Validation --

    pub fn validate(&self) -> Result<()> {
        if self.mtu < 64 || self.mtu > 65500 {
            return Err(TetherError::config("MTU must be between 64 and 65500"));
        }
        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            return Err(TetherError::config("Window sizes must be greater than 0"));
        }
        if self.send_backlog < self.snd_wnd {
            return Err(TetherError::config(
                "Send backlog must be at least the send window",
            ));
        }
        if self.delay.interval == 0 {
            return Err(TetherError::config("Update interval must be greater than 0"));
        }
        if self.rto_min == 0 || self.rto_min > self.rto_max {
            return Err(TetherError::config(
                "RTO bounds must satisfy 0 < min <= max",
            ));
        }
        if self.max_retries == 0 {
            return Err(TetherError::config("Max retries must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(TetherError::config("Max connections must be greater than 0"));
        }
        Ok(())
    }

    // -- Convenience connect/listen --

    pub async fn connect<A: Into<SocketAddr>>(
        self,
        addr: A,
    ) -> Result<crate::stream::TetherStream<crate::transport::UdpTransport>> {
        crate::stream::TetherStream::connect(addr.into(), self).await
    }

    pub async fn listen<A: Into<SocketAddr>>(
        self,
        addr: A,
    ) -> Result<crate::listener::TetherListener<crate::transport::UdpTransport>> {
        crate::listener::TetherListener::bind(addr.into(), self).await
    }
}

// ── Presets ──────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Low-latency action games: aggressive retransmission, small packets,
    /// fast failure detection.
    pub fn gaming() -> Self {
        Self::default()
            .delay_config(DelayConfig::gaming())
            .window_size(64, 128)
            .mtu(1200)
            .rto_bounds(30, 10_000)
            .connect_timeout(Duration::from_secs(3))
            .idle_timeout(Duration::from_secs(5))
            .ping_interval(Duration::from_millis(500))
    }

    /// Bulk transfer: wide windows, patient timeouts.
    pub fn file_transfer() -> Self {
        Self::default()
            .normal_mode()
            .window_size(256, 256)
            .send_backlog(1024)
            .connect_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(60))
            .ping_interval(Duration::from_secs(5))
    }

    /// Interactive sessions that favor latency but keep congestion control.
    pub fn realtime() -> Self {
        Self::default()
            .fast_mode()
            .window_size(64, 64)
            .mtu(1200)
            .connect_timeout(Duration::from_secs(3))
            .idle_timeout(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TetherConfig::default().validate().is_ok());
        assert!(TetherConfig::gaming().validate().is_ok());
        assert!(TetherConfig::file_transfer().validate().is_ok());
        assert!(TetherConfig::realtime().validate().is_ok());
    }

    #[test]
    fn validate_rejects_nonsense() {
        assert!(TetherConfig::new().mtu(10).validate().is_err());
        assert!(TetherConfig::new().window_size(0, 64).validate().is_err());
        assert!(TetherConfig::new().rto_bounds(500, 100).validate().is_err());
        assert!(TetherConfig::new().max_retries(0).validate().is_err());
        assert!(TetherConfig::new().send_backlog(1).validate().is_err());
    }

    #[test]
    fn core_config_carries_protocol_fields() {
        let cfg = TetherConfig::gaming().probe_delay(2000);
        let core: ArqConfig = cfg.clone().into();
        assert_eq!(core.mtu, cfg.mtu);
        assert_eq!(core.snd_wnd, cfg.snd_wnd);
        assert_eq!(core.probe_init_ms, 2000);
        assert!(core.delay.nodelay);
        assert_eq!(core.idle_timeout_ms, 5_000);
    }
}
