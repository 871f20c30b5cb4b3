use anyhow::bail;
use std::time::Duration;

/// Raw tuning parameters handed to the engine's `configure`. The fields mirror the knobs
///  every ARQ implementation of this family exposes; the adapter never interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileParams {
    pub nodelay: bool,
    pub interval: Duration,
    pub fast_resend: u32,
    pub congestion_control: bool,
}

/// Operating profile of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqProfile {
    /// Throughput-friendly defaults: 40ms maintenance interval, no fast retransmit,
    ///  congestion control enabled.
    Normal,
    /// Latency-optimized: nodelay, 10ms interval, fast retransmit after 2 duplicate acks,
    ///  congestion control disabled.
    LowLatency,
    Custom(ProfileParams),
}

impl ArqProfile {
    pub fn params(&self) -> ProfileParams {
        match self {
            ArqProfile::Normal => ProfileParams {
                nodelay: false,
                interval: Duration::from_millis(40),
                fast_resend: 0,
                congestion_control: true,
            },
            ArqProfile::LowLatency => ProfileParams {
                nodelay: true,
                interval: Duration::from_millis(10),
                fast_resend: 2,
                congestion_control: false,
            },
            ArqProfile::Custom(params) => *params,
        }
    }
}

/// Per-channel configuration, fixed at bind time.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub profile: ArqProfile,

    /// `send` is refused (would-block) while the engine reports more unacknowledged units
    ///  than this.
    pub admission_ceiling: usize,

    /// A blocked writer is released only once the unacknowledged count has dropped to this
    ///  value or below. Must be strictly below `admission_ceiling`: the gap between the two
    ///  is the hysteresis band that keeps a session hovering near the ceiling from flapping
    ///  between refusal and release on every acknowledgment.
    pub release_floor: usize,

    /// Send / receive window sizes passed to the engine, in protocol units.
    pub send_window: u32,
    pub recv_window: u32,

    /// Size of the buffer the input path drains raw datagrams into. One datagram must fit.
    pub recv_buf_len: usize,
}

impl ChannelConfig {
    pub fn new(profile: ArqProfile) -> ChannelConfig {
        ChannelConfig {
            profile,
            admission_ceiling: 100,
            release_floor: 25,
            send_window: 256,
            recv_window: 256,
            recv_buf_len: 64 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.release_floor >= self.admission_ceiling {
            bail!(
                "release floor {} must be below the admission ceiling {}",
                self.release_floor,
                self.admission_ceiling
            );
        }
        if self.send_window == 0 || self.recv_window == 0 {
            bail!("window sizes must be non-zero");
        }
        if self.recv_buf_len == 0 {
            bail!("receive buffer must be non-empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::defaults(ChannelConfig::new(ArqProfile::Normal), true)]
    #[case::floor_equals_ceiling(
        ChannelConfig { admission_ceiling: 25, release_floor: 25, ..ChannelConfig::new(ArqProfile::Normal) },
        false
    )]
    #[case::floor_above_ceiling(
        ChannelConfig { admission_ceiling: 10, release_floor: 90, ..ChannelConfig::new(ArqProfile::Normal) },
        false
    )]
    #[case::zero_send_window(
        ChannelConfig { send_window: 0, ..ChannelConfig::new(ArqProfile::Normal) },
        false
    )]
    #[case::zero_recv_buf(
        ChannelConfig { recv_buf_len: 0, ..ChannelConfig::new(ArqProfile::LowLatency) },
        false
    )]
    fn test_validate(#[case] config: ChannelConfig, #[case] expect_ok: bool) {
        assert_eq!(config.validate().is_ok(), expect_ok);
    }

    #[test]
    fn test_profile_params() {
        let normal = ArqProfile::Normal.params();
        assert!(!normal.nodelay);
        assert_eq!(normal.interval, Duration::from_millis(40));
        assert!(normal.congestion_control);

        let low_latency = ArqProfile::LowLatency.params();
        assert!(low_latency.nodelay);
        assert_eq!(low_latency.fast_resend, 2);
        assert!(!low_latency.congestion_control);

        let custom = ProfileParams {
            nodelay: true,
            interval: Duration::from_millis(5),
            fast_resend: 1,
            congestion_control: true,
        };
        assert_eq!(ArqProfile::Custom(custom).params(), custom);
    }
}
