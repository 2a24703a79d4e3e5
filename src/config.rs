use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;
use crate::wire::FRAGMENT_HEADER_LEN;

pub struct RudpConfig {
    /// This is the payload size inside UDP packets that the transport assumes
    ///  deliverable without IP-level fragmentation. Discovery is unreliable in
    ///  practice (surprising network hardware on some routes), so the
    ///  application configures this rather than the transport guessing: with
    ///  full Ethernet frames and no optional IP headers it is
    ///  `1500 - 20 - 8 = 1472` for IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    ///
    /// Choosing this too big causes silently dropped packets (possibly only on
    ///  some routes); choosing it too small wastes bandwidth.
    pub mtu: usize,

    /// the number of buffers retained per pool size class - buffers returned
    ///  in excess of this are discarded
    pub buffer_pool_class_cap: usize,

    /// the largest single pool allocation; must cover the biggest reassembled
    ///  message any fragmenting channel can produce
    pub max_block_size: usize,

    pub default_channel_config: ChannelConfig,
    pub specific_channel_configs: FxHashMap<u8, ChannelConfig>,
}

impl RudpConfig {
    /// defaults for IPV4 with end-to-end full Ethernet MTU and no optional headers
    pub fn default_ipv4() -> RudpConfig {
        RudpConfig {
            mtu: 1472,
            buffer_pool_class_cap: 1024,
            max_block_size: 16 * 1024 * 1024,
            default_channel_config: ChannelConfig {
                reliability_window_size: 512,
                max_fragments: 512,
                retransmit_timeout: Duration::from_millis(200),
                max_retries: 10,
                assembly_timeout: Duration::from_secs(5),
                ack_mask_bytes: 4,
            },
            specific_channel_configs: FxHashMap::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 100 {
            bail!("MTU of {} is too small", self.mtu);
        }
        if self.max_block_size < self.mtu {
            bail!("maximum pool block size {} is smaller than the MTU {}", self.max_block_size, self.mtu);
        }

        for (channel_id, channel_config) in std::iter::once((None, &self.default_channel_config))
            .chain(self.specific_channel_configs.iter().map(|(id, c)| (Some(*id), c)))
        {
            let context = match channel_id {
                Some(id) => format!("channel {}", id),
                None => "default channel config".to_string(),
            };

            if channel_config.reliability_window_size == 0 || channel_config.reliability_window_size > 32768 {
                bail!("{}: reliability window size must be in 1..=32768", context);
            }
            if channel_config.ack_mask_bytes == 0 || channel_config.ack_mask_bytes > 8 {
                bail!("{}: ack mask must be 1..=8 bytes", context);
            }
            if channel_config.max_fragments == 0 {
                bail!("{}: maximum fragment count must be positive", context);
            }
            if channel_config.max_fragments > channel_config.reliability_window_size {
                bail!("{}: maximum fragment count must not exceed the reliability window - a single message's unacknowledged fragments would evict each other", context);
            }

            let max_assembled = channel_config.max_fragments * (self.mtu - FRAGMENT_HEADER_LEN);
            if max_assembled > self.max_block_size {
                bail!("{}: a fully fragmented message of {} bytes would exceed the maximum pool block size of {}",
                      context, max_assembled, self.max_block_size);
            }
        }

        Ok(())
    }

    pub fn get_effective_channel_config(&self, channel_id: u8) -> EffectiveChannelConfig {
        let raw = self.specific_channel_configs.get(&channel_id)
            .unwrap_or(&self.default_channel_config);

        EffectiveChannelConfig {
            mtu: self.mtu,
            reliability_window_size: raw.reliability_window_size,
            max_fragments: raw.max_fragments,
            retransmit_timeout: raw.retransmit_timeout,
            max_retries: raw.max_retries,
            assembly_timeout: raw.assembly_timeout,
            ack_mask_bytes: raw.ack_mask_bytes,
        }
    }
}

#[derive(Clone)]
pub struct ChannelConfig {
    /// the number of *messages* (not bytes) tracked per direction for dedup
    ///  and retransmission bookkeeping
    pub reliability_window_size: usize,

    pub max_fragments: usize,

    /// how long an unacknowledged reliable message waits before being resent
    pub retransmit_timeout: Duration,

    /// resend attempts before the channel reports a timeout upward
    pub max_retries: u16,

    /// partial fragment assemblies older than this are reclaimed
    pub assembly_timeout: Duration,

    /// width of the ack bitfield on the wire
    pub ack_mask_bytes: usize,
}

#[derive(Clone)]
pub struct EffectiveChannelConfig {
    pub mtu: usize,
    pub reliability_window_size: usize,
    pub max_fragments: usize,
    pub retransmit_timeout: Duration,
    pub max_retries: u16,
    pub assembly_timeout: Duration,
    pub ack_mask_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ipv4_is_valid() {
        assert!(RudpConfig::default_ipv4().validate().is_ok());
    }

    #[test]
    fn test_validate_mtu_too_small() {
        let mut config = RudpConfig::default_ipv4();
        config.mtu = 99;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ack_mask_bytes() {
        let mut config = RudpConfig::default_ipv4();
        config.default_channel_config.ack_mask_bytes = 9;
        assert!(config.validate().is_err());
        config.default_channel_config.ack_mask_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_specific_channel_config() {
        let mut config = RudpConfig::default_ipv4();
        let mut broken = config.default_channel_config.clone();
        broken.reliability_window_size = 0;
        config.specific_channel_configs.insert(3, broken);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_max_fragments_vs_window() {
        let mut config = RudpConfig::default_ipv4();
        config.default_channel_config.max_fragments = 513;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_assembly_exceeds_pool_block() {
        let mut config = RudpConfig::default_ipv4();
        config.max_block_size = 64 * 1024;
        config.default_channel_config.max_fragments = 65;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_config_resolution() {
        let mut config = RudpConfig::default_ipv4();
        let mut specific = config.default_channel_config.clone();
        specific.max_retries = 77;
        config.specific_channel_configs.insert(9, specific);

        assert_eq!(config.get_effective_channel_config(9).max_retries, 77);
        assert_eq!(config.get_effective_channel_config(1).max_retries,
                   config.default_channel_config.max_retries);
        assert_eq!(config.get_effective_channel_config(1).mtu, config.mtu);
    }
}
