use crate::packet::{ChannelId, MAX_CHANNELS, MAX_PAYLOAD};
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::time::Duration;

/// The largest number of packets a single message may be split into. This keeps a message's
///  packet id range well inside half the id space, so wrap-around comparisons stay unambiguous.
pub const MAX_PACKETS_PER_MESSAGE: usize = 32768;

pub struct RudpConfig {
    /// This is the number of packet buffers that are pre-allocated for the end point. It bounds
    ///  *all* memory for packets: outbound packets waiting to be sent, sent packets waiting for an
    ///  ack, and received packets waiting for reassembly or delivery to the application.
    ///
    /// Sending a message fails if there are not enough free buffers for all its packets, and
    ///  incoming packets are left in the socket's buffer while the pool is exhausted.
    pub packet_pool_size: usize,

    /// Peers are created on first contact and never removed, so this limits the number of distinct
    ///  addresses an end point can talk to in its lifetime.
    pub max_peers: usize,

    /// The maximum number of complete messages per peer that are waiting for delivery to the
    ///  application
    pub max_pending_messages_per_peer: usize,

    /// A packet sent with CONFIRM_DELIVERY is re-sent if no ack arrived within this interval
    pub ack_timeout: Duration,
    /// `None` re-sends indefinitely
    pub max_resend_attempts: Option<u32>,

    /// upper bound for the number of datagrams read from the socket in a single pump cycle
    pub listen_attempts: usize,

    /// applies to all channels without an entry in `specific_channel_configs`
    pub default_channel_config: ChannelConfig,
    pub specific_channel_configs: FxHashMap<ChannelId, ChannelConfig>,

    /// time `update()` sleeps between pump cycles that found nothing to do
    pub idle_poll_interval: Duration,

    pub max_message_size: usize,
}

impl Default for RudpConfig {
    fn default() -> RudpConfig {
        RudpConfig {
            packet_pool_size: 1024,
            max_peers: 256,
            max_pending_messages_per_peer: 1024,
            ack_timeout: Duration::from_millis(1000),
            max_resend_attempts: Some(30),
            listen_attempts: 256,
            default_channel_config: ChannelConfig {
                stale_message_timeout: Some(Duration::from_secs(60)),
            },
            specific_channel_configs: FxHashMap::default(),
            idle_poll_interval: Duration::from_millis(1),
            max_message_size: 1024*1024,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.packet_pool_size == 0 {
            bail!("packet pool size must be positive");
        }
        if self.packet_pool_size >= u32::MAX as usize {
            bail!("packet pool size {} is too big", self.packet_pool_size);
        }
        if self.max_peers == 0 || self.max_peers >= u32::MAX as usize {
            bail!("max peers must be between 1 and {}", u32::MAX - 1);
        }
        if self.max_pending_messages_per_peer == 0 || self.max_pending_messages_per_peer >= u32::MAX as usize {
            bail!("max pending messages per peer must be between 1 and {}", u32::MAX - 1);
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if self.listen_attempts == 0 {
            bail!("listen attempts must be positive");
        }
        if self.max_message_size > MAX_PACKETS_PER_MESSAGE * MAX_PAYLOAD {
            bail!("max message size {} exceeds the protocol limit of {}", self.max_message_size, MAX_PACKETS_PER_MESSAGE * MAX_PAYLOAD);
        }
        for channel_id in self.specific_channel_configs.keys() {
            if *channel_id as usize >= MAX_CHANNELS {
                bail!("channel config for invalid channel id {}", channel_id);
            }
        }

        let stale_timeouts = self.specific_channel_configs.values()
            .chain(Some(&self.default_channel_config))
            .filter_map(|c| c.stale_message_timeout);
        for stale_timeout in stale_timeouts {
            // a receiver must not discard acknowledged fragments while the sender may still re-send missing ones
            let Some(resend_horizon) = self.resend_horizon() else {
                bail!("stale message timeout {:?} requires a bounded number of resend attempts", stale_timeout);
            };
            if stale_timeout <= resend_horizon {
                bail!("stale message timeout {:?} must exceed ack timeout * max resend attempts ({:?})", stale_timeout, resend_horizon);
            }
        }

        Ok(())
    }

    /// the time after which a sender gives up on an unacknowledged packet, `None` if it never does
    pub fn resend_horizon(&self) -> Option<Duration> {
        self.ack_timeout.checked_mul(self.max_resend_attempts?.checked_add(1)?)
    }

    pub fn get_effective_channel_config(&self, channel_id: ChannelId) -> &ChannelConfig {
        self.specific_channel_configs.get(&channel_id)
            .unwrap_or(&self.default_channel_config)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Incomplete messages are discarded after this time, and messages waiting for a missing
    ///  predecessor stop waiting. `None` waits forever.
    ///
    /// NB: This must exceed the sender's [resend horizon](RudpConfig::resend_horizon), otherwise
    ///  fragments that were acknowledged already could be discarded.
    pub stale_message_timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        RudpConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::empty_pool(|c: &mut RudpConfig| c.packet_pool_size = 0)]
    #[case::no_peers(|c: &mut RudpConfig| c.max_peers = 0)]
    #[case::no_pending_messages(|c: &mut RudpConfig| c.max_pending_messages_per_peer = 0)]
    #[case::zero_ack_timeout(|c: &mut RudpConfig| c.ack_timeout = Duration::ZERO)]
    #[case::no_listen_attempts(|c: &mut RudpConfig| c.listen_attempts = 0)]
    #[case::message_too_big(|c: &mut RudpConfig| c.max_message_size = MAX_PACKETS_PER_MESSAGE * MAX_PAYLOAD + 1)]
    #[case::invalid_channel(|c: &mut RudpConfig| { c.specific_channel_configs.insert(255, ChannelConfig { stale_message_timeout: None }); })]
    #[case::stale_before_resends_end(|c: &mut RudpConfig| c.default_channel_config.stale_message_timeout = Some(Duration::from_secs(10)))]
    #[case::stale_equals_resend_horizon(|c: &mut RudpConfig| c.default_channel_config.stale_message_timeout = Some(Duration::from_secs(31)))]
    #[case::stale_with_unbounded_resends(|c: &mut RudpConfig| c.max_resend_attempts = None)]
    #[case::specific_stale_too_short(|c: &mut RudpConfig| { c.specific_channel_configs.insert(2, ChannelConfig { stale_message_timeout: Some(Duration::from_secs(5)) }); })]
    fn test_validate_rejects(#[case] modify: fn(&mut RudpConfig)) {
        let mut config = RudpConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::no_eviction(Some(30), None)]
    #[case::unbounded_resends_without_eviction(None, None)]
    #[case::just_after_resends_end(Some(3), Some(Duration::from_millis(4001)))]
    fn test_validate_accepts(#[case] max_resend_attempts: Option<u32>, #[case] stale_message_timeout: Option<Duration>) {
        let config = RudpConfig {
            ack_timeout: Duration::from_secs(1),
            max_resend_attempts,
            default_channel_config: ChannelConfig { stale_message_timeout },
            ..RudpConfig::default()
        };
        config.validate().unwrap();
    }

    #[rstest]
    #[case::default(RudpConfig::default(), Some(Duration::from_secs(31)))]
    #[case::unbounded(RudpConfig { max_resend_attempts: None, ..RudpConfig::default() }, None)]
    fn test_resend_horizon(#[case] config: RudpConfig, #[case] expected: Option<Duration>) {
        assert_eq!(config.resend_horizon(), expected);
    }

    #[test]
    fn test_effective_channel_config() {
        let mut config = RudpConfig::default();
        config.specific_channel_configs.insert(3, ChannelConfig { stale_message_timeout: None });

        assert_eq!(config.get_effective_channel_config(3).stale_message_timeout, None);
        assert_eq!(config.get_effective_channel_config(4).stale_message_timeout, Some(Duration::from_secs(60)));
    }
}
