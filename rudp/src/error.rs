use crate::packet::ChannelId;
use thiserror::Error;

/// Reasons why a message is not accepted for sending. None of them leaves partial state behind:
///  no packet was queued, and no packet id was used up.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("not enough free packet buffers for the message")]
    OutQueueFull,
    #[error("the peer table is full")]
    PeerTableFull,
    #[error("invalid channel id {0}")]
    InvalidChannel(ChannelId),
    #[error("message of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
}
