use std::fmt;

pub const BROADCAST_CHANNEL_ID: ChannelId = ChannelId(0xffff_ffff);
const RESERVED_CHANNEL_ID: ChannelId = ChannelId(0);
const MAX_CHANNEL_ID: ChannelId = ChannelId(BROADCAST_CHANNEL_ID.0 - 1);
const MIN_CHANNEL_ID: ChannelId = ChannelId(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub fn checked_add(self, number: u32) -> Option<ChannelId> {
        self.0.checked_add(number).and_then(|id| {
            // Do not overflow into the broadcast channel.
            if id == BROADCAST_CHANNEL_ID.0 {
                None
            } else {
                Some(ChannelId(id))
            }
        })
    }

    pub fn is_broadcast(self) -> bool {
        self == BROADCAST_CHANNEL_ID
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Hands out channel identifiers in increasing order, never reusing one.
#[derive(Debug)]
pub struct Channels {
    next_allocation: Option<ChannelId>,
}

impl Channels {
    pub fn new() -> Channels {
        Channels {
            next_allocation: Some(MIN_CHANNEL_ID),
        }
    }

    /// Returns `None` once the identifier space is exhausted.
    pub fn allocate(&mut self) -> Option<ChannelId> {
        let allocation = self.next_allocation?;
        self.next_allocation = allocation.checked_add(1);
        Some(allocation)
    }

    pub fn is_allocated(&self, channel_id: ChannelId) -> bool {
        if channel_id == RESERVED_CHANNEL_ID || channel_id > MAX_CHANNEL_ID {
            return false;
        }
        match self.next_allocation {
            Some(next) => channel_id < next,
            None => true,
        }
    }
}
