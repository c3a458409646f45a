//! Flow to lookup-table slot hashing.

use l4lb_common::FiveTuple;
use log::debug;
use network_types::ip::IpProto;

use crate::error::{Error, Result};

const FLOW_SEED: u32 = 0x666c_6f77;

/// Hashes the full 5-tuple, in its canonical network-order encoding, into a
/// lookup-table slot. Directions are not folded together: the reply
/// direction of a connection is a different flow.
#[derive(Debug, Clone, Copy)]
pub struct FlowHasher {
    seed: u32,
}

impl FlowHasher {
    pub const fn new(seed: u32) -> Self {
        FlowHasher { seed }
    }

    pub fn hash(&self, flow: &FiveTuple) -> u32 {
        mur3::murmurhash3_x86_32(&flow.to_be_bytes(), self.seed)
    }

    /// Slot in `[0, table_size)`. `table_size` must be non-zero.
    pub fn slot(&self, flow: &FiveTuple, table_size: usize) -> usize {
        self.hash(flow) as usize % table_size
    }
}

impl Default for FlowHasher {
    fn default() -> Self {
        FlowHasher::new(FLOW_SEED)
    }
}

/// Check a key before it reaches a table. Anything but TCP or UDP is
/// unroutable. Zero addresses or ports mean the upstream parser produced a
/// bad key; those are logged and rejected.
pub fn validate(flow: &FiveTuple) -> Result<()> {
    if !matches!(flow.proto, IpProto::Tcp | IpProto::Udp) {
        return Err(Error::UnroutableFlow);
    }
    let reason = if flow.source_addr == 0 {
        "unspecified source address"
    } else if flow.dst_addr == 0 {
        "unspecified destination address"
    } else if flow.source_port == 0 {
        "zero source port"
    } else if flow.dst_port == 0 {
        "zero destination port"
    } else {
        return Ok(());
    };
    debug!("passing through malformed flow key {:?}: {}", flow, reason);
    Err(Error::MalformedFlowKey(reason))
}
