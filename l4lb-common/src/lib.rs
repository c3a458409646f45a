#![cfg_attr(not(test), no_std)]

use core::hash::{Hash, Hasher};

use network_types::ip::IpProto;

/// Length of the canonical flow encoding produced by [`FiveTuple::to_be_bytes`].
pub const FIVE_TUPLE_LEN: usize = 13;

// This is a 5tuple struct for IPv4 which is used to identify a flow.
// Addresses and ports are kept in host order, as they come out of `from_be`
// in the packet parser.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct FiveTuple {
    pub source_addr: u32,
    pub source_port: u16,
    pub dst_addr: u32,
    pub dst_port: u16,
    pub proto: IpProto,
}

impl FiveTuple {
    pub fn new(
        source_addr: u32,
        source_port: u16,
        dst_addr: u32,
        dst_port: u16,
        proto: IpProto,
    ) -> Self {
        FiveTuple {
            source_addr,
            source_port,
            dst_addr,
            dst_port,
            proto,
        }
    }

    /// Canonical network-order encoding of the flow.
    ///
    /// Everything that hashes a flow goes through this encoding so the result
    /// never depends on struct layout or host endianness.
    pub fn to_be_bytes(&self) -> [u8; FIVE_TUPLE_LEN] {
        let mut out = [0u8; FIVE_TUPLE_LEN];
        out[0..4].copy_from_slice(&self.source_addr.to_be_bytes());
        out[4..6].copy_from_slice(&self.source_port.to_be_bytes());
        out[6..10].copy_from_slice(&self.dst_addr.to_be_bytes());
        out[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        out[12] = self.proto as u8;
        out
    }

    /// The virtual service this flow is addressed to.
    pub fn vip(&self) -> VipKey {
        VipKey {
            addr: self.dst_addr,
            port: self.dst_port,
            proto: self.proto,
        }
    }
}

impl PartialEq for FiveTuple {
    fn eq(&self, other: &Self) -> bool {
        self.to_be_bytes() == other.to_be_bytes()
    }
}

impl Eq for FiveTuple {}

impl Hash for FiveTuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_be_bytes().hash(state);
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct VipKey {
    pub addr: u32,
    pub port: u16,
    pub proto: IpProto,
}

impl VipKey {
    pub fn new(addr: u32, port: u16, proto: IpProto) -> Self {
        VipKey { addr, port, proto }
    }

    fn key(&self) -> (u32, u16, u8) {
        (self.addr, self.port, self.proto as u8)
    }
}

impl PartialEq for VipKey {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for VipKey {}

impl Hash for VipKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
