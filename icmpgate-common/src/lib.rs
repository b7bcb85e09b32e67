#![cfg_attr(not(test), no_std)]

//! Shared core of icmpgate: wire constants, the bounds-checked header
//! parser, the pass/drop engine, and the event type the TC hook hands to
//! userspace via a RingBuf.
//!
//! Everything compiles without std so the same definitions are usable from
//! the bpfel-unknown-none program and from the daemon. The `user` feature
//! adds serde and aya integration for the userspace side.

pub mod engine;
pub mod parse;

pub use engine::{DiagnosticRecord, FilterEngine, Verdict};
pub use parse::{parse, IcmpHeader, Ipv4Header, ParseOutcome};

/// IPv4 protocol number carried by ICMP datagrams.
pub const IPPROTO_ICMP: u8 = 1;

/// Size of the base IPv4 header, options excluded.
pub const IPV4_MIN_HDR_LEN: usize = 20;

/// Bytes of the ICMP header the filter reads: type, code, checksum.
pub const ICMP_MIN_LEN: usize = 4;

/// ICMP type of an echo request.
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// Snapshot capacity for one [`VerdictEvent`]: a maximal IPv4 header
/// (15 words = 60 bytes) plus [`ICMP_MIN_LEN`], so any classifiable prefix
/// fits whole.
pub const SNAP_LEN: usize = 64;

/// Header snapshot passed from the TC hook to userspace via a RingBuf.
///
/// Kept intentionally small: eBPF has a 512-byte stack limit and the
/// verifier is strict about memory access. Only inbound ICMP datagrams are
/// reported; the hook stays silent for everything else so the ring is not
/// swamped by bulk traffic.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VerdictEvent {
    /// Total length declared by the IPv4 header, host byte order.
    pub pkt_len: u32,
    /// Number of valid bytes in `hdr`.
    pub cap_len: u32,
    /// First `cap_len` bytes of the network-layer datagram.
    pub hdr: [u8; SNAP_LEN],
}

impl VerdictEvent {
    /// The captured datagram prefix, clamped to what was actually copied.
    pub fn snapshot(&self) -> &[u8] {
        let cap = (self.cap_len as usize).min(SNAP_LEN);
        &self.hdr[..cap]
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for VerdictEvent {}
