//! The pass/drop engine: one fixed classification rule and a running drop
//! counter.
//!
//! The engine is deliberately free of I/O. It renders a verdict plus a
//! [`DiagnosticRecord`] and leaves logging, storage, and packet disposal to
//! the caller, so the same engine runs under any traffic pipeline.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::parse::{parse, ParseOutcome};
use crate::ICMP_ECHO_REQUEST;

/// Filtering decision for one datagram. Terminal per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub enum Verdict {
    /// Forward the datagram unmodified.
    Pass,
    /// Discard the datagram.
    Drop,
}

impl Verdict {
    pub fn is_drop(&self) -> bool {
        matches!(self, Verdict::Drop)
    }
}

/// Reason attached to datagrams the parser could not line up with a full
/// ICMP header.
pub const REASON_INSUFFICIENT_DATA: &str = "insufficient data";
/// Reason attached to non-ICMP datagrams.
pub const REASON_NOT_APPLICABLE: &str = "not applicable";
/// Reason attached to dropped echo requests.
pub const REASON_ECHO_DROPPED: &str = "echo request dropped";
/// Reason attached to ICMP datagrams of any other type.
pub const REASON_NOT_ECHO: &str = "control message, not echo request";

/// Per-decision record handed to the caller's logging/telemetry side.
///
/// `packet_len` is the length of the buffer that was inspected; a caller
/// that knows the full wire length of the original datagram (the inspected
/// buffer may be a capture prefix) should report that figure instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct DiagnosticRecord {
    pub verdict: Verdict,
    pub packet_len: usize,
    pub reason: &'static str,
}

/// Applies the one filtering rule -- inbound ICMP echo requests are dropped,
/// everything else passes -- and owns the session drop counter.
///
/// `inspect` takes `&self` and is safe to call from any number of threads at
/// once; the counter increment is atomic, so N concurrent Drop verdicts
/// always advance the count by exactly N. The counter starts at zero when
/// the engine is constructed and is never reset for the lifetime of the
/// instance; tearing the session down is reading a final
/// [`snapshot_count`](FilterEngine::snapshot_count) and dropping the engine.
pub struct FilterEngine {
    dropped: AtomicU64,
}

impl FilterEngine {
    pub fn new() -> Self {
        Self {
            dropped: AtomicU64::new(0),
        }
    }

    /// Classify one datagram and render the verdict.
    ///
    /// Malformed or truncated input is never penalized: anything the parser
    /// cannot fully line up passes through, because dropping on ambiguous
    /// data would discard legitimate fragmented traffic. The counter
    /// increment on Drop is the only side effect.
    pub fn inspect(&self, buf: &[u8]) -> (Verdict, DiagnosticRecord) {
        let (verdict, reason) = match parse(buf) {
            ParseOutcome::Incomplete => (Verdict::Pass, REASON_INSUFFICIENT_DATA),
            ParseOutcome::NotOfInterest => (Verdict::Pass, REASON_NOT_APPLICABLE),
            ParseOutcome::Parsed(_, icmp) => {
                if icmp.icmp_type == ICMP_ECHO_REQUEST {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    (Verdict::Drop, REASON_ECHO_DROPPED)
                } else {
                    (Verdict::Pass, REASON_NOT_ECHO)
                }
            }
        };

        (
            verdict,
            DiagnosticRecord {
                verdict,
                packet_len: buf.len(),
                reason,
            },
        )
    }

    /// Current drop total. Read-only; no intervening `inspect` means two
    /// snapshots agree.
    pub fn snapshot_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IPPROTO_ICMP;
    use std::sync::Arc;

    /// IPv4 datagram: 20-byte base header, given protocol, then `tail`.
    fn datagram(protocol: u8, tail: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        buf[9] = protocol;
        buf[12..16].copy_from_slice(&[198, 51, 100, 7]);
        buf[16..20].copy_from_slice(&[198, 51, 100, 9]);
        buf.extend_from_slice(tail);
        let total = buf.len() as u16;
        buf[2..4].copy_from_slice(&total.to_be_bytes());
        buf
    }

    fn echo_request() -> Vec<u8> {
        datagram(IPPROTO_ICMP, &[ICMP_ECHO_REQUEST, 0, 0, 0])
    }

    #[test]
    fn test_short_buffer_passes_without_counting() {
        let engine = FilterEngine::new();
        let (verdict, diag) = engine.inspect(&[0u8; 10]);
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(diag.reason, REASON_INSUFFICIENT_DATA);
        assert_eq!(diag.packet_len, 10);
        assert_eq!(engine.snapshot_count(), 0);
    }

    #[test]
    fn test_empty_buffer_passes_without_counting() {
        let engine = FilterEngine::new();
        let (verdict, _) = engine.inspect(&[]);
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(engine.snapshot_count(), 0);
    }

    #[test]
    fn test_non_icmp_passes_regardless_of_payload() {
        let engine = FilterEngine::new();
        // TCP datagram whose payload happens to start with the echo type.
        let (verdict, diag) = engine.inspect(&datagram(6, &[ICMP_ECHO_REQUEST, 0, 0, 0]));
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(diag.reason, REASON_NOT_APPLICABLE);
        assert_eq!(engine.snapshot_count(), 0);
    }

    #[test]
    fn test_truncated_icmp_passes_without_counting() {
        let engine = FilterEngine::new();
        // 22 bytes total: two short of holding the ICMP fields.
        let (verdict, diag) = engine.inspect(&datagram(IPPROTO_ICMP, &[ICMP_ECHO_REQUEST, 0]));
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(diag.reason, REASON_INSUFFICIENT_DATA);
        assert_eq!(engine.snapshot_count(), 0);
    }

    #[test]
    fn test_echo_request_drops_and_counts() {
        let engine = FilterEngine::new();
        let buf = echo_request();
        let (verdict, diag) = engine.inspect(&buf);
        assert_eq!(verdict, Verdict::Drop);
        assert!(verdict.is_drop());
        assert_eq!(diag.reason, REASON_ECHO_DROPPED);
        assert_eq!(diag.packet_len, buf.len());
        assert_eq!(engine.snapshot_count(), 1);
    }

    #[test]
    fn test_other_icmp_types_pass() {
        let engine = FilterEngine::new();
        // Echo reply (0) and destination unreachable (3).
        for icmp_type in [0u8, 3] {
            let (verdict, diag) = engine.inspect(&datagram(IPPROTO_ICMP, &[icmp_type, 0, 0, 0]));
            assert_eq!(verdict, Verdict::Pass);
            assert_eq!(diag.reason, REASON_NOT_ECHO);
        }
        assert_eq!(engine.snapshot_count(), 0);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let engine = FilterEngine::new();
        engine.inspect(&echo_request());
        assert_eq!(engine.snapshot_count(), engine.snapshot_count());
        assert_eq!(engine.snapshot_count(), 1);
    }

    #[test]
    fn test_counter_accumulates_across_calls() {
        let engine = FilterEngine::new();
        for _ in 0..5 {
            engine.inspect(&echo_request());
        }
        // Interleave decisions that must not count.
        engine.inspect(&datagram(6, &[]));
        engine.inspect(&[0u8; 3]);
        assert_eq!(engine.snapshot_count(), 5);
    }

    #[test]
    fn test_concurrent_drops_never_lose_increments() {
        let engine = Arc::new(FilterEngine::new());
        let threads: u64 = 8;
        let per_thread: u64 = 250;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    let buf = echo_request();
                    for _ in 0..per_thread {
                        let (verdict, _) = engine.inspect(&buf);
                        assert_eq!(verdict, Verdict::Drop);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.snapshot_count(), threads * per_thread);
    }

    #[test]
    fn test_fresh_engine_starts_at_zero() {
        let engine = FilterEngine::new();
        engine.inspect(&echo_request());
        assert_eq!(engine.snapshot_count(), 1);
        drop(engine);

        // A new session never inherits the previous total.
        let engine = FilterEngine::default();
        assert_eq!(engine.snapshot_count(), 0);
    }
}
