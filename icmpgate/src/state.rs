use dashmap::DashMap;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::time::Instant;

use icmpgate_common::{parse, DiagnosticRecord, ParseOutcome, VerdictEvent};

/// One dropped datagram, as logged, stored, and served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct DropRecord {
    pub timestamp: i64,
    pub src_ip: String,
    pub dst_ip: String,
    pub icmp_type: u8,
    /// Wire length of the datagram (IP total length), not the snapshot size.
    pub length: usize,
    pub reason: String,
    pub src_hostname: Option<String>,
}

impl DropRecord {
    /// Build the telemetry record for a decided event.
    ///
    /// The timestamp is assigned here in userspace. Returns `None` when the
    /// snapshot does not parse to an ICMP datagram; the poller skips such
    /// events instead of recording fields it cannot trust.
    pub fn from_event(event: &VerdictEvent, diag: &DiagnosticRecord) -> Option<Self> {
        match parse(event.snapshot()) {
            ParseOutcome::Parsed(ip, icmp) => Some(Self {
                timestamp: chrono::Utc::now().timestamp_millis(),
                src_ip: ip.src.to_string(),
                dst_ip: ip.dst.to_string(),
                icmp_type: icmp.icmp_type,
                length: event.pkt_len as usize,
                reason: diag.reason.to_string(),
                src_hostname: None,
            }),
            _ => None,
        }
    }
}

/// Live stats for one source address with dropped traffic.
#[derive(Debug, Serialize, Clone)]
pub struct SourceStats {
    pub drops: u64,
    pub last_icmp_type: u8,
    pub hostname: Option<String>,
    #[serde(skip)]
    pub last_seen: Instant,
}

/// Shared in-memory view of the filtering session.
///
/// The authoritative drop total lives in the engine; this tracks the
/// surrounding telemetry -- how many events were inspected, how many passed,
/// and which sources are currently getting dropped.
pub struct FilterState {
    pub offenders: DashMap<Ipv4Addr, SourceStats>,
    pub inspected_total: AtomicU64,
    pub passed_total: AtomicU64,
    pub tracked_sources: AtomicUsize,
}

impl FilterState {
    pub fn new() -> Self {
        Self {
            offenders: DashMap::new(),
            inspected_total: AtomicU64::new(0),
            passed_total: AtomicU64::new(0),
            tracked_sources: AtomicUsize::new(0),
        }
    }

    /// Record a pass decision. Passed sources are counted, not tracked.
    pub fn note_pass(&self) {
        self.inspected_total.fetch_add(1, Ordering::Relaxed);
        self.passed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a drop decision for `record`'s source address.
    pub fn note_drop(&self, src: Ipv4Addr, record: &DropRecord) {
        self.inspected_total.fetch_add(1, Ordering::Relaxed);

        self.offenders
            .entry(src)
            .and_modify(|stats| {
                stats.drops += 1;
                stats.last_icmp_type = record.icmp_type;
                stats.last_seen = Instant::now();
                if stats.hostname.is_none() {
                    stats.hostname = record.src_hostname.clone();
                }
            })
            .or_insert_with(|| {
                self.tracked_sources.fetch_add(1, Ordering::Relaxed);
                SourceStats {
                    drops: 1,
                    last_icmp_type: record.icmp_type,
                    hostname: record.src_hostname.clone(),
                    last_seen: Instant::now(),
                }
            });
    }

    /// Evict sources that have not been dropped within `timeout`.
    pub fn cleanup_stale_sources(&self, timeout: tokio::time::Duration) {
        let now = Instant::now();
        let mut to_remove = Vec::new();

        for entry in self.offenders.iter() {
            if now.duration_since(entry.value().last_seen) > timeout {
                to_remove.push(*entry.key());
            }
        }

        let removed_count = to_remove.len();
        for key in to_remove {
            self.offenders.remove(&key);
        }

        if removed_count > 0 {
            self.tracked_sources
                .fetch_sub(removed_count, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icmpgate_common::{FilterEngine, Verdict, ICMP_ECHO_REQUEST, IPPROTO_ICMP, SNAP_LEN};

    fn echo_event(src: [u8; 4], wire_len: u32) -> VerdictEvent {
        let mut hdr = [0u8; SNAP_LEN];
        hdr[0] = 0x45;
        hdr[2..4].copy_from_slice(&24u16.to_be_bytes());
        hdr[9] = IPPROTO_ICMP;
        hdr[12..16].copy_from_slice(&src);
        hdr[16..20].copy_from_slice(&[10, 0, 0, 2]);
        hdr[20] = ICMP_ECHO_REQUEST;
        VerdictEvent {
            pkt_len: wire_len,
            cap_len: 24,
            hdr,
        }
    }

    #[test]
    fn test_drop_record_from_event() {
        let engine = FilterEngine::new();
        let event = echo_event([203, 0, 113, 5], 84);
        let (verdict, diag) = engine.inspect(event.snapshot());
        assert_eq!(verdict, Verdict::Drop);

        let record = DropRecord::from_event(&event, &diag).unwrap();
        assert_eq!(record.src_ip, "203.0.113.5");
        assert_eq!(record.dst_ip, "10.0.0.2");
        assert_eq!(record.icmp_type, ICMP_ECHO_REQUEST);
        // The wire length, not the 24 bytes that were captured.
        assert_eq!(record.length, 84);
        assert_eq!(record.reason, "echo request dropped");
    }

    #[test]
    fn test_drop_record_rejects_unparseable_snapshot() {
        let event = VerdictEvent {
            pkt_len: 84,
            cap_len: 8,
            hdr: [0u8; SNAP_LEN],
        };
        let engine = FilterEngine::new();
        let (_, diag) = engine.inspect(event.snapshot());
        assert!(DropRecord::from_event(&event, &diag).is_none());
    }

    #[test]
    fn test_state_tracks_offenders() {
        let state = FilterState::new();
        let event = echo_event([203, 0, 113, 5], 84);
        let engine = FilterEngine::new();
        let (_, diag) = engine.inspect(event.snapshot());
        let record = DropRecord::from_event(&event, &diag).unwrap();
        let src: Ipv4Addr = record.src_ip.parse().unwrap();

        state.note_drop(src, &record);
        assert_eq!(state.inspected_total.load(Ordering::Relaxed), 1);
        assert_eq!(state.tracked_sources.load(Ordering::Relaxed), 1);

        state.note_drop(src, &record);
        assert_eq!(state.inspected_total.load(Ordering::Relaxed), 2);
        // Same source: tracked once, drop count advanced.
        assert_eq!(state.tracked_sources.load(Ordering::Relaxed), 1);
        assert_eq!(state.offenders.get(&src).unwrap().drops, 2);

        state.note_pass();
        assert_eq!(state.inspected_total.load(Ordering::Relaxed), 3);
        assert_eq!(state.passed_total.load(Ordering::Relaxed), 1);
    }
}
