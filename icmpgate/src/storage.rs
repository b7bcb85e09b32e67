use crate::state::DropRecord;
use rusqlite::{params, Connection, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, Duration};

/// One row of the drop log. `drop_count` is 1 for individually stored
/// drops and the bucket size for aggregated rows.
#[derive(Debug, Clone, Serialize)]
pub struct StoredDrop {
    pub timestamp: i64,
    pub src_ip: String,
    pub dst_ip: String,
    pub icmp_type: u8,
    pub length: usize,
    pub reason: String,
    pub src_hostname: Option<String>,
    pub drop_count: u64,
}

/// Accumulates drops from one source/type pair within an aggregation window.
struct DropBucket {
    first_timestamp: i64,
    src_ip: String,
    dst_ip: String,
    icmp_type: u8,
    reason: String,
    src_hostname: Option<String>,
    drop_count: u64,
    total_bytes: u64,
}

impl DropBucket {
    fn from_record(record: &DropRecord) -> Self {
        Self {
            first_timestamp: record.timestamp,
            src_ip: record.src_ip.clone(),
            dst_ip: record.dst_ip.clone(),
            icmp_type: record.icmp_type,
            reason: record.reason.clone(),
            src_hostname: record.src_hostname.clone(),
            drop_count: 1,
            total_bytes: record.length as u64,
        }
    }

    fn merge(&mut self, record: &DropRecord) {
        self.drop_count += 1;
        self.total_bytes += record.length as u64;
        if self.src_hostname.is_none() {
            self.src_hostname = record.src_hostname.clone();
        }
    }
}

#[derive(Clone)]
pub struct Storage {
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl Storage {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        let _: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS drops (
                id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                src_ip TEXT NOT NULL,
                dst_ip TEXT NOT NULL,
                icmp_type INTEGER NOT NULL,
                length INTEGER,
                reason TEXT,
                src_hostname TEXT,
                drop_count INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_drops_timestamp ON drops(timestamp)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    pub async fn run_writer(&self, rx: Receiver<DropRecord>, aggregation_window_seconds: u64) {
        if aggregation_window_seconds == 0 {
            self.run_writer_raw(rx).await;
        } else {
            self.run_writer_aggregated(rx, aggregation_window_seconds)
                .await;
        }
    }

    async fn run_writer_raw(&self, mut rx: Receiver<DropRecord>) {
        let mut buffer = Vec::new();
        let mut ticker = interval(Duration::from_secs(2));

        loop {
            tokio::select! {
                Some(record) = rx.recv() => {
                    buffer.push(record);
                    if buffer.len() >= 1000 {
                        self.flush(&mut buffer);
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer);
                    }
                }
            }
        }
    }

    async fn run_writer_aggregated(&self, mut rx: Receiver<DropRecord>, window_secs: u64) {
        let mut buckets: HashMap<(String, u8), DropBucket> = HashMap::new();
        let mut ticker = interval(Duration::from_secs(window_secs));

        loop {
            tokio::select! {
                Some(record) = rx.recv() => {
                    let key = (record.src_ip.clone(), record.icmp_type);
                    buckets
                        .entry(key)
                        .and_modify(|b| b.merge(&record))
                        .or_insert_with(|| DropBucket::from_record(&record));
                }
                _ = ticker.tick() => {
                    if !buckets.is_empty() {
                        self.flush_aggregated(&mut buckets);
                    }
                }
            }
        }
    }

    fn flush(&self, buffer: &mut Vec<DropRecord>) {
        let mut conn = self.conn.lock().unwrap();
        let tx = match conn.transaction() {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!("Failed to start transaction: {}", e);
                return;
            }
        };

        {
            let mut stmt = match tx.prepare(
                "INSERT INTO drops (timestamp, src_ip, dst_ip, icmp_type, length, reason, src_hostname, drop_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            ) {
                Ok(stmt) => stmt,
                Err(e) => {
                    tracing::error!("Failed to prepare statement: {}", e);
                    return;
                }
            };

            for record in buffer.iter() {
                if let Err(e) = stmt.execute(params![
                    record.timestamp,
                    record.src_ip,
                    record.dst_ip,
                    record.icmp_type,
                    record.length,
                    record.reason,
                    record.src_hostname,
                ]) {
                    tracing::error!("Failed to insert drop record: {}", e);
                }
            }
        }

        if let Err(e) = tx.commit() {
            tracing::error!("Failed to commit transaction: {}", e);
        } else {
            buffer.clear();
        }
    }

    fn flush_aggregated(&self, buckets: &mut HashMap<(String, u8), DropBucket>) {
        let mut conn = self.conn.lock().unwrap();
        let tx = match conn.transaction() {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!("Failed to start transaction: {}", e);
                return;
            }
        };

        {
            let mut stmt = match tx.prepare(
                "INSERT INTO drops (timestamp, src_ip, dst_ip, icmp_type, length, reason, src_hostname, drop_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            ) {
                Ok(stmt) => stmt,
                Err(e) => {
                    tracing::error!("Failed to prepare statement: {}", e);
                    return;
                }
            };

            for bucket in buckets.values() {
                if let Err(e) = stmt.execute(params![
                    bucket.first_timestamp,
                    bucket.src_ip,
                    bucket.dst_ip,
                    bucket.icmp_type,
                    bucket.total_bytes as i64,
                    bucket.reason,
                    bucket.src_hostname,
                    bucket.drop_count as i64,
                ]) {
                    tracing::error!("Failed to insert aggregated row: {}", e);
                }
            }
        }

        if let Err(e) = tx.commit() {
            tracing::error!("Failed to commit transaction: {}", e);
        } else {
            buckets.clear();
        }
    }

    pub fn query_history(&self, limit: usize) -> Result<Vec<StoredDrop>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp, src_ip, dst_ip, icmp_type, length, reason, src_hostname, drop_count
             FROM drops ORDER BY timestamp DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit], |row| {
            Ok(StoredDrop {
                timestamp: row.get(0)?,
                src_ip: row.get(1)?,
                dst_ip: row.get(2)?,
                icmp_type: row.get(3)?,
                length: row.get::<_, i64>(4)? as usize,
                reason: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                src_hostname: row.get(6)?,
                drop_count: row.get::<_, i64>(7)? as u64,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_old_data(&self, older_than_seconds: u64) -> Result<usize> {
        let cutoff_ms = chrono::Utc::now().timestamp_millis() - (older_than_seconds as i64 * 1000);
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM drops WHERE timestamp < ?1", params![cutoff_ms])?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(src: &str, length: usize) -> DropRecord {
        DropRecord {
            timestamp: chrono::Utc::now().timestamp_millis(),
            src_ip: src.to_string(),
            dst_ip: "10.0.0.2".to_string(),
            icmp_type: 8,
            length,
            reason: "echo request dropped".to_string(),
            src_hostname: None,
        }
    }

    #[test]
    fn test_flush_and_query_roundtrip() {
        let storage = Storage::new(":memory:").unwrap();
        let mut buffer = vec![record("203.0.113.5", 84), record("203.0.113.6", 120)];
        storage.flush(&mut buffer);
        assert!(buffer.is_empty());

        let history = storage.query_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|d| d.drop_count == 1));
        assert!(history.iter().any(|d| d.src_ip == "203.0.113.5"));
    }

    #[test]
    fn test_retention_deletes_old_rows() {
        let storage = Storage::new(":memory:").unwrap();
        let mut old = record("203.0.113.5", 84);
        old.timestamp -= 3_600_000;
        let mut buffer = vec![old, record("203.0.113.6", 84)];
        storage.flush(&mut buffer);

        let deleted = storage.delete_old_data(60).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(storage.query_history(10).unwrap().len(), 1);
    }

    #[test]
    fn test_bucket_merge_accumulates() {
        let mut bucket = DropBucket::from_record(&record("203.0.113.5", 84));
        bucket.merge(&record("203.0.113.5", 84));
        bucket.merge(&record("203.0.113.5", 84));
        assert_eq!(bucket.drop_count, 3);
        assert_eq!(bucket.total_bytes, 252);
    }
}
