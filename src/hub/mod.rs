//! Process-wide fan-out of log records.
//!
//! `broadcast` is the single entry point: it counts the record into the
//! statistics, stamps the snapshot onto the record, hands it to the journal,
//! keeps a small in-memory ring for recency, and offers it to the dispatch
//! loop over a bounded channel. When the channel is full the record is
//! dropped with a warning; the live feed is best-effort and the journal is
//! the durable copy.

pub mod frame;
pub mod subscriber;

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::WiretapResult;
use crate::journal::Journal;
use crate::logger::models::{LogRecord, Statistics};
use subscriber::Subscriber;

/// Records kept in memory for quick access when no journal is configured
const MEMORY_HISTORY_CAP: usize = 20;

pub struct Hub {
    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    next_subscriber_id: AtomicU64,
    broadcast_tx: mpsc::Sender<LogRecord>,
    dispatch_rx: StdMutex<Option<mpsc::Receiver<LogRecord>>>,
    stats: StdRwLock<Statistics>,
    history: StdMutex<VecDeque<LogRecord>>,
    journal: Option<Journal>,
}

impl Hub {
    pub fn new(broadcast_size: usize, journal: Option<Journal>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(broadcast_size.max(1));

        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            broadcast_tx: tx,
            dispatch_rx: StdMutex::new(Some(rx)),
            stats: StdRwLock::new(Statistics::default()),
            history: StdMutex::new(VecDeque::new()),
            journal,
        })
    }

    /// Dispatch loop: one frame per record per subscriber, each send in its
    /// own task so a slow peer never stalls the others. Runs until the
    /// broadcast channel closes.
    pub async fn run(self: Arc<Self>) {
        let receiver = match self.dispatch_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut receiver) = receiver else {
            warn!("Hub dispatch loop already running");
            return;
        };

        while let Some(record) = receiver.recv().await {
            let payload = match serde_json::to_vec(&record) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize record for broadcast: {}", e);
                    continue;
                }
            };
            let frame: Arc<Vec<u8>> = Arc::new(frame::text_frame(&payload));

            let subscribers: Vec<Arc<Subscriber>> =
                self.subscribers.read().await.values().cloned().collect();

            // Enqueue is non-blocking; each subscriber's writer task drains
            // its own queue, so a slow peer never holds up this loop or the
            // other subscribers.
            for sub in subscribers {
                if sub.enqueue(Arc::clone(&frame)).is_err() {
                    let hub = Arc::clone(&self);
                    let id = sub.id;
                    tokio::spawn(async move {
                        hub.remove_subscriber(id).await;
                    });
                }
            }
        }

        debug!("Hub dispatch loop exited");
    }

    /// Count, persist and fan out one record. Never blocks on a slow feed.
    pub async fn broadcast(&self, mut record: LogRecord) {
        self.update_stats(&record);
        record.stats = Some(self.stats_snapshot());

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&record).await {
                error!("Failed to persist record to journal: {}", e);
            }
        }

        if let Ok(mut history) = self.history.lock() {
            history.push_back(record.clone());
            while history.len() > MEMORY_HISTORY_CAP {
                history.pop_front();
            }
        }

        match self.broadcast_tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Broadcast channel full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Broadcast channel closed, dropping message");
            }
        }
    }

    fn update_stats(&self, record: &LogRecord) {
        let mut stats = match self.stats.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        stats.total_requests += 1;
        stats.last_request_time = Utc::now();
        *stats
            .method_counts
            .entry(record.method.clone())
            .or_insert(0) += 1;
        *stats
            .status_code_counts
            .entry(record.status_code)
            .or_insert(0) += 1;

        if (200..400).contains(&record.status_code) {
            stats.success_requests += 1;
        } else {
            stats.error_requests += 1;
        }
    }

    /// Read-copy of the current statistics
    pub fn stats_snapshot(&self) -> Statistics {
        match self.stats.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Recent records, newest first. Delegates to the journal when one is
    /// configured, otherwise serves the in-memory ring.
    pub async fn get_history(&self, limit: usize) -> WiretapResult<Vec<LogRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        if let Some(journal) = &self.journal {
            return journal.recent(limit).await;
        }

        let history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(history.iter().rev().take(limit).cloned().collect())
    }

    /// Empty the ring and, when present, the journal's files.
    pub async fn clear_history(&self) -> WiretapResult<()> {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }

        if let Some(journal) = &self.journal {
            journal.clear().await?;
        }
        Ok(())
    }

    /// Register an upgraded connection as a subscriber: spawn its writer
    /// task and a drain task that reads and discards incoming bytes. EOF, a
    /// read error or a write error ends the subscription.
    pub async fn add_subscriber<S>(self: &Arc<Self>, stream: S, read_buffer_size: usize)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (subscriber, frame_rx) = Subscriber::new(id);
        let subscriber = Arc::new(subscriber);

        let count = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(id, Arc::clone(&subscriber));
            subscribers.len()
        };
        info!("WebSocket client connected. Total: {}", count);

        let writer_hub = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = subscriber::write_frames(frame_rx, write_half).await {
                debug!("Subscriber {} writer stopped: {}", id, e);
            }
            writer_hub.remove_subscriber(id).await;
        });

        let drain_hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; read_buffer_size.max(1)];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            drain_hub.remove_subscriber(id).await;
        });
    }

    /// Deregister a subscriber. Dropping the handle closes its frame queue,
    /// which ends the writer task and shuts the stream down.
    pub async fn remove_subscriber(&self, id: u64) {
        let removed = self.subscribers.write().await.remove(&id);
        if let Some(subscriber) = removed {
            drop(subscriber);
            let count = self.subscribers.read().await.len();
            info!("WebSocket client disconnected. Total: {}", count);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(method: &str, status: u16) -> LogRecord {
        LogRecord {
            method: method.to_string(),
            path: "/x".to_string(),
            status_code: status,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_broadcast_updates_stats() {
        let hub = Hub::new(16, None);

        hub.broadcast(record("GET", 200)).await;
        hub.broadcast(record("POST", 502)).await;
        hub.broadcast(record("GET", 301)).await;

        let stats = hub.stats_snapshot();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.success_requests, 2);
        assert_eq!(stats.error_requests, 1);
        assert_eq!(stats.method_counts.get("GET"), Some(&2));
        assert_eq!(stats.status_code_counts.get(&502), Some(&1));
    }

    #[tokio::test]
    async fn test_stats_snapshot_reflects_counted_record() {
        let hub = Hub::new(16, None);
        hub.broadcast(record("GET", 200)).await;

        let history = hub.get_history(1).await.unwrap();
        let attached = history[0].stats.as_ref().unwrap();
        // The snapshot includes the record it rides on
        assert_eq!(attached.total_requests, 1);
    }

    #[tokio::test]
    async fn test_memory_ring_capped_and_newest_first() {
        let hub = Hub::new(64, None);
        for i in 0..30u16 {
            hub.broadcast(record("GET", 200 + i)).await;
        }

        let history = hub.get_history(50).await.unwrap();
        assert_eq!(history.len(), MEMORY_HISTORY_CAP);
        assert_eq!(history[0].status_code, 229);
        assert_eq!(history.last().unwrap().status_code, 210);
    }

    #[tokio::test]
    async fn test_get_history_zero_limit() {
        let hub = Hub::new(16, None);
        hub.broadcast(record("GET", 200)).await;
        assert!(hub.get_history(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_history() {
        let hub = Hub::new(16, None);
        hub.broadcast(record("GET", 200)).await;
        hub.clear_history().await.unwrap();
        assert!(hub.get_history(10).await.unwrap().is_empty());

        hub.broadcast(record("GET", 200)).await;
        assert_eq!(hub.get_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_never_blocks_when_channel_full() {
        // Depth 1 and nobody draining: the second record must drop, not block
        let hub = Hub::new(1, None);
        hub.broadcast(record("GET", 200)).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            hub.broadcast(record("GET", 200)).await;
            hub.broadcast(record("GET", 200)).await;
        })
        .await
        .expect("broadcast must not block on a full channel");
    }

    #[tokio::test]
    async fn test_subscriber_receives_ordered_frames() {
        let hub = Hub::new(16, None);
        tokio::spawn(Arc::clone(&hub).run());

        let (client, server) = tokio::io::duplex(64 * 1024);
        hub.add_subscriber(server, 1024).await;
        assert_eq!(hub.subscriber_count().await, 1);

        hub.broadcast(record("GET", 200)).await;
        hub.broadcast(record("POST", 201)).await;

        let (mut client_read, _client_write) = tokio::io::split(client);
        let mut received = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        while received.len() < 2 {
            let n = tokio::time::timeout(
                std::time::Duration::from_secs(2),
                client_read.read(&mut buf),
            )
            .await
            .expect("frame not delivered in time")
            .unwrap();
            assert!(n > 0);
            let mut rest = &buf[..n];
            while rest.len() > 4 {
                assert_eq!(rest[0], 0x81);
                let (payload_len, header_len) = match rest[1] {
                    126 => (u16::from_be_bytes([rest[2], rest[3]]) as usize, 4),
                    127 => unreachable!("test frames are small"),
                    n => (n as usize, 2),
                };
                let payload = &rest[header_len..header_len + payload_len];
                let parsed: LogRecord = serde_json::from_slice(payload).unwrap();
                received.push(parsed);
                rest = &rest[header_len + payload_len..];
            }
        }

        // Per-subscriber order matches broadcast order
        assert_eq!(received[0].method, "GET");
        assert_eq!(received[1].method, "POST");
    }

    #[tokio::test]
    async fn test_peer_close_removes_subscriber() {
        let hub = Hub::new(16, None);
        let (client, server) = tokio::io::duplex(1024);
        hub.add_subscriber(server, 64).await;
        assert_eq!(hub.subscriber_count().await, 1);

        drop(client);

        for _ in 0..50 {
            if hub.subscriber_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(hub.subscriber_count().await, 0);
    }
}
