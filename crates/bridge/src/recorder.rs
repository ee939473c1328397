//! Bounded persistence queue between telemetry ingestion and the database.
//!
//! Ingestion never waits on SQLite: packets are offered to a bounded
//! channel and a single writer task stores them in arrival order. When the
//! channel is full the packet is dropped from storage and counted; it has
//! already been broadcast by then.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use unitboard_protocol::SensorPacket;

use crate::db::Db;
use crate::state::SharedState;

#[derive(Debug, Default)]
struct Counters {
    persisted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub persisted: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::Sender<SensorPacket>,
    counters: Arc<Counters>,
}

impl Recorder {
    /// Start the writer task. It exits once every `Recorder` clone is gone
    /// and the queue has drained.
    pub fn spawn(db: Db, capacity: usize, state: SharedState) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());
        let handle = tokio::spawn(run_writer(rx, db, Arc::clone(&counters), state));
        (Self { tx, counters }, handle)
    }

    /// Queue a packet for storage. Returns `false` when it was dropped.
    pub fn submit(&self, packet: SensorPacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(p)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(order = p.order, dropped, "persistence queue full, packet not stored");
                false
            }
            Err(mpsc::error::TrySendError::Closed(p)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!(order = p.order, "persistence writer gone, packet not stored");
                false
            }
        }
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<SensorPacket>,
    db: Db,
    counters: Arc<Counters>,
    state: SharedState,
) {
    while let Some(packet) = rx.recv().await {
        match db.persist(&packet).await {
            Ok(packet_id) => {
                counters.persisted.fetch_add(1, Ordering::Relaxed);
                debug!(order = packet.order, packet_id, "packet stored");
            }
            Err(e) => {
                error!(order = packet.order, "failed to store packet: {e:#}");
                state
                    .write()
                    .await
                    .record_error(format!("persist order={} failed: {e:#}", packet.order));
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    debug!("persistence writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EventKind, UnitMirror};
    use std::time::Duration;
    use unitboard_protocol::SensorValue;

    fn packet(order: u64, value: &str) -> SensorPacket {
        SensorPacket {
            order,
            date: "2024-01-01".into(),
            time: "00:00:00".into(),
            values: vec![SensorValue {
                tank_id: 101,
                sensor_id: 1,
                value: value.into(),
            }],
            state: vec![],
        }
    }

    async fn wait_for(recorder: &Recorder, f: impl Fn(RecorderStats) -> bool) {
        for _ in 0..200 {
            if f(recorder.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("recorder did not settle: {:?}", recorder.stats());
    }

    #[tokio::test]
    async fn packets_stored_in_order() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let (recorder, _task) = Recorder::spawn(db.clone(), 16, UnitMirror::shared());

        for i in 0..5 {
            assert!(recorder.submit(packet(i, "1.5")));
        }
        wait_for(&recorder, |s| s.persisted == 5).await;

        let orders: Vec<i64> = sqlx::query_scalar("SELECT order_num FROM packets ORDER BY id")
            .fetch_all(db.pool())
            .await
            .unwrap();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failed_persist_is_counted_and_logged_to_mirror() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let state = UnitMirror::shared();
        let (recorder, _task) = Recorder::spawn(db, 4, state.clone());

        recorder.submit(packet(1, "bogus"));
        wait_for(&recorder, |s| s.failed == 1).await;

        let st = state.read().await;
        assert_eq!(st.events.back().unwrap().kind, EventKind::Error);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        // No writer task: nothing drains the queue.
        let (tx, _rx) = mpsc::channel(2);
        let recorder = Recorder {
            tx,
            counters: Arc::new(Counters::default()),
        };

        assert!(recorder.submit(packet(1, "1")));
        assert!(recorder.submit(packet(2, "1")));
        assert!(!recorder.submit(packet(3, "1")));
        assert!(!recorder.submit(packet(4, "1")));
        assert_eq!(recorder.stats().dropped, 2);
    }
}
