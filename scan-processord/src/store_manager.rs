use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use shared::types::{CanonicalRecord, ScanKey, StoredScan};
use crate::config::ReportConfig;
use crate::error::StoreError;
use crate::store::{ScanDb, UpsertOutcome};

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Commands sent to the store thread
pub enum StoreCommand {
    Upsert(CanonicalRecord, Reply<UpsertOutcome>),
    Get(ScanKey, Reply<Option<StoredScan>>),
    CountKeys(Reply<u64>),
    Recent(u32, Reply<Vec<StoredScan>>),
    Shutdown,
}

/// Handle to the thread that owns the scan database
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn a new store thread with the given database
    pub fn spawn(db: ScanDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Upsert(record, reply) => {
                        let _ = reply.send(db.upsert_scan(&record));
                    }
                    StoreCommand::Get(key, reply) => {
                        let _ = reply.send(db.get_scan(&key));
                    }
                    StoreCommand::CountKeys(reply) => {
                        let _ = reply.send(db.count_keys());
                    }
                    StoreCommand::Recent(limit, reply) => {
                        let _ = reply.send(db.recent_scans(limit));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| StoreError::Unavailable)?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// Apply a record unless a newer one is already stored
    pub async fn upsert(&self, record: CanonicalRecord) -> Result<UpsertOutcome, StoreError> {
        self.request(|reply| StoreCommand::Upsert(record, reply)).await
    }

    /// Get the stored row for a key
    pub async fn get(&self, key: ScanKey) -> Result<Option<StoredScan>, StoreError> {
        self.request(|reply| StoreCommand::Get(key, reply)).await
    }

    /// Count distinct keys
    pub async fn count_keys(&self) -> Result<u64, StoreError> {
        self.request(StoreCommand::CountKeys).await
    }

    /// Most recently scanned rows, newest first
    pub async fn recent(&self, limit: u32) -> Result<Vec<StoredScan>, StoreError> {
        self.request(|reply| StoreCommand::Recent(limit, reply)).await
    }

    /// Shutdown the store thread once queued commands are done
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| StoreError::Unavailable)
    }
}

/// Periodically log the key count and the most recent rows
pub async fn run_reporter(
    store: StoreHandle,
    config: ReportConfig,
    cancel: CancellationToken,
) -> Result<(), StoreError> {
    if config.interval_secs == 0 {
        tracing::info!("Store reporter disabled");
        return Ok(());
    }

    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = report_once(&store, config.recent_limit).await {
                    tracing::error!(error = %e, "Failed to report store state");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Store reporter shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn report_once(store: &StoreHandle, recent_limit: u32) -> Result<(), StoreError> {
    let count = store.count_keys().await?;
    tracing::info!(unique_keys = count, "Store summary");

    for scan in store.recent(recent_limit).await? {
        tracing::info!(
            ip = %scan.ip,
            port = scan.port,
            service = %scan.service,
            last_scanned = scan.last_scanned,
            response = %scan.response,
            "Recent scan"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(port: u16, timestamp: i64, response: &str) -> CanonicalRecord {
        CanonicalRecord {
            key: ScanKey {
                ip: "192.0.2.1".to_string(),
                port,
                service: "http".to_string(),
            },
            timestamp,
            response: response.to_string(),
        }
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let store = StoreHandle::spawn(ScanDb::open_in_memory().unwrap());

        assert_eq!(store.upsert(record(80, 100, "a")).await.unwrap(), UpsertOutcome::Written);
        assert_eq!(store.upsert(record(80, 50, "b")).await.unwrap(), UpsertOutcome::Stale);
        store.upsert(record(443, 60, "c")).await.unwrap();

        assert_eq!(store.count_keys().await.unwrap(), 2);

        let recent = store.recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].port, 80);

        let stored = store.get(record(80, 0, "").key).await.unwrap().unwrap();
        assert_eq!(stored.response, "a");
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_newest() {
        for order in [[10, 20], [20, 10]] {
            let store = StoreHandle::spawn(ScanDb::open_in_memory().unwrap());

            let tasks: Vec<_> = order
                .into_iter()
                .map(|ts| {
                    let store = store.clone();
                    tokio::spawn(async move { store.upsert(record(80, ts, &ts.to_string())).await })
                })
                .collect();
            for task in tasks {
                task.await.unwrap().unwrap();
            }

            let stored = store.get(record(80, 0, "").key).await.unwrap().unwrap();
            assert_eq!(stored.last_scanned, 20);
            assert_eq!(stored.response, "20");
        }
    }

    #[tokio::test]
    async fn test_shutdown_makes_store_unavailable() {
        let store = StoreHandle::spawn(ScanDb::open_in_memory().unwrap());
        store.shutdown().await.unwrap();

        let err = store.upsert(record(80, 1, "x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable));
    }

    #[tokio::test]
    async fn test_reporter_stops_on_cancel() {
        let store = StoreHandle::spawn(ScanDb::open_in_memory().unwrap());
        store.upsert(record(80, 1, "x")).await.unwrap();

        let cancel = CancellationToken::new();
        let config = ReportConfig { interval_secs: 1, recent_limit: 5 };
        let reporter = tokio::spawn(run_reporter(store, config, cancel.clone()));

        cancel.cancel();
        reporter.await.unwrap().unwrap();
    }
}
