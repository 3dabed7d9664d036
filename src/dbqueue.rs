//! Serialized persistence access over the SQLite pool.
//!
//! Writes are serialized per shard key (by convention the table name):
//! each shard gets its own worker task draining an mpsc channel, so two
//! writes against the same tables never interleave. Reads run concurrently
//! under a bounded semaphore. Lock-contention errors are retried with a
//! fresh transaction; when the write backlog crosses the high-water mark a
//! watch flag tells source adapters to pause ingestion until low-water.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{debug, warn};

use crate::error::{is_retryable_db_error, QueueError};

/// A write unit: re-invocable so the worker can retry it on a fresh
/// transaction after a lock error.
pub type WriteOp =
    Arc<dyn for<'c> Fn(&'c mut SqliteConnection) -> BoxFuture<'c, Result<(), sqlx::Error>> + Send + Sync>;

struct WriteJob {
    op: WriteOp,
    done: oneshot::Sender<Result<(), QueueError>>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub read_concurrency: usize,
    pub max_retries: u32,
    pub high_water: usize,
    pub low_water: usize,
    /// Backlog depth past which a shard worker coalesces queued jobs into
    /// a single transaction.
    pub coalesce_threshold: usize,
    pub max_batch: usize,
    pub channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            read_concurrency: 8,
            max_retries: 3,
            high_water: 512,
            low_water: 64,
            coalesce_threshold: 32,
            max_batch: 32,
            channel_capacity: 2000,
        }
    }
}

pub struct DbQueue {
    pool: SqlitePool,
    config: QueueConfig,
    read_permits: Arc<Semaphore>,
    shards: Mutex<HashMap<String, mpsc::Sender<WriteJob>>>,
    depth: Arc<AtomicUsize>,
    paused_tx: watch::Sender<bool>,
    stats: QueueStats,
}

#[derive(Default)]
pub struct QueueStats {
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub write_errors: AtomicUsize,
    pub deadlock_retries: AtomicUsize,
}

impl DbQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Arc<Self> {
        let (paused_tx, _) = watch::channel(false);
        Arc::new(Self {
            read_permits: Arc::new(Semaphore::new(config.read_concurrency)),
            shards: Mutex::new(HashMap::new()),
            depth: Arc::new(AtomicUsize::new(0)),
            paused_tx,
            stats: QueueStats::default(),
            pool,
            config,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current write backlog across all shards.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    pub fn pause_signal(&self) -> watch::Receiver<bool> {
        self.paused_tx.subscribe()
    }

    /// Suspends until backpressure clears. Used by source adapters before
    /// enqueueing new candidates.
    pub async fn wait_until_resumed(&self) {
        let mut rx = self.paused_tx.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn update_watermark(&self) {
        let depth = self.depth();
        let paused = self.is_paused();
        if !paused && depth >= self.config.high_water {
            warn!(depth, "write queue above high-water mark, pausing ingestion");
            let _ = self.paused_tx.send(true);
        } else if paused && depth <= self.config.low_water {
            debug!(depth, "write queue drained to low-water mark, resuming ingestion");
            let _ = self.paused_tx.send(false);
        }
    }

    /// Execute a read under the bounded read pool, retrying lock errors.
    pub async fn read<T, F>(&self, op: F) -> Result<T, QueueError>
    where
        F: Fn(SqlitePool) -> BoxFuture<'static, Result<T, sqlx::Error>>,
    {
        let _permit = self
            .read_permits
            .acquire()
            .await
            .map_err(|_| QueueError::Closed)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0u32;
        loop {
            match op(self.pool.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable_db_error(&e) && attempt < self.config.max_retries => {
                    attempt += 1;
                    self.stats.deadlock_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(QueueError::Sql(e)),
            }
        }
    }

    /// Enqueue a write on the shard's serialized worker and wait for it.
    pub async fn write(&self, shard: &str, op: WriteOp) -> Result<(), QueueError> {
        let sender = self.shard_sender(shard);
        let (done, wait) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.update_watermark();
        self.stats.writes.fetch_add(1, Ordering::Relaxed);

        if sender.send(WriteJob { op, done }).await.is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(QueueError::Closed);
        }
        match wait.await {
            Ok(result) => {
                if result.is_err() {
                    self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
            Err(_) => Err(QueueError::Closed),
        }
    }

    /// Write that produces a value: the unit stores its result into a slot
    /// the caller reads back after the queue confirms the transaction.
    pub async fn write_returning<T, F>(&self, shard: &str, op: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: for<'c> Fn(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, sqlx::Error>>
            + Send
            + Sync
            + 'static,
    {
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let slot_in = slot.clone();
        let unit: WriteOp = Arc::new(move |conn| {
            let slot = slot_in.clone();
            let fut = op(conn);
            Box::pin(async move {
                let value = fut.await?;
                *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(value);
                Ok(())
            })
        });
        self.write(shard, unit).await?;
        let value = slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        value.ok_or(QueueError::Closed)
    }

    fn shard_sender(&self, shard: &str) -> mpsc::Sender<WriteJob> {
        let mut shards = self.shards.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(sender) = shards.get(shard) {
            return sender.clone();
        }
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let worker = ShardWorker {
            pool: self.pool.clone(),
            depth: self.depth.clone(),
            config: self.config.clone(),
            shard: shard.to_string(),
        };
        tokio::spawn(worker.run(rx));
        shards.insert(shard.to_string(), tx.clone());
        tx
    }

    /// Drop all shard senders; in-flight jobs finish, workers then exit.
    pub fn close(&self) {
        self.shards.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

struct ShardWorker {
    pool: SqlitePool,
    depth: Arc<AtomicUsize>,
    config: QueueConfig,
    shard: String,
}

impl ShardWorker {
    async fn run(self, mut rx: mpsc::Receiver<WriteJob>) {
        debug!(shard = %self.shard, "write shard worker started");
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            if self.depth.load(Ordering::Relaxed) > self.config.coalesce_threshold {
                while batch.len() < self.config.max_batch {
                    match rx.try_recv() {
                        Ok(job) => batch.push(job),
                        Err(_) => break,
                    }
                }
            }

            let outcome = self.execute_batch(&batch).await;
            let completed = batch.len();
            for job in batch {
                let result = match &outcome {
                    Ok(()) => Ok(()),
                    Err(QueueError::DeadlockRetryExhausted { attempts }) => {
                        Err(QueueError::DeadlockRetryExhausted { attempts: *attempts })
                    }
                    Err(e) => Err(QueueError::Write(e.to_string())),
                };
                let _ = job.done.send(result);
            }
            self.depth.fetch_sub(completed, Ordering::Relaxed);
        }
        debug!(shard = %self.shard, "write shard worker stopped");
    }

    /// Run a batch inside one transaction, retrying the whole unit on lock
    /// contention with a fresh transaction each time.
    async fn execute_batch(&self, batch: &[WriteJob]) -> Result<(), QueueError> {
        let mut attempt = 0u32;
        loop {
            match self.try_batch(batch).await {
                Ok(()) => return Ok(()),
                Err(e) if is_retryable_db_error(&e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(QueueError::DeadlockRetryExhausted {
                            attempts: self.config.max_retries,
                        });
                    }
                    warn!(shard = %self.shard, attempt, "database locked, retrying write batch");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(QueueError::Sql(e)),
            }
        }
    }

    async fn try_batch(&self, batch: &[WriteJob]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for job in batch {
            (job.op)(&mut tx).await?;
        }
        tx.commit().await
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = 50u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::random::<u64>() % (base / 2 + 1);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    async fn queue_with_counter_table() -> Arc<DbQueue> {
        let pool = create_test_pool().await.unwrap();
        sqlx::query("CREATE TABLE counters (name TEXT PRIMARY KEY, value INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO counters (name, value) VALUES ('hits', 0)")
            .execute(&pool)
            .await
            .unwrap();
        DbQueue::new(pool, QueueConfig::default())
    }

    #[tokio::test]
    async fn serialized_increments_are_exact() {
        let queue = queue_with_counter_table().await;
        let mut handles = Vec::new();
        for _ in 0..50 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .write(
                        "counters",
                        Arc::new(|conn| {
                            Box::pin(async move {
                                sqlx::query("UPDATE counters SET value = value + 1 WHERE name = 'hits'")
                                    .execute(conn)
                                    .await?;
                                Ok(())
                            })
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let value: (i64,) = sqlx::query_as("SELECT value FROM counters WHERE name = 'hits'")
            .fetch_one(queue.pool())
            .await
            .unwrap();
        assert_eq!(value.0, 50);
    }

    #[tokio::test]
    async fn write_returning_delivers_value() {
        let queue = queue_with_counter_table().await;
        let value = queue
            .write_returning("counters", |conn| {
                Box::pin(async move {
                    sqlx::query("UPDATE counters SET value = value + 5 WHERE name = 'hits'")
                        .execute(&mut *conn)
                        .await?;
                    let row: (i64,) = sqlx::query_as("SELECT value FROM counters WHERE name = 'hits'")
                        .fetch_one(conn)
                        .await?;
                    Ok(row.0)
                })
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn failed_unit_reports_write_error() {
        let queue = queue_with_counter_table().await;
        let result = queue
            .write(
                "counters",
                Arc::new(|conn| {
                    Box::pin(async move {
                        sqlx::query("INSERT INTO no_such_table (x) VALUES (1)")
                            .execute(conn)
                            .await?;
                        Ok(())
                    })
                }),
            )
            .await;
        assert!(matches!(result, Err(QueueError::Write(_))));
    }

    #[tokio::test]
    async fn watermarks_flip_pause_flag() {
        let pool = create_test_pool().await.unwrap();
        let config = QueueConfig {
            high_water: 1,
            low_water: 0,
            ..QueueConfig::default()
        };
        let queue = DbQueue::new(pool, config);
        assert!(!queue.is_paused());
        queue.depth.store(2, Ordering::Relaxed);
        queue.update_watermark();
        assert!(queue.is_paused());
        queue.depth.store(0, Ordering::Relaxed);
        queue.update_watermark();
        assert!(!queue.is_paused());
    }
}
