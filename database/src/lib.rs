//! SQLite Store for the Velora Mining Pool
//!
//! Durable implementation of the `velora-storage` contract. One connection
//! behind an async mutex serializes all callers; every multi-row operation
//! runs inside a transaction.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

use velora_core::{
    BlockRecord, BlockRewardRecord, BlockStatus, LeaderboardEntry, MinerRecord, ShareRecord,
};
use velora_storage::{miner_key, Store, StorageError};
use velora_util::now_ms;

/// Database error types
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl From<DatabaseError> for StorageError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(msg) => StorageError::NotFound(msg),
            DatabaseError::InvalidData(msg) => StorageError::InvalidData(msg),
            _ => StorageError::Database(err.to_string()),
        }
    }
}

fn sqlite_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// SQLite-backed pool store.
pub struct SqliteStore {
    /// Database connection
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the pool database at the given path.
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        Self::create_tables(&conn)?;

        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database; used by tests.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;

        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create database tables
    fn create_tables(conn: &Connection) -> Result<(), DatabaseError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS miners (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                worker_name TEXT NOT NULL,
                hashrate REAL NOT NULL DEFAULT 0,
                shares INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS shares (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                miner_id TEXT NOT NULL,
                address TEXT NOT NULL,
                worker TEXT NOT NULL,
                job_id TEXT NOT NULL,
                extra_nonce2 TEXT,
                n_time TEXT NOT NULL,
                nonce TEXT NOT NULL,
                difficulty INTEGER NOT NULL,
                is_valid INTEGER NOT NULL,
                is_block INTEGER NOT NULL,
                ts INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                height INTEGER PRIMARY KEY,
                hash TEXT UNIQUE NOT NULL,
                previous_hash TEXT NOT NULL,
                merkle_root TEXT NOT NULL,
                ts INTEGER NOT NULL,
                nonce INTEGER NOT NULL,
                difficulty INTEGER NOT NULL,
                found_by TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS block_rewards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                block_height INTEGER NOT NULL,
                block_hash TEXT NOT NULL,
                miner_address TEXT NOT NULL,
                base_reward INTEGER NOT NULL,
                pool_fee INTEGER NOT NULL,
                miner_reward INTEGER NOT NULL,
                miner_percentage REAL NOT NULL,
                ts INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS leaderboard (
                address TEXT PRIMARY KEY,
                confirmed_balance INTEGER NOT NULL DEFAULT 0,
                unconfirmed_balance INTEGER NOT NULL DEFAULT 0,
                total_paid INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_shares_ts ON shares(ts)", [])?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_shares_miner ON shares(miner_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_blocks_status ON blocks(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rewards_address ON block_rewards(miner_address)",
            [],
        )?;

        Ok(())
    }
}

fn row_to_miner(row: &rusqlite::Row<'_>) -> rusqlite::Result<MinerRecord> {
    Ok(MinerRecord {
        key: row.get(0)?,
        address: row.get(1)?,
        worker: row.get(2)?,
        hashrate: row.get(3)?,
        shares: row.get(4)?,
        last_seen: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_share(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShareRecord> {
    Ok(ShareRecord {
        miner_key: row.get(0)?,
        address: row.get(1)?,
        worker: row.get(2)?,
        job_id: row.get(3)?,
        extra_nonce2: row.get(4)?,
        ntime: row.get(5)?,
        nonce: row.get(6)?,
        difficulty: row.get(7)?,
        is_valid: row.get(8)?,
        is_block: row.get(9)?,
        timestamp: row.get(10)?,
    })
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRecord> {
    let status_str: String = row.get(8)?;
    Ok(BlockRecord {
        height: row.get(0)?,
        hash: row.get(1)?,
        previous_hash: row.get(2)?,
        merkle_root: row.get(3)?,
        timestamp: row.get(4)?,
        nonce: row.get(5)?,
        difficulty: row.get(6)?,
        found_by: row.get(7)?,
        status: BlockStatus::parse(&status_str).unwrap_or(BlockStatus::Found),
        created_at: row.get(9)?,
    })
}

const BLOCK_COLUMNS: &str =
    "height, hash, previous_hash, merkle_root, ts, nonce, difficulty, found_by, status, created_at";

#[async_trait]
impl Store for SqliteStore {
    async fn register_miner(
        &self,
        address: &str,
        worker: &str,
    ) -> Result<MinerRecord, StorageError> {
        let key = miner_key(address, worker);
        let now = now_ms();
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT INTO miners (id, address, worker_name, hashrate, shares, last_seen, created_at)
             VALUES (?, ?, ?, 0, 0, ?, ?)
             ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen",
            params![key, address, worker, now, now],
        )
        .map_err(sqlite_err)?;

        conn.query_row(
            "SELECT id, address, worker_name, hashrate, shares, last_seen, created_at
             FROM miners WHERE id = ?",
            params![key],
            row_to_miner,
        )
        .map_err(sqlite_err)
    }

    async fn get_miner(&self, key: &str) -> Result<MinerRecord, StorageError> {
        let conn = self.conn.lock().await;

        conn.query_row(
            "SELECT id, address, worker_name, hashrate, shares, last_seen, created_at
             FROM miners WHERE id = ?",
            params![key],
            row_to_miner,
        )
        .optional()
        .map_err(sqlite_err)?
        .ok_or_else(|| StorageError::NotFound(format!("Miner not found: {}", key)))
    }

    async fn update_miner_stats(
        &self,
        key: &str,
        hashrate: f64,
        shares: u64,
        last_seen: u64,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;

        let updated = conn
            .execute(
                "UPDATE miners SET hashrate = ?, shares = ?, last_seen = ? WHERE id = ?",
                params![hashrate, shares, last_seen, key],
            )
            .map_err(sqlite_err)?;

        if updated == 0 {
            return Err(StorageError::NotFound(format!("Miner not found: {}", key)));
        }

        Ok(())
    }

    async fn record_share(&self, share: ShareRecord) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT INTO shares
             (miner_id, address, worker, job_id, extra_nonce2, n_time, nonce, difficulty, is_valid, is_block, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                share.miner_key,
                share.address,
                share.worker,
                share.job_id,
                share.extra_nonce2,
                share.ntime,
                share.nonce,
                share.difficulty,
                share.is_valid,
                share.is_block,
                share.timestamp,
            ],
        )
        .map_err(sqlite_err)?;

        Ok(())
    }

    async fn shares_since(&self, since_ms: u64) -> Result<Vec<ShareRecord>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT miner_id, address, worker, job_id, extra_nonce2, n_time, nonce,
                        difficulty, is_valid, is_block, ts
                 FROM shares WHERE ts >= ? ORDER BY ts",
            )
            .map_err(sqlite_err)?;

        let shares = stmt
            .query_map(params![since_ms], row_to_share)
            .map_err(sqlite_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sqlite_err)?;

        Ok(shares)
    }

    async fn prune_shares_before(&self, before_ms: u64) -> Result<u64, StorageError> {
        let conn = self.conn.lock().await;

        let deleted = conn
            .execute("DELETE FROM shares WHERE ts < ?", params![before_ms])
            .map_err(sqlite_err)?;

        if deleted > 0 {
            debug!("Pruned {} share rows older than {}", deleted, before_ms);
        }

        Ok(deleted as u64)
    }

    async fn insert_block(&self, block: BlockRecord) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;

        // Hashes are fixed-length lowercase hex, so string comparison is
        // numeric comparison: a smaller hash is a better hash.
        let written = conn
            .execute(
                "INSERT INTO blocks
                 (height, hash, previous_hash, merkle_root, ts, nonce, difficulty, found_by, status, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(height) DO UPDATE SET
                     hash = excluded.hash,
                     previous_hash = excluded.previous_hash,
                     merkle_root = excluded.merkle_root,
                     ts = excluded.ts,
                     nonce = excluded.nonce,
                     difficulty = excluded.difficulty,
                     found_by = excluded.found_by,
                     created_at = excluded.created_at
                 WHERE excluded.hash < blocks.hash",
                params![
                    block.height,
                    block.hash,
                    block.previous_hash,
                    block.merkle_root,
                    block.timestamp,
                    block.nonce,
                    block.difficulty,
                    block.found_by,
                    block.status.as_str(),
                    block.created_at,
                ],
            )
            .map_err(sqlite_err)?;

        Ok(written > 0)
    }

    async fn get_block(&self, height: u64) -> Result<BlockRecord, StorageError> {
        let conn = self.conn.lock().await;

        conn.query_row(
            &format!("SELECT {} FROM blocks WHERE height = ?", BLOCK_COLUMNS),
            params![height],
            row_to_block,
        )
        .optional()
        .map_err(sqlite_err)?
        .ok_or_else(|| StorageError::NotFound(format!("Block at height {} not found", height)))
    }

    async fn blocks_by_status(
        &self,
        status: BlockStatus,
    ) -> Result<Vec<BlockRecord>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM blocks WHERE status = ? ORDER BY height",
                BLOCK_COLUMNS
            ))
            .map_err(sqlite_err)?;

        let blocks = stmt
            .query_map(params![status.as_str()], row_to_block)
            .map_err(sqlite_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sqlite_err)?;

        Ok(blocks)
    }

    async fn set_block_status(
        &self,
        height: u64,
        status: BlockStatus,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;

        let updated = conn
            .execute(
                "UPDATE blocks SET status = ? WHERE height = ?",
                params![status.as_str(), height],
            )
            .map_err(sqlite_err)?;

        if updated == 0 {
            return Err(StorageError::NotFound(format!(
                "Block at height {} not found",
                height
            )));
        }

        Ok(())
    }

    async fn insert_rewards(&self, rewards: Vec<BlockRewardRecord>) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sqlite_err)?;

        for reward in &rewards {
            tx.execute(
                "INSERT INTO block_rewards
                 (block_height, block_hash, miner_address, base_reward, pool_fee, miner_reward, miner_percentage, ts)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    reward.block_height,
                    reward.block_hash,
                    reward.miner_address,
                    reward.base_reward,
                    reward.pool_fee,
                    reward.miner_reward,
                    reward.miner_percentage,
                    reward.timestamp,
                ],
            )
            .map_err(sqlite_err)?;
        }

        tx.commit().map_err(sqlite_err)?;
        Ok(())
    }

    async fn recompute_balances(&self) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sqlite_err)?;

        // Rebuild both balance columns from the reward rows; never
        // incremental, so a repeated pass yields identical sums.
        tx.execute(
            "INSERT INTO leaderboard (address, confirmed_balance, unconfirmed_balance, total_paid)
             SELECT r.miner_address,
                    COALESCE(SUM(CASE WHEN b.status = 'confirmed' THEN r.miner_reward ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN b.status IS NULL OR b.status != 'confirmed' THEN r.miner_reward ELSE 0 END), 0),
                    0
             FROM block_rewards r
             LEFT JOIN blocks b ON b.height = r.block_height
             GROUP BY r.miner_address
             ON CONFLICT(address) DO UPDATE SET
                 confirmed_balance = excluded.confirmed_balance,
                 unconfirmed_balance = excluded.unconfirmed_balance",
            [],
        )
        .map_err(sqlite_err)?;

        tx.execute(
            "UPDATE leaderboard SET confirmed_balance = 0, unconfirmed_balance = 0
             WHERE address NOT IN (SELECT DISTINCT miner_address FROM block_rewards)",
            [],
        )
        .map_err(sqlite_err)?;

        tx.commit().map_err(sqlite_err)?;
        Ok(())
    }

    async fn leaderboard_entry(&self, address: &str) -> Result<LeaderboardEntry, StorageError> {
        let conn = self.conn.lock().await;

        let entry = conn
            .query_row(
                "SELECT address, confirmed_balance, unconfirmed_balance, total_paid
                 FROM leaderboard WHERE address = ?",
                params![address],
                |row| {
                    Ok(LeaderboardEntry {
                        address: row.get(0)?,
                        confirmed_balance: row.get(1)?,
                        unconfirmed_balance: row.get(2)?,
                        total_paid: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(sqlite_err)?;

        Ok(entry.unwrap_or_else(|| LeaderboardEntry {
            address: address.to_string(),
            ..Default::default()
        }))
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            debug!("Checkpoint on flush skipped: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u64, hash: &str, status: BlockStatus) -> BlockRecord {
        BlockRecord {
            height,
            hash: hash.to_string(),
            previous_hash: "00".repeat(32),
            merkle_root: "11".repeat(32),
            timestamp: 1_000,
            nonce: 42,
            difficulty: 1_000_000,
            found_by: "1Addr.rig1".to_string(),
            status,
            created_at: 1_000,
        }
    }

    fn reward(height: u64, address: &str, amount: u64) -> BlockRewardRecord {
        BlockRewardRecord {
            block_height: height,
            block_hash: "0f".repeat(32),
            miner_address: address.to_string(),
            base_reward: 5_000_000_000,
            pool_fee: 50_000_000,
            miner_reward: amount,
            miner_percentage: 0.5,
            timestamp: 0,
        }
    }

    fn share(ts: u64, valid: bool) -> ShareRecord {
        ShareRecord {
            miner_key: "1Addr.rig1".to_string(),
            address: "1Addr".to_string(),
            worker: "rig1".to_string(),
            job_id: "0000000000000001".to_string(),
            extra_nonce2: Some("00000000".to_string()),
            ntime: "65a0cf00".to_string(),
            nonce: "deadbeef".to_string(),
            difficulty: 1000,
            is_valid: valid,
            is_block: false,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_miner_registration_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();

        let miner = store.register_miner("1Addr", "rig1").await.unwrap();
        assert_eq!(miner.key, "1Addr.rig1");

        // Re-registration keeps the row (no duplicate key).
        let again = store.register_miner("1Addr", "rig1").await.unwrap();
        assert_eq!(again.created_at, miner.created_at);

        store
            .update_miner_stats("1Addr.rig1", 1234.5, 10, 99)
            .await
            .unwrap();
        let updated = store.get_miner("1Addr.rig1").await.unwrap();
        assert_eq!(updated.shares, 10);
        assert_eq!(updated.last_seen, 99);
    }

    #[tokio::test]
    async fn test_share_persistence_and_window() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.record_share(share(1_000, true)).await.unwrap();
        store.record_share(share(2_000, false)).await.unwrap();
        store.record_share(share(3_000, true)).await.unwrap();

        let window = store.shares_since(2_000).await.unwrap();
        assert_eq!(window.len(), 2);
        assert!(!window[0].is_valid);

        assert_eq!(store.prune_shares_before(2_500).await.unwrap(), 2);
        assert_eq!(store.shares_since(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_block_dedupe_better_hash_replaces() {
        let store = SqliteStore::open_in_memory().unwrap();
        let worse = format!("{}ffff", "0".repeat(60));
        let better = format!("{}000f", "0".repeat(60));

        assert!(store
            .insert_block(block(5, &worse, BlockStatus::Found))
            .await
            .unwrap());
        assert!(!store
            .insert_block(block(5, &worse, BlockStatus::Found))
            .await
            .unwrap());
        assert!(store
            .insert_block(block(5, &better, BlockStatus::Found))
            .await
            .unwrap());

        assert_eq!(store.get_block(5).await.unwrap().hash, better);
    }

    #[tokio::test]
    async fn test_status_transition_and_listing() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_block(block(1, &"0a".repeat(32), BlockStatus::Found))
            .await
            .unwrap();
        store
            .insert_block(block(2, &"0b".repeat(32), BlockStatus::Found))
            .await
            .unwrap();

        store
            .set_block_status(1, BlockStatus::Confirmed)
            .await
            .unwrap();

        let found = store.blocks_by_status(BlockStatus::Found).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].height, 2);

        let confirmed = store
            .blocks_by_status(BlockStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].height, 1);
    }

    #[tokio::test]
    async fn test_balance_recompute_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_block(block(1, &"0a".repeat(32), BlockStatus::Found))
            .await
            .unwrap();
        store
            .insert_rewards(vec![reward(1, "1AddrA", 1_485_000_000), reward(1, "1AddrB", 3_465_000_000)])
            .await
            .unwrap();

        store.recompute_balances().await.unwrap();
        let a = store.leaderboard_entry("1AddrA").await.unwrap();
        assert_eq!(a.unconfirmed_balance, 1_485_000_000);
        assert_eq!(a.confirmed_balance, 0);

        store
            .set_block_status(1, BlockStatus::Confirmed)
            .await
            .unwrap();
        store.recompute_balances().await.unwrap();
        store.recompute_balances().await.unwrap();

        let a = store.leaderboard_entry("1AddrA").await.unwrap();
        let b = store.leaderboard_entry("1AddrB").await.unwrap();
        assert_eq!(a.confirmed_balance, 1_485_000_000);
        assert_eq!(a.unconfirmed_balance, 0);
        assert_eq!(b.confirmed_balance, 3_465_000_000);
    }

    #[tokio::test]
    async fn test_unknown_address_reads_zeroed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let entry = store.leaderboard_entry("1Nobody").await.unwrap();
        assert_eq!(entry.confirmed_balance, 0);
        assert_eq!(entry.unconfirmed_balance, 0);
    }
}
