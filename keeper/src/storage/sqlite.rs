//! SQLite Persistent Storage for the keeper
//!
//! Uses connection pooling via r2d2 for concurrent reads. Commits run in one
//! SQLite transaction and are additionally serialized by an in-process lock.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use safe_common::Chain;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

use super::traits::{Commit, Store, StorageError, StorageResult, Write};
use crate::ledger;
use crate::types::{
    now_millis, BalanceRecord, DepositRecord, LedgerTransaction, ProposalRecord, RequestRecord, RequestState,
    SafeRecord,
};

/// SQLite-backed keeper store with connection pooling
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    write_lock: Mutex<()>,
}

fn db(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// Maps unique constraint failures to `Duplicate`
fn insert_error(e: rusqlite::Error, key: impl Into<String>) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.extended_code == 1555 || err.extended_code == 2067 {
            return StorageError::Duplicate(key.into());
        }
    }
    StorageError::Database(e.to_string())
}

fn column<T>(value: String, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(StorageError::InvalidData(e.to_string())),
        )
    })
}

fn optional_column<T>(value: Option<String>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    value.map(|v| column(v, idx)).transpose()
}

fn chain_column(id: i64, idx: usize) -> rusqlite::Result<Chain> {
    Chain::from_id(id as u8).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn receivers_column(value: String, idx: usize) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn hex_column(value: String, idx: usize) -> rusqlite::Result<Vec<u8>> {
    hex::decode(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn to_json(receivers: &[String]) -> StorageResult<String> {
    serde_json::to_string(receivers).map_err(|e| StorageError::InvalidData(e.to_string()))
}

impl SqliteStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.run_migrations()?;

        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                request_id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                action INTEGER NOT NULL,
                sender TEXT NOT NULL,
                transaction_hash TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                memo TEXT NOT NULL,
                state TEXT NOT NULL,
                failure TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_requests_state ON requests(state, created_at);

            CREATE TABLE IF NOT EXISTS safes (
                holder TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                request_id TEXT NOT NULL UNIQUE,
                chain INTEGER NOT NULL,
                observer TEXT NOT NULL,
                timelock INTEGER NOT NULL,
                threshold INTEGER NOT NULL,
                receivers TEXT NOT NULL,
                path TEXT NOT NULL,
                keygen_session TEXT NOT NULL UNIQUE,
                signer TEXT,
                chain_code TEXT,
                signer_child TEXT,
                ownership_session TEXT UNIQUE,
                ownership_signature TEXT,
                address TEXT UNIQUE,
                state TEXT NOT NULL,
                halted TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deposits (
                transaction_hash TEXT NOT NULL,
                output_index INTEGER NOT NULL,
                chain INTEGER NOT NULL,
                asset_id TEXT NOT NULL,
                asset_address TEXT,
                amount TEXT NOT NULL,
                holder TEXT NOT NULL,
                sender TEXT,
                request_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (transaction_hash, output_index)
            );

            CREATE TABLE IF NOT EXISTS proposals (
                proposal_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                address TEXT NOT NULL,
                chain INTEGER NOT NULL,
                asset_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                receiver TEXT NOT NULL,
                digest TEXT NOT NULL,
                session_id TEXT NOT NULL UNIQUE,
                signature TEXT,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS observer_keys (
                public TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                trace_id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                receivers TEXT NOT NULL,
                threshold INTEGER NOT NULL,
                amount TEXT NOT NULL,
                memo TEXT NOT NULL,
                sent INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_request ON transactions(request_id);
            CREATE INDEX IF NOT EXISTS idx_transactions_sent ON transactions(sent);
            "#,
        )
        .map_err(db)?;
        conn.execute_batch(ledger::BALANCES_SCHEMA).map_err(db)?;

        Ok(())
    }

    fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<RequestRecord> {
        Ok(RequestRecord {
            id: column(row.get("request_id")?, 0)?,
            role: column(row.get("role")?, 1)?,
            action: row.get::<_, i64>("action")? as u8,
            sender: row.get("sender")?,
            transaction_hash: row.get("transaction_hash")?,
            asset_id: column(row.get("asset_id")?, 5)?,
            amount: row.get("amount")?,
            memo: row.get("memo")?,
            state: column(row.get("state")?, 8)?,
            failure: row.get("failure")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_safe(row: &rusqlite::Row) -> rusqlite::Result<SafeRecord> {
        Ok(SafeRecord {
            holder: row.get("holder")?,
            owner: row.get("owner")?,
            request_id: column(row.get("request_id")?, 2)?,
            chain: chain_column(row.get("chain")?, 3)?,
            observer: row.get("observer")?,
            timelock: row.get::<_, i64>("timelock")? as u16,
            threshold: row.get::<_, i64>("threshold")? as u8,
            receivers: receivers_column(row.get("receivers")?, 7)?,
            path: hex_column(row.get("path")?, 8)?,
            keygen_session: column(row.get("keygen_session")?, 9)?,
            signer: row.get("signer")?,
            chain_code: row.get("chain_code")?,
            signer_child: row.get("signer_child")?,
            ownership_session: optional_column(row.get("ownership_session")?, 13)?,
            ownership_signature: row.get("ownership_signature")?,
            address: row.get("address")?,
            state: column(row.get("state")?, 16)?,
            halted: row.get("halted")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_deposit(row: &rusqlite::Row) -> rusqlite::Result<DepositRecord> {
        Ok(DepositRecord {
            transaction_hash: row.get("transaction_hash")?,
            output_index: row.get::<_, i64>("output_index")? as u64,
            chain: chain_column(row.get("chain")?, 2)?,
            asset_id: column(row.get("asset_id")?, 3)?,
            asset_address: row.get("asset_address")?,
            amount: column(row.get("amount")?, 5)?,
            holder: row.get("holder")?,
            sender: row.get("sender")?,
            request_id: column(row.get("request_id")?, 8)?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_proposal(row: &rusqlite::Row) -> rusqlite::Result<ProposalRecord> {
        Ok(ProposalRecord {
            id: column(row.get("proposal_id")?, 0)?,
            holder: row.get("holder")?,
            address: row.get("address")?,
            chain: chain_column(row.get("chain")?, 3)?,
            asset_id: column(row.get("asset_id")?, 4)?,
            amount: column(row.get("amount")?, 5)?,
            receiver: row.get("receiver")?,
            digest: row.get("digest")?,
            session_id: column(row.get("session_id")?, 8)?,
            signature: row.get("signature")?,
            state: column(row.get("state")?, 10)?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<LedgerTransaction> {
        Ok(LedgerTransaction {
            trace_id: column(row.get("trace_id")?, 0)?,
            request_id: column(row.get("request_id")?, 1)?,
            asset_id: column(row.get("asset_id")?, 2)?,
            receivers: receivers_column(row.get("receivers")?, 3)?,
            threshold: row.get::<_, i64>("threshold")? as u8,
            amount: row.get("amount")?,
            memo: row.get("memo")?,
        })
    }

    fn put_safe(conn: &Connection, safe: &SafeRecord) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO safes (
                holder, owner, request_id, chain, observer, timelock, threshold,
                receivers, path, keygen_session, signer, chain_code, signer_child,
                ownership_session, ownership_signature, address, state, halted,
                created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17, ?18,
                ?19, ?20
            )
            "#,
            params![
                safe.holder,
                safe.owner,
                safe.request_id.to_string(),
                safe.chain.id() as i64,
                safe.observer,
                safe.timelock as i64,
                safe.threshold as i64,
                to_json(&safe.receivers)?,
                hex::encode(&safe.path),
                safe.keygen_session.to_string(),
                safe.signer,
                safe.chain_code,
                safe.signer_child,
                safe.ownership_session.map(|s| s.to_string()),
                safe.ownership_signature,
                safe.address,
                safe.state.to_string(),
                safe.halted,
                safe.created_at,
                safe.updated_at,
            ],
        )
        .map_err(|e| insert_error(e, safe.holder.clone()))?;
        Ok(())
    }

    fn put_proposal(conn: &Connection, proposal: &ProposalRecord) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO proposals (
                proposal_id, holder, address, chain, asset_id, amount, receiver,
                digest, session_id, signature, state, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                proposal.id.to_string(),
                proposal.holder,
                proposal.address,
                proposal.chain.id() as i64,
                proposal.asset_id.to_string(),
                proposal.amount.to_string(),
                proposal.receiver,
                proposal.digest,
                proposal.session_id.to_string(),
                proposal.signature,
                proposal.state.to_string(),
                proposal.created_at,
                proposal.updated_at,
            ],
        )
        .map_err(|e| insert_error(e, proposal.id.to_string()))?;
        Ok(())
    }

    fn insert_deposit(conn: &Connection, deposit: &DepositRecord) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT INTO deposits (
                transaction_hash, output_index, chain, asset_id, asset_address,
                amount, holder, sender, request_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                deposit.transaction_hash,
                deposit.output_index as i64,
                deposit.chain.id() as i64,
                deposit.asset_id.to_string(),
                deposit.asset_address,
                deposit.amount.to_string(),
                deposit.holder,
                deposit.sender,
                deposit.request_id.to_string(),
                deposit.created_at,
            ],
        )
        .map_err(|e| insert_error(e, format!("{}:{}", deposit.transaction_hash, deposit.output_index)))?;
        Ok(())
    }

    fn insert_transaction(conn: &Connection, tx: &LedgerTransaction) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT INTO transactions (
                trace_id, request_id, asset_id, receivers, threshold, amount, memo, sent, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
            "#,
            params![
                tx.trace_id.to_string(),
                tx.request_id.to_string(),
                tx.asset_id.to_string(),
                to_json(&tx.receivers)?,
                tx.threshold as i64,
                tx.amount,
                tx.memo,
                now_millis(),
            ],
        )
        .map_err(|e| insert_error(e, tx.trace_id.to_string()))?;
        Ok(())
    }

    fn apply_write(conn: &Connection, write: &Write) -> StorageResult<()> {
        match write {
            Write::InsertDeposit(deposit) => Self::insert_deposit(conn, deposit),
            Write::Credit {
                address,
                asset_id,
                bond_asset_id,
                amount,
            } => ledger::apply_deposit(conn, address, *asset_id, *bond_asset_id, *amount).map(|_| ()),
            Write::Debit {
                address,
                asset_id,
                amount,
            } => ledger::apply_spend(conn, address, *asset_id, *amount).map(|_| ()),
            Write::PutSafe(safe) => Self::put_safe(conn, safe),
            Write::PutProposal(proposal) => Self::put_proposal(conn, proposal),
            Write::AddObserverKey { public, request_id } => {
                conn.execute(
                    "INSERT OR IGNORE INTO observer_keys (public, request_id, created_at) VALUES (?1, ?2, ?3)",
                    params![public, request_id.to_string(), now_millis()],
                )
                .map_err(db)?;
                Ok(())
            }
        }
    }

    // Synchronous helper methods for the trait implementations

    fn insert_request_sync(&self, record: &RequestRecord) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO requests (
                request_id, role, action, sender, transaction_hash, asset_id,
                amount, memo, state, failure, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.id.to_string(),
                record.role.to_string(),
                record.action as i64,
                record.sender,
                record.transaction_hash,
                record.asset_id.to_string(),
                record.amount,
                record.memo,
                record.state.to_string(),
                record.failure,
                record.created_at,
                record.updated_at,
            ],
        )
        .map_err(|e| insert_error(e, record.id.to_string()))?;
        Ok(())
    }

    fn get_request_sync(&self, id: Uuid) -> StorageResult<Option<RequestRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM requests WHERE request_id = ?1",
            params![id.to_string()],
            Self::row_to_request,
        )
        .optional()
        .map_err(db)
    }

    fn initial_requests_sync(&self) -> StorageResult<Vec<RequestRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM requests WHERE state = 'initial' ORDER BY created_at, rowid")
            .map_err(db)?;
        let records = stmt
            .query_map([], Self::row_to_request)
            .map_err(db)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)?;
        Ok(records)
    }

    fn count_requests_sync(&self) -> StorageResult<BTreeMap<String, u64>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM requests GROUP BY state")
            .map_err(db)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))
            .map_err(db)?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (state, count) = row.map_err(db)?;
            counts.insert(state, count);
        }
        Ok(counts)
    }

    fn commit_sync(&self, commit: &Commit) -> StorageResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::Connection("write lock poisoned".to_string()))?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;

        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM requests WHERE request_id = ?1",
                params![commit.request_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        let state: RequestState = match state {
            Some(state) => state.parse().map_err(StorageError::InvalidData)?,
            None => return Err(StorageError::NotFound(commit.request_id.to_string())),
        };
        if state.is_terminal() {
            return Err(StorageError::AlreadyFinished(commit.request_id, state));
        }

        for write in &commit.writes {
            Self::apply_write(&tx, write)?;
        }
        for transaction in &commit.transactions {
            Self::insert_transaction(&tx, transaction)?;
        }
        tx.execute(
            "UPDATE requests SET state = ?2, failure = ?3, updated_at = ?4 WHERE request_id = ?1",
            params![
                commit.request_id.to_string(),
                commit.state.to_string(),
                commit.failure,
                now_millis()
            ],
        )
        .map_err(db)?;

        tx.commit().map_err(db)
    }

    fn transactions_where_sync(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> StorageResult<Vec<LedgerTransaction>> {
        let conn = self.conn()?;
        let sql = format!("SELECT * FROM transactions WHERE {} ORDER BY created_at, rowid", filter);
        let mut stmt = conn.prepare(&sql).map_err(db)?;
        let transactions = stmt
            .query_map(args, Self::row_to_transaction)
            .map_err(db)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)?;
        Ok(transactions)
    }

    fn mark_sent_sync(&self, trace_id: Uuid) -> StorageResult<()> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE transactions SET sent = 1 WHERE trace_id = ?1",
                params![trace_id.to_string()],
            )
            .map_err(db)?;
        if rows == 0 {
            return Err(StorageError::NotFound(trace_id.to_string()));
        }
        Ok(())
    }

    fn safe_where_sync(&self, filter: &str, value: String) -> StorageResult<Option<SafeRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT * FROM safes WHERE {}", filter);
        conn.query_row(&sql, params![value], Self::row_to_safe)
            .optional()
            .map_err(db)
    }

    fn set_halted_sync(&self, holder: &str, reason: Option<&str>) -> StorageResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::Connection("write lock poisoned".to_string()))?;
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE safes SET halted = ?2, updated_at = ?3 WHERE holder = ?1",
                params![holder, reason, now_millis()],
            )
            .map_err(db)?;
        if rows == 0 {
            return Err(StorageError::NotFound(holder.to_string()));
        }
        Ok(())
    }

    fn get_deposit_sync(&self, transaction_hash: &str, output_index: u64) -> StorageResult<Option<DepositRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM deposits WHERE transaction_hash = ?1 AND output_index = ?2",
            params![transaction_hash, output_index as i64],
            Self::row_to_deposit,
        )
        .optional()
        .map_err(db)
    }

    fn proposal_where_sync(&self, filter: &str, value: String) -> StorageResult<Option<ProposalRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT * FROM proposals WHERE {}", filter);
        conn.query_row(&sql, params![value], Self::row_to_proposal)
            .optional()
            .map_err(db)
    }

    fn observer_key_exists_sync(&self, public: &str) -> StorageResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM observer_keys WHERE public = ?1",
                params![public],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_request(&self, record: &RequestRecord) -> StorageResult<()> {
        self.insert_request_sync(record)
    }

    async fn get_request(&self, id: Uuid) -> StorageResult<Option<RequestRecord>> {
        self.get_request_sync(id)
    }

    async fn initial_requests(&self) -> StorageResult<Vec<RequestRecord>> {
        self.initial_requests_sync()
    }

    async fn count_requests(&self) -> StorageResult<BTreeMap<String, u64>> {
        self.count_requests_sync()
    }

    async fn commit(&self, commit: &Commit) -> StorageResult<()> {
        self.commit_sync(commit)
    }

    async fn request_transactions(&self, request_id: Uuid) -> StorageResult<Vec<LedgerTransaction>> {
        self.transactions_where_sync("request_id = ?1", &[&request_id.to_string()])
    }

    async fn unsent_transactions(&self) -> StorageResult<Vec<LedgerTransaction>> {
        self.transactions_where_sync("sent = 0", &[])
    }

    async fn mark_sent(&self, trace_id: Uuid) -> StorageResult<()> {
        self.mark_sent_sync(trace_id)
    }

    async fn get_safe(&self, holder: &str) -> StorageResult<Option<SafeRecord>> {
        self.safe_where_sync("holder = ?1", holder.to_string())
    }

    async fn safe_by_address(&self, address: &str) -> StorageResult<Option<SafeRecord>> {
        self.safe_where_sync("address = ?1", address.to_string())
    }

    async fn safe_by_session(&self, session_id: Uuid) -> StorageResult<Option<SafeRecord>> {
        self.safe_where_sync(
            "keygen_session = ?1 OR ownership_session = ?1",
            session_id.to_string(),
        )
    }

    async fn set_halted(&self, holder: &str, reason: Option<&str>) -> StorageResult<()> {
        self.set_halted_sync(holder, reason)
    }

    async fn get_deposit(&self, transaction_hash: &str, output_index: u64) -> StorageResult<Option<DepositRecord>> {
        self.get_deposit_sync(transaction_hash, output_index)
    }

    async fn read_balance(&self, address: &str, asset_id: Uuid) -> StorageResult<u128> {
        let conn = self.conn()?;
        ledger::read_balance(&conn, address, asset_id)
    }

    async fn balances(&self, address: &str) -> StorageResult<Vec<BalanceRecord>> {
        let conn = self.conn()?;
        ledger::read_balances(&conn, address)
    }

    async fn get_proposal(&self, id: Uuid) -> StorageResult<Option<ProposalRecord>> {
        self.proposal_where_sync("proposal_id = ?1", id.to_string())
    }

    async fn proposal_by_session(&self, session_id: Uuid) -> StorageResult<Option<ProposalRecord>> {
        self.proposal_where_sync("session_id = ?1", session_id.to_string())
    }

    async fn observer_key_exists(&self, public: &str) -> StorageResult<bool> {
        self.observer_key_exists_sync(public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProposalState, Role, SafeState};

    fn request(id: Uuid) -> RequestRecord {
        RequestRecord {
            id,
            role: Role::Observer,
            action: 120,
            sender: "observer".to_string(),
            transaction_hash: "ab".repeat(32),
            asset_id: Uuid::new_v4(),
            amount: "0.001".to_string(),
            memo: "bWVtbw==".to_string(),
            state: RequestState::Initial,
            failure: None,
            created_at: now_millis(),
            updated_at: now_millis(),
        }
    }

    fn safe(holder: &str) -> SafeRecord {
        SafeRecord {
            holder: holder.to_string(),
            owner: "holder-conversation".to_string(),
            request_id: Uuid::new_v4(),
            chain: Chain::Bitcoin,
            observer: "03".repeat(33),
            timelock: 144,
            threshold: 1,
            receivers: vec![Uuid::new_v4().to_string()],
            path: vec![3, 1, 2, 3],
            keygen_session: Uuid::new_v4(),
            signer: None,
            chain_code: None,
            signer_child: None,
            ownership_session: None,
            ownership_signature: None,
            address: None,
            state: SafeState::Pending,
            halted: None,
            created_at: now_millis(),
            updated_at: now_millis(),
        }
    }

    fn deposit(request_id: Uuid, hash: &str) -> DepositRecord {
        DepositRecord {
            transaction_hash: hash.to_string(),
            output_index: 1,
            chain: Chain::Bitcoin,
            asset_id: Chain::Bitcoin.native_asset_id(),
            asset_address: None,
            amount: 50_000,
            holder: "02".repeat(33),
            sender: None,
            request_id,
            created_at: now_millis(),
        }
    }

    fn transaction(request_id: Uuid) -> LedgerTransaction {
        LedgerTransaction {
            trace_id: Uuid::new_v4(),
            request_id,
            asset_id: Uuid::new_v4(),
            receivers: vec!["r1".to_string(), "r2".to_string()],
            threshold: 2,
            amount: "0.00050000".to_string(),
            memo: String::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_request() {
        let store = SqliteStore::in_memory().unwrap();
        let record = request(Uuid::new_v4());
        store.insert_request(&record).await.unwrap();

        let loaded = store.get_request(record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(matches!(
            store.insert_request(&record).await,
            Err(StorageError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_applies_everything_once() {
        let store = SqliteStore::in_memory().unwrap();
        let record = request(Uuid::new_v4());
        store.insert_request(&record).await.unwrap();

        let address = "bc1qsafe".to_string();
        let asset = Chain::Bitcoin.native_asset_id();
        let tx = transaction(record.id);
        let commit = Commit::done(
            record.id,
            vec![
                Write::InsertDeposit(deposit(record.id, "aa")),
                Write::Credit {
                    address: address.clone(),
                    asset_id: asset,
                    bond_asset_id: Uuid::new_v4(),
                    amount: 50_000,
                },
            ],
            vec![tx.clone()],
        );
        store.commit(&commit).await.unwrap();

        assert_eq!(store.read_balance(&address, asset).await.unwrap(), 50_000);
        assert_eq!(store.request_transactions(record.id).await.unwrap(), vec![tx]);
        let loaded = store.get_request(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Done);

        let again = store.commit(&commit).await;
        assert!(matches!(again, Err(StorageError::AlreadyFinished(_, RequestState::Done))));
        assert_eq!(store.read_balance(&address, asset).await.unwrap(), 50_000);
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let store = SqliteStore::in_memory().unwrap();
        let first = request(Uuid::new_v4());
        let second = request(Uuid::new_v4());
        store.insert_request(&first).await.unwrap();
        store.insert_request(&second).await.unwrap();
        store
            .commit(&Commit::done(first.id, vec![Write::InsertDeposit(deposit(first.id, "bb"))], vec![]))
            .await
            .unwrap();

        let asset = Uuid::new_v4();
        let commit = Commit::done(
            second.id,
            vec![
                Write::Credit {
                    address: "bc1qsafe".to_string(),
                    asset_id: asset,
                    bond_asset_id: Uuid::new_v4(),
                    amount: 10,
                },
                Write::InsertDeposit(deposit(second.id, "bb")),
            ],
            vec![transaction(second.id)],
        );
        assert!(matches!(store.commit(&commit).await, Err(StorageError::Duplicate(_))));

        assert_eq!(store.read_balance("bc1qsafe", asset).await.unwrap(), 0);
        assert!(store.request_transactions(second.id).await.unwrap().is_empty());
        let loaded = store.get_request(second.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Initial);
    }

    #[tokio::test]
    async fn test_overdraft_rolls_back() {
        let store = SqliteStore::in_memory().unwrap();
        let record = request(Uuid::new_v4());
        store.insert_request(&record).await.unwrap();

        let commit = Commit::done(
            record.id,
            vec![Write::Debit {
                address: "0xsafe".to_string(),
                asset_id: Uuid::new_v4(),
                amount: 1,
            }],
            vec![],
        );
        assert!(matches!(
            store.commit(&commit).await,
            Err(StorageError::NegativeBalance { .. })
        ));
        assert_eq!(store.initial_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_initial_requests_in_creation_order() {
        let store = SqliteStore::in_memory().unwrap();
        let mut first = request(Uuid::new_v4());
        first.created_at = 10;
        let mut second = request(Uuid::new_v4());
        second.created_at = 20;
        store.insert_request(&second).await.unwrap();
        store.insert_request(&first).await.unwrap();

        let ids: Vec<Uuid> = store.initial_requests().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);

        store.commit(&Commit::failed(first.id, "malformed")).await.unwrap();
        let ids: Vec<Uuid> = store.initial_requests().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id]);

        let counts = store.count_requests().await.unwrap();
        assert_eq!(counts.get("failed"), Some(&1));
        assert_eq!(counts.get("initial"), Some(&1));
    }

    #[tokio::test]
    async fn test_safe_lookups() {
        let store = SqliteStore::in_memory().unwrap();
        let record = request(Uuid::new_v4());
        store.insert_request(&record).await.unwrap();

        let mut safe = safe(&"02".repeat(33));
        safe.ownership_session = Some(Uuid::new_v4());
        safe.address = Some("bc1qsafe".to_string());
        store
            .commit(&Commit::done(record.id, vec![Write::PutSafe(safe.clone())], vec![]))
            .await
            .unwrap();

        assert_eq!(store.get_safe(&safe.holder).await.unwrap().unwrap(), safe);
        assert_eq!(store.safe_by_address("bc1qsafe").await.unwrap().unwrap(), safe);
        assert_eq!(store.safe_by_session(safe.keygen_session).await.unwrap().unwrap(), safe);
        assert_eq!(
            store.safe_by_session(safe.ownership_session.unwrap()).await.unwrap().unwrap(),
            safe
        );
        assert!(store.safe_by_session(Uuid::new_v4()).await.unwrap().is_none());

        store.set_halted(&safe.holder, Some("negative balance")).await.unwrap();
        let halted = store.get_safe(&safe.holder).await.unwrap().unwrap();
        assert_eq!(halted.halted.as_deref(), Some("negative balance"));
        store.set_halted(&safe.holder, None).await.unwrap();
        assert!(store.get_safe(&safe.holder).await.unwrap().unwrap().halted.is_none());
        assert!(matches!(
            store.set_halted("unknown", None).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_proposals_and_observer_keys() {
        let store = SqliteStore::in_memory().unwrap();
        let record = request(Uuid::new_v4());
        store.insert_request(&record).await.unwrap();

        let proposal = ProposalRecord {
            id: record.id,
            holder: "02".repeat(33),
            address: "0xsafe".to_string(),
            chain: Chain::Ethereum,
            asset_id: Chain::Ethereum.native_asset_id(),
            amount: 1_000_000_000_000_000_000_000,
            receiver: "0xreceiver".to_string(),
            digest: "11".repeat(32),
            session_id: Uuid::new_v4(),
            signature: None,
            state: ProposalState::Pending,
            created_at: now_millis(),
            updated_at: now_millis(),
        };
        store
            .commit(&Commit::done(
                record.id,
                vec![
                    Write::PutProposal(proposal.clone()),
                    Write::AddObserverKey {
                        public: "03".repeat(33),
                        request_id: record.id,
                    },
                ],
                vec![],
            ))
            .await
            .unwrap();

        assert_eq!(store.get_proposal(record.id).await.unwrap().unwrap(), proposal);
        assert_eq!(
            store.proposal_by_session(proposal.session_id).await.unwrap().unwrap(),
            proposal
        );
        assert!(store.observer_key_exists(&"03".repeat(33)).await.unwrap());
        assert!(!store.observer_key_exists(&"02".repeat(33)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsent_transactions() {
        let store = SqliteStore::in_memory().unwrap();
        let record = request(Uuid::new_v4());
        store.insert_request(&record).await.unwrap();
        let first = transaction(record.id);
        let second = transaction(record.id);
        store
            .commit(&Commit::done(record.id, vec![], vec![first.clone(), second.clone()]))
            .await
            .unwrap();

        assert_eq!(store.unsent_transactions().await.unwrap().len(), 2);
        store.mark_sent(first.trace_id).await.unwrap();
        assert_eq!(store.unsent_transactions().await.unwrap(), vec![second]);
        assert!(matches!(
            store.mark_sent(Uuid::new_v4()).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
