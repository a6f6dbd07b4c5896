//! Safe balance ledger
//!
//! Balances are kept per (safe address, asset) together with the bond asset
//! the safe's receivers hold for it. Amounts are integers in the chain's
//! smallest unit, stored as decimal text so EVM amounts fit.
//!
//! The mutating functions run on the caller's SQLite transaction; a spend
//! that would take a balance below zero fails before anything is written.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::storage::StorageError;
use crate::types::{now_millis, BalanceRecord};

pub(crate) const BALANCES_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS balances (
        address TEXT NOT NULL,
        asset_id TEXT NOT NULL,
        bond_asset_id TEXT NOT NULL,
        balance TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (address, asset_id)
    );
"#;

fn db(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

pub fn parse_amount(value: &str) -> Result<u128, StorageError> {
    value
        .parse()
        .map_err(|_| StorageError::InvalidData(format!("invalid amount {}", value)))
}

/// Renders `value` smallest units as a decimal with `decimals` places
pub fn format_amount(value: u128, decimals: u32) -> String {
    if decimals == 0 {
        return value.to_string();
    }
    let places = decimals as usize;
    let digits = format!("{:0>width$}", value, width = places + 1);
    let (whole, fraction) = digits.split_at(digits.len() - places);
    format!("{}.{}", whole, fraction)
}

pub fn read_balance(conn: &Connection, address: &str, asset_id: Uuid) -> Result<u128, StorageError> {
    let balance: Option<String> = conn
        .query_row(
            "SELECT balance FROM balances WHERE address = ?1 AND asset_id = ?2",
            params![address, asset_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db)?;
    match balance {
        Some(balance) => parse_amount(&balance),
        None => Ok(0),
    }
}

pub fn read_balances(conn: &Connection, address: &str) -> Result<Vec<BalanceRecord>, StorageError> {
    let mut stmt = conn
        .prepare(
            "SELECT address, asset_id, bond_asset_id, balance, updated_at FROM balances
             WHERE address = ?1 ORDER BY asset_id",
        )
        .map_err(db)?;
    let rows = stmt
        .query_map(params![address], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })
        .map_err(db)?;

    let mut balances = Vec::new();
    for row in rows {
        let (address, asset_id, bond_asset_id, balance, updated_at) = row.map_err(db)?;
        balances.push(BalanceRecord {
            address,
            asset_id: parse_uuid(&asset_id)?,
            bond_asset_id: parse_uuid(&bond_asset_id)?,
            balance: parse_amount(&balance)?,
            updated_at,
        });
    }
    Ok(balances)
}

fn parse_uuid(value: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(value).map_err(|e| StorageError::InvalidData(e.to_string()))
}

/// Credits `delta` and returns the new balance
pub fn apply_deposit(
    conn: &Connection,
    address: &str,
    asset_id: Uuid,
    bond_asset_id: Uuid,
    delta: u128,
) -> Result<u128, StorageError> {
    let current = read_balance(conn, address, asset_id)?;
    let next = current
        .checked_add(delta)
        .ok_or_else(|| StorageError::InvalidData(format!("balance overflow at {}", address)))?;
    conn.execute(
        r#"
        INSERT INTO balances (address, asset_id, bond_asset_id, balance, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(address, asset_id) DO UPDATE SET
            balance = excluded.balance,
            updated_at = excluded.updated_at
        "#,
        params![
            address,
            asset_id.to_string(),
            bond_asset_id.to_string(),
            next.to_string(),
            now_millis()
        ],
    )
    .map_err(db)?;
    Ok(next)
}

/// Debits `delta` and returns the new balance
pub fn apply_spend(conn: &Connection, address: &str, asset_id: Uuid, delta: u128) -> Result<u128, StorageError> {
    let current = read_balance(conn, address, asset_id)?;
    let next = current
        .checked_sub(delta)
        .ok_or_else(|| StorageError::NegativeBalance {
            address: address.to_string(),
            asset_id,
        })?;
    if delta == 0 {
        return Ok(current);
    }
    conn.execute(
        "UPDATE balances SET balance = ?3, updated_at = ?4 WHERE address = ?1 AND asset_id = ?2",
        params![address, asset_id.to_string(), next.to_string(), now_millis()],
    )
    .map_err(db)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(BALANCES_SCHEMA).unwrap();
        conn
    }

    #[test]
    fn test_absent_balance_is_zero() {
        let conn = conn();
        assert_eq!(read_balance(&conn, "bc1qsafe", Uuid::new_v4()).unwrap(), 0);
    }

    #[test]
    fn test_deposit_then_spend() {
        let conn = conn();
        let asset = Uuid::new_v4();
        let bond = Uuid::new_v4();
        assert_eq!(apply_deposit(&conn, "bc1qsafe", asset, bond, 50_000).unwrap(), 50_000);
        assert_eq!(apply_deposit(&conn, "bc1qsafe", asset, bond, 25_000).unwrap(), 75_000);
        assert_eq!(apply_spend(&conn, "bc1qsafe", asset, 70_000).unwrap(), 5_000);
        assert_eq!(read_balance(&conn, "bc1qsafe", asset).unwrap(), 5_000);

        let balances = read_balances(&conn, "bc1qsafe").unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].bond_asset_id, bond);
    }

    #[test]
    fn test_overdraft_is_rejected_without_writing() {
        let conn = conn();
        let asset = Uuid::new_v4();
        apply_deposit(&conn, "0xsafe", asset, Uuid::new_v4(), 10).unwrap();
        let result = apply_spend(&conn, "0xsafe", asset, 11);
        assert!(matches!(result, Err(StorageError::NegativeBalance { .. })));
        assert_eq!(read_balance(&conn, "0xsafe", asset).unwrap(), 10);

        let result = apply_spend(&conn, "0xother", asset, 1);
        assert!(matches!(result, Err(StorageError::NegativeBalance { .. })));
    }

    #[test]
    fn test_amounts_beyond_i64_fit() {
        let conn = conn();
        let asset = Uuid::new_v4();
        let wei = 5_000_000_000_000_000_000_000u128;
        apply_deposit(&conn, "0xsafe", asset, Uuid::new_v4(), wei).unwrap();
        assert_eq!(read_balance(&conn, "0xsafe", asset).unwrap(), wei);
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(50_000, 8), "0.00050000");
        assert_eq!(format_amount(123_456_789, 8), "1.23456789");
        assert_eq!(format_amount(1, 18), "0.000000000000000001");
        assert_eq!(format_amount(42, 0), "42");
    }
}
