//! Fixtures shared by unit tests

use safe_common::Chain;
use uuid::Uuid;

use crate::storage::{Commit, SqliteStore, Store, Write};
use crate::types::{now_millis, RequestRecord, RequestState, Role, SafeRecord, SafeState};

pub const HOLDER: &str = "02a34b99f22c790c4e36b2b3c2c35a36db06226e41c692fc82b8b56ac1c540c5bd";

pub fn request(role: Role, action: u8) -> RequestRecord {
    RequestRecord {
        id: Uuid::new_v4(),
        role,
        action,
        sender: "holder-conversation".to_string(),
        transaction_hash: "cd".repeat(32),
        asset_id: Uuid::new_v4(),
        amount: "0.00000001".to_string(),
        memo: String::new(),
        state: RequestState::Initial,
        failure: None,
        created_at: now_millis(),
        updated_at: now_millis(),
    }
}

pub fn approved_safe(chain: Chain, address: &str) -> SafeRecord {
    SafeRecord {
        holder: HOLDER.to_string(),
        owner: "holder-conversation".to_string(),
        request_id: Uuid::new_v4(),
        chain,
        observer: "03".repeat(33),
        timelock: 144,
        threshold: 1,
        receivers: vec!["receiver-1".to_string()],
        path: vec![3, 1, 2, 3],
        keygen_session: Uuid::new_v4(),
        signer: Some("02".repeat(33)),
        chain_code: Some("00".repeat(32)),
        signer_child: Some("03".repeat(33)),
        ownership_session: Some(Uuid::new_v4()),
        ownership_signature: Some("11".repeat(64)),
        address: Some(address.to_string()),
        state: SafeState::Approved,
        halted: None,
        created_at: now_millis(),
        updated_at: now_millis(),
    }
}

/// Applies `writes` through a throwaway request
pub async fn seed(store: &SqliteStore, writes: Vec<Write>) {
    let record = request(Role::Holder, 0);
    store.insert_request(&record).await.unwrap();
    store.commit(&Commit::done(record.id, writes, vec![])).await.unwrap();
}
