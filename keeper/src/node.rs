//! Keeper node
//!
//! Every inbound transfer becomes a persisted request that is handled at
//! most once to a terminal state. A handler never writes anything itself;
//! it describes the outcome as a [`Commit`] that the store applies in one
//! transaction together with the request state, and only then are the
//! emitted ledger transactions published.
//!
//! Requests are serialized per lane: the holder key of the safe they touch,
//! or a shared lane for requests without a safe. Different safes never wait
//! on each other. Lane locks and lane workers are dropped once idle.

use safe_common::ids::{session_id, trace_id};
use safe_common::logging::{audit, AuditKind};
use safe_common::{
    derive_public, fingerprint, verify_signature, BusFrame, DerivationPath, GroupBus, Operation, OperationCipher,
    Scheme, Transfer,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::KeeperConfig;
use crate::deposit::{Deposit, DepositVerifier};
use crate::error::{KeeperError, Result};
use crate::request::{Action, Request, SafeProposal, TransactionProposal};
use crate::rpc::ChainClients;
use crate::safe::{ownership_digest, parse_key, proposal_digest, safe_address, safe_path};
use crate::storage::{Commit, StorageError, Store, Write};
use crate::types::{
    now_millis, LedgerTransaction, ProposalRecord, ProposalState, RequestRecord, RequestState, SafeRecord, SafeState,
};

/// Nominal amount of the transfers carrying operations to the signers
pub const OPERATION_AMOUNT: &str = "0.00000001";

const OBSERVER_LANE: &str = "observers";
const SIGNER_LANE: &str = "signers";
const REJECT_LANE: &str = "rejects";

/// A lane worker with nothing queued for this long exits
const WORKER_IDLE: Duration = Duration::from_secs(30);

/// Where a request ended up after one processing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed(String),
    /// Left initial; a later replay picks it up
    Deferred(String),
    /// Left initial because its safe is halted
    Halted(String),
}

impl Outcome {
    fn stored(record: &RequestRecord) -> Self {
        match record.state {
            RequestState::Done => Outcome::Done,
            RequestState::Failed => Outcome::Failed(record.failure.clone().unwrap_or_default()),
            RequestState::Initial => Outcome::Deferred("initial".to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Done | Outcome::Failed(_))
    }
}

pub struct KeeperNode {
    config: KeeperConfig,
    store: Arc<dyn Store>,
    bus: Arc<dyn GroupBus>,
    cipher: OperationCipher,
    verifier: DepositVerifier,
    lanes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    replaying: AtomicBool,
    worker_idle: Duration,
}

impl KeeperNode {
    pub fn new(
        config: KeeperConfig,
        store: Arc<dyn Store>,
        bus: Arc<dyn GroupBus>,
        clients: ChainClients,
    ) -> Result<Self> {
        let cipher = OperationCipher::from_hex(&config.operation_key)?;
        tracing::info!(
            keeper_id = %config.keeper_id,
            chains = ?clients.chains(),
            "keeper node ready"
        );
        Ok(Self {
            verifier: DepositVerifier::new(store.clone(), clients),
            config,
            store,
            bus,
            cipher,
            lanes: Mutex::new(HashMap::new()),
            replaying: AtomicBool::new(false),
            worker_idle: WORKER_IDLE,
        })
    }

    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Consumes inbound bus frames until the stream closes
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<BusFrame>) {
        match self.flush_unsent().await {
            Ok(0) => {}
            Ok(sent) => tracing::info!(sent, "published transactions left over from the last run"),
            Err(e) => tracing::warn!(error = %e, "failed to flush unsent transactions"),
        }

        let mut workers: HashMap<String, mpsc::UnboundedSender<Transfer>> = HashMap::new();
        let mut replay = tokio::time::interval(self.config.replay_interval);
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(BusFrame::Transfer(transfer)) => self.dispatch(&mut workers, transfer).await,
                    Some(BusFrame::Session(message)) => {
                        tracing::debug!(session_id = %message.session_id, "ignoring session message");
                    }
                    None => break,
                },
                _ = replay.tick() => self.spawn_replay(),
            }
        }
        tracing::info!(keeper_id = %self.config.keeper_id, "inbound bus closed, keeper node stopping");
    }

    /// Queues `transfer` on its lane worker, keeping per-lane arrival order
    async fn dispatch(self: &Arc<Self>, workers: &mut HashMap<String, mpsc::UnboundedSender<Transfer>>, transfer: Transfer) {
        let lane = self.lane_of_transfer(&transfer).await;
        workers.retain(|_, worker| !worker.is_closed());
        let worker = workers
            .entry(lane.clone())
            .or_insert_with(|| self.spawn_worker(lane.clone()));
        if let Err(mpsc::error::SendError(transfer)) = worker.send(transfer) {
            let worker = self.spawn_worker(lane.clone());
            if worker.send(transfer).is_err() {
                tracing::error!(lane = %lane, "lane worker unavailable");
            }
            workers.insert(lane, worker);
        }
    }

    fn spawn_worker(self: &Arc<Self>, lane: String) -> mpsc::UnboundedSender<Transfer> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Transfer>();
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut closing = false;
            loop {
                let next = if closing {
                    rx.recv().await
                } else {
                    match tokio::time::timeout(node.worker_idle, rx.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            // drain what was queued before the close, then exit
                            rx.close();
                            closing = true;
                            continue;
                        }
                    }
                };
                let Some(transfer) = next else { break };
                let trace_id = transfer.trace_id;
                match node.process(&transfer).await {
                    Ok(outcome) => tracing::debug!(request_id = %trace_id, lane = %lane, ?outcome, "request processed"),
                    Err(e) => tracing::warn!(request_id = %trace_id, lane = %lane, error = %e, "request left initial"),
                }
            }
            tracing::debug!(lane = %lane, "lane worker idle, exiting");
        });
        tx
    }

    fn spawn_replay(self: &Arc<Self>) {
        if self.replaying.swap(true, Ordering::SeqCst) {
            return;
        }
        let node = Arc::clone(self);
        tokio::spawn(async move {
            match node.replay_initial().await {
                Ok(0) => {}
                Ok(finished) => tracing::info!(finished, "replayed initial requests"),
                Err(e) => tracing::warn!(error = %e, "replay failed"),
            }
            node.replaying.store(false, Ordering::SeqCst);
        });
    }

    /// Handles one inbound transfer to a terminal state if possible
    pub async fn process(&self, transfer: &Transfer) -> Result<Outcome> {
        let role = self.config.role_of(&transfer.sender);
        let parsed = Request::parse(&transfer.memo, role, &self.cipher);
        let action = parsed.as_ref().map(|r| r.action.tag()).unwrap_or(0);
        let record = RequestRecord::from_transfer(transfer, role, action);
        self.process_record(record, parsed).await
    }

    /// Re-drives every initial request, oldest first
    pub async fn replay_initial(&self) -> Result<usize> {
        let pending = self.store.initial_requests().await?;
        let mut finished = 0;
        for record in pending {
            let request_id = record.id;
            let parsed = Request::parse(&record.memo, record.role, &self.cipher);
            match self.process_record(record, parsed).await {
                Ok(outcome) if outcome.is_terminal() => finished += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(request_id = %request_id, error = %e, "replay left request initial"),
            }
        }
        Ok(finished)
    }

    /// Publishes every persisted transaction the bus has not taken yet
    pub async fn flush_unsent(&self) -> Result<usize> {
        let unsent = self.store.unsent_transactions().await?;
        let mut sent = 0;
        for transaction in unsent {
            self.publish(&transaction).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Clears the halt of a safe after manual intervention
    pub async fn resume_safe(&self, holder: &str) -> Result<()> {
        self.store.set_halted(holder, None).await?;
        tracing::info!(holder = %holder, "safe resumed");
        Ok(())
    }

    async fn process_record(&self, record: RequestRecord, parsed: Result<Request>) -> Result<Outcome> {
        match self.store.get_request(record.id).await? {
            Some(stored) if stored.state.is_terminal() => {
                tracing::debug!(request_id = %record.id, state = %stored.state, "request already finished");
                return Ok(Outcome::stored(&stored));
            }
            Some(_) => {}
            None => match self.store.insert_request(&record).await {
                Ok(()) | Err(StorageError::Duplicate(_)) => {}
                Err(e) => return Err(e.into()),
            },
        }

        let request = match parsed {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(request_id = %record.id, sender = %record.sender, error = %e, "malformed request");
                return self.finish(Commit::failed(record.id, format!("{}: {}", e.error_code(), e)), None).await;
            }
        };

        let lane = self.lane_of(&request).await?;
        let lock = self.lane_lock(&lane).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.process_in_lane(&record, &request, &lane).await
        };
        drop(lock);
        self.release_lane(&lane).await;
        outcome
    }

    /// Runs a request while holding its lane
    async fn process_in_lane(&self, record: &RequestRecord, request: &Request, lane: &str) -> Result<Outcome> {
        // another delivery may have finished it while we waited
        if let Some(stored) = self.store.get_request(record.id).await? {
            if stored.state.is_terminal() {
                return Ok(Outcome::stored(&stored));
            }
        }
        if let Some(safe) = self.store.get_safe(lane).await? {
            if let Some(reason) = safe.halted {
                tracing::warn!(request_id = %record.id, holder = %lane, reason = %reason, "safe halted, request left initial");
                return Ok(Outcome::Halted(reason));
            }
        }
        self.drive(record, request, lane).await
    }

    /// Runs the handler, retrying upstream trouble with capped backoff
    async fn drive(&self, record: &RequestRecord, request: &Request, lane: &str) -> Result<Outcome> {
        let mut attempt = 0;
        loop {
            let error = match self.handle(record, request).await {
                Ok(commit) => return self.finish(commit, Some(lane)).await,
                Err(e) => e,
            };

            if error.is_deferred() {
                tracing::info!(request_id = %record.id, reason = %error, "request deferred");
                return Ok(Outcome::Deferred(error.to_string()));
            }
            if error.is_retryable() {
                if attempt >= self.config.max_retries {
                    tracing::warn!(request_id = %record.id, attempts = attempt + 1, error = %error, "upstream unavailable, request deferred");
                    return Ok(Outcome::Deferred(error.to_string()));
                }
                let delay = self.backoff(attempt);
                tracing::debug!(request_id = %record.id, attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            if error.is_invariant() {
                return self.halt(record.id, lane, &error.to_string()).await;
            }

            if let Some(kind) = error.audit_kind() {
                audit(kind, &record.id.to_string(), &error.to_string());
            }
            tracing::warn!(request_id = %record.id, action = ?request.action, error = %error, "request failed");
            let reason = format!("{}: {}", error.error_code(), error);
            return self.finish(Commit::failed(record.id, reason), Some(lane)).await;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config
            .retry_base
            .checked_mul(factor)
            .unwrap_or(self.config.retry_max)
            .min(self.config.retry_max)
    }

    /// Commits an outcome and publishes what it emitted
    async fn finish(&self, commit: Commit, lane: Option<&str>) -> Result<Outcome> {
        let outcome = match &commit.failure {
            Some(reason) => Outcome::Failed(reason.clone()),
            None => Outcome::Done,
        };
        match self.store.commit(&commit).await {
            Ok(()) => {}
            Err(StorageError::AlreadyFinished(id, _)) => {
                return match self.store.get_request(id).await? {
                    Some(stored) => Ok(Outcome::stored(&stored)),
                    None => Err(StorageError::NotFound(id.to_string()).into()),
                };
            }
            Err(e @ (StorageError::NegativeBalance { .. } | StorageError::Duplicate(_))) => {
                return self.halt(commit.request_id, lane.unwrap_or(REJECT_LANE), &e.to_string()).await;
            }
            Err(e) => return Err(e.into()),
        }

        for transaction in &commit.transactions {
            if let Err(e) = self.publish(transaction).await {
                // left unsent for the next flush
                tracing::warn!(trace_id = %transaction.trace_id, error = %e, "failed to publish transaction");
            }
        }
        tracing::info!(
            request_id = %commit.request_id,
            state = %commit.state,
            transactions = commit.transactions.len(),
            "request finished"
        );
        Ok(outcome)
    }

    async fn halt(&self, request_id: Uuid, lane: &str, reason: &str) -> Result<Outcome> {
        audit(AuditKind::InvariantViolation, lane, reason);
        if self.store.get_safe(lane).await?.is_some() {
            self.store.set_halted(lane, Some(reason)).await?;
            tracing::error!(request_id = %request_id, holder = %lane, reason = %reason, "safe halted");
        } else {
            tracing::error!(request_id = %request_id, lane = %lane, reason = %reason, "invariant violated");
        }
        Ok(Outcome::Halted(reason.to_string()))
    }

    async fn publish(&self, transaction: &LedgerTransaction) -> Result<()> {
        let transfer = transaction.to_transfer(&self.config.keeper_id);
        self.bus.publish(BusFrame::Transfer(transfer)).await?;
        self.store.mark_sent(transaction.trace_id).await?;
        tracing::debug!(trace_id = %transaction.trace_id, receivers = ?transaction.receivers, "transaction published");
        Ok(())
    }

    async fn lane_lock(&self, lane: &str) -> Arc<Mutex<()>> {
        let mut lanes = self.lanes.lock().await;
        lanes.entry(lane.to_string()).or_default().clone()
    }

    /// Drops the lock of `lane` once nobody else holds or waits on it
    async fn release_lane(&self, lane: &str) {
        let mut lanes = self.lanes.lock().await;
        if lanes.get(lane).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            lanes.remove(lane);
        }
    }

    async fn lane_of_transfer(&self, transfer: &Transfer) -> String {
        let role = self.config.role_of(&transfer.sender);
        match Request::parse(&transfer.memo, role, &self.cipher) {
            Ok(request) => self.lane_of(&request).await.unwrap_or_else(|_| SIGNER_LANE.to_string()),
            Err(_) => REJECT_LANE.to_string(),
        }
    }

    /// Holder key of the safe a request touches
    async fn lane_of(&self, request: &Request) -> Result<String> {
        match request.action {
            Action::AddObserverKey => Ok(OBSERVER_LANE.to_string()),
            Action::KeygenOutput | Action::SignOutput => {
                let session = request.envelope.id;
                if let Some(safe) = self.store.safe_by_session(session).await? {
                    return Ok(safe.holder);
                }
                if let Some(proposal) = self.store.proposal_by_session(session).await? {
                    return Ok(proposal.holder);
                }
                Ok(SIGNER_LANE.to_string())
            }
            // only a well-formed holder key gets a lane of its own
            _ => Ok(request
                .key_hex()
                .and_then(|holder| parse_key(&request.envelope.public).map(|_| holder))
                .unwrap_or_else(|_| REJECT_LANE.to_string())),
        }
    }

    async fn handle(&self, record: &RequestRecord, request: &Request) -> Result<Commit> {
        match request.action {
            Action::ProposeSafe => self.propose_safe(record, request).await,
            Action::ProposeTransaction => self.propose_transaction(record, request).await,
            Action::CloseSafe => self.close_safe(record, request).await,
            Action::Deposit => self.deposit(record, request).await,
            Action::AddObserverKey => self.add_observer_key(record, request).await,
            Action::KeygenOutput => self.keygen_output(record, &request.operation()?).await,
            Action::SignOutput => self.sign_output(record, &request.operation()?).await,
        }
    }

    /// Transaction carrying `op` to the signer group
    fn operation_transaction(&self, request_id: Uuid, purpose: &str, op: &Operation) -> Result<LedgerTransaction> {
        Ok(LedgerTransaction {
            trace_id: trace_id(&request_id, purpose),
            request_id,
            asset_id: self.config.operation_asset_id,
            receivers: self.config.signer_members.clone(),
            threshold: self.config.signer_threshold,
            amount: OPERATION_AMOUNT.to_string(),
            memo: self.cipher.seal_operation(op)?,
        })
    }

    async fn deposit(&self, record: &RequestRecord, request: &Request) -> Result<Commit> {
        let holder = request.key_hex()?;
        let deposit = Deposit::parse(&request.envelope.extra)?;
        if request.envelope.curve != deposit.chain.curve() {
            return Err(KeeperError::malformed(format!(
                "curve {} does not match {}",
                request.envelope.curve, deposit.chain
            )));
        }
        let verified = self.verifier.verify(record.id, &holder, &deposit).await?;
        Ok(verified.into_commit())
    }

    async fn add_observer_key(&self, record: &RequestRecord, request: &Request) -> Result<Commit> {
        let public = request.key_hex()?;
        parse_key(&request.envelope.public)?;
        tracing::info!(request_id = %record.id, public = %public, "observer key added");
        Ok(Commit::done(
            record.id,
            vec![Write::AddObserverKey {
                public,
                request_id: record.id,
            }],
            vec![],
        ))
    }

    async fn propose_safe(&self, record: &RequestRecord, request: &Request) -> Result<Commit> {
        let holder = request.key_hex()?;
        let holder_bytes = &request.envelope.public;
        parse_key(holder_bytes)?;
        let proposal = SafeProposal::parse(&request.envelope.extra)?;
        let chain = proposal.chain;
        if request.envelope.curve != chain.curve() {
            return Err(KeeperError::malformed(format!(
                "curve {} does not match {}",
                request.envelope.curve, chain
            )));
        }
        parse_key(&proposal.observer)?;
        if proposal.threshold == 0 || proposal.threshold as usize > proposal.receivers.len() {
            return Err(KeeperError::malformed(format!(
                "threshold {} of {} receivers",
                proposal.threshold,
                proposal.receivers.len()
            )));
        }
        if proposal.timelock == 0 {
            return Err(KeeperError::malformed("zero timelock"));
        }

        let observer = hex::encode(&proposal.observer);
        if !self.store.observer_key_exists(&observer).await? {
            return Err(KeeperError::rejected(format!("observer key {} is not registered", observer)));
        }
        if self.store.get_safe(&holder).await?.is_some() {
            return Err(KeeperError::rejected(format!("holder {} already has a safe", holder)));
        }

        let path = safe_path(holder_bytes)?;
        let mut params = holder_bytes.clone();
        params.push(chain.id());
        let keygen_session = session_id("keygen", &record.id.to_string(), &params);
        let now = now_millis();
        let safe = SafeRecord {
            holder: holder.clone(),
            owner: record.sender.clone(),
            request_id: record.id,
            chain,
            observer,
            timelock: proposal.timelock,
            threshold: proposal.threshold,
            receivers: proposal.receivers.iter().map(Uuid::to_string).collect(),
            path: path.to_bytes(),
            keygen_session,
            signer: None,
            chain_code: None,
            signer_child: None,
            ownership_session: None,
            ownership_signature: None,
            address: None,
            state: SafeState::Pending,
            halted: None,
            created_at: now,
            updated_at: now,
        };

        let op = Operation::keygen_input(keygen_session, chain.curve());
        let transaction = self.operation_transaction(record.id, "keygen", &op)?;
        tracing::info!(request_id = %record.id, holder = %holder, chain = %chain, session_id = %keygen_session, "safe proposed");
        Ok(Commit::done(record.id, vec![Write::PutSafe(safe)], vec![transaction]))
    }

    async fn keygen_output(&self, record: &RequestRecord, op: &Operation) -> Result<Commit> {
        let mut safe = match self.store.safe_by_session(op.id).await? {
            Some(safe) if safe.keygen_session == op.id => safe,
            _ => return Err(KeeperError::rejected(format!("no safe waits for keygen {}", op.id))),
        };
        if op.curve != safe.chain.curve() {
            return Err(KeeperError::malicious(
                AuditKind::SessionConflict,
                format!("keygen {} answered on {}", op.id, op.curve),
            ));
        }
        let public = op.public_hex();
        if let Some(signer) = &safe.signer {
            if *signer == public {
                tracing::debug!(request_id = %record.id, session_id = %op.id, "keygen output already bound");
                return Ok(Commit::done(record.id, vec![], vec![]));
            }
            return Err(KeeperError::malicious(
                AuditKind::SessionConflict,
                format!("keygen {} produced {} and {}", op.id, signer, public),
            ));
        }

        let chain_code = op
            .chain_code()
            .ok_or_else(|| KeeperError::malformed("keygen output without chain code"))?;
        let path = DerivationPath::from_bytes(&safe.path).map_err(|e| KeeperError::invariant(e.to_string()))?;
        let child = derive_public(Scheme::Ecdsa, &op.public, &chain_code, &path)
            .map_err(|e| KeeperError::malformed(e.to_string()))?;
        let holder = hex::decode(&safe.holder).map_err(|e| KeeperError::invariant(e.to_string()))?;
        let digest = ownership_digest(&holder, &child.public);
        let ownership_session = session_id("ownership", &safe.request_id.to_string(), &digest);

        let sign = Operation::sign_input(
            ownership_session,
            safe.chain.curve(),
            fingerprint(&op.public),
            &path,
            digest.to_vec(),
        );
        let transaction = self.operation_transaction(record.id, "ownership", &sign)?;

        safe.signer = Some(public);
        safe.chain_code = Some(hex::encode(chain_code));
        safe.signer_child = Some(hex::encode(&child.public));
        safe.ownership_session = Some(ownership_session);
        safe.updated_at = now_millis();
        tracing::info!(
            request_id = %record.id,
            holder = %safe.holder,
            child = %hex::encode(&child.public),
            session_id = %ownership_session,
            "signer key bound to safe"
        );
        Ok(Commit::done(record.id, vec![Write::PutSafe(safe)], vec![transaction]))
    }

    async fn sign_output(&self, record: &RequestRecord, op: &Operation) -> Result<Commit> {
        if let Some(safe) = self.store.safe_by_session(op.id).await? {
            if safe.ownership_session == Some(op.id) {
                return self.ownership_signed(record, op, safe);
            }
        }
        if let Some(proposal) = self.store.proposal_by_session(op.id).await? {
            let safe = self
                .store
                .get_safe(&proposal.holder)
                .await?
                .ok_or_else(|| KeeperError::invariant(format!("proposal {} without safe", proposal.id)))?;
            return self.proposal_signed(record, op, &safe, proposal);
        }
        Err(KeeperError::rejected(format!("no session {}", op.id)))
    }

    /// Checks a signature is by the safe's signer child key over `digest`
    fn check_signature(&self, op: &Operation, safe: &SafeRecord, digest: &[u8]) -> Result<()> {
        let child = safe
            .signer_child
            .as_deref()
            .ok_or_else(|| KeeperError::invariant(format!("safe {} has no signer key", safe.holder)))?;
        let child = hex::decode(child).map_err(|e| KeeperError::invariant(e.to_string()))?;
        if op.curve != safe.chain.curve() || op.public != child {
            return Err(KeeperError::malicious(
                AuditKind::SignatureMismatch,
                format!("session {} signed by {}", op.id, op.public_hex()),
            ));
        }
        verify_signature(op.curve, &child, digest, &op.extra)
            .map_err(|e| KeeperError::malicious(AuditKind::SignatureMismatch, format!("session {}: {}", op.id, e)))
    }

    fn ownership_signed(&self, record: &RequestRecord, op: &Operation, mut safe: SafeRecord) -> Result<Commit> {
        let holder = hex::decode(&safe.holder).map_err(|e| KeeperError::invariant(e.to_string()))?;
        let child = hex::decode(safe.signer_child.as_deref().unwrap_or_default())
            .map_err(|e| KeeperError::invariant(e.to_string()))?;
        let digest = ownership_digest(&holder, &child);
        self.check_signature(op, &safe, &digest)?;
        if safe.state != SafeState::Pending {
            tracing::debug!(request_id = %record.id, holder = %safe.holder, "ownership already proven");
            return Ok(Commit::done(record.id, vec![], vec![]));
        }

        let observer = hex::decode(&safe.observer).map_err(|e| KeeperError::invariant(e.to_string()))?;
        let address = safe_address(safe.chain, &holder, &child, &observer, safe.timelock)
            .map_err(|e| KeeperError::invariant(e.to_string()))?;
        safe.address = Some(address.clone());
        safe.ownership_signature = Some(hex::encode(&op.extra));
        safe.state = SafeState::Approved;
        safe.updated_at = now_millis();
        tracing::info!(request_id = %record.id, holder = %safe.holder, address = %address, "safe approved");
        Ok(Commit::done(record.id, vec![Write::PutSafe(safe)], vec![]))
    }

    fn proposal_signed(
        &self,
        record: &RequestRecord,
        op: &Operation,
        safe: &SafeRecord,
        mut proposal: ProposalRecord,
    ) -> Result<Commit> {
        let digest = hex::decode(&proposal.digest).map_err(|e| KeeperError::invariant(e.to_string()))?;
        self.check_signature(op, safe, &digest)?;
        if proposal.state == ProposalState::Signed {
            return Ok(Commit::done(record.id, vec![], vec![]));
        }
        proposal.signature = Some(hex::encode(&op.extra));
        proposal.state = ProposalState::Signed;
        proposal.updated_at = now_millis();
        tracing::info!(request_id = %record.id, proposal_id = %proposal.id, "transaction proposal signed");
        Ok(Commit::done(record.id, vec![Write::PutProposal(proposal)], vec![]))
    }

    /// Loads the approved safe of `holder` and checks `sender` owns it
    async fn owned_safe(&self, holder: &str, sender: &str) -> Result<SafeRecord> {
        let safe = self
            .store
            .get_safe(holder)
            .await?
            .ok_or_else(|| KeeperError::rejected(format!("no safe for {}", holder)))?;
        if safe.owner != sender {
            return Err(KeeperError::rejected(format!("{} does not own the safe", sender)));
        }
        Ok(safe)
    }

    async fn propose_transaction(&self, record: &RequestRecord, request: &Request) -> Result<Commit> {
        let holder = request.key_hex()?;
        let proposal = TransactionProposal::parse(&request.envelope.extra)?;
        let safe = self.owned_safe(&holder, &record.sender).await?;
        if safe.state != SafeState::Approved {
            return Err(KeeperError::rejected(format!("safe is {}", safe.state)));
        }
        if safe.chain != proposal.chain {
            return Err(KeeperError::rejected(format!("safe is on {}", safe.chain)));
        }
        let (Some(address), Some(signer)) = (safe.address.clone(), safe.signer.as_deref()) else {
            return Err(KeeperError::invariant(format!("approved safe {} without keys", holder)));
        };

        let balance = self.store.read_balance(&address, proposal.asset_id).await?;
        if balance < proposal.amount {
            return Err(KeeperError::rejected(format!(
                "balance {} below {}",
                balance, proposal.amount
            )));
        }

        let digest = proposal_digest(record.id, &address, &proposal.receiver, proposal.amount);
        let session = session_id("sign", &record.id.to_string(), &digest);
        let path = DerivationPath::from_bytes(&safe.path).map_err(|e| KeeperError::invariant(e.to_string()))?;
        let signer = hex::decode(signer).map_err(|e| KeeperError::invariant(e.to_string()))?;
        let op = Operation::sign_input(session, safe.chain.curve(), fingerprint(&signer), &path, digest.to_vec());
        let transaction = self.operation_transaction(record.id, "sign", &op)?;

        let now = now_millis();
        let record_proposal = ProposalRecord {
            id: record.id,
            holder: holder.clone(),
            address: address.clone(),
            chain: safe.chain,
            asset_id: proposal.asset_id,
            amount: proposal.amount,
            receiver: proposal.receiver,
            digest: hex::encode(digest),
            session_id: session,
            signature: None,
            state: ProposalState::Pending,
            created_at: now,
            updated_at: now,
        };
        tracing::info!(request_id = %record.id, holder = %holder, amount = %proposal.amount, session_id = %session, "transaction proposed");
        Ok(Commit::done(
            record.id,
            vec![
                Write::Debit {
                    address,
                    asset_id: proposal.asset_id,
                    amount: proposal.amount,
                },
                Write::PutProposal(record_proposal),
            ],
            vec![transaction],
        ))
    }

    async fn close_safe(&self, record: &RequestRecord, request: &Request) -> Result<Commit> {
        let holder = request.key_hex()?;
        let mut safe = self.owned_safe(&holder, &record.sender).await?;
        if safe.state == SafeState::Closed {
            return Err(KeeperError::rejected("safe already closed"));
        }
        if let Some(address) = &safe.address {
            let balances = self.store.balances(address).await?;
            if let Some(open) = balances.iter().find(|b| b.balance > 0) {
                return Err(KeeperError::rejected(format!(
                    "balance {} of {} left",
                    open.balance, open.asset_id
                )));
            }
        }
        safe.state = SafeState::Closed;
        safe.updated_at = now_millis();
        tracing::info!(request_id = %record.id, holder = %holder, "safe closed");
        Ok(Commit::done(record.id, vec![Write::PutSafe(safe)], vec![]))
    }
}
