// Test doubles shared by the unit tests
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::chain::{
    ChainReceipt, Confirmation, FeeMarket, KeySource, LedgerRpc, SignedTransaction,
    TransactionSigner, TransferCall, UnsignedTransaction,
};
use crate::error::{ExecutionError, RpcError, StoreError};
use crate::execution::TransferReceipt;
use crate::fees::{FeeConfig, FeeEstimator};
use crate::jobs::memory::MemoryJobStore;
use crate::jobs::models::{Asset, Frequency, JobPatch, JobStatus, ScheduledJob, UpdateGuard};
use crate::jobs::service::{JobService, JobServiceConfig, NewJob};
use crate::jobs::store::JobStore;
use crate::oracle::PriceOracle;

pub const OWNER: &str = "0x52908400098527886E0F7030069857D2E4169EE7";
pub const RECIPIENT: &str = "0x8ba1f109551bD432803012645Ac136ddd64DBA72";
pub const TOKEN_CONTRACT: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";

const GWEI: u128 = 1_000_000_000;
const ETHER: u128 = 1_000_000_000_000_000_000;

/// Weekly 1.5 ETH job due 2024-01-01 12:00 UTC, four executions
pub fn sample_job(schedule_id: &str) -> ScheduledJob {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    ScheduledJob {
        schedule_id: schedule_id.to_string(),
        owner_address: OWNER.to_string(),
        recipient_address: RECIPIENT.to_string(),
        asset: Asset::native("ETH", 18),
        amount: dec!(1.5),
        frequency: Frequency::Weekly,
        scheduled_for: start,
        next_execution: Some(start),
        execution_count: 0,
        max_executions: 4,
        status: JobStatus::Active,
        processing_by: None,
        processing_started: None,
        last_error: None,
        failed_at: None,
        created_at: start - Duration::days(1),
        last_execution_at: None,
        last_transaction_hash: None,
        cancelled_at: None,
    }
}

/// `sample_job` already claimed by `executor-test`
pub fn claimed_job(schedule_id: &str) -> ScheduledJob {
    let mut job = sample_job(schedule_id);
    JobPatch::claim("executor-test", job.scheduled_for).apply(&mut job);
    job
}

pub fn receipt(tx_hash: &str) -> TransferReceipt {
    TransferReceipt {
        tx_hash: tx_hash.to_string(),
        block_number: 19_000_000,
        gas_used: 21_000,
        effective_fee_per_unit: 32 * GWEI,
        actual_cost_in_asset: dec!(0.000672),
        actual_cost_in_fiat: Some(dec!(1.344)),
        confirmed_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap(),
    }
}

/// Native ETH job starting tomorrow
pub fn new_job(frequency: Frequency, max_executions: Option<u32>) -> NewJob {
    NewJob {
        owner_address: OWNER.to_string(),
        recipient_address: RECIPIENT.to_string(),
        asset: Asset::native("ETH", 18),
        amount: dec!(1.5),
        frequency,
        scheduled_for: Utc::now() + Duration::days(1),
        max_executions,
    }
}

pub fn job_service(store: Arc<MemoryJobStore>) -> JobService {
    let estimator = FeeEstimator::new(
        FeeConfig::default(),
        Arc::new(MockLedger::new()),
        Arc::new(StaticOracle::new(Some(dec!(2000)))),
    );
    JobService::new(store, Arc::new(estimator), JobServiceConfig::default())
}

struct LedgerState {
    reachable: bool,
    market: FeeMarket,
    simulation: Result<u64, String>,
    balance: u128,
    broadcast_error: Option<String>,
    broadcasts: Vec<SignedTransaction>,
    receipt_gas_used: u64,
    receipt_gas_price: u128,
    receipt_success: bool,
    times_out: bool,
    /// Next nonce per sender, advanced by accepted broadcasts
    nonces: HashMap<String, u64>,
}

/// Scriptable ledger. Builders configure it up front; `fail_broadcasts`
/// can be toggled while a test runs.
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                reachable: true,
                market: FeeMarket {
                    base_fee_per_gas: 30 * GWEI,
                    priority_fee_per_gas: 2 * GWEI,
                },
                simulation: Ok(52_000),
                balance: 100 * ETHER,
                broadcast_error: None,
                broadcasts: Vec::new(),
                receipt_gas_used: 21_000,
                receipt_gas_price: 32 * GWEI,
                receipt_success: true,
                times_out: false,
                nonces: HashMap::new(),
            }),
        }
    }

    pub fn with_fee_market(self, base_fee_per_gas: u128, priority_fee_per_gas: u128) -> Self {
        self.state.lock().market = FeeMarket {
            base_fee_per_gas,
            priority_fee_per_gas,
        };
        self
    }

    pub fn with_simulation_error(self, message: &str) -> Self {
        self.state.lock().simulation = Err(message.to_string());
        self
    }

    pub fn with_simulated_gas(self, gas: u64) -> Self {
        self.state.lock().simulation = Ok(gas);
        self
    }

    pub fn with_balance(self, balance: u128) -> Self {
        self.state.lock().balance = balance;
        self
    }

    pub fn with_receipt(self, gas_used: u64, gas_price: u128) -> Self {
        {
            let mut state = self.state.lock();
            state.receipt_gas_used = gas_used;
            state.receipt_gas_price = gas_price;
        }
        self
    }

    pub fn with_reverted_receipts(self) -> Self {
        self.state.lock().receipt_success = false;
        self
    }

    pub fn with_confirmation_timeout(self) -> Self {
        self.state.lock().times_out = true;
        self
    }

    pub fn unreachable(self) -> Self {
        self.state.lock().reachable = false;
        self
    }

    pub fn fail_broadcasts(&self, message: &str) {
        self.state.lock().broadcast_error = Some(message.to_string());
    }

    pub fn clear_broadcast_failure(&self) {
        self.state.lock().broadcast_error = None;
    }

    /// Accepted broadcasts only
    pub fn broadcast_count(&self) -> usize {
        self.state.lock().broadcasts.len()
    }

    fn check_reachable(&self) -> Result<(), RpcError> {
        if self.state.lock().reachable {
            Ok(())
        } else {
            Err(RpcError::Transport("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        self.check_reachable()?;
        Ok(1)
    }

    async fn fee_market(&self) -> Result<FeeMarket, RpcError> {
        self.check_reachable()?;
        Ok(self.state.lock().market)
    }

    async fn simulate(&self, _call: &TransferCall) -> Result<u64, RpcError> {
        self.check_reachable()?;
        self.state.lock().simulation.clone().map_err(|message| RpcError::Node {
            code: -32000,
            message,
        })
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<String, RpcError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if let Some(message) = &state.broadcast_error {
            return Err(RpcError::Node {
                code: -32000,
                message: message.clone(),
            });
        }
        let (sender, nonce) = decode_mock_raw(&tx.raw)?;
        let expected = state.nonces.entry(sender).or_insert(0);
        if nonce != *expected {
            return Err(RpcError::Node {
                code: -32000,
                message: format!("invalid nonce: next nonce {}, tx nonce {}", expected, nonce),
            });
        }
        *expected += 1;
        state.broadcasts.push(tx.clone());
        Ok(format!("0x{:064x}", state.broadcasts.len()))
    }

    async fn wait_confirmation(
        &self,
        tx_hash: &str,
        _timeout: std::time::Duration,
    ) -> Result<Confirmation, RpcError> {
        self.check_reachable()?;
        let state = self.state.lock();
        if state.times_out {
            return Ok(Confirmation::TimedOut);
        }
        Ok(Confirmation::Confirmed(ChainReceipt {
            tx_hash: tx_hash.to_string(),
            block_number: 19_000_000 + state.broadcasts.len() as u64,
            gas_used: state.receipt_gas_used,
            effective_gas_price: state.receipt_gas_price,
            success: state.receipt_success,
        }))
    }

    async fn get_balance(&self, _address: &str) -> Result<u128, RpcError> {
        self.check_reachable()?;
        Ok(self.state.lock().balance)
    }

    async fn transaction_count(&self, address: &str) -> Result<u64, RpcError> {
        self.check_reachable()?;
        let nonce = self
            .state
            .lock()
            .nonces
            .get(&address.to_ascii_lowercase())
            .copied()
            .unwrap_or(0);
        // Lets a concurrent transfer run between nonce read and broadcast
        tokio::task::yield_now().await;
        Ok(nonce)
    }
}

pub struct StaticOracle {
    price: Option<Decimal>,
}

impl StaticOracle {
    pub fn new(price: Option<Decimal>) -> Self {
        Self { price }
    }
}

#[async_trait]
impl PriceOracle for StaticOracle {
    async fn spot_price(&self, _symbol: &str) -> Option<Decimal> {
        self.price
    }
}

/// Hands out signers for any address and records what they signed
pub struct MockKeySource {
    has_keys: bool,
    signed: Arc<Mutex<Vec<UnsignedTransaction>>>,
}

impl MockKeySource {
    pub fn new() -> Self {
        Self {
            has_keys: true,
            signed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn without_keys() -> Self {
        Self {
            has_keys: false,
            ..Self::new()
        }
    }

    pub fn signed(&self) -> Vec<UnsignedTransaction> {
        self.signed.lock().clone()
    }
}

#[async_trait]
impl KeySource for MockKeySource {
    async fn signer_for(&self, owner_address: &str) -> Result<Box<dyn TransactionSigner>, ExecutionError> {
        if !self.has_keys {
            return Err(ExecutionError::Signing(format!("no key for {}", owner_address)));
        }
        Ok(Box::new(MockSigner {
            address: owner_address.to_string(),
            signed: self.signed.clone(),
        }))
    }
}

struct MockSigner {
    address: String,
    signed: Arc<Mutex<Vec<UnsignedTransaction>>>,
}

#[async_trait]
impl TransactionSigner for MockSigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<SignedTransaction, ExecutionError> {
        self.signed.lock().push(tx.clone());
        let sender = self.address.to_ascii_lowercase();
        let mut raw = vec![0x02];
        raw.extend_from_slice(&tx.nonce.to_be_bytes());
        raw.push(sender.len() as u8);
        raw.extend_from_slice(sender.as_bytes());
        raw.extend_from_slice(&tx.call.data);
        Ok(SignedTransaction { raw })
    }
}

/// `0x02 | nonce (8 bytes) | sender length | sender | call data`
fn decode_mock_raw(raw: &[u8]) -> Result<(String, u64), RpcError> {
    let malformed = || RpcError::Node {
        code: -32602,
        message: "malformed transaction".to_string(),
    };
    let nonce_bytes: [u8; 8] = raw.get(1..9).ok_or_else(malformed)?.try_into().map_err(|_| malformed())?;
    let len = *raw.get(9).ok_or_else(malformed)? as usize;
    let sender = raw.get(10..10 + len).ok_or_else(malformed)?;
    Ok((
        String::from_utf8_lossy(sender).into_owned(),
        u64::from_be_bytes(nonce_bytes),
    ))
}

/// Memory store whose write-back updates fail a set number of times.
/// Only updates guarded on `processing` (and forced updates) are affected,
/// so claims still go through.
pub struct FlakyStore {
    inner: MemoryJobStore,
    conditional_failures: AtomicU32,
    forced_failures: AtomicU32,
    conditional_calls: AtomicU32,
    forced_calls: AtomicU32,
}

impl FlakyStore {
    pub fn new(conditional_failures: u32, forced_failures: u32) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            conditional_failures: AtomicU32::new(conditional_failures),
            forced_failures: AtomicU32::new(forced_failures),
            conditional_calls: AtomicU32::new(0),
            forced_calls: AtomicU32::new(0),
        }
    }

    pub fn conditional_calls(&self) -> u32 {
        self.conditional_calls.load(Ordering::SeqCst)
    }

    pub fn forced_calls(&self) -> u32 {
        self.forced_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        tolerance: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        self.inner.find_due(now, tolerance, limit).await
    }

    async fn conditional_update(
        &self,
        schedule_id: &str,
        guard: &UpdateGuard,
        patch: &JobPatch,
    ) -> Result<bool, StoreError> {
        if guard.expected_status == JobStatus::Processing {
            self.conditional_calls.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&self.conditional_failures) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
        }
        self.inner.conditional_update(schedule_id, guard, patch).await
    }

    async fn force_update(&self, schedule_id: &str, patch: &JobPatch) -> Result<bool, StoreError> {
        self.forced_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.forced_failures) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.force_update(schedule_id, patch).await
    }

    async fn insert(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        self.inner.insert(job).await
    }

    async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledJob>, StoreError> {
        self.inner.get(schedule_id).await
    }

    async fn list_by_owner(&self, owner_address: &str) -> Result<Vec<ScheduledJob>, StoreError> {
        self.inner.list_by_owner(owner_address).await
    }

    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        self.inner.find_stale_processing(older_than).await
    }
}
