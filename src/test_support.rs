//! Mocks and fixtures shared by the unit tests

use crate::chain::{ChainClient, ChainError, SignatureStatus};
use crate::config::{AgentConfig, CycleTiming, InMemoryConfigSource};
use crate::cycle::{AgentCycleState, CycleDeps, CycleEvent, Phase};
use crate::store::{CycleStateStore, MemoryStateStore};
use crate::supervisor::CycleSupervisor;
use crate::swap::{QuoteRequest, QuoteResult, SwapError, SwapOutcome, SwapService, Swapper};
use crate::tokens::mints;
use crate::wallet::{SecureWallet, StaticKeyring, TransactionSigner};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const BONK: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";

/// Runs `f` with temporary environment overrides under a process-wide lock
pub(crate) fn with_locked_env<T>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> T) -> T {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let previous = vars
        .iter()
        .map(|(name, _)| ((*name).to_string(), std::env::var(name).ok()))
        .collect::<Vec<_>>();

    for (name, value) in vars {
        match value {
            Some(v) => std::env::set_var(name, v),
            None => std::env::remove_var(name),
        }
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));

    for (name, value) in previous {
        match value {
            Some(v) => std::env::set_var(name, v),
            None => std::env::remove_var(name),
        }
    }

    match result {
        Ok(output) => output,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

/// Deterministic wallet from a repeated seed byte
pub fn test_wallet(seed: u8) -> SecureWallet {
    SecureWallet::from_signing_key(SigningKey::from_bytes(&[seed; 32]))
}

/// A one-signer wire transaction with an empty signature slot for `payer`
pub fn unsigned_transaction(payer: &[u8; 32], versioned: bool) -> Vec<u8> {
    let mut wire = vec![1u8];
    wire.extend_from_slice(&[0u8; 64]);
    if versioned {
        wire.push(0x80);
    }
    // header: 1 required signature, 0 readonly signed, 1 readonly unsigned
    wire.extend_from_slice(&[1, 0, 1]);
    wire.push(2);
    wire.extend_from_slice(payer);
    wire.extend_from_slice(&[7u8; 32]);
    // recent blockhash, then no instructions
    wire.extend_from_slice(&[9u8; 32]);
    wire.push(0);
    if versioned {
        // no address table lookups
        wire.push(0);
    }
    wire
}

fn pubkey_bytes(address: &str) -> [u8; 32] {
    let decoded = bs58::decode(address).into_vec().unwrap_or_default();
    decoded.try_into().unwrap_or([0u8; 32])
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ChainState {
    sol_balance: u64,
    token_balances: HashMap<String, u64>,
    statuses: VecDeque<SignatureStatus>,
    sent: Vec<String>,
    send_error: Option<ChainError>,
    send_credit: Option<(String, u64)>,
}

/// In-memory ledger; token balances are tracked per owner address
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// SOL balance reported for every address
    pub fn set_balance(&self, lamports: u64) {
        lock(&self.state).sol_balance = lamports;
    }

    pub fn token_balance(&self, owner: &str) -> u64 {
        lock(&self.state)
            .token_balances
            .get(owner)
            .copied()
            .unwrap_or(0)
    }

    pub fn add_tokens(&self, owner: &str, amount: u64) {
        let mut state = lock(&self.state);
        let balance = state.token_balances.entry(owner.to_string()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    pub fn remove_tokens(&self, owner: &str, amount: u64) {
        let mut state = lock(&self.state);
        let balance = state.token_balances.entry(owner.to_string()).or_insert(0);
        *balance = balance.saturating_sub(amount);
    }

    /// Statuses returned by successive polls; the last one repeats
    pub fn set_status_sequence(&self, statuses: Vec<SignatureStatus>) {
        lock(&self.state).statuses = statuses.into();
    }

    /// Credit `owner` with `amount` tokens for every accepted transaction
    pub fn credit_tokens_on_send(&self, owner: &str, amount: u64) {
        lock(&self.state).send_credit = Some((owner.to_string(), amount));
    }

    pub fn fail_sends_with(&self, error: ChainError) {
        lock(&self.state).send_error = Some(error);
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.state).sent.len()
    }

    pub fn sent_signatures(&self) -> Vec<String> {
        lock(&self.state).sent.clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_balance(&self, _address: &str) -> Result<u64, ChainError> {
        Ok(lock(&self.state).sol_balance)
    }

    async fn get_token_balance(&self, owner: &str, _mint: &str) -> Result<u64, ChainError> {
        Ok(self.token_balance(owner))
    }

    async fn send_transaction(&self, signed_tx: &[u8]) -> Result<String, ChainError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.send_error.clone() {
            return Err(error);
        }
        let signature = if signed_tx.len() >= 65 {
            bs58::encode(&signed_tx[1..65]).into_string()
        } else {
            format!("mock-signature-{}", state.sent.len() + 1)
        };
        state.sent.push(signature.clone());
        if let Some((owner, amount)) = state.send_credit.clone() {
            let balance = state.token_balances.entry(owner).or_insert(0);
            *balance = balance.saturating_add(amount);
        }
        Ok(signature)
    }

    async fn signature_status(&self, _signature: &str) -> Result<SignatureStatus, ChainError> {
        let mut state = lock(&self.state);
        if state.statuses.len() > 1 {
            if let Some(status) = state.statuses.pop_front() {
                return Ok(status);
            }
        }
        Ok(state
            .statuses
            .front()
            .cloned()
            .unwrap_or(SignatureStatus::Confirmed { slot: 1 }))
    }
}

fn mock_quote(request: &QuoteRequest, out_amount: u64) -> QuoteResult {
    let min_out_amount = out_amount * u64::from(10_000 - request.slippage_bps.min(10_000)) / 10_000;
    QuoteResult {
        input_mint: request.input_mint.clone(),
        output_mint: request.output_mint.clone(),
        in_amount: request.amount,
        out_amount,
        min_out_amount,
        price_impact_pct: 0.001,
        route_labels: vec!["Mock".to_string()],
        slippage_bps: request.slippage_bps,
        fetched_at: Utc::now(),
        expires_at: Instant::now() + Duration::from_secs(30),
        raw: serde_json::json!({ "inAmount": request.amount.to_string() }),
    }
}

/// Scripted failure returned by [`MockSwapService::quote`]
#[derive(Debug, Clone)]
pub enum ServiceReply {
    RateLimited,
    Timeout,
    NoRoute,
}

#[derive(Default)]
struct ServiceState {
    replies: VecDeque<ServiceReply>,
    quote_times: Vec<Instant>,
    swap_calls: u32,
}

/// Stand-in for the Jupiter API
pub struct MockSwapService {
    out_amount: u64,
    state: Mutex<ServiceState>,
}

impl MockSwapService {
    pub fn new(out_amount: u64) -> Self {
        Self {
            out_amount,
            state: Mutex::new(ServiceState::default()),
        }
    }

    /// Failures for the next quote calls, in order; later calls succeed
    pub fn queue_quote_replies(&self, replies: Vec<ServiceReply>) {
        lock(&self.state).replies.extend(replies);
    }

    pub fn quote_calls(&self) -> usize {
        lock(&self.state).quote_times.len()
    }

    pub fn swap_calls(&self) -> u32 {
        lock(&self.state).swap_calls
    }

    /// Time between consecutive quote calls
    pub fn quote_call_gaps(&self) -> Vec<Duration> {
        lock(&self.state)
            .quote_times
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl SwapService for MockSwapService {
    async fn quote(&self, request: &QuoteRequest) -> Result<QuoteResult, SwapError> {
        let reply = {
            let mut state = lock(&self.state);
            state.quote_times.push(Instant::now());
            state.replies.pop_front()
        };
        match reply {
            Some(ServiceReply::RateLimited) => Err(SwapError::RateLimited { retry_after: None }),
            Some(ServiceReply::Timeout) => Err(SwapError::Timeout),
            Some(ServiceReply::NoRoute) => Err(SwapError::NoRoute("no route".to_string())),
            None => Ok(mock_quote(request, self.out_amount)),
        }
    }

    async fn swap_transaction(
        &self,
        _quote: &QuoteResult,
        user_pubkey: &str,
    ) -> Result<String, SwapError> {
        lock(&self.state).swap_calls += 1;
        let payer = pubkey_bytes(user_pubkey);
        Ok(BASE64.encode(unsigned_transaction(&payer, false)))
    }
}

/// How a [`MockSwapper`] execution ends
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Success,
    Fail(SwapError),
    /// Reported unknown, but balances moved
    UnknownLanded,
    /// Reported unknown, and nothing happened on chain
    UnknownLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedSwap {
    pub input_mint: String,
    pub output_mint: String,
    pub amount: u64,
    pub slippage_bps: u16,
}

#[derive(Default)]
struct SwapperState {
    quote_errors: VecDeque<SwapError>,
    outcomes: VecDeque<ScriptedOutcome>,
    executed: Vec<ExecutedSwap>,
    quote_calls: usize,
    execute_delay: Duration,
    panic_mint: Option<String>,
    fill_at_minimum: bool,
}

/// Scripted [`Swapper`] that moves token balances on a [`MockChain`].
///
/// Buys yield 1000 tokens; sells yield 0.49 SOL. Unscripted executions succeed.
pub struct MockSwapper {
    chain: Arc<MockChain>,
    state: Mutex<SwapperState>,
}

pub const MOCK_TOKENS_PER_BUY: u64 = 1000;
const MOCK_LAMPORTS_PER_SELL: u64 = 490_000_000;

impl MockSwapper {
    pub fn new(chain: Arc<MockChain>) -> Self {
        Self {
            chain,
            state: Mutex::new(SwapperState::default()),
        }
    }

    pub fn fail_quotes_with(&self, errors: Vec<SwapError>) {
        lock(&self.state).quote_errors.extend(errors);
    }

    pub fn script(&self, outcomes: Vec<ScriptedOutcome>) {
        lock(&self.state).outcomes.extend(outcomes);
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        lock(&self.state).execute_delay = delay;
    }

    /// Settle buys at the quote's minimum output instead of its estimate
    pub fn fill_at_minimum(&self) {
        lock(&self.state).fill_at_minimum = true;
    }

    /// Panic inside any execution touching `mint`
    pub fn panic_on_mint(&self, mint: &str) {
        lock(&self.state).panic_mint = Some(mint.to_string());
    }

    pub fn quote_calls(&self) -> usize {
        lock(&self.state).quote_calls
    }

    pub fn executed(&self) -> Vec<ExecutedSwap> {
        lock(&self.state).executed.clone()
    }

    fn settle(&self, quote: &QuoteResult, owner: &str) {
        if quote.input_mint == mints::WSOL {
            let received = if lock(&self.state).fill_at_minimum {
                quote.min_out_amount
            } else {
                quote.out_amount
            };
            self.chain.add_tokens(owner, received);
        } else {
            self.chain.remove_tokens(owner, quote.in_amount);
        }
    }
}

#[async_trait]
impl Swapper for MockSwapper {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<QuoteResult, SwapError> {
        let mut state = lock(&self.state);
        state.quote_calls += 1;
        if let Some(error) = state.quote_errors.pop_front() {
            return Err(error);
        }
        let request = QuoteRequest {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            amount,
            slippage_bps,
        };
        let out_amount = if input_mint == mints::WSOL {
            MOCK_TOKENS_PER_BUY
        } else {
            MOCK_LAMPORTS_PER_SELL
        };
        Ok(mock_quote(&request, out_amount))
    }

    async fn execute_swap(
        &self,
        quote: &QuoteResult,
        signer: &dyn TransactionSigner,
    ) -> SwapOutcome {
        let (delay, outcome, panic_mint) = {
            let mut state = lock(&self.state);
            state.executed.push(ExecutedSwap {
                input_mint: quote.input_mint.clone(),
                output_mint: quote.output_mint.clone(),
                amount: quote.in_amount,
                slippage_bps: quote.slippage_bps,
            });
            let outcome = state.outcomes.pop_front().unwrap_or(ScriptedOutcome::Success);
            (state.execute_delay, outcome, state.panic_mint.clone())
        };

        if let Some(mint) = panic_mint {
            if quote.input_mint == mint || quote.output_mint == mint {
                panic!("mock swapper exploded on {}", mint);
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let owner = signer.address();
        let signature = format!("mock-swap-{}", self.executed().len());
        match outcome {
            ScriptedOutcome::Success => {
                self.settle(quote, &owner);
                SwapOutcome::Success {
                    signature,
                    output_amount: quote.out_amount,
                }
            }
            ScriptedOutcome::Fail(error) => SwapOutcome::Failed { error },
            ScriptedOutcome::UnknownLanded => {
                self.settle(quote, &owner);
                SwapOutcome::Unknown { signature }
            }
            ScriptedOutcome::UnknownLost => SwapOutcome::Unknown { signature },
        }
    }
}

/// A supervisor wired to mocks, with the event stream captured
pub struct CycleHarness {
    pub supervisor: CycleSupervisor,
    pub chain: Arc<MockChain>,
    pub swapper: Arc<MockSwapper>,
    pub store: Arc<MemoryStateStore>,
    pub configs: InMemoryConfigSource,
    pub events: mpsc::UnboundedReceiver<CycleEvent>,
    signers: Arc<StaticKeyring>,
    wallets: HashMap<String, String>,
    timing: CycleTiming,
}

impl CycleHarness {
    pub fn new(agents: Vec<AgentConfig>) -> Self {
        let chain = Arc::new(MockChain::new());
        let swapper = Arc::new(MockSwapper::new(chain.clone()));
        let store = Arc::new(MemoryStateStore::new());

        let mut keyring = StaticKeyring::new();
        let mut wallets = HashMap::new();
        for (i, agent) in agents.iter().enumerate() {
            let wallet = test_wallet(i as u8 + 1);
            wallets.insert(agent.agent_id.clone(), wallet.address());
            keyring = keyring.with_signer(agent.agent_id.clone(), Arc::new(wallet));
        }

        let configs = InMemoryConfigSource::new(agents);
        let timing = CycleTiming::default();
        let signers = Arc::new(keyring);
        let (supervisor, events) = Self::build(
            &chain,
            &swapper,
            &store,
            &configs,
            &signers,
            &timing,
        );

        Self {
            supervisor,
            chain,
            swapper,
            store,
            configs,
            events,
            signers,
            wallets,
            timing,
        }
    }

    fn build(
        chain: &Arc<MockChain>,
        swapper: &Arc<MockSwapper>,
        store: &Arc<MemoryStateStore>,
        configs: &InMemoryConfigSource,
        signers: &Arc<StaticKeyring>,
        timing: &CycleTiming,
    ) -> (CycleSupervisor, mpsc::UnboundedReceiver<CycleEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let deps = CycleDeps {
            swapper: swapper.clone(),
            chain: chain.clone(),
            store: store.clone(),
            configs: Arc::new(configs.clone()),
            timing: timing.clone(),
            events,
        };
        (CycleSupervisor::new(deps, signers.clone()), receiver)
    }

    /// Replace the supervisor with a fresh one over the same store and mocks
    pub fn restart(&mut self) {
        let (supervisor, events) = Self::build(
            &self.chain,
            &self.swapper,
            &self.store,
            &self.configs,
            &self.signers,
            &self.timing,
        );
        self.supervisor = supervisor;
        self.events = events;
    }

    pub fn wallet_address(&self, agent_id: &str) -> String {
        self.wallets.get(agent_id).cloned().unwrap_or_default()
    }

    pub async fn store_state(&self, agent_id: &str) -> AgentCycleState {
        self.store
            .load(agent_id)
            .await
            .expect("memory store never fails")
            .expect("agent state persisted")
    }

    pub async fn next_event(&mut self) -> CycleEvent {
        tokio::time::timeout(Duration::from_secs(24 * 3600), self.events.recv())
            .await
            .expect("timed out waiting for a cycle event")
            .expect("event channel closed")
    }

    pub async fn wait_for_transition(&mut self, from: Phase, to: Phase) -> CycleEvent {
        loop {
            let event = self.next_event().await;
            if event.from == from && event.to == to {
                return event;
            }
        }
    }

    /// Wait for the next transition into `phase` and return the agent's state
    pub async fn wait_for_phase(&mut self, phase: Phase) -> AgentCycleState {
        loop {
            let event = self.next_event().await;
            if event.to == phase {
                return self.current_state(&event.agent_id).await;
            }
        }
    }

    pub async fn wait_for_agent_phase(&mut self, agent_id: &str, phase: Phase) -> AgentCycleState {
        loop {
            let event = self.next_event().await;
            if event.agent_id == agent_id && event.to == phase {
                return self.current_state(agent_id).await;
            }
        }
    }

    async fn current_state(&self, agent_id: &str) -> AgentCycleState {
        self.supervisor
            .status(agent_id)
            .await
            .expect("status lookup")
            .expect("agent has a state")
    }
}
