//! An in-memory chain implementing [`NetworkClient`], for dry runs and tests.
//!
//! Contract creation succeeds unless the creation code was marked as reverting,
//! and lands at the CREATE address of the sender and its nonce. Creation code
//! that starts with the registered proxy bytecode is treated as an OpenZeppelin
//! `TransparentUpgradeableProxy`: its EIP-1967 slots are written, its
//! constructor `data` is executed as a call through the proxy, and its admin
//! accepts `upgradeAndCall`. Calls through a proxy whose selector is a
//! registered initializer succeed once per proxy and revert afterwards.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use alloy_primitives::{keccak256, Address, Bytes, Selector, TxHash, B256, U256};
use alloy_sol_types::SolCall;
use tokio::time::sleep;

use crate::{
    client::{ClientError, NetworkClient},
    constants::{
        NUM_BYTES_ADDRESS, NUM_BYTES_SELECTOR, NUM_BYTES_STORAGE_SLOT, PROXY_ADMIN_STORAGE_SLOT,
        PROXY_IMPLEMENTATION_STORAGE_SLOT,
    },
    policy::ResourcePolicy,
    solidity::upgradeAndCallCall,
    types::{Confirmation, TxPayload},
};

/// The revert reason of OpenZeppelin's `Initializable` guard
const ALREADY_INITIALIZED: &str = "Initializable: contract is already initialized";

/// The nonce at which OpenZeppelin v5 proxies create their `ProxyAdmin`
const PROXY_ADMIN_NONCE: u64 = 1;

/// The mutable state of a [`SimulatedChain`]
#[derive(Default)]
struct ChainState {
    /// The sender's next nonce
    nonce: u64,
    /// Creation code of every deployed contract
    code: HashMap<Address, Bytes>,
    /// Contract storage
    storage: HashMap<(Address, B256), B256>,
    /// Outcomes of accepted transactions
    receipts: HashMap<TxHash, Confirmation>,
    /// Creation code recognised as an upgradeable proxy
    proxy_code: Option<Bytes>,
    /// Proxy admins, mapped to the proxy they administer
    admins: HashMap<Address, Address>,
    /// Selectors guarded as one-time initializers
    initializers: HashSet<Selector>,
    /// Successful initializer executions per proxy
    initializations: HashMap<Address, usize>,
    /// Every successful call, in order
    calls: Vec<(Address, Bytes)>,
    /// Creation code whose deployment reverts
    reverting_code: Vec<Bytes>,
    /// Refused submissions still to come, and the refusal message
    failing_submissions: (usize, String),
    /// Confirmations that will time out, still to come
    stalled_confirmations: usize,
    /// Confirmations that go through before the stalled ones
    confirmations_before_stall: usize,
    /// Whether confirmation waits block for their full timeout
    hold_confirmations: bool,
    /// Every call to `submit_transaction`
    submission_attempts: usize,
    /// Every accepted transaction
    submissions: usize,
}

/// An in-memory chain with a single sender
pub struct SimulatedChain {
    /// The account every transaction is sent from
    sender: Address,
    /// The chain state
    state: Mutex<ChainState>,
}

impl SimulatedChain {
    /// An empty chain
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            state: Mutex::new(ChainState::default()),
        }
    }

    /// Recognise creation code starting with `code` as an upgradeable proxy
    pub fn with_proxy_code(self, code: Bytes) -> Self {
        self.state().proxy_code = Some(code);
        self
    }

    /// Guard calls with `selector` made through a proxy as one-time initializers
    pub fn guard_initializer(&self, selector: Selector) {
        self.state().initializers.insert(selector);
    }

    /// Refuse the next `count` submissions with `reason`, classified as a node would be
    pub fn fail_next_submissions(&self, count: usize, reason: &str) {
        self.state().failing_submissions = (count, reason.to_string());
    }

    /// Revert every creation whose code starts with `code`
    pub fn revert_creations_of(&self, code: Bytes) {
        self.state().reverting_code.push(code);
    }

    /// Time out the next `count` confirmation waits
    pub fn stall_next_confirmations(&self, count: usize) {
        self.stall_confirmations_after(0, count);
    }

    /// Let `confirmed` confirmation waits through, then time out the next `count`
    pub fn stall_confirmations_after(&self, confirmed: usize, count: usize) {
        let mut state = self.state();
        state.confirmations_before_stall = confirmed;
        state.stalled_confirmations = count;
    }

    /// Make every confirmation wait block for its full timeout
    pub fn hold_confirmations(&self, hold: bool) {
        self.state().hold_confirmations = hold;
    }

    /// Whether a contract is deployed at `address`
    pub fn has_code(&self, address: Address) -> bool {
        self.state().code.contains_key(&address)
    }

    /// The number of transactions accepted
    pub fn submissions(&self) -> usize {
        self.state().submissions
    }

    /// The number of submissions attempted, accepted or not
    pub fn submission_attempts(&self) -> usize {
        self.state().submission_attempts
    }

    /// The number of successful initializer executions through `proxy`
    pub fn initializations(&self, proxy: Address) -> usize {
        self.state()
            .initializations
            .get(&proxy)
            .copied()
            .unwrap_or_default()
    }

    /// Every successful call made to `to`
    pub fn calls_to(&self, to: Address) -> Vec<Bytes> {
        self.state()
            .calls
            .iter()
            .filter(|(addr, _)| *addr == to)
            .map(|(_, calldata)| calldata.clone())
            .collect()
    }

    /// Lock the chain state
    fn state(&self) -> MutexGuard<'_, ChainState> {
        // A panic while holding the lock leaves no partial update behind
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChainState {
    /// Execute a contract creation at `address`
    fn create(&mut self, address: Address, code: Bytes) -> Confirmation {
        if self.reverting_code.iter().any(|c| code.starts_with(c)) {
            return Confirmation::Reverted {
                reason: "contract creation reverted".to_string(),
            };
        }

        let proxy_args = self
            .proxy_code
            .as_ref()
            .filter(|proxy_code| code.starts_with(proxy_code))
            .map(|proxy_code| code.slice(proxy_code.len()..));
        if let Some(args) = proxy_args {
            let Some(data) = proxy_init_data(&args) else {
                return Confirmation::Reverted {
                    reason: "malformed proxy constructor arguments".to_string(),
                };
            };

            let admin = address.create(PROXY_ADMIN_NONCE);
            self.storage.insert(
                (address, PROXY_IMPLEMENTATION_STORAGE_SLOT),
                B256::from_slice(&args[..NUM_BYTES_STORAGE_SLOT]),
            );
            self.storage.insert(
                (address, PROXY_ADMIN_STORAGE_SLOT),
                B256::left_padding_from(admin.as_slice()),
            );
            self.admins.insert(admin, address);
            self.code.insert(admin, Bytes::new());

            if !data.is_empty() {
                let selector = (data.len() >= NUM_BYTES_SELECTOR)
                    .then(|| Selector::from_slice(&data[..NUM_BYTES_SELECTOR]));
                if selector.is_some_and(|selector| self.initializers.contains(&selector)) {
                    *self.initializations.entry(address).or_default() += 1;
                }
                self.calls.push((address, data));
            }
        }

        self.code.insert(address, code);
        Confirmation::Success {
            contract_address: Some(address),
        }
    }

    /// Execute a call to `to`
    fn call(&mut self, to: Address, calldata: Bytes) -> Confirmation {
        let selector = (calldata.len() >= NUM_BYTES_SELECTOR)
            .then(|| Selector::from_slice(&calldata[..NUM_BYTES_SELECTOR]));

        let outcome = match (self.admins.get(&to).copied(), selector) {
            (Some(proxy), Some(selector)) if selector == Selector::from(upgradeAndCallCall::SELECTOR) => {
                self.upgrade(proxy, &calldata)
            }
            (None, Some(selector)) if self.is_proxy(to) && self.initializers.contains(&selector) => {
                let count = self.initializations.entry(to).or_default();
                if *count > 0 {
                    Confirmation::Reverted {
                        reason: ALREADY_INITIALIZED.to_string(),
                    }
                } else {
                    *count += 1;
                    Confirmation::Success {
                        contract_address: None,
                    }
                }
            }
            _ => Confirmation::Success {
                contract_address: None,
            },
        };

        if matches!(outcome, Confirmation::Success { .. }) {
            self.calls.push((to, calldata));
        }
        outcome
    }

    /// Point `proxy` at a new implementation through its admin
    fn upgrade(&mut self, proxy: Address, calldata: &[u8]) -> Confirmation {
        let call = match upgradeAndCallCall::abi_decode(calldata) {
            Ok(call) => call,
            Err(e) => {
                return Confirmation::Reverted {
                    reason: e.to_string(),
                }
            }
        };

        if call.proxy != proxy || !self.code.contains_key(&call.implementation) {
            return Confirmation::Reverted {
                reason: "ERC1967InvalidImplementation".to_string(),
            };
        }

        self.storage.insert(
            (proxy, PROXY_IMPLEMENTATION_STORAGE_SLOT),
            B256::left_padding_from(call.implementation.as_slice()),
        );
        Confirmation::Success {
            contract_address: None,
        }
    }

    /// Whether `address` holds a proxy
    fn is_proxy(&self, address: Address) -> bool {
        self.storage
            .get(&(address, PROXY_IMPLEMENTATION_STORAGE_SLOT))
            .is_some_and(|slot| {
                slot[NUM_BYTES_STORAGE_SLOT - NUM_BYTES_ADDRESS..] != [0u8; NUM_BYTES_ADDRESS]
            })
    }
}

/// The `data` argument of ABI-encoded `(address, address, bytes)` proxy
/// constructor arguments
fn proxy_init_data(args: &Bytes) -> Option<Bytes> {
    let len_word = args.get(3 * NUM_BYTES_STORAGE_SLOT..4 * NUM_BYTES_STORAGE_SLOT)?;
    let len = usize::try_from(U256::from_be_slice(len_word)).ok()?;
    let start = 4 * NUM_BYTES_STORAGE_SLOT;
    let end = start.checked_add(len)?;
    (end <= args.len()).then(|| args.slice(start..end))
}

impl NetworkClient for SimulatedChain {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn submit_transaction(
        &self,
        payload: TxPayload,
        _policy: &ResourcePolicy,
    ) -> Result<TxHash, ClientError> {
        let mut state = self.state();
        state.submission_attempts += 1;

        if state.failing_submissions.0 > 0 {
            state.failing_submissions.0 -= 1;
            return Err(ClientError::from_submission_message(
                state.failing_submissions.1.clone(),
            ));
        }

        let nonce = state.nonce;
        state.nonce += 1;
        state.submissions += 1;

        let mut preimage = self.sender.to_vec();
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(payload.to.unwrap_or_default().as_slice());
        preimage.extend_from_slice(&payload.input);
        let tx_hash = keccak256(preimage);

        let outcome = match payload.to {
            None => state.create(self.sender.create(nonce), payload.input),
            Some(to) => state.call(to, payload.input),
        };
        state.receipts.insert(tx_hash, outcome);

        Ok(tx_hash)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<Confirmation, ClientError> {
        let hold = {
            let mut state = self.state();
            if state.stalled_confirmations > 0 {
                if state.confirmations_before_stall > 0 {
                    state.confirmations_before_stall -= 1;
                } else {
                    state.stalled_confirmations -= 1;
                    return Err(ClientError::Timeout);
                }
            }
            state.hold_confirmations
        };

        if hold {
            sleep(timeout).await;
            return Err(ClientError::Timeout);
        }

        self.state()
            .receipts
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| ClientError::Rpc(format!("unknown transaction {:#x}", tx_hash)))
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ClientError> {
        Ok(self
            .state()
            .storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    //! Exchange contract artifacts with stand-in bytecode

    use alloy::json_abi::JsonAbi;
    use alloy_primitives::Bytes;

    use super::SimulatedChain;
    use crate::{
        artifacts::{ArtifactStore, CompiledArtifact, ContractBinder},
        constants::{DEFAULT_PROXY_CONTRACT, INITIALIZER_NAME, SIMULATED_SENDER},
    };

    /// Build an artifact from human-readable ABI items and stand-in bytecode
    fn artifact(name: &str, abi: &[&str], code: &'static [u8]) -> CompiledArtifact {
        let abi = JsonAbi::parse(abi.iter().copied()).unwrap();
        CompiledArtifact::new(name.into(), abi, Bytes::from_static(code)).unwrap()
    }

    /// The checker, exchange core (two versions), and proxy artifacts
    pub(crate) fn exchange_artifacts() -> ArtifactStore {
        ArtifactStore::new()
            .with_artifact(artifact(
                "Checker",
                &["constructor(address club)"],
                &[0xc0, 0xde, 0x01],
            ))
            .with_artifact(artifact(
                "ExchangeCore",
                &[
                    "function initialize(address checker, address vault)",
                    "function transferOwnership(address newOwner)",
                    "function owner() view returns (address)",
                ],
                &[0xc0, 0xde, 0x02],
            ))
            .with_artifact(artifact(
                "ExchangeCoreV2",
                &[
                    "function initialize(address checker, address vault)",
                    "function initializeV2(uint256 fee)",
                ],
                &[0xc0, 0xde, 0x03],
            ))
            .with_artifact(artifact(
                DEFAULT_PROXY_CONTRACT,
                &["constructor(address logic, address initialOwner, bytes data)"],
                &[0xc0, 0xde, 0xff],
            ))
    }

    /// A simulated chain that recognises the proxy and guards the exchange initializer
    pub(crate) fn exchange_chain(artifacts: &ArtifactStore) -> SimulatedChain {
        let proxy = artifacts.bind(&DEFAULT_PROXY_CONTRACT.into()).unwrap();
        let chain = SimulatedChain::new(SIMULATED_SENDER).with_proxy_code(proxy.bytecode().clone());

        let market = artifacts.bind(&"ExchangeCore".into()).unwrap();
        chain.guard_initializer(market.selector(INITIALIZER_NAME, 2).unwrap());
        chain
    }
}
