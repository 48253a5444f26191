//! Constants used in the deploy scripts

use alloy_primitives::{address, b256, Address, B256};

/// The storage slot containing the implementation address in an upgradeable proxy.
///
/// This is specified in EIP1967: https://eips.ethereum.org/EIPS/eip-1967#logic-contract-address
pub const PROXY_IMPLEMENTATION_STORAGE_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// The storage slot containing the proxy admin contract address in the upgradeable proxy.
///
/// This is specified in EIP1967: https://eips.ethereum.org/EIPS/eip-1967#admin-address
pub const PROXY_ADMIN_STORAGE_SLOT: B256 =
    b256!("b53127684a568b3173ae13b9f8a6016e243e63b6e8ee1178d6a717850b5d6103");

/// The number of bytes stored in a single storage slot
pub const NUM_BYTES_STORAGE_SLOT: usize = 32;

/// The number of bytes in an Ethereum address
pub const NUM_BYTES_ADDRESS: usize = 20;

/// The number of bytes in a function selector
pub const NUM_BYTES_SELECTOR: usize = 4;

/// The name of the upgradeable proxy artifact.
///
/// Compiled from https://github.com/OpenZeppelin/openzeppelin-contracts/blob/v5.0.0/contracts/proxy/transparent/TransparentUpgradeableProxy.sol
pub const DEFAULT_PROXY_CONTRACT: &str = "TransparentUpgradeableProxy";

/// The default gas limit attached to every transaction
pub const DEFAULT_GAS_LIMIT: u64 = 6_000_000;

/// The default number of submission attempts per transaction
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The default delay before the first resubmission, in milliseconds
pub const DEFAULT_BACKOFF_MS: u64 = 1_000;

/// The ceiling on the delay between resubmissions, in milliseconds
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// The default bound on waiting for a transaction to be confirmed, in seconds
pub const DEFAULT_CONFIRMATION_TIMEOUT_SECS: u64 = 120;

/// The default interval between receipt polls, in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Fragments of node and transport errors after which resubmitting the same
/// transaction can succeed. Any other refusal is permanent.
pub const TRANSIENT_SUBMISSION_ERRORS: &[&str] = &[
    "nonce",
    "underpriced",
    "replacement transaction",
    "already known",
    "timeout",
    "timed out",
    "connection",
    "error sending request",
    "rate limit",
    "too many requests",
];

/// The default network label
pub const DEFAULT_NETWORK: &str = "hardhat";

/// The default location of the Hardhat artifacts tree
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";

/// The directory Hardhat writes build info to, which holds no contract artifacts
pub const BUILD_INFO_DIR: &str = "build-info";

/// The suffix of Hardhat debug artifacts
pub const DEBUG_ARTIFACT_SUFFIX: &str = ".dbg.json";

/// The extension of an artifact file
pub const ARTIFACT_EXTENSION: &str = "json";

/// The name of the initializer invoked on the exchange core through its proxy
pub const INITIALIZER_NAME: &str = "initialize";

/// The name of the ownership transfer method on the exchange core
pub const TRANSFER_OWNERSHIP_NAME: &str = "transferOwnership";

/// The checker contract role in the deployments file
pub const CHECKER_ROLE: &str = "Checker";

/// The exchange core (market) proxy role in the deployments file
pub const MARKET_ROLE: &str = "Market";

/// The ownership transfer action role in the deployments file
pub const MARKET_OWNERSHIP_ROLE: &str = "MarketOwnership";

/// The default checker contract name
pub const DEFAULT_CHECKER_CONTRACT: &str = "Checker";

/// The default exchange core contract name
pub const DEFAULT_MARKET_CONTRACT: &str = "ExchangeCore";

/// The address the simulated chain deploys from, the first default Hardhat account
pub const SIMULATED_SENDER: Address = address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
