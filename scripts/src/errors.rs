//! Definitions of errors that can occur while deploying the exchange contracts

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    time::Duration,
};

use alloy_primitives::{Address, TxHash};

use crate::report::AddressReport;

/// Errors that can occur while resolving, submitting, or confirming a deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    /// The resource policy resolved to unusable transaction parameters
    InvalidPolicy(String),
    /// No compiled artifact matches the requested contract name
    UnknownContract(String),
    /// Error parsing a compilation artifact
    ArtifactParsing(String),
    /// Error constructing creation code or calldata for a contract
    CalldataConstruction(String),
    /// A submission or polling failure that may succeed if retried
    Transient(String),
    /// A submitted transaction was not confirmed within the wait bound
    ConfirmationTimeout {
        /// The hash of the transaction that was being waited on
        tx_hash: TxHash,
        /// How long the step waited before giving up
        waited: Duration,
    },
    /// An on-chain revert or a refusal resubmission cannot fix, never retried
    Fatal(String),
    /// A deployment that failed after its implementation was already on chain
    PartialDeployment {
        /// The confirmed implementation
        implementation: Address,
        /// What failed after it
        cause: Box<DeployError>,
    },
    /// The address does not hold an EIP-1967 proxy
    ProxyNotFound(Address),
    /// A step referenced a role that has not been deployed yet
    UnresolvedRole(String),
    /// The plan itself is malformed
    InvalidPlan(String),
    /// The step was cancelled while in flight
    Cancelled(String),
    /// Error initializing the RPC client
    ClientInitialization(String),
    /// Error reading the deployments file
    ReadDeployments(String),
    /// Error writing the deployments file
    WriteDeployments(String),
}

impl DeployError {
    /// Whether the caller may retry the failed operation with an unchanged request
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::Transient(_))
    }
}

impl Display for DeployError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeployError::InvalidPolicy(s) => write!(f, "invalid resource policy: {}", s),
            DeployError::UnknownContract(s) => write!(f, "unknown contract: {}", s),
            DeployError::ArtifactParsing(s) => write!(f, "error parsing artifact: {}", s),
            DeployError::CalldataConstruction(s) => write!(f, "error constructing calldata: {}", s),
            DeployError::Transient(s) => write!(f, "transient network error: {}", s),
            DeployError::ConfirmationTimeout { tx_hash, waited } => write!(
                f,
                "transaction {:#x} not confirmed after {}s",
                tx_hash,
                waited.as_secs()
            ),
            DeployError::Fatal(s) => write!(f, "transaction failed: {}", s),
            DeployError::PartialDeployment {
                implementation,
                cause,
            } => write!(f, "{} (implementation {:#x} is deployed)", cause, implementation),
            DeployError::ProxyNotFound(a) => write!(f, "no proxy found at {:#x}", a),
            DeployError::UnresolvedRole(s) => write!(f, "role `{}` has not been deployed", s),
            DeployError::InvalidPlan(s) => write!(f, "invalid deployment plan: {}", s),
            DeployError::Cancelled(s) => write!(f, "cancelled: {}", s),
            DeployError::ClientInitialization(s) => write!(f, "error initializing client: {}", s),
            DeployError::ReadDeployments(s) => write!(f, "error reading deployments: {}", s),
            DeployError::WriteDeployments(s) => write!(f, "error writing deployments: {}", s),
        }
    }
}

impl Error for DeployError {}

/// A plan that halted partway, with the addresses it managed to deploy
#[derive(Debug, Clone)]
pub struct PlanFailure {
    /// The role whose step failed
    pub role: String,
    /// The underlying, unreclassified cause
    pub cause: DeployError,
    /// Everything recorded before the failing step, and whatever that step
    /// left on chain before failing
    pub report: AddressReport,
}

impl Display for PlanFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "step `{}` failed: {}", self.role, self.cause)
    }
}

impl Error for PlanFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}
