//! Type definitions used throughout the scripts

use std::fmt::{self, Display};

use alloy::dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes, TxHash};
use serde::{Deserialize, Serialize};

use crate::policy::ResourcePolicy;

/// The name of a compiled contract artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractName(String);

impl ContractName {
    /// Create a contract name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContractName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContractName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ContractName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A one-time setup call run through a proxy in place of a constructor
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    /// The name of the initializer method on the implementation
    pub name: String,
    /// The initializer's arguments
    pub args: Vec<DynSolValue>,
}

impl Initializer {
    /// Create an initializer call
    pub fn new(name: impl Into<String>, args: Vec<DynSolValue>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Everything needed to deploy one contract instance
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRequest {
    /// The contract to deploy
    pub contract: ContractName,
    /// The constructor arguments, in order
    pub constructor_args: Vec<DynSolValue>,
    /// The resolved resource policy for every transaction of this deployment
    pub policy: ResourcePolicy,
    /// The initializer to run through the proxy, for proxied deployments
    pub initializer: Option<Initializer>,
}

impl DeploymentRequest {
    /// A request for a plain deployment
    pub fn new(
        contract: impl Into<ContractName>,
        constructor_args: Vec<DynSolValue>,
        policy: ResourcePolicy,
    ) -> Self {
        Self {
            contract: contract.into(),
            constructor_args,
            policy,
            initializer: None,
        }
    }

    /// Attach an initializer, for deployment behind a proxy
    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// The same request as a plain deployment, e.g. of a proxy's implementation
    pub fn without_initializer(&self) -> Self {
        Self {
            initializer: None,
            ..self.clone()
        }
    }
}

/// The payload of a transaction handed to the network client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPayload {
    /// The recipient, `None` for contract creation
    pub to: Option<Address>,
    /// Creation code or calldata
    pub input: Bytes,
}

impl TxPayload {
    /// A contract creation transaction
    pub fn create(code: Bytes) -> Self {
        Self {
            to: None,
            input: code,
        }
    }

    /// A call to an existing contract
    pub fn call(to: Address, calldata: Bytes) -> Self {
        Self {
            to: Some(to),
            input: calldata,
        }
    }
}

/// The settled outcome of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The transaction executed successfully
    Success {
        /// The created contract, for creation transactions
        contract_address: Option<Address>,
    },
    /// The transaction was included but reverted
    Reverted {
        /// Whatever the network reports about the revert
        reason: String,
    },
}

/// A confirmed, successful transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// The transaction hash
    pub tx_hash: TxHash,
    /// The created contract, for creation transactions
    pub contract_address: Option<Address>,
}
