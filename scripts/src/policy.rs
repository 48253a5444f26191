//! Transaction resource policies: gas limit and fee parameters

use serde::{Deserialize, Serialize};

use crate::{constants::DEFAULT_GAS_LIMIT, errors::DeployError};

/// How a transaction's fees are priced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FeeModel {
    /// A single legacy gas price, in wei
    Legacy {
        /// The gas price, in wei
        gas_price: u128,
    },
    /// EIP-1559 fee market fields, in wei
    Eip1559 {
        /// The maximum total fee per gas
        max_fee_per_gas: u128,
        /// The maximum tip per gas
        max_priority_fee_per_gas: u128,
    },
    /// Leave fees to the node's estimate
    Market,
}

/// The resource parameters attached to a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// The gas limit, never zero
    gas_limit: u64,
    /// The fee parameters
    fees: FeeModel,
}

/// A partial policy, merged field-wise onto a default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Replaces the default gas limit when set
    pub gas_limit: Option<u64>,
    /// Replaces the default fee model when set
    pub fees: Option<FeeModel>,
}

impl ResourcePolicy {
    /// Build a validated policy
    pub fn new(gas_limit: u64, fees: FeeModel) -> Result<Self, DeployError> {
        let policy = Self { gas_limit, fees };
        policy.validate()?;
        Ok(policy)
    }

    /// The gas limit
    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    /// The fee parameters
    pub fn fees(&self) -> FeeModel {
        self.fees
    }

    /// Merge an optional override onto this policy.
    ///
    /// Fields absent from the override keep this policy's values. The merged
    /// result is validated, so a zero gas limit from either side is rejected.
    pub fn resolve(&self, over: Option<&PolicyOverride>) -> Result<Self, DeployError> {
        let merged = match over {
            Some(over) => Self {
                gas_limit: over.gas_limit.unwrap_or(self.gas_limit),
                fees: over.fees.unwrap_or(self.fees),
            },
            None => *self,
        };

        merged.validate()?;
        Ok(merged)
    }

    /// Check the policy invariants
    fn validate(&self) -> Result<(), DeployError> {
        if self.gas_limit == 0 {
            return Err(DeployError::InvalidPolicy(
                "gas limit must be positive".to_string(),
            ));
        }

        if let FeeModel::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } = self.fees
        {
            if max_priority_fee_per_gas > max_fee_per_gas {
                return Err(DeployError::InvalidPolicy(format!(
                    "priority fee {} exceeds max fee {}",
                    max_priority_fee_per_gas, max_fee_per_gas
                )));
            }
        }

        Ok(())
    }
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            gas_limit: DEFAULT_GAS_LIMIT,
            fees: FeeModel::Market,
        }
    }
}
