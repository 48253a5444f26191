//! The address report: what each role of a deployment run resolved to

use std::fmt::{self, Display, Formatter};

use alloy_primitives::{Address, TxHash};
use serde::{Deserialize, Serialize};

use crate::{errors::DeployError, types::ContractName};

/// A confirmed contract deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedInstance {
    /// The instance's address; for proxies, the proxy's stable address
    pub address: Address,
    /// The transaction that created (or last upgraded) the instance
    pub transaction_hash: TxHash,
    /// The contract deployed, for proxies the implementation contract
    pub contract_name: ContractName,
    /// Whether the address is a proxy
    pub is_proxy: bool,
    /// The implementation behind the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation_address: Option<Address>,
}

/// What an unfinished step left on chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    /// A confirmed implementation still waiting for its proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<DeployedInstance>,
    /// An accepted transaction whose outcome is not yet known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<TxHash>,
}

/// An ordered, role-keyed record of a deployment run.
///
/// Append-only within a run; persisted between runs so that a re-run skips
/// every role already recorded. A step that halts partway keeps what it
/// already put on chain under its role's progress, which the re-run picks up
/// instead of deploying again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressReport {
    /// Deployed instances by role, in deployment order
    #[serde(default, with = "ordered_map")]
    deployments: Vec<(String, DeployedInstance)>,
    /// Completed post-deployment calls by role, in execution order
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    actions: Vec<(String, TxHash)>,
    /// Progress of unfinished steps by role
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    in_flight: Vec<(String, StepProgress)>,
}

impl AddressReport {
    /// An empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deployed instance under `role`
    pub fn record(&mut self, role: &str, instance: DeployedInstance) -> Result<(), DeployError> {
        self.ensure_vacant(role)?;
        self.deployments.push((role.to_string(), instance));
        self.in_flight.retain(|(r, _)| r != role);
        Ok(())
    }

    /// Record a completed call under `role`
    pub fn record_action(&mut self, role: &str, tx_hash: TxHash) -> Result<(), DeployError> {
        self.ensure_vacant(role)?;
        self.actions.push((role.to_string(), tx_hash));
        self.in_flight.retain(|(r, _)| r != role);
        Ok(())
    }

    /// Record the confirmed implementation of the proxy step running under `role`
    pub fn record_implementation(&mut self, role: &str, instance: DeployedInstance) {
        let progress = self.progress_mut(role);
        progress.implementation = Some(instance);
        progress.pending = None;
    }

    /// Record a transaction of `role`'s step that was accepted but not yet confirmed
    pub fn record_pending(&mut self, role: &str, tx_hash: TxHash) {
        self.progress_mut(role).pending = Some(tx_hash);
    }

    /// Forget `role`'s pending transaction once it settled without a result to record
    pub fn clear_pending(&mut self, role: &str) {
        self.progress_mut(role).pending = None;
        self.in_flight
            .retain(|(_, progress)| *progress != StepProgress::default());
    }

    /// The progress of `role`'s unfinished step
    pub fn progress(&self, role: &str) -> Option<&StepProgress> {
        self.in_flight
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, progress)| progress)
    }

    /// The transaction `role`'s step is waiting on, if any
    pub fn pending(&self, role: &str) -> Option<TxHash> {
        self.progress(role).and_then(|progress| progress.pending)
    }

    /// Replace the instance recorded under `role` after an upgrade, keeping its position
    pub fn record_upgrade(
        &mut self,
        role: &str,
        instance: DeployedInstance,
    ) -> Result<(), DeployError> {
        let entry = self
            .deployments
            .iter_mut()
            .find(|(r, _)| r == role)
            .ok_or_else(|| DeployError::UnresolvedRole(role.to_string()))?;

        if entry.1.address != instance.address {
            return Err(DeployError::InvalidPlan(format!(
                "upgrade of `{}` moved its address from {:#x} to {:#x}",
                role, entry.1.address, instance.address
            )));
        }

        entry.1 = instance;
        Ok(())
    }

    /// The instance deployed under `role`
    pub fn get(&self, role: &str) -> Option<&DeployedInstance> {
        self.deployments
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, instance)| instance)
    }

    /// The address deployed under `role`, for binding later steps' arguments
    pub fn address_of(&self, role: &str) -> Result<Address, DeployError> {
        self.get(role)
            .map(|instance| instance.address)
            .ok_or_else(|| DeployError::UnresolvedRole(role.to_string()))
    }

    /// The transaction of the call completed under `role`
    pub fn action(&self, role: &str) -> Option<TxHash> {
        self.actions
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, tx_hash)| *tx_hash)
    }

    /// Whether anything has been recorded under `role`
    pub fn contains(&self, role: &str) -> bool {
        self.get(role).is_some() || self.action(role).is_some()
    }

    /// The deployed instances, in deployment order
    pub fn deployments(&self) -> impl Iterator<Item = (&str, &DeployedInstance)> {
        self.deployments.iter().map(|(r, i)| (r.as_str(), i))
    }

    /// The number of deployed instances
    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    /// Whether nothing has been deployed
    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }

    /// The flat `role -> address` listing, as JSON
    pub fn to_address_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.deployments
                .iter()
                .map(|(role, instance)| {
                    (
                        role.clone(),
                        serde_json::Value::String(format!("{:#x}", instance.address)),
                    )
                })
                .collect(),
        )
    }

    /// The progress entry of `role`, created if missing
    fn progress_mut(&mut self, role: &str) -> &mut StepProgress {
        let idx = match self.in_flight.iter().position(|(r, _)| r == role) {
            Some(idx) => idx,
            None => {
                self.in_flight.push((role.to_string(), StepProgress::default()));
                self.in_flight.len() - 1
            }
        };
        &mut self.in_flight[idx].1
    }

    /// Fail if `role` is already recorded
    fn ensure_vacant(&self, role: &str) -> Result<(), DeployError> {
        if self.contains(role) {
            return Err(DeployError::InvalidPlan(format!(
                "role `{}` is already recorded",
                role
            )));
        }
        Ok(())
    }
}

impl Display for AddressReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (role, instance) in &self.deployments {
            write!(f, "{}: {:#x} ({})", role, instance.address, instance.contract_name)?;
            if let Some(implementation) = instance.implementation_address {
                write!(f, " proxy, implementation {:#x}", implementation)?;
            }
            writeln!(f)?;
        }
        for (role, tx_hash) in &self.actions {
            writeln!(f, "{}: done in {:#x}", role, tx_hash)?;
        }
        for (role, progress) in &self.in_flight {
            write!(f, "{}: unfinished", role)?;
            if let Some(implementation) = &progress.implementation {
                write!(f, ", implementation {:#x}", implementation.address)?;
            }
            if let Some(tx_hash) = progress.pending {
                write!(f, ", awaiting {:#x}", tx_hash)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// De/serializes a `Vec` of pairs as a map, preserving order
mod ordered_map {
    use std::{fmt, marker::PhantomData};

    use serde::{
        de::{MapAccess, Visitor},
        Deserialize, Deserializer, Serialize, Serializer,
    };

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S, K, V>(entries: &Vec<(K, V)>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<Vec<(K, V)>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de>,
        V: Deserialize<'de>,
    {
        struct PairsVisitor<K, V>(PhantomData<(K, V)>);

        impl<'de, K: Deserialize<'de>, V: Deserialize<'de>> Visitor<'de> for PairsVisitor<K, V> {
            type Value = Vec<(K, V)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or_default());
                while let Some(entry) = map.next_entry()? {
                    entries.push(entry);
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(PairsVisitor(PhantomData))
    }
}
