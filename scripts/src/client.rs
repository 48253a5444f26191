//! The narrow network-client interface the deployment logic depends on, and
//! its JSON-RPC implementation

use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use alloy::{
    network::{EthereumWallet, TransactionBuilder},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
};
use alloy_primitives::{Address, TxHash, B256, U256};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::{
    constants::TRANSIENT_SUBMISSION_ERRORS,
    errors::DeployError,
    policy::{FeeModel, ResourcePolicy},
    types::{Confirmation, TxPayload},
};

/// Errors surfaced by a network client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The node refused the transaction for now, e.g. a nonce conflict or an underpriced fee
    Submission(String),
    /// The node rejected the transaction because its execution reverts
    Rejected(String),
    /// The node refused the transaction for good, e.g. insufficient funds
    Refused(String),
    /// A transport or RPC failure
    Rpc(String),
    /// The transaction was not confirmed within the allotted time
    Timeout,
}

impl ClientError {
    /// Classify a submission error message reported by a node
    pub fn from_submission_message(msg: String) -> Self {
        let lower = msg.to_lowercase();
        if lower.contains("revert") {
            ClientError::Rejected(msg)
        } else if TRANSIENT_SUBMISSION_ERRORS
            .iter()
            .any(|fragment| lower.contains(fragment))
        {
            ClientError::Submission(msg)
        } else {
            ClientError::Refused(msg)
        }
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Submission(s) => write!(f, "submission failed: {}", s),
            ClientError::Rejected(s) => write!(f, "rejected by node: {}", s),
            ClientError::Refused(s) => write!(f, "refused by node: {}", s),
            ClientError::Rpc(s) => write!(f, "rpc error: {}", s),
            ClientError::Timeout => write!(f, "timed out waiting for confirmation"),
        }
    }
}

impl std::error::Error for ClientError {}

/// The operations the deployment logic needs from a network.
///
/// Implementations sign with a signer of their own; the deployment logic never
/// sees key material.
#[allow(async_fn_in_trait)]
pub trait NetworkClient {
    /// The account transactions are sent from
    fn sender(&self) -> Address;

    /// Submit a transaction with the given resource policy, returning its hash
    async fn submit_transaction(
        &self,
        payload: TxPayload,
        policy: &ResourcePolicy,
    ) -> Result<TxHash, ClientError>;

    /// Wait up to `timeout` for a submitted transaction to be confirmed
    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<Confirmation, ClientError>;

    /// Read a storage slot of a contract
    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ClientError>;
}

/// A [`NetworkClient`] backed by a JSON-RPC node and a local signer
pub struct RpcClient {
    /// The signing provider
    provider: DynProvider,
    /// The signer's address
    sender: Address,
    /// The interval between receipt polls
    poll_interval: Duration,
}

impl RpcClient {
    /// Sets up a signing client from a private key and RPC url
    pub async fn connect(
        priv_key: &str,
        rpc_url: &str,
        poll_interval: Duration,
    ) -> Result<Self, DeployError> {
        let signer = priv_key
            .parse::<PrivateKeySigner>()
            .map_err(|e| DeployError::ClientInitialization(e.to_string()))?;
        let sender = signer.address();
        let url = rpc_url
            .parse()
            .map_err(|e| DeployError::ClientInitialization(format!("{}: {}", rpc_url, e)))?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        // Fail early on an unreachable node
        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| DeployError::ClientInitialization(e.to_string()))?;
        debug!(chain_id, sender = %sender, "connected to node");

        Ok(Self {
            provider,
            sender,
            poll_interval,
        })
    }
}

impl NetworkClient for RpcClient {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn submit_transaction(
        &self,
        payload: TxPayload,
        policy: &ResourcePolicy,
    ) -> Result<TxHash, ClientError> {
        let tx = build_request(payload, policy);
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| ClientError::from_submission_message(e.to_string()))?;

        Ok(*pending.tx_hash())
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<Confirmation, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let receipt = self
                .provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|e| ClientError::Rpc(e.to_string()))?;

            if let Some(receipt) = receipt {
                return Ok(if receipt.status() {
                    Confirmation::Success {
                        contract_address: receipt.contract_address,
                    }
                } else {
                    Confirmation::Reverted {
                        reason: format!(
                            "transaction {:#x} reverted in block {}",
                            tx_hash,
                            receipt.block_number.unwrap_or_default()
                        ),
                    }
                });
            }

            match next_poll_delay(deadline, Instant::now(), self.poll_interval) {
                Some(delay) => sleep(delay).await,
                None => return Err(ClientError::Timeout),
            }
        }
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ClientError> {
        let value = self
            .provider
            .get_storage_at(address, U256::from_be_bytes(slot.0))
            .await
            .map_err(|e| ClientError::Rpc(e.to_string()))?;

        Ok(B256::from(value.to_be_bytes::<32>()))
    }
}

/// The delay before the next receipt poll, cut short so the last poll lands
/// on the deadline, or `None` once the deadline has passed
fn next_poll_delay(deadline: Instant, now: Instant, poll_interval: Duration) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(now);
    (!remaining.is_zero()).then(|| poll_interval.min(remaining))
}

/// Build a transaction request carrying the payload and resource policy
fn build_request(payload: TxPayload, policy: &ResourcePolicy) -> TransactionRequest {
    let mut tx = match payload.to {
        Some(to) => TransactionRequest::default()
            .with_to(to)
            .with_input(payload.input),
        None => TransactionRequest::default().with_deploy_code(payload.input),
    }
    .with_gas_limit(policy.gas_limit());

    match policy.fees() {
        FeeModel::Legacy { gas_price } => tx.set_gas_price(gas_price),
        FeeModel::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            tx.set_max_fee_per_gas(max_fee_per_gas);
            tx.set_max_priority_fee_per_gas(max_priority_fee_per_gas);
        }
        FeeModel::Market => {}
    }

    tx
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy_primitives::{Address, Bytes, TxKind};
    use tokio::time::Instant;

    use super::{build_request, next_poll_delay, ClientError};
    use crate::{
        policy::{FeeModel, ResourcePolicy},
        types::TxPayload,
    };

    #[test]
    fn test_submission_errors_are_classified() {
        assert!(matches!(
            ClientError::from_submission_message("nonce too low".to_string()),
            ClientError::Submission(_)
        ));
        assert!(matches!(
            ClientError::from_submission_message("replacement transaction underpriced".to_string()),
            ClientError::Submission(_)
        ));
        assert!(matches!(
            ClientError::from_submission_message("error sending request for url".to_string()),
            ClientError::Submission(_)
        ));
        assert!(matches!(
            ClientError::from_submission_message("execution reverted: already initialized".to_string()),
            ClientError::Rejected(_)
        ));

        // Resubmitting cannot fix these
        for msg in [
            "insufficient funds for gas * price + value",
            "intrinsic gas too low",
            "exceeds block gas limit",
        ] {
            assert!(matches!(
                ClientError::from_submission_message(msg.to_string()),
                ClientError::Refused(_)
            ));
        }
    }

    #[test]
    fn test_last_poll_lands_on_deadline() {
        let now = Instant::now();
        let interval = Duration::from_millis(1_000);

        assert_eq!(
            next_poll_delay(now + Duration::from_secs(5), now, interval),
            Some(interval)
        );
        // Less than an interval left still polls once more, at the deadline
        assert_eq!(
            next_poll_delay(now + Duration::from_millis(300), now, interval),
            Some(Duration::from_millis(300))
        );
        assert_eq!(next_poll_delay(now, now, interval), None);
        assert_eq!(next_poll_delay(now, now + interval, interval), None);
    }

    #[test]
    fn test_request_carries_policy() {
        let policy = ResourcePolicy::new(
            500_000,
            FeeModel::Eip1559 {
                max_fee_per_gas: 100,
                max_priority_fee_per_gas: 2,
            },
        )
        .unwrap();

        let create = build_request(TxPayload::create(Bytes::from_static(&[0x60])), &policy);
        assert_eq!(create.to, Some(TxKind::Create));
        assert_eq!(create.gas, Some(500_000));
        assert_eq!(create.max_fee_per_gas, Some(100));
        assert_eq!(create.max_priority_fee_per_gas, Some(2));
        assert_eq!(create.gas_price, None);

        let legacy = ResourcePolicy::new(21_000, FeeModel::Legacy { gas_price: 0 }).unwrap();
        let to = Address::repeat_byte(0x42);
        let call = build_request(TxPayload::call(to, Bytes::new()), &legacy);
        assert_eq!(call.to, Some(TxKind::Call(to)));
        assert_eq!(call.gas_price, Some(0));
    }
}
