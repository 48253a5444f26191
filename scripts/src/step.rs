//! Deployment of a single contract instance: submission, retry, and confirmation

use std::time::Duration;

use alloy_primitives::{Address, Bytes, TxHash};
use tokio::{
    sync::watch,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    artifacts::ContractBinder,
    client::{ClientError, NetworkClient},
    constants::{
        DEFAULT_BACKOFF_MS, DEFAULT_CONFIRMATION_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPTS,
        DEFAULT_POLL_INTERVAL_MS, MAX_BACKOFF_MS,
    },
    errors::DeployError,
    policy::ResourcePolicy,
    report::DeployedInstance,
    types::{Confirmation, DeploymentRequest, Receipt, TxPayload},
};

// ---------
// | Retry |
// ---------

/// How often, and how patiently, to resubmit a transaction the node refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The total number of submission attempts, at least one
    pub max_attempts: u32,
    /// The delay before the first resubmission
    pub initial_backoff: Duration,
    /// The ceiling on the delay between resubmissions
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that submits exactly once
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// The delay before attempt `attempt + 1`, doubling from the initial backoff
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// The number of attempts, treating zero as one
    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

// ----------------
// | Cancellation |
// ----------------

/// The trigger side of a [`Cancellation`]
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Cancel every step holding the paired token
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// A token that in-flight steps watch for cancellation
#[derive(Debug, Clone)]
pub struct Cancellation(watch::Receiver<bool>);

impl Cancellation {
    /// Create a linked handle and token
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), Self(rx))
    }

    /// A token that is never cancelled
    pub fn never() -> Self {
        // The receiver keeps its last value once the sender is dropped
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested; never resolves if it cannot be
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

// --------
// | Step |
// --------

/// Caller-controlled knobs for submitting and confirming transactions
#[derive(Debug, Clone, Default)]
pub struct StepSettings {
    /// Resubmission policy for refused submissions
    pub retry: RetryPolicy,
    /// Bound on waiting for each transaction's confirmation
    pub confirmation: ConfirmationWait,
    /// Watched while waiting on the network
    pub cancellation: Cancellation,
}

/// The bound on waiting for a transaction and the interval between retried waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationWait {
    /// The total time to wait for a confirmation
    pub bound: Duration,
    /// The delay before re-waiting after a transient polling failure
    pub poll_interval: Duration,
}

impl Default for ConfirmationWait {
    fn default() -> Self {
        Self {
            bound: Duration::from_secs(DEFAULT_CONFIRMATION_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Deploys contract instances and sends transactions, blocking until each is confirmed
pub struct DeploymentStep<'a, C, B> {
    /// The network the step submits to
    client: &'a C,
    /// Resolves contract artifacts
    binder: &'a B,
    /// Retry, timeout, and cancellation settings
    settings: StepSettings,
}

impl<'a, C: NetworkClient, B: ContractBinder> DeploymentStep<'a, C, B> {
    /// Create a step
    pub fn new(client: &'a C, binder: &'a B, settings: StepSettings) -> Self {
        Self {
            client,
            binder,
            settings,
        }
    }

    /// The network client
    pub fn client(&self) -> &'a C {
        self.client
    }

    /// The artifact binder
    pub fn binder(&self) -> &'a B {
        self.binder
    }

    /// The step's settings
    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    /// Deploy a plain (non-proxied) contract and wait for it to be confirmed
    pub async fn deploy(&self, request: &DeploymentRequest) -> Result<DeployedInstance, DeployError> {
        let tx_hash = self.submit_deployment(request).await?;
        self.confirm_deployment(request, tx_hash).await
    }

    /// Submit the creation of a plain contract, resubmitting on refusal, and
    /// return the accepted transaction without waiting for it
    pub async fn submit_deployment(&self, request: &DeploymentRequest) -> Result<TxHash, DeployError> {
        if request.initializer.is_some() {
            return Err(DeployError::CalldataConstruction(format!(
                "{} has an initializer, which requires a proxied deployment",
                request.contract
            )));
        }

        // A missing artifact is a build defect, so it is never retried
        let artifact = self.binder.bind(&request.contract)?;
        let code = artifact.creation_code(&request.constructor_args)?;

        info!(contract = %request.contract, "deploying contract");
        self.submit_with_retry(TxPayload::create(code), &request.policy, &self.settings.retry)
            .await
    }

    /// Wait for the creation of `request`'s contract in `tx_hash` to be confirmed
    pub async fn confirm_deployment(
        &self,
        request: &DeploymentRequest,
        tx_hash: TxHash,
    ) -> Result<DeployedInstance, DeployError> {
        let receipt = self.confirm(tx_hash).await?;
        let address = receipt.contract_address.ok_or_else(|| {
            DeployError::Fatal(format!(
                "creation of {} confirmed in {:#x} without a contract address",
                request.contract, receipt.tx_hash
            ))
        })?;
        info!(
            contract = %request.contract,
            address = %address,
            tx_hash = %receipt.tx_hash,
            "contract deployed"
        );

        Ok(DeployedInstance {
            address,
            transaction_hash: receipt.tx_hash,
            contract_name: request.contract.clone(),
            is_proxy: false,
            implementation_address: None,
        })
    }

    /// Send a call to an existing contract and wait for it to be confirmed
    pub async fn call(
        &self,
        to: Address,
        calldata: Bytes,
        policy: &ResourcePolicy,
        retry: &RetryPolicy,
    ) -> Result<TxHash, DeployError> {
        let tx_hash = self.submit_call(to, calldata, policy, retry).await?;
        Ok(self.confirm(tx_hash).await?.tx_hash)
    }

    /// Submit a call to an existing contract without waiting for it
    pub async fn submit_call(
        &self,
        to: Address,
        calldata: Bytes,
        policy: &ResourcePolicy,
        retry: &RetryPolicy,
    ) -> Result<TxHash, DeployError> {
        self.submit_with_retry(TxPayload::call(to, calldata), policy, retry)
            .await
    }

    /// Wait for an accepted transaction to be confirmed.
    ///
    /// The transaction is never resubmitted: a revert is `Fatal` and an
    /// unconfirmed transaction is a `ConfirmationTimeout`.
    pub async fn confirm(&self, tx_hash: TxHash) -> Result<Receipt, DeployError> {
        debug!(tx_hash = %tx_hash, "awaiting confirmation");
        let confirmation = tokio::select! {
            res = self.await_confirmation(tx_hash) => res?,
            _ = self.settings.cancellation.cancelled() => {
                warn!(tx_hash = %tx_hash, "cancelled while awaiting confirmation");
                return Err(DeployError::Cancelled(format!(
                    "awaiting confirmation of {:#x}",
                    tx_hash
                )));
            }
        };

        match confirmation {
            Confirmation::Success { contract_address } => Ok(Receipt {
                tx_hash,
                contract_address,
            }),
            Confirmation::Reverted { reason } => Err(DeployError::Fatal(reason)),
        }
    }

    /// Submit a transaction, retrying refused submissions with backoff
    async fn submit_with_retry(
        &self,
        payload: TxPayload,
        policy: &ResourcePolicy,
        retry: &RetryPolicy,
    ) -> Result<TxHash, DeployError> {
        let attempts = retry.attempts();
        let mut attempt = 1;
        loop {
            if self.settings.cancellation.is_cancelled() {
                return Err(DeployError::Cancelled("before submission".to_string()));
            }

            let err = match self.client.submit_transaction(payload.clone(), policy).await {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(ClientError::Rejected(reason) | ClientError::Refused(reason)) => {
                    return Err(DeployError::Fatal(reason))
                }
                Err(e) => e,
            };

            if attempt >= attempts {
                return Err(DeployError::Transient(format!(
                    "{} (after {} attempts)",
                    err, attempts
                )));
            }

            let delay = retry.backoff(attempt);
            warn!(attempt, ?delay, error = %err, "submission failed, retrying");
            tokio::select! {
                _ = sleep(delay) => {},
                _ = self.settings.cancellation.cancelled() => {
                    return Err(DeployError::Cancelled("between submission attempts".to_string()));
                }
            }
            attempt += 1;
        }
    }

    /// Wait for a confirmation, re-waiting through transient polling failures until the bound
    async fn await_confirmation(&self, tx_hash: TxHash) -> Result<Confirmation, DeployError> {
        let ConfirmationWait {
            bound,
            poll_interval,
        } = self.settings.confirmation;
        let start = Instant::now();
        let timeout = || DeployError::ConfirmationTimeout {
            tx_hash,
            waited: start.elapsed(),
        };

        loop {
            let remaining = bound.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(timeout());
            }

            match self.client.wait_for_confirmation(tx_hash, remaining).await {
                Ok(confirmation) => return Ok(confirmation),
                Err(ClientError::Timeout) => return Err(timeout()),
                Err(e) => {
                    warn!(tx_hash = %tx_hash, error = %e, "polling for confirmation failed");
                    if start.elapsed() + poll_interval >= bound {
                        return Err(timeout());
                    }
                    sleep(poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy::dyn_abi::DynSolValue;
    use alloy_primitives::Address;

    use super::{Cancellation, ConfirmationWait, DeploymentStep, RetryPolicy, StepSettings};
    use crate::{
        artifacts::{ArtifactStore, ContractBinder},
        errors::DeployError,
        policy::ResourcePolicy,
        simulation::{
            test_helpers::{exchange_artifacts, exchange_chain},
            SimulatedChain,
        },
        types::{DeploymentRequest, Initializer},
    };

    /// Settings that never sleep between attempts
    fn fast_settings() -> StepSettings {
        StepSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
            confirmation: ConfirmationWait {
                bound: Duration::from_secs(5),
                poll_interval: Duration::from_millis(1),
            },
            cancellation: Cancellation::never(),
        }
    }

    fn checker_request() -> DeploymentRequest {
        DeploymentRequest::new(
            "Checker",
            vec![DynSolValue::Address(Address::repeat_byte(0xc1))],
            ResourcePolicy::default(),
        )
    }

    fn setup() -> (SimulatedChain, ArtifactStore) {
        let artifacts = exchange_artifacts();
        let chain = exchange_chain(&artifacts);
        (chain, artifacts)
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };

        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
        assert_eq!(retry.backoff(64), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_deploy_plain_contract() {
        let (chain, artifacts) = setup();
        let step = DeploymentStep::new(&chain, &artifacts, fast_settings());

        let instance = step.deploy(&checker_request()).await.unwrap();

        assert!(!instance.is_proxy);
        assert_eq!(instance.implementation_address, None);
        assert_eq!(instance.contract_name.as_str(), "Checker");
        assert!(chain.has_code(instance.address));
        assert_eq!(chain.submissions(), 1);
    }

    #[tokio::test]
    async fn test_transient_submission_failures_are_retried() {
        let (chain, artifacts) = setup();
        chain.fail_next_submissions(2, "nonce too low");
        let step = DeploymentStep::new(&chain, &artifacts, fast_settings());

        let instance = step.deploy(&checker_request()).await.unwrap();
        assert!(chain.has_code(instance.address));
        assert_eq!(chain.submission_attempts(), 3);
        assert_eq!(chain.submissions(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_transient() {
        let (chain, artifacts) = setup();
        chain.fail_next_submissions(3, "replacement transaction underpriced");
        let step = DeploymentStep::new(&chain, &artifacts, fast_settings());

        let err = step.deploy(&checker_request()).await.unwrap_err();
        assert!(matches!(err, DeployError::Transient(_)));
        assert!(err.is_retryable());
        assert_eq!(chain.submissions(), 0);
    }

    #[tokio::test]
    async fn test_permanent_refusal_is_fatal_and_not_retried() {
        let (chain, artifacts) = setup();
        chain.fail_next_submissions(3, "insufficient funds for gas * price + value");
        let step = DeploymentStep::new(&chain, &artifacts, fast_settings());

        let err = step.deploy(&checker_request()).await.unwrap_err();
        assert!(matches!(err, DeployError::Fatal(_)));
        assert_eq!(chain.submission_attempts(), 1);
    }

    #[tokio::test]
    async fn test_accepted_deployment_confirms_later() {
        let (chain, artifacts) = setup();
        chain.stall_next_confirmations(1);
        let step = DeploymentStep::new(&chain, &artifacts, fast_settings());

        let tx_hash = step.submit_deployment(&checker_request()).await.unwrap();
        let err = step.confirm_deployment(&checker_request(), tx_hash).await.unwrap_err();
        assert!(matches!(err, DeployError::ConfirmationTimeout { tx_hash: t, .. } if t == tx_hash));

        let instance = step.confirm_deployment(&checker_request(), tx_hash).await.unwrap();
        assert_eq!(instance.transaction_hash, tx_hash);
        assert!(chain.has_code(instance.address));
        assert_eq!(chain.submission_attempts(), 1);
    }

    #[tokio::test]
    async fn test_constructor_revert_is_fatal_and_not_retried() {
        let (chain, artifacts) = setup();
        let checker = artifacts.bind(&"Checker".into()).unwrap();
        chain.revert_creations_of(checker.bytecode().clone());
        let step = DeploymentStep::new(&chain, &artifacts, fast_settings());

        let err = step.deploy(&checker_request()).await.unwrap_err();
        assert!(matches!(err, DeployError::Fatal(_)));
        assert!(!err.is_retryable());
        assert_eq!(chain.submission_attempts(), 1);
    }

    #[tokio::test]
    async fn test_unknown_contract_submits_nothing() {
        let (chain, artifacts) = setup();
        let step = DeploymentStep::new(&chain, &artifacts, fast_settings());

        let request = DeploymentRequest::new("Missing", vec![], ResourcePolicy::default());
        let err = step.deploy(&request).await.unwrap_err();
        assert_eq!(err, DeployError::UnknownContract("Missing".to_string()));
        assert_eq!(chain.submission_attempts(), 0);
    }

    #[tokio::test]
    async fn test_initializer_rejected_for_plain_deploy() {
        let (chain, artifacts) = setup();
        let step = DeploymentStep::new(&chain, &artifacts, fast_settings());

        let request = checker_request().with_initializer(Initializer::new("initialize", vec![]));
        assert!(matches!(
            step.deploy(&request).await,
            Err(DeployError::CalldataConstruction(_))
        ));
        assert_eq!(chain.submission_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_transaction_times_out() {
        let (chain, artifacts) = setup();
        chain.stall_next_confirmations(1);
        let step = DeploymentStep::new(&chain, &artifacts, fast_settings());

        let err = step.deploy(&checker_request()).await.unwrap_err();
        assert!(matches!(err, DeployError::ConfirmationTimeout { .. }));
        // The accepted transaction is never resubmitted
        assert_eq!(chain.submission_attempts(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_submission() {
        let (chain, artifacts) = setup();
        let (handle, cancellation) = Cancellation::new();
        let settings = StepSettings {
            cancellation,
            ..fast_settings()
        };
        let step = DeploymentStep::new(&chain, &artifacts, settings);

        handle.cancel();
        let err = step.deploy(&checker_request()).await.unwrap_err();
        assert!(matches!(err, DeployError::Cancelled(_)));
        assert_eq!(chain.submission_attempts(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_while_awaiting_confirmation() {
        let (chain, artifacts) = setup();
        chain.hold_confirmations(true);
        let (handle, cancellation) = Cancellation::new();
        let settings = StepSettings {
            cancellation,
            ..fast_settings()
        };
        let step = DeploymentStep::new(&chain, &artifacts, settings);

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        };
        let request = checker_request();
        let (res, _) = tokio::join!(step.deploy(&request), canceller);

        assert!(matches!(res, Err(DeployError::Cancelled(_))));
        assert_eq!(chain.submissions(), 1);
    }
}
