//! Deployment of upgradeable contracts behind an OpenZeppelin
//! `TransparentUpgradeableProxy`, and inspection of existing proxies

use std::{collections::HashSet, sync::Mutex};

use alloy::dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes, TxHash, B256};
use alloy_sol_types::SolCall;
use tracing::{info, warn};

use crate::{
    artifacts::ContractBinder,
    client::NetworkClient,
    constants::{
        DEFAULT_PROXY_CONTRACT, NUM_BYTES_ADDRESS, NUM_BYTES_STORAGE_SLOT,
        PROXY_ADMIN_STORAGE_SLOT, PROXY_IMPLEMENTATION_STORAGE_SLOT,
    },
    errors::DeployError,
    policy::ResourcePolicy,
    report::DeployedInstance,
    solidity::upgradeAndCallCall,
    step::{DeploymentStep, RetryPolicy},
    types::{ContractName, DeploymentRequest, Initializer},
};

/// Deploys implementations behind proxies, runs their initializers, and
/// upgrades them.
///
/// The proxy is created with the initializer's calldata as its constructor
/// `data`, so creation and initialization are one transaction: a revert of
/// the initializer reverts the creation and is `Fatal`. A later explicit
/// initialization of a proxy this coordinator already initialized is `Fatal`
/// without submitting anything.
pub struct ProxyUpgradeCoordinator<'a, C, B> {
    /// Submits and confirms the underlying transactions
    step: DeploymentStep<'a, C, B>,
    /// The proxy artifact
    proxy_contract: ContractName,
    /// The owner of the proxy's admin, the sender if unset
    owner: Option<Address>,
    /// Proxies initialized by this coordinator
    initialized: Mutex<HashSet<Address>>,
}

impl<'a, C: NetworkClient, B: ContractBinder> ProxyUpgradeCoordinator<'a, C, B> {
    /// Create a coordinator using the default proxy artifact
    pub fn new(step: DeploymentStep<'a, C, B>) -> Self {
        Self {
            step,
            proxy_contract: DEFAULT_PROXY_CONTRACT.into(),
            owner: None,
            initialized: Mutex::new(HashSet::new()),
        }
    }

    /// Use a different proxy artifact
    pub fn with_proxy_contract(mut self, proxy_contract: impl Into<ContractName>) -> Self {
        self.proxy_contract = proxy_contract.into();
        self
    }

    /// Make `owner` the owner of every proxy's admin
    pub fn with_owner(mut self, owner: Address) -> Self {
        self.owner = Some(owner);
        self
    }

    /// The underlying step
    pub fn step(&self) -> &DeploymentStep<'a, C, B> {
        &self.step
    }

    /// Deploy `request`'s contract as an implementation behind a new proxy
    /// that runs its initializer on creation.
    ///
    /// Once the implementation is confirmed, any later failure is returned as
    /// a `PartialDeployment` carrying its address.
    pub async fn deploy_behind_proxy(
        &self,
        request: &DeploymentRequest,
    ) -> Result<DeployedInstance, DeployError> {
        // Encode the initializer before anything is deployed
        let init_data = self.initializer_calldata(request)?;
        let implementation = self.step.deploy(&request.without_initializer()).await?;

        info!(implementation = %implementation.address, "deploying proxy");
        let proxy_request = self.proxy_request(implementation.address, init_data, request.policy);
        let proxy = self.step.deploy(&proxy_request).await.map_err(|cause| {
            DeployError::PartialDeployment {
                implementation: implementation.address,
                cause: Box::new(cause),
            }
        })?;

        Ok(self.complete_proxy(request, &implementation, proxy))
    }

    /// The calldata of `request`'s initializer on its implementation
    pub fn initializer_calldata(&self, request: &DeploymentRequest) -> Result<Bytes, DeployError> {
        let initializer = request.initializer.as_ref().ok_or_else(|| {
            DeployError::CalldataConstruction(format!(
                "proxied deployment of {} has no initializer",
                request.contract
            ))
        })?;

        self.step
            .binder()
            .bind(&request.contract)?
            .calldata(&initializer.name, &initializer.args)
    }

    /// The deployment of a proxy over `implementation`, running `init_data`
    /// through it on creation
    pub fn proxy_request(
        &self,
        implementation: Address,
        init_data: Bytes,
        policy: ResourcePolicy,
    ) -> DeploymentRequest {
        let owner = self.owner.unwrap_or_else(|| self.step.client().sender());
        DeploymentRequest::new(
            self.proxy_contract.clone(),
            vec![
                DynSolValue::Address(implementation),
                DynSolValue::Address(owner),
                DynSolValue::Bytes(init_data.to_vec()),
            ],
            policy,
        )
    }

    /// The instance of `request` deployed as `proxy` over `implementation`,
    /// whose initializer ran on creation
    pub fn complete_proxy(
        &self,
        request: &DeploymentRequest,
        implementation: &DeployedInstance,
        proxy: DeployedInstance,
    ) -> DeployedInstance {
        self.mark_initialized(proxy.address);
        DeployedInstance {
            address: proxy.address,
            transaction_hash: proxy.transaction_hash,
            contract_name: request.contract.clone(),
            is_proxy: true,
            implementation_address: Some(implementation.address),
        }
    }

    /// Run `initializer` of `implementation` through an existing `proxy`.
    ///
    /// Never retried: a second attempt could initialize twice, or be reverted by
    /// the contract's own guard.
    pub async fn initialize_proxy(
        &self,
        proxy: Address,
        implementation: &ContractName,
        initializer: &Initializer,
        policy: &ResourcePolicy,
    ) -> Result<TxHash, DeployError> {
        let artifact = self.step.binder().bind(implementation)?;
        let calldata = artifact.calldata(&initializer.name, &initializer.args)?;

        if !self.mark_initialized(proxy) {
            return Err(DeployError::Fatal(format!(
                "proxy {:#x} has already been initialized",
                proxy
            )));
        }

        info!(proxy = %proxy, initializer = %initializer.name, "initializing proxy");
        self.step
            .call(proxy, calldata, policy, &RetryPolicy::once())
            .await
            .map_err(|e| {
                warn!(proxy = %proxy, error = %e, "proxy initialization failed");
                match e {
                    DeployError::Transient(msg) => {
                        DeployError::Fatal(format!("initializer submission refused: {}", msg))
                    }
                    e => e,
                }
            })
    }

    /// The implementation a proxy currently points at, read from its EIP-1967 slot
    pub async fn get_implementation_address(&self, proxy: Address) -> Result<Address, DeployError> {
        self.read_address_slot(proxy, PROXY_IMPLEMENTATION_STORAGE_SLOT)
            .await
    }

    /// The admin contract of a proxy, read from its EIP-1967 slot
    pub async fn get_admin_address(&self, proxy: Address) -> Result<Address, DeployError> {
        self.read_address_slot(proxy, PROXY_ADMIN_STORAGE_SLOT)
            .await
    }

    /// Deploy `request`'s contract and point `proxy` at it through the proxy's
    /// admin, calling the request's initializer (if any) in the same transaction.
    ///
    /// Once the new implementation is confirmed, any later failure is returned
    /// as a `PartialDeployment` carrying its address.
    pub async fn upgrade(
        &self,
        proxy: Address,
        request: &DeploymentRequest,
    ) -> Result<DeployedInstance, DeployError> {
        let admin = self.get_admin_address(proxy).await?;

        let artifact = self.step.binder().bind(&request.contract)?;
        let data = match &request.initializer {
            Some(initializer) => artifact.calldata(&initializer.name, &initializer.args)?,
            None => Bytes::new(),
        };

        let implementation = self.step.deploy(&request.without_initializer()).await?;
        let tx_hash = self
            .point_at(admin, proxy, implementation.address, data, &request.policy)
            .await
            .map_err(|cause| {
                warn!(
                    proxy = %proxy,
                    implementation = %implementation.address,
                    error = %cause,
                    "upgrade failed after deploying the implementation"
                );
                DeployError::PartialDeployment {
                    implementation: implementation.address,
                    cause: Box::new(cause),
                }
            })?;

        Ok(DeployedInstance {
            address: proxy,
            transaction_hash: tx_hash,
            contract_name: request.contract.clone(),
            is_proxy: true,
            implementation_address: Some(implementation.address),
        })
    }

    /// Point `proxy` at `implementation` through `admin` and verify its slot
    async fn point_at(
        &self,
        admin: Address,
        proxy: Address,
        implementation: Address,
        data: Bytes,
        policy: &ResourcePolicy,
    ) -> Result<TxHash, DeployError> {
        info!(proxy = %proxy, implementation = %implementation, "upgrading proxy");
        let calldata = upgradeAndCallCall {
            proxy,
            implementation,
            data,
        }
        .abi_encode();
        let tx_hash = self
            .step
            .call(admin, calldata.into(), policy, &RetryPolicy::once())
            .await?;

        let current = self.get_implementation_address(proxy).await?;
        if current != implementation {
            return Err(DeployError::Fatal(format!(
                "proxy {:#x} points at {:#x} after upgrading to {:#x}",
                proxy, current, implementation
            )));
        }
        Ok(tx_hash)
    }

    /// Record `proxy` as initialized, returning false if it already was
    fn mark_initialized(&self, proxy: Address) -> bool {
        let mut initialized = self.initialized.lock().unwrap_or_else(|e| e.into_inner());
        initialized.insert(proxy)
    }

    /// Read an address from a proxy storage slot, treating an empty slot as no proxy
    async fn read_address_slot(&self, proxy: Address, slot: B256) -> Result<Address, DeployError> {
        let value = self
            .step
            .client()
            .storage_at(proxy, slot)
            .await
            .map_err(|e| DeployError::Transient(e.to_string()))?;

        let address =
            Address::from_slice(&value[NUM_BYTES_STORAGE_SLOT - NUM_BYTES_ADDRESS..]);
        if address.is_zero() {
            return Err(DeployError::ProxyNotFound(proxy));
        }
        Ok(address)
    }
}
