//! The ordered deployment plan: runs each step in turn, threading earlier
//! steps' addresses into later steps' arguments

use alloy::dyn_abi::DynSolValue;
use itertools::Itertools;
use tracing::{error, info};

use crate::{
    artifacts::ContractBinder,
    client::NetworkClient,
    errors::{DeployError, PlanFailure},
    policy::{PolicyOverride, ResourcePolicy},
    proxy::ProxyUpgradeCoordinator,
    report::{AddressReport, DeployedInstance},
    types::{ContractName, DeploymentRequest, Initializer},
};

/// Computes a step's arguments from the addresses recorded so far
pub type ArgBinder = Box<dyn Fn(&AddressReport) -> Result<StepArgs, DeployError> + Send + Sync>;

/// The arguments a step is run with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepArgs {
    /// Constructor arguments, for plain and proxied deployments
    pub constructor: Vec<DynSolValue>,
    /// Initializer arguments for proxied deployments, function arguments for calls
    pub call: Vec<DynSolValue>,
}

impl StepArgs {
    /// Arguments for a constructor
    pub fn for_constructor(args: Vec<DynSolValue>) -> Self {
        Self {
            constructor: args,
            call: Vec::new(),
        }
    }

    /// Arguments for an initializer or a call
    pub fn for_call(args: Vec<DynSolValue>) -> Self {
        Self {
            constructor: Vec::new(),
            call: args,
        }
    }
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Deploy a contract directly
    Plain {
        /// The contract to deploy
        contract: ContractName,
    },
    /// Deploy a contract behind a proxy and initialize it
    Proxy {
        /// The implementation contract
        implementation: ContractName,
        /// The initializer method on the implementation
        initializer: String,
    },
    /// Call a method on a contract deployed by an earlier step
    Call {
        /// The role of the contract to call
        target: String,
        /// The method to call
        function: String,
    },
}

/// One declared step of a [`DeploymentPlan`]
pub struct StepSpec {
    /// The role the step's result is recorded under
    pub role: String,
    /// What the step does
    pub kind: StepKind,
    /// Overrides of the plan's default resource policy
    pub policy: Option<PolicyOverride>,
    /// Computes the step's arguments
    pub binder: ArgBinder,
}

impl StepSpec {
    /// A plain deployment of `contract`
    pub fn plain(role: &str, contract: impl Into<ContractName>) -> Self {
        Self::new(
            role,
            StepKind::Plain {
                contract: contract.into(),
            },
        )
    }

    /// A deployment of `implementation` behind a proxy, initialized with `initializer`
    pub fn proxy(role: &str, implementation: impl Into<ContractName>, initializer: &str) -> Self {
        Self::new(
            role,
            StepKind::Proxy {
                implementation: implementation.into(),
                initializer: initializer.to_string(),
            },
        )
    }

    /// A call of `function` on the contract recorded under `target`
    pub fn call(role: &str, target: &str, function: &str) -> Self {
        Self::new(
            role,
            StepKind::Call {
                target: target.to_string(),
                function: function.to_string(),
            },
        )
    }

    /// Bind the step's arguments with `binder`
    pub fn with_args<F>(mut self, binder: F) -> Self
    where
        F: Fn(&AddressReport) -> Result<StepArgs, DeployError> + Send + Sync + 'static,
    {
        self.binder = Box::new(binder);
        self
    }

    /// Override the plan's default resource policy for this step
    pub fn with_policy(mut self, policy: PolicyOverride) -> Self {
        self.policy = Some(policy);
        self
    }

    /// A step with no arguments and the default policy
    fn new(role: &str, kind: StepKind) -> Self {
        Self {
            role: role.to_string(),
            kind,
            policy: None,
            binder: Box::new(|_| Ok(StepArgs::default())),
        }
    }
}

/// Runs step specs strictly in order, recording each result in an
/// [`AddressReport`].
///
/// The first failing step halts the run; the failure carries the step's role
/// and everything recorded before it. Roles already present in the report the
/// run starts from are skipped, so a persisted partial report resumes the run.
///
/// Every accepted transaction and every confirmed implementation is written to
/// the report as soon as it is known, so a resumed run waits on what it already
/// sent instead of sending it again.
pub struct DeploymentPlan<'a, C, B> {
    /// Deploys plain and proxied contracts
    coordinator: ProxyUpgradeCoordinator<'a, C, B>,
    /// The default resource policy, overridden per step
    policy: ResourcePolicy,
}

impl<'a, C: NetworkClient, B: ContractBinder> DeploymentPlan<'a, C, B> {
    /// Create a plan
    pub fn new(coordinator: ProxyUpgradeCoordinator<'a, C, B>, policy: ResourcePolicy) -> Self {
        Self {
            coordinator,
            policy,
        }
    }

    /// The proxy coordinator
    pub fn coordinator(&self) -> &ProxyUpgradeCoordinator<'a, C, B> {
        &self.coordinator
    }

    /// Run `specs` in order, starting from `report`
    pub async fn run(
        &self,
        specs: &[StepSpec],
        mut report: AddressReport,
    ) -> Result<AddressReport, PlanFailure> {
        if let Some(role) = specs.iter().map(|spec| spec.role.as_str()).duplicates().next() {
            return Err(PlanFailure {
                role: role.to_string(),
                cause: DeployError::InvalidPlan(format!("role `{}` is declared twice", role)),
                report,
            });
        }

        for spec in specs {
            if report.contains(&spec.role) {
                info!(role = %spec.role, "already recorded, skipping");
                continue;
            }

            if let Err(cause) = self.run_step(spec, &mut report).await {
                error!(role = %spec.role, error = %cause, "step failed, halting plan");
                return Err(PlanFailure {
                    role: spec.role.clone(),
                    cause,
                    report,
                });
            }
        }

        Ok(report)
    }

    /// Run a single step and record its result
    async fn run_step(&self, spec: &StepSpec, report: &mut AddressReport) -> Result<(), DeployError> {
        let policy = self.policy.resolve(spec.policy.as_ref())?;
        let StepArgs { constructor, call } = (spec.binder)(report)?;
        info!(role = %spec.role, "running step");

        match &spec.kind {
            StepKind::Plain { contract } => {
                let request = DeploymentRequest::new(contract.clone(), constructor, policy);
                let instance = self.create(&spec.role, &request, report).await?;
                report.record(&spec.role, instance)
            }
            StepKind::Proxy {
                implementation,
                initializer,
            } => {
                let request = DeploymentRequest::new(implementation.clone(), constructor, policy)
                    .with_initializer(Initializer::new(initializer.as_str(), call));
                // Encode the initializer before anything is deployed
                let init_data = self.coordinator.initializer_calldata(&request)?;

                let recorded = report
                    .progress(&spec.role)
                    .and_then(|progress| progress.implementation.clone());
                let implementation = match recorded {
                    Some(instance) => {
                        info!(
                            role = %spec.role,
                            address = %instance.address,
                            "implementation already deployed"
                        );
                        instance
                    }
                    None => {
                        let instance = self
                            .create(&spec.role, &request.without_initializer(), report)
                            .await?;
                        report.record_implementation(&spec.role, instance.clone());
                        instance
                    }
                };

                let proxy_request = self
                    .coordinator
                    .proxy_request(implementation.address, init_data, policy);
                let proxy = self.create(&spec.role, &proxy_request, report).await?;
                let instance = self
                    .coordinator
                    .complete_proxy(&request, &implementation, proxy);
                report.record(&spec.role, instance)
            }
            StepKind::Call { target, function } => {
                let (address, contract) = report
                    .get(target)
                    .map(|instance| (instance.address, instance.contract_name.clone()))
                    .ok_or_else(|| DeployError::UnresolvedRole(target.clone()))?;

                let step = self.coordinator.step();
                let tx_hash = match report.pending(&spec.role) {
                    Some(tx_hash) => {
                        info!(role = %spec.role, tx_hash = %tx_hash, "resuming pending call");
                        tx_hash
                    }
                    None => {
                        let calldata = step.binder().bind(&contract)?.calldata(function, &call)?;
                        let tx_hash = step
                            .submit_call(address, calldata, &policy, &step.settings().retry)
                            .await?;
                        report.record_pending(&spec.role, tx_hash);
                        tx_hash
                    }
                };

                let confirmed = step.confirm(tx_hash).await;
                settle(&spec.role, &confirmed, report);
                report.record_action(&spec.role, confirmed?.tx_hash)
            }
        }
    }

    /// Create `request`'s contract for `role`, or wait on the creation a
    /// previous run left pending
    async fn create(
        &self,
        role: &str,
        request: &DeploymentRequest,
        report: &mut AddressReport,
    ) -> Result<DeployedInstance, DeployError> {
        let step = self.coordinator.step();
        let tx_hash = match report.pending(role) {
            Some(tx_hash) => {
                info!(
                    role,
                    tx_hash = %tx_hash,
                    contract = %request.contract,
                    "resuming pending deployment"
                );
                tx_hash
            }
            None => {
                let tx_hash = step.submit_deployment(request).await?;
                report.record_pending(role, tx_hash);
                tx_hash
            }
        };

        let confirmed = step.confirm_deployment(request, tx_hash).await;
        settle(role, &confirmed, report);
        confirmed
    }
}

/// Forget `role`'s pending transaction once it reverted. A transaction that is
/// still unconfirmed stays pending for the next run.
fn settle<T>(role: &str, confirmed: &Result<T, DeployError>, report: &mut AddressReport) {
    if let Err(DeployError::Fatal(_)) = confirmed {
        report.clear_pending(role);
    }
}
