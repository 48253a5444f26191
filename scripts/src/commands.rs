//! Implementations of the deploy script commands

use std::path::PathBuf;

use alloy::dyn_abi::DynSolValue;
use tracing::{error, info};

use crate::{
    artifacts::{ArtifactStore, ContractBinder},
    cli::{DeployArgs, ImplementationArgs, UpgradeArgs},
    client::NetworkClient,
    constants::{
        CHECKER_ROLE, INITIALIZER_NAME, MARKET_OWNERSHIP_ROLE, MARKET_ROLE, SIMULATED_SENDER,
        TRANSFER_OWNERSHIP_NAME,
    },
    errors::{DeployError, PlanFailure},
    plan::{DeploymentPlan, StepArgs, StepSpec},
    policy::ResourcePolicy,
    proxy::ProxyUpgradeCoordinator,
    report::AddressReport,
    simulation::SimulatedChain,
    step::{DeploymentStep, StepSettings},
    types::{ContractName, DeploymentRequest, Initializer},
    utils::{load_report, parse_address, print_report, save_report},
};

/// Settings shared by every command
pub struct ScriptConfig {
    /// The compiled contracts
    pub artifacts: ArtifactStore,
    /// Where the address report is persisted
    pub deployments_path: PathBuf,
    /// The upgradeable proxy artifact
    pub proxy_contract: ContractName,
    /// The default resource policy
    pub policy: ResourcePolicy,
    /// Retry, confirmation, and cancellation settings
    pub settings: StepSettings,
}

impl ScriptConfig {
    /// A proxy coordinator over `client`
    fn coordinator<'a, C: NetworkClient>(
        &'a self,
        client: &'a C,
    ) -> ProxyUpgradeCoordinator<'a, C, ArtifactStore> {
        let step = DeploymentStep::new(client, &self.artifacts, self.settings.clone());
        ProxyUpgradeCoordinator::new(step).with_proxy_contract(self.proxy_contract.clone())
    }
}

/// The exchange deployment plan: the checker, the market proxy initialized
/// with the checker's address, and optionally an ownership transfer
pub fn exchange_plan(args: &DeployArgs) -> Result<Vec<StepSpec>, DeployError> {
    let club = parse_address(&args.club)?;
    let vault = parse_address(&args.vault)?;

    let mut specs = vec![
        StepSpec::plain(CHECKER_ROLE, args.checker_contract.as_str()).with_args(move |_| {
            Ok(StepArgs::for_constructor(vec![DynSolValue::Address(club)]))
        }),
        StepSpec::proxy(MARKET_ROLE, args.market_contract.as_str(), INITIALIZER_NAME).with_args(
            move |report| {
                Ok(StepArgs::for_call(vec![
                    DynSolValue::Address(report.address_of(CHECKER_ROLE)?),
                    DynSolValue::Address(vault),
                ]))
            },
        ),
    ];

    if let Some(owner) = &args.transfer_ownership_to {
        let owner = parse_address(owner)?;
        specs.push(
            StepSpec::call(MARKET_OWNERSHIP_ROLE, MARKET_ROLE, TRANSFER_OWNERSHIP_NAME)
                .with_args(move |_| Ok(StepArgs::for_call(vec![DynSolValue::Address(owner)]))),
        );
    }

    Ok(specs)
}

/// An in-memory chain that treats the configured proxy artifact as a proxy
/// and guards the exchange core's initializer
pub fn dry_run_chain(
    config: &ScriptConfig,
    market_contract: &str,
) -> Result<SimulatedChain, DeployError> {
    let proxy = config.artifacts.bind(&config.proxy_contract)?;
    let chain = SimulatedChain::new(SIMULATED_SENDER).with_proxy_code(proxy.bytecode().clone());

    let market = config.artifacts.bind(&market_contract.into())?;
    chain.guard_initializer(market.selector(INITIALIZER_NAME, 2)?);
    Ok(chain)
}

/// Run the exchange deployment plan, resuming from and persisting to the
/// deployments file unless this is a dry run
pub async fn deploy<C: NetworkClient>(
    args: &DeployArgs,
    client: &C,
    config: &ScriptConfig,
) -> eyre::Result<()> {
    let specs = exchange_plan(args)?;

    let report = if args.fresh || args.dry_run {
        AddressReport::new()
    } else {
        load_report(&config.deployments_path)?
    };
    if !report.is_empty() {
        info!(
            recorded = report.len(),
            path = %config.deployments_path.display(),
            "resuming from deployments file"
        );
    }

    let mut coordinator = config.coordinator(client);
    if let Some(owner) = &args.proxy_admin_owner {
        coordinator = coordinator.with_owner(parse_address(owner)?);
    }
    let result = DeploymentPlan::new(coordinator, config.policy)
        .run(&specs, report)
        .await;

    if !args.dry_run {
        let report = match &result {
            Ok(report) => report,
            Err(failure) => &failure.report,
        };
        save_report(&config.deployments_path, report)?;
        info!(path = %config.deployments_path.display(), "saved deployments");
    }

    finish(result)
}

/// Upgrade the proxy recorded under `args.role` and rewrite its report entry
pub async fn upgrade<C: NetworkClient>(
    args: &UpgradeArgs,
    client: &C,
    config: &ScriptConfig,
) -> eyre::Result<()> {
    let mut report = load_report(&config.deployments_path)?;
    let current = report
        .get(&args.role)
        .ok_or_else(|| DeployError::UnresolvedRole(args.role.clone()))?;
    if !current.is_proxy {
        return Err(DeployError::ProxyNotFound(current.address).into());
    }
    let proxy = current.address;

    let implementation = ContractName::new(args.implementation.as_str());
    let initializer = match &args.call {
        Some(function) => {
            let artifact = config.artifacts.bind(&implementation)?;
            let call_args = artifact.coerce_args(function, &args.call_args)?;
            Some(Initializer::new(function.as_str(), call_args))
        }
        None => None,
    };
    let request = DeploymentRequest {
        contract: implementation,
        constructor_args: Vec::new(),
        policy: config.policy,
        initializer,
    };

    let instance = config.coordinator(client).upgrade(proxy, &request).await?;
    info!(
        role = %args.role,
        implementation = ?instance.implementation_address,
        "proxy upgraded"
    );
    report.record_upgrade(&args.role, instance)?;
    save_report(&config.deployments_path, &report)?;

    print_report(&report)?;
    Ok(())
}

/// Print the implementation and admin behind a proxy
pub async fn show_implementation<C: NetworkClient>(
    args: &ImplementationArgs,
    client: &C,
    config: &ScriptConfig,
) -> eyre::Result<()> {
    let proxy = parse_address(&args.proxy)?;
    let coordinator = config.coordinator(client);

    let implementation = coordinator.get_implementation_address(proxy).await?;
    let admin = coordinator.get_admin_address(proxy).await?;
    println!("implementation: {:#x}", implementation);
    println!("admin: {:#x}", admin);
    Ok(())
}

/// Print the outcome of a plan run
fn finish(result: Result<AddressReport, PlanFailure>) -> eyre::Result<()> {
    match result {
        Ok(report) => {
            print_report(&report)?;
            Ok(())
        }
        Err(failure) => {
            error!(
                role = %failure.role,
                cause = %failure.cause,
                deployed = failure.report.len(),
                "deployment halted"
            );
            print_report(&failure.report)?;
            Err(failure.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;

    use super::{deploy, dry_run_chain, exchange_plan, upgrade, ScriptConfig};
    use crate::{
        artifacts::ContractBinder,
        cli::{DeployArgs, UpgradeArgs},
        constants::{CHECKER_ROLE, MARKET_OWNERSHIP_ROLE, MARKET_ROLE},
        policy::ResourcePolicy,
        simulation::test_helpers::exchange_artifacts,
        step::StepSettings,
        utils::load_report,
    };

    fn config(dir: &tempfile::TempDir) -> ScriptConfig {
        ScriptConfig {
            artifacts: exchange_artifacts(),
            deployments_path: dir.path().join("deployments.hardhat.json"),
            proxy_contract: "TransparentUpgradeableProxy".into(),
            policy: ResourcePolicy::default(),
            settings: StepSettings::default(),
        }
    }

    fn deploy_args() -> DeployArgs {
        DeployArgs {
            club: format!("{:#x}", Address::repeat_byte(0xc1)),
            vault: format!("{:#x}", Address::repeat_byte(0xfa)),
            transfer_ownership_to: None,
            proxy_admin_owner: None,
            checker_contract: "Checker".to_string(),
            market_contract: "ExchangeCore".to_string(),
            fresh: false,
            dry_run: false,
        }
    }

    #[test]
    fn test_exchange_plan_roles() {
        let specs = exchange_plan(&deploy_args()).unwrap();
        let roles = specs.iter().map(|s| s.role.as_str()).collect::<Vec<_>>();
        assert_eq!(roles, vec![CHECKER_ROLE, MARKET_ROLE]);

        let args = DeployArgs {
            transfer_ownership_to: Some(format!("{:#x}", Address::repeat_byte(0x0e))),
            ..deploy_args()
        };
        let specs = exchange_plan(&args).unwrap();
        assert_eq!(specs.last().unwrap().role, MARKET_OWNERSHIP_ROLE);

        let args = DeployArgs {
            club: "not-an-address".to_string(),
            ..deploy_args()
        };
        assert!(exchange_plan(&args).is_err());
    }

    #[tokio::test]
    async fn test_deploy_persists_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let chain = dry_run_chain(&config, "ExchangeCore").unwrap();

        deploy(&deploy_args(), &chain, &config).await.unwrap();
        let saved = load_report(&config.deployments_path).unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved.get(MARKET_ROLE).unwrap().is_proxy);

        // A second run finds every role recorded
        let attempts = chain.submission_attempts();
        deploy(&deploy_args(), &chain, &config).await.unwrap();
        assert_eq!(chain.submission_attempts(), attempts);
        assert_eq!(load_report(&config.deployments_path).unwrap(), saved);
    }

    #[tokio::test]
    async fn test_halted_deploy_saves_partial_report() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let chain = dry_run_chain(&config, "ExchangeCore").unwrap();
        let core = config.artifacts.bind(&"ExchangeCore".into()).unwrap();
        chain.revert_creations_of(core.bytecode().clone());

        let err = deploy(&deploy_args(), &chain, &config).await.unwrap_err();
        assert!(err.to_string().contains(MARKET_ROLE));

        let saved = load_report(&config.deployments_path).unwrap();
        assert!(saved.contains(CHECKER_ROLE));
        assert!(!saved.contains(MARKET_ROLE));
    }

    #[tokio::test]
    async fn test_unconfirmed_proxy_is_saved_and_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let chain = dry_run_chain(&config, "ExchangeCore").unwrap();

        chain.stall_confirmations_after(2, 1);
        assert!(deploy(&deploy_args(), &chain, &config).await.is_err());
        let saved = load_report(&config.deployments_path).unwrap();
        let progress = saved.progress(MARKET_ROLE).unwrap();
        assert!(progress.implementation.is_some());
        assert!(progress.pending.is_some());

        let submissions = chain.submissions();
        deploy(&deploy_args(), &chain, &config).await.unwrap();
        assert_eq!(chain.submissions(), submissions);

        let report = load_report(&config.deployments_path).unwrap();
        assert!(report.get(MARKET_ROLE).unwrap().is_proxy);
        assert_eq!(report.progress(MARKET_ROLE), None);
    }

    #[tokio::test]
    async fn test_dry_run_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let chain = dry_run_chain(&config, "ExchangeCore").unwrap();

        let args = DeployArgs {
            dry_run: true,
            ..deploy_args()
        };
        deploy(&args, &chain, &config).await.unwrap();
        assert!(!config.deployments_path.exists());
    }

    #[tokio::test]
    async fn test_upgrade_rewrites_report_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let chain = dry_run_chain(&config, "ExchangeCore").unwrap();
        deploy(&deploy_args(), &chain, &config).await.unwrap();
        let before = load_report(&config.deployments_path).unwrap();

        let args = UpgradeArgs {
            role: MARKET_ROLE.to_string(),
            implementation: "ExchangeCoreV2".to_string(),
            call: Some("initializeV2".to_string()),
            call_args: vec!["30".to_string()],
        };
        upgrade(&args, &chain, &config).await.unwrap();

        let after = load_report(&config.deployments_path).unwrap();
        let (old, new) = (before.get(MARKET_ROLE).unwrap(), after.get(MARKET_ROLE).unwrap());
        assert_eq!(new.address, old.address);
        assert_eq!(new.contract_name.as_str(), "ExchangeCoreV2");
        assert_ne!(new.implementation_address, old.implementation_address);
        assert_eq!(after.get(CHECKER_ROLE), before.get(CHECKER_ROLE));

        // Only proxies can be upgraded
        let args = UpgradeArgs {
            role: CHECKER_ROLE.to_string(),
            call: None,
            call_args: vec![],
            ..args
        };
        assert!(upgrade(&args, &chain, &config).await.is_err());
    }
}
