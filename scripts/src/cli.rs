//! Definitions of CLI arguments and commands for the deploy scripts

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    artifacts::ArtifactStore,
    client::RpcClient,
    commands::{deploy, dry_run_chain, show_implementation, upgrade, ScriptConfig},
    constants::{
        DEFAULT_ARTIFACTS_DIR, DEFAULT_BACKOFF_MS, DEFAULT_CHECKER_CONTRACT,
        DEFAULT_CONFIRMATION_TIMEOUT_SECS, DEFAULT_GAS_LIMIT, DEFAULT_MARKET_CONTRACT,
        DEFAULT_MAX_ATTEMPTS, DEFAULT_NETWORK, DEFAULT_POLL_INTERVAL_MS, DEFAULT_PROXY_CONTRACT,
        MAX_BACKOFF_MS,
    },
    errors::DeployError,
    policy::{FeeModel, ResourcePolicy},
    step::{Cancellation, ConfirmationWait, RetryPolicy, StepSettings},
    utils::setup_client,
};

/// Deploys and upgrades the exchange contracts
#[derive(Parser)]
pub struct Cli {
    /// Private key of the deployer
    #[arg(short, long, env = "PKEY", hide_env_values = true)]
    pub priv_key: Option<String>,

    /// Network RPC URL
    #[arg(short, long, env = "RPC_URL")]
    pub rpc_url: Option<String>,

    /// Label of the target network, used to name the deployments file
    #[arg(short, long, default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// Path to the Hardhat artifacts directory
    #[arg(short, long, default_value = DEFAULT_ARTIFACTS_DIR)]
    pub artifacts: PathBuf,

    /// Path to the deployments file, `deployments.<network>.json` by default
    #[arg(short, long)]
    pub deployments_path: Option<PathBuf>,

    /// Name of the upgradeable proxy artifact
    #[arg(long, default_value = DEFAULT_PROXY_CONTRACT)]
    pub proxy_contract: String,

    /// Resource policy flags
    #[command(flatten)]
    pub policy: PolicyArgs,

    /// Retry and confirmation flags
    #[command(flatten)]
    pub retry: RetryArgs,

    /// The command to run
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Run the selected command, watching `cancellation` while waiting on the network
    pub async fn run(self, cancellation: Cancellation) -> eyre::Result<()> {
        let deployments_path = self
            .deployments_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("deployments.{}.json", self.network)));

        // Reading a proxy needs no artifacts
        let artifacts = match self.command {
            Command::Implementation(_) => ArtifactStore::new(),
            _ => ArtifactStore::from_dir(&self.artifacts)?,
        };

        let config = ScriptConfig {
            artifacts,
            deployments_path,
            proxy_contract: self.proxy_contract.as_str().into(),
            policy: self.policy.resource_policy()?,
            settings: self.retry.step_settings(cancellation),
        };

        match &self.command {
            Command::Deploy(args) if args.dry_run => {
                let chain = dry_run_chain(&config, &args.market_contract)?;
                deploy(args, &chain, &config).await
            }
            Command::Deploy(args) => {
                let client = self.connect(&config).await?;
                deploy(args, &client, &config).await
            }
            Command::Upgrade(args) => {
                let client = self.connect(&config).await?;
                upgrade(args, &client, &config).await
            }
            Command::Implementation(args) => {
                let client = self.connect(&config).await?;
                show_implementation(args, &client, &config).await
            }
        }
    }

    /// Connect to the configured node
    async fn connect(&self, config: &ScriptConfig) -> Result<RpcClient, DeployError> {
        setup_client(
            self.priv_key.as_deref(),
            self.rpc_url.as_deref(),
            config.settings.confirmation.poll_interval,
        )
        .await
    }
}

/// The deploy script commands
#[derive(Subcommand)]
pub enum Command {
    /// Deploy the checker and the exchange core behind a proxy, resuming from
    /// the deployments file
    Deploy(DeployArgs),
    /// Upgrade a deployed proxy to a new implementation
    Upgrade(UpgradeArgs),
    /// Print the implementation and admin behind a proxy
    Implementation(ImplementationArgs),
}

/// Resource parameters attached to every transaction
#[derive(Args)]
pub struct PolicyArgs {
    /// Gas limit of every transaction
    #[arg(long, default_value_t = DEFAULT_GAS_LIMIT)]
    pub gas_limit: u64,

    /// Legacy gas price, in wei
    #[arg(long, conflicts_with_all = ["max_fee_per_gas", "max_priority_fee_per_gas"])]
    pub gas_price: Option<u128>,

    /// EIP-1559 max fee per gas, in wei
    #[arg(long, requires = "max_priority_fee_per_gas")]
    pub max_fee_per_gas: Option<u128>,

    /// EIP-1559 max priority fee per gas, in wei
    #[arg(long, requires = "max_fee_per_gas")]
    pub max_priority_fee_per_gas: Option<u128>,
}

impl PolicyArgs {
    /// The default resource policy of the run
    pub fn resource_policy(&self) -> Result<ResourcePolicy, DeployError> {
        let fees = match (self.gas_price, self.max_fee_per_gas, self.max_priority_fee_per_gas) {
            (Some(gas_price), ..) => FeeModel::Legacy { gas_price },
            (None, Some(max_fee_per_gas), Some(max_priority_fee_per_gas)) => FeeModel::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            },
            _ => FeeModel::Market,
        };

        ResourcePolicy::new(self.gas_limit, fees)
    }
}

/// Resubmission and confirmation settings
#[derive(Args)]
pub struct RetryArgs {
    /// Total submission attempts per transaction
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Delay before the first resubmission, in milliseconds, doubling on each attempt
    #[arg(long, default_value_t = DEFAULT_BACKOFF_MS)]
    pub backoff_ms: u64,

    /// Bound on waiting for each transaction's confirmation, in seconds
    #[arg(long, default_value_t = DEFAULT_CONFIRMATION_TIMEOUT_SECS)]
    pub confirmation_timeout_secs: u64,

    /// Interval between receipt polls, in milliseconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,
}

impl RetryArgs {
    /// The step settings of the run
    pub fn step_settings(&self, cancellation: Cancellation) -> StepSettings {
        StepSettings {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_backoff: Duration::from_millis(self.backoff_ms),
                max_backoff: Duration::from_millis(MAX_BACKOFF_MS.max(self.backoff_ms)),
            },
            confirmation: ConfirmationWait {
                bound: Duration::from_secs(self.confirmation_timeout_secs),
                poll_interval: Duration::from_millis(self.poll_interval_ms),
            },
            cancellation,
        }
    }
}

/// Deploy the exchange: the `Checker`, then the `Market` proxy over the
/// exchange core, initialized with the checker's address.
///
/// Concretely, the proxy is a [`TransparentUpgradeableProxy`](https://docs.openzeppelin.com/contracts/5.x/api/proxy#transparent_proxy),
/// which itself deploys a `ProxyAdmin` contract.
#[derive(Args)]
pub struct DeployArgs {
    /// Address of the club the checker verifies membership of
    #[arg(long)]
    pub club: String,

    /// Address of the vault the exchange core settles through
    #[arg(long)]
    pub vault: String,

    /// Transfer ownership of the exchange core to this address once deployed
    #[arg(long)]
    pub transfer_ownership_to: Option<String>,

    /// Owner of the proxy admin, the deployer by default
    #[arg(long)]
    pub proxy_admin_owner: Option<String>,

    /// Name of the checker artifact
    #[arg(long, default_value = DEFAULT_CHECKER_CONTRACT)]
    pub checker_contract: String,

    /// Name of the exchange core artifact
    #[arg(long, default_value = DEFAULT_MARKET_CONTRACT)]
    pub market_contract: String,

    /// Ignore the deployments file and deploy every role
    #[arg(long)]
    pub fresh: bool,

    /// Run the plan against an in-memory chain; nothing is sent or saved
    #[arg(long)]
    pub dry_run: bool,
}

/// Upgrade the implementation behind a deployed proxy
#[derive(Args)]
pub struct UpgradeArgs {
    /// Role of the proxy in the deployments file
    #[arg(long)]
    pub role: String,

    /// Name of the new implementation artifact
    #[arg(short, long)]
    pub implementation: String,

    /// Method of the new implementation to call through the proxy when upgrading
    #[arg(short, long)]
    pub call: Option<String>,

    /// Arguments of the upgrade call
    #[arg(long, num_args = 1.., requires = "call")]
    pub call_args: Vec<String>,
}

/// Print the implementation behind a proxy
#[derive(Args)]
pub struct ImplementationArgs {
    /// Address of the proxy contract
    #[arg(long)]
    pub proxy: String,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};
    use crate::{errors::DeployError, policy::FeeModel, step::Cancellation};

    #[test]
    fn test_parse_deploy_with_defaults() {
        let cli = Cli::try_parse_from([
            "exchange-deploy",
            "deploy",
            "--club",
            "0x0101010101010101010101010101010101010101",
            "--vault",
            "0x0202020202020202020202020202020202020202",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(cli.network, "hardhat");
        let policy = cli.policy.resource_policy().unwrap();
        assert_eq!(policy.gas_limit(), 6_000_000);
        assert_eq!(policy.fees(), FeeModel::Market);

        let settings = cli.retry.step_settings(Cancellation::never());
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.confirmation.bound.as_secs(), 120);

        let Command::Deploy(args) = cli.command else {
            panic!("expected the deploy command");
        };
        assert!(args.dry_run);
        assert!(!args.fresh);
        assert_eq!(args.market_contract, "ExchangeCore");
    }

    #[test]
    fn test_fee_flags_select_fee_model() {
        let cli = Cli::try_parse_from([
            "exchange-deploy",
            "--max-fee-per-gas",
            "30",
            "--max-priority-fee-per-gas",
            "2",
            "implementation",
            "--proxy",
            "0x0101010101010101010101010101010101010101",
        ])
        .unwrap();
        assert_eq!(
            cli.policy.resource_policy().unwrap().fees(),
            FeeModel::Eip1559 {
                max_fee_per_gas: 30,
                max_priority_fee_per_gas: 2
            }
        );

        // Legacy and fee-market flags are exclusive
        assert!(Cli::try_parse_from([
            "exchange-deploy",
            "--gas-price",
            "1",
            "--max-fee-per-gas",
            "30",
            "--max-priority-fee-per-gas",
            "2",
            "implementation",
            "--proxy",
            "0x0101010101010101010101010101010101010101",
        ])
        .is_err());
    }

    #[test]
    fn test_zero_gas_limit_is_invalid() {
        let cli = Cli::try_parse_from([
            "exchange-deploy",
            "--gas-limit",
            "0",
            "implementation",
            "--proxy",
            "0x0101010101010101010101010101010101010101",
        ])
        .unwrap();
        assert!(matches!(
            cli.policy.resource_policy(),
            Err(DeployError::InvalidPolicy(_))
        ));
    }
}
