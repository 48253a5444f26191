//! Utilities for the deploy scripts

use std::{fs, path::Path, str::FromStr, time::Duration};

use alloy_primitives::Address;
use tracing::debug;

use crate::{client::RpcClient, errors::DeployError, report::AddressReport};

/// Sets up the signing client from the private key and RPC url given on the
/// command line or in the environment
pub async fn setup_client(
    priv_key: Option<&str>,
    rpc_url: Option<&str>,
    poll_interval: Duration,
) -> Result<RpcClient, DeployError> {
    let rpc_url = rpc_url.ok_or_else(|| {
        DeployError::ClientInitialization("an RPC url is required (--rpc-url)".to_string())
    })?;
    let priv_key = priv_key.ok_or_else(|| {
        DeployError::ClientInitialization("a private key is required (--priv-key)".to_string())
    })?;

    RpcClient::connect(priv_key, rpc_url, poll_interval).await
}

/// Parse a hex-encoded address argument
pub fn parse_address(address: &str) -> Result<Address, DeployError> {
    Address::from_str(address)
        .map_err(|e| DeployError::CalldataConstruction(format!("address `{}`: {}", address, e)))
}

/// Read the address report persisted at `file_path`, or an empty report if
/// nothing has been deployed yet
pub fn load_report(file_path: &Path) -> Result<AddressReport, DeployError> {
    if !file_path.exists() {
        debug!(path = %file_path.display(), "no deployments file, starting fresh");
        return Ok(AddressReport::new());
    }

    let file_contents = fs::read_to_string(file_path)
        .map_err(|e| DeployError::ReadDeployments(format!("{}: {}", file_path.display(), e)))?;
    serde_json::from_str(&file_contents)
        .map_err(|e| DeployError::ReadDeployments(format!("{}: {}", file_path.display(), e)))
}

/// Persist the address report to `file_path`, replacing its previous contents
pub fn save_report(file_path: &Path, report: &AddressReport) -> Result<(), DeployError> {
    if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| DeployError::WriteDeployments(format!("{}: {}", parent.display(), e)))?;
    }

    let contents = serde_json::to_string_pretty(report)
        .map_err(|e| DeployError::WriteDeployments(e.to_string()))?;
    fs::write(file_path, contents)
        .map_err(|e| DeployError::WriteDeployments(format!("{}: {}", file_path.display(), e)))
}

/// Print the report as `role: address` lines followed by a flat JSON listing
pub fn print_report(report: &AddressReport) -> Result<(), DeployError> {
    let listing = serde_json::to_string_pretty(&report.to_address_json())
        .map_err(|e| DeployError::WriteDeployments(e.to_string()))?;
    print!("{}", report);
    println!("{}", listing);
    Ok(())
}
