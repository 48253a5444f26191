//! Scripts for deploying, initializing, and upgrading the exchange contracts.
//!
//! A deployment run is a [`plan::DeploymentPlan`] of ordered steps. Each step
//! binds a compiled artifact, submits its transaction through a
//! [`client::NetworkClient`], and blocks until it is confirmed; the resulting
//! addresses are recorded in a [`report::AddressReport`] that later steps draw
//! their arguments from and that is persisted so a halted run can resume.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

pub mod artifacts;
pub mod cli;
pub mod client;
mod commands;
pub mod constants;
pub mod errors;
pub mod plan;
pub mod policy;
pub mod proxy;
pub mod report;
pub mod simulation;
mod solidity;
pub mod step;
pub mod types;
pub mod utils;
