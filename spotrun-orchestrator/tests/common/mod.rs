// Shared fixtures for orchestrator integration tests.
// Everything runs against the scripted mock marketplace with tokio's paused clock.
#![allow(dead_code)]

use clap::Parser;
use spotrun_common::{Instance, InstanceSnapshot, InstanceStatus, LaunchRequest, Offer};
use spotrun_orchestrator::cli::Cli;
use spotrun_orchestrator::Settings;
use spotrun_providers::mock::{mock_offer, MockMarketplace};
use spotrun_providers::Marketplace;
use std::collections::BTreeMap;

/// Settings for the mock provider. A W&B key is set unless `args` override it.
pub fn test_settings(args: &[&str]) -> Settings {
    let mut argv = vec!["spotrun", "--provider", "mock", "--skip-build", "--skip-push"];
    if !args.contains(&"--wandb-key") {
        argv.extend(["--wandb-key", "test-wandb-key"]);
    }
    argv.extend_from_slice(args);
    Settings::from_cli(Cli::parse_from(argv)).expect("valid test settings")
}

/// Offers from the selection example: A and B qualify, C is over budget.
pub fn abc_offers() -> Vec<Offer> {
    vec![
        mock_offer("A", "RTX 4090", 1.8, 0.96),
        mock_offer("B", "RTX 4090", 1.5, 0.99),
        mock_offer("C", "RTX 4090", 2.5, 0.99),
    ]
}

pub fn boot_then_exit(code: i32) -> Vec<InstanceSnapshot> {
    vec![
        InstanceSnapshot::status(InstanceStatus::Provisioning),
        InstanceSnapshot::status(InstanceStatus::Running),
        InstanceSnapshot::status(InstanceStatus::Running),
        InstanceSnapshot::exited(code),
    ]
}

pub fn launch_request(offer_id: &str) -> LaunchRequest {
    LaunchRequest {
        offer_id: offer_id.to_string(),
        image: "img:test".to_string(),
        disk_gb: 50.0,
        onstart: String::new(),
        env: BTreeMap::new(),
        label: "spotrun-test".to_string(),
    }
}

/// Creates an instance directly on the mock, bypassing the provisioner.
pub async fn create_instance(market: &MockMarketplace, offer_id: &str) -> Instance {
    let id = market
        .create_instance(&launch_request(offer_id))
        .await
        .expect("mock create");
    Instance::new(id, offer_id)
}
