//! Service registry: one contract per logical service name.
//!
//! # Responsibilities
//! - Hold the contract (name, version, capabilities, health) of each service
//! - Answer capability lookups for the router and the runner
//! - Summarize contract health
//!
//! # Design Decisions
//! - Contracts are trait objects with one concrete type per backend kind
//! - Registering an existing name replaces the contract
//! - The map has its own lock; nothing else is held while it is taken

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;
use crate::error::{MeshError, MeshResult};
use crate::health::state::HealthStatus;

/// Kind of backend a service fronts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    MlClassifier,
    RuleEngine,
    #[default]
    Generic,
}

/// Capability-set view of a logical service.
pub trait ServiceContract: Send + Sync + fmt::Debug {
    fn service_name(&self) -> &str;
    fn version(&self) -> &str;
    fn kind(&self) -> ServiceKind;
    fn health(&self) -> HealthStatus;
    fn set_health(&mut self, health: HealthStatus);
    fn capabilities(&self) -> &[String];

    fn has_capability(&self, capability: &str) -> bool {
        self.capabilities().iter().any(|c| c == capability)
    }

    fn describe(&self) -> ContractInfo {
        ContractInfo {
            name: self.service_name().to_string(),
            version: self.version().to_string(),
            kind: self.kind(),
            health: self.health(),
            capabilities: self.capabilities().to_vec(),
        }
    }
}

/// Owned snapshot of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractInfo {
    pub name: String,
    pub version: String,
    pub kind: ServiceKind,
    pub health: HealthStatus,
    pub capabilities: Vec<String>,
}

/// ML classification backend.
#[derive(Debug, Clone)]
pub struct ClassifierContract {
    name: String,
    version: String,
    capabilities: Vec<String>,
    health: HealthStatus,
    /// Models the service can serve, e.g. `bert_classification`.
    pub models: Vec<String>,
}

impl ClassifierContract {
    pub fn new(name: impl Into<String>, version: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities,
            health: HealthStatus::Unknown,
            models: Vec::new(),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }
}

impl ServiceContract for ClassifierContract {
    fn service_name(&self) -> &str {
        &self.name
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn kind(&self) -> ServiceKind {
        ServiceKind::MlClassifier
    }
    fn health(&self) -> HealthStatus {
        self.health
    }
    fn set_health(&mut self, health: HealthStatus) {
        self.health = health;
    }
    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }
}

/// Deterministic rule engine backend.
#[derive(Debug, Clone)]
pub struct RuleEngineContract {
    name: String,
    version: String,
    capabilities: Vec<String>,
    health: HealthStatus,
}

impl RuleEngineContract {
    pub fn new(name: impl Into<String>, version: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities,
            health: HealthStatus::Unknown,
        }
    }
}

impl ServiceContract for RuleEngineContract {
    fn service_name(&self) -> &str {
        &self.name
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn kind(&self) -> ServiceKind {
        ServiceKind::RuleEngine
    }
    fn health(&self) -> HealthStatus {
        self.health
    }
    fn set_health(&mut self, health: HealthStatus) {
        self.health = health;
    }
    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }
}

/// Any other downstream service.
#[derive(Debug, Clone)]
pub struct GenericContract {
    name: String,
    version: String,
    capabilities: Vec<String>,
    health: HealthStatus,
}

impl GenericContract {
    pub fn new(name: impl Into<String>, version: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities,
            health: HealthStatus::Unknown,
        }
    }
}

impl ServiceContract for GenericContract {
    fn service_name(&self) -> &str {
        &self.name
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn kind(&self) -> ServiceKind {
        ServiceKind::Generic
    }
    fn health(&self) -> HealthStatus {
        self.health
    }
    fn set_health(&mut self, health: HealthStatus) {
        self.health = health;
    }
    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }
}

/// Build the contract matching a configured service kind.
pub fn contract_from_config(config: &ServiceConfig) -> Box<dyn ServiceContract> {
    let name = config.name.clone();
    let version = config.version.clone();
    let capabilities = config.capabilities.clone();
    match config.kind {
        ServiceKind::MlClassifier => Box::new(ClassifierContract::new(name, version, capabilities)),
        ServiceKind::RuleEngine => Box::new(RuleEngineContract::new(name, version, capabilities)),
        ServiceKind::Generic => Box::new(GenericContract::new(name, version, capabilities)),
    }
}

/// Contract counts per health status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

/// Contracts keyed by service name.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    contracts: RwLock<HashMap<String, Box<dyn ServiceContract>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(services: &[ServiceConfig]) -> Self {
        let registry = Self::new();
        for service in services {
            registry.register(contract_from_config(service));
        }
        registry
    }

    /// Register a contract, returning the one it replaced.
    pub fn register(&self, contract: Box<dyn ServiceContract>) -> Option<ContractInfo> {
        let name = contract.service_name().to_string();
        tracing::info!(service = %name, version = %contract.version(), kind = ?contract.kind(), "Service contract registered");
        let mut contracts = self.contracts.write().expect("registry lock poisoned");
        contracts.insert(name, contract).map(|old| old.describe())
    }

    pub fn unregister(&self, name: &str) -> MeshResult<()> {
        let mut contracts = self.contracts.write().expect("registry lock poisoned");
        match contracts.remove(name) {
            Some(_) => {
                tracing::info!(service = %name, "Service contract unregistered");
                Ok(())
            }
            None => Err(MeshError::ServiceNotFound {
                service: name.to_string(),
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<ContractInfo> {
        let contracts = self.contracts.read().expect("registry lock poisoned");
        contracts.get(name).map(|c| c.describe())
    }

    pub fn contains(&self, name: &str) -> bool {
        let contracts = self.contracts.read().expect("registry lock poisoned");
        contracts.contains_key(name)
    }

    /// All contracts ordered by name.
    pub fn list(&self) -> Vec<ContractInfo> {
        let contracts = self.contracts.read().expect("registry lock poisoned");
        let mut all: Vec<ContractInfo> = contracts.values().map(|c| c.describe()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<ContractInfo> {
        let contracts = self.contracts.read().expect("registry lock poisoned");
        let mut found: Vec<ContractInfo> = contracts
            .values()
            .filter(|c| c.has_capability(capability))
            .map(|c| c.describe())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    pub fn update_health(&self, name: &str, health: HealthStatus) -> MeshResult<()> {
        let mut contracts = self.contracts.write().expect("registry lock poisoned");
        let contract = contracts.get_mut(name).ok_or_else(|| MeshError::ServiceNotFound {
            service: name.to_string(),
        })?;
        if contract.health() != health {
            tracing::info!(service = %name, from = %contract.health(), to = %health, "Service health changed");
        }
        contract.set_health(health);
        Ok(())
    }

    pub fn health_summary(&self) -> HealthSummary {
        let contracts = self.contracts.read().expect("registry lock poisoned");
        contracts
            .values()
            .fold(HealthSummary::default(), |mut summary, c| {
                match c.health() {
                    HealthStatus::Healthy => summary.healthy += 1,
                    HealthStatus::Unhealthy => summary.unhealthy += 1,
                    HealthStatus::Unknown => summary.unknown += 1,
                }
                summary
            })
    }

    pub fn len(&self) -> usize {
        self.contracts.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
