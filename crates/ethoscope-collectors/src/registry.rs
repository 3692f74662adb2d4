//! Collector registry: id -> collector instance
//!
//! The orchestrator iterates the registry; adding or removing a collector never
//! touches orchestrator code.

use ethoscope_core::{CollectorKind, CollectorSettings, EthoscopeConfig, EthoscopeError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::collector::Collector;
use crate::l2::L2Collector;
use crate::mainnet::MainnetCollector;
use crate::mev::MevRelayCollector;
use crate::source::{HttpSource, Source};

#[derive(Default, Clone)]
pub struct CollectorRegistry {
    collectors: BTreeMap<String, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collector; ids must be unique
    pub fn register(&mut self, collector: Arc<dyn Collector>) -> Result<()> {
        let id = collector.id().to_string();
        if self.collectors.contains_key(&id) {
            return Err(EthoscopeError::Config(format!(
                "collector '{}' is already registered",
                id
            )));
        }
        info!(collector = %id, kinds = ?collector.metric_kinds(), "registered collector");
        self.collectors.insert(id, collector);
        Ok(())
    }

    pub fn deregister(&mut self, id: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Collector>> {
        self.collectors.get(id)
    }

    /// Collectors in id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Collector>> {
        self.collectors.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.collectors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("collectors", &self.ids())
            .finish()
    }
}

/// Build the registry from configuration, talking HTTP through `client`
///
/// The client is created once by the caller and shared by every source.
pub fn build_registry(config: &EthoscopeConfig, client: reqwest::Client) -> Result<CollectorRegistry> {
    build_registry_with(config, |url, timeout| {
        Arc::new(HttpSource::new(client.clone(), url, timeout)) as Arc<dyn Source>
    })
}

/// Build the registry with a custom source factory (`url`, request timeout)
pub fn build_registry_with<F>(config: &EthoscopeConfig, make_source: F) -> Result<CollectorRegistry>
where
    F: Fn(&str, Duration) -> Arc<dyn Source>,
{
    let mut registry = CollectorRegistry::new();

    for (id, settings) in config.enabled_collectors() {
        let collector = build_collector(id, settings, &make_source)?;
        registry.register(collector)?;
    }

    Ok(registry)
}

fn build_collector<F>(id: &str, settings: &CollectorSettings, make_source: &F) -> Result<Arc<dyn Collector>>
where
    F: Fn(&str, Duration) -> Arc<dyn Source>,
{
    let timeout = Duration::from_secs(settings.request_timeout_secs);

    let collector: Arc<dyn Collector> = match settings.kind {
        CollectorKind::Mainnet => {
            let url = settings.rpc_url.as_deref().ok_or_else(|| {
                EthoscopeError::Config(format!("collectors.{}: mainnet collector needs rpc_url", id))
            })?;
            Arc::new(MainnetCollector::new(id, make_source(url, timeout), settings))
        }
        CollectorKind::MevRelay => {
            let relays = settings
                .relays
                .iter()
                .map(|relay| (relay.name.clone(), make_source(&relay.url, timeout)))
                .collect();
            Arc::new(MevRelayCollector::new(id, relays, settings))
        }
        CollectorKind::L2 => {
            let networks = settings
                .networks
                .iter()
                .map(|network| (network.clone(), make_source(&network.rpc_url, timeout)))
                .collect();
            Arc::new(L2Collector::new(id, networks, settings))
        }
    };

    Ok(collector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;

    fn mock_factory(url: &str, _timeout: Duration) -> Arc<dyn Source> {
        Arc::new(MockSource::new(url))
    }

    #[test]
    fn test_default_config_builds_three_collectors() {
        let config = EthoscopeConfig::default();
        let registry = build_registry_with(&config, mock_factory).unwrap();
        assert_eq!(registry.ids(), vec!["l2", "mainnet", "mev_relay"]);

        let mev = registry.get("mev_relay").unwrap();
        assert_eq!(mev.circuits().len(), 3);
        let l2 = registry.get("l2").unwrap();
        assert_eq!(l2.circuits().len(), 6);
    }

    #[test]
    fn test_disabled_collectors_are_not_registered() {
        let mut config = EthoscopeConfig::default();
        if let Some(l2) = config.collectors.get_mut("l2") {
            l2.enabled = false;
        }
        let registry = build_registry_with(&config, mock_factory).unwrap();
        assert!(registry.get("l2").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_and_deregister() {
        let config = EthoscopeConfig::default();
        let mut registry = build_registry_with(&config, mock_factory).unwrap();

        let mainnet = registry.deregister("mainnet").unwrap();
        assert_eq!(registry.len(), 2);

        registry.register(mainnet.clone()).unwrap();
        assert!(registry.register(mainnet).is_err());
    }
}
