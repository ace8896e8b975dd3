//! Pipeline registry: maps source types to pipeline factories.

use crate::config::SourceConfig;
use crate::traits::SourcePipeline;
use crate::{ConnectorError, ConnectorResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Factory building a pipeline for one source.
pub type PipelineFactory =
    Arc<dyn Fn(&SourceConfig) -> ConnectorResult<Box<dyn SourcePipeline>> + Send + Sync>;

/// Registry of pipeline factories keyed by source type.
#[derive(Clone, Default)]
pub struct PipelineRegistry {
    factories: HashMap<String, PipelineFactory>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `source_type`. A later registration replaces
    /// an earlier one.
    pub fn register<F>(&mut self, source_type: impl Into<String>, factory: F)
    where
        F: Fn(&SourceConfig) -> ConnectorResult<Box<dyn SourcePipeline>> + Send + Sync + 'static,
    {
        let source_type = source_type.into();
        if self.factories.contains_key(&source_type) {
            warn!(source_type = %source_type, "Replacing registered pipeline factory");
        }
        debug!(source_type = %source_type, "Registered pipeline factory");
        self.factories.insert(source_type, Arc::new(factory));
    }

    /// Validate `config` and build its pipeline.
    pub fn create(&self, config: &SourceConfig) -> ConnectorResult<Box<dyn SourcePipeline>> {
        config.validate()?;
        let factory = self.factories.get(&config.source_type).ok_or_else(|| {
            ConnectorError::UnknownSourceType {
                source_type: config.source_type.clone(),
                source_name: config.name.clone(),
            }
        })?;
        factory(config)
    }

    /// Build pipelines for every config, logging and skipping failures.
    ///
    /// Output order follows input order.
    pub fn create_many(
        &self,
        configs: &[SourceConfig],
    ) -> Vec<(SourceConfig, Box<dyn SourcePipeline>)> {
        configs
            .iter()
            .filter_map(|config| match self.create(config) {
                Ok(pipeline) => Some((config.clone(), pipeline)),
                Err(e) => {
                    error!(
                        source = %config.name,
                        source_type = %config.source_type,
                        "Failed to create pipeline: {}",
                        e
                    );
                    None
                }
            })
            .collect()
    }

    /// Registered source types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::PipelineContext;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Noop;

    #[async_trait]
    impl SourcePipeline for Noop {
        async fn extract(&self, _ctx: &PipelineContext) -> ConnectorResult<Option<Value>> {
            Ok(None)
        }

        async fn transform(&self, raw: Value, _ctx: &PipelineContext) -> ConnectorResult<Value> {
            Ok(raw)
        }
    }

    fn registry() -> PipelineRegistry {
        let mut registry = PipelineRegistry::new();
        registry.register("rest", |_config| Ok(Box::new(Noop) as Box<dyn SourcePipeline>));
        registry.register("broken", |config| {
            Err(ConnectorError::config(format!(
                "source '{}' is missing options",
                config.name
            )))
        });
        registry
    }

    #[test]
    fn test_create_unknown_type() {
        let err = registry()
            .create(&SourceConfig::new("x", "graphql", "https://api.test"))
            .err()
            .unwrap();
        match err {
            ConnectorError::UnknownSourceType {
                source_type,
                source_name,
            } => {
                assert_eq!(source_type, "graphql");
                assert_eq!(source_name, "x");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_create_many_skips_failures_in_order() {
        let configs = vec![
            SourceConfig::new("a", "rest", "https://a.test"),
            SourceConfig::new("b", "graphql", "https://b.test"),
            SourceConfig::new("c", "broken", "https://c.test"),
            SourceConfig::new("d", "rest", "https://d.test"),
        ];

        let created = registry().create_many(&configs);
        let names: Vec<&str> = created.iter().map(|(c, _)| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "d"]);
    }

    #[test]
    fn test_create_rejects_invalid_source() {
        let registry = registry();

        let mut zero = SourceConfig::new("fast", "rest", "https://a.test");
        zero.interval_ms = Some(0);
        let err = registry.create(&zero).err().unwrap();
        assert!(matches!(err, ConnectorError::Configuration(_)));

        let no_url = SourceConfig::new("nowhere", "rest", "");
        assert!(registry.create(&no_url).is_err());

        let ok = SourceConfig::new("ok", "rest", "https://ok.test");
        let created = registry.create_many(&[zero, no_url, ok]);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0.name, "ok");
    }

    #[test]
    fn test_registered_types() {
        let registry = registry();
        assert_eq!(registry.registered_types(), vec!["broken", "rest"]);
    }
}
