//! Built-in pipelines of the HTTP poller connector

mod paginated;
mod rest;

pub use paginated::PaginatedPipeline;
pub use rest::RestPipeline;

use danube_poller_core::{
    get_path, ConnectorError, ConnectorResult, PipelineRegistry, SourceConfig, SourcePipeline,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Registry with every built-in source type
pub fn registry() -> PipelineRegistry {
    let mut registry = PipelineRegistry::new();
    registry.register("rest", |config| {
        Ok(Box::new(RestPipeline::from_config(config)?) as Box<dyn SourcePipeline>)
    });
    registry.register("paginated", |config| {
        Ok(Box::new(PaginatedPipeline::from_config(config)?) as Box<dyn SourcePipeline>)
    });
    registry
}

/// Deserialize the type-specific `options` table of a source
fn parse_options<T: DeserializeOwned>(config: &SourceConfig) -> ConnectorResult<T> {
    serde_json::from_value(Value::Object(config.options.clone())).map_err(|e| {
        ConnectorError::config(format!(
            "source '{}' has invalid options: {}",
            config.name, e
        ))
    })
}

/// Records at `data_path` (whole body when unset). Missing paths mean no data.
fn select_records(body: Value, data_path: Option<&str>) -> Option<Value> {
    match data_path {
        None => Some(body),
        Some(path) => get_path(&body, path).cloned(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_has_builtin_types() {
        assert_eq!(registry().registered_types(), vec!["paginated", "rest"]);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let mut config = SourceConfig::new("crm", "paginated", "https://api.test");
        config.options.insert("page_size".into(), json!("many"));
        assert!(registry().create(&config).is_err());
    }

    #[test]
    fn test_select_records() {
        let body = json!({"data": {"items": [1, 2]}});
        assert_eq!(select_records(body.clone(), None), Some(body.clone()));
        assert_eq!(
            select_records(body.clone(), Some("data.items")),
            Some(json!([1, 2]))
        );
        assert_eq!(select_records(body, Some("data.missing")), None);
    }
}
