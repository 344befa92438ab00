use std::collections::HashMap;

use crate::error::ProxyError;

/// One backend deployment bound to a logical model name.
///
/// Values here are fully resolved: `auth_key` already went through inline /
/// env lookup at startup and is empty when the caller's token should be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub model: String,
    pub deployment_id: String,
    pub api_version: String,
    pub auth_key: String,
    pub endpoint: String,
}

impl DeploymentConfig {
    pub fn has_auth_key(&self) -> bool {
        !self.auth_key.trim().is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate deployment for model '{0}'")]
    DuplicateModel(String),
    #[error("deployment entry has an empty model name")]
    EmptyModel,
}

/// Read-only model → deployment table.
///
/// Built once before the server starts and shared behind an `Arc`; nothing
/// mutates it afterwards, so concurrent lookups need no lock.
#[derive(Debug, Default, Clone)]
pub struct DeploymentRegistry {
    by_model: HashMap<String, DeploymentConfig>,
}

impl DeploymentRegistry {
    pub fn new(deployments: impl IntoIterator<Item = DeploymentConfig>) -> Result<Self, RegistryError> {
        let mut by_model = HashMap::new();
        for d in deployments {
            if d.model.trim().is_empty() {
                return Err(RegistryError::EmptyModel);
            }
            if by_model.contains_key(&d.model) {
                return Err(RegistryError::DuplicateModel(d.model));
            }
            by_model.insert(d.model.clone(), d);
        }
        Ok(Self { by_model })
    }

    pub fn lookup(&self, model: &str) -> Result<&DeploymentConfig, ProxyError> {
        self.by_model
            .get(model)
            .ok_or_else(|| ProxyError::DeploymentNotFound {
                model: model.to_string(),
            })
    }

    /// Deployments sorted by model name (HashMap iteration order is not stable).
    pub fn deployments(&self) -> Vec<&DeploymentConfig> {
        let mut out = self.by_model.values().collect::<Vec<_>>();
        out.sort_by(|a, b| a.model.cmp(&b.model));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn deployment(model: &str, key: &str) -> DeploymentConfig {
        DeploymentConfig {
            model: model.to_string(),
            deployment_id: format!("{model}-deploy"),
            api_version: "2024-02-01".to_string(),
            auth_key: key.to_string(),
            endpoint: "https://example.openai.azure.com".to_string(),
        }
    }

    #[test]
    fn lookup_returns_the_configured_deployment() {
        let reg = DeploymentRegistry::new(vec![deployment("gpt-4", ""), deployment("gpt-35", "k")])
            .expect("registry");
        assert_eq!(reg.deployments().len(), 2);
        let d = reg.lookup("gpt-35").expect("found");
        assert_eq!(d.deployment_id, "gpt-35-deploy");
        assert!(d.has_auth_key());
    }

    #[test]
    fn lookup_of_unknown_model_names_it() {
        let reg = DeploymentRegistry::new(vec![deployment("gpt-4", "")]).expect("registry");
        let err = reg.lookup("gpt-5").unwrap_err();
        match err {
            ProxyError::DeploymentNotFound { model } => assert_eq!(model, "gpt-5"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn duplicate_models_are_rejected() {
        let err = DeploymentRegistry::new(vec![deployment("gpt-4", ""), deployment("gpt-4", "x")])
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateModel("gpt-4".to_string()));
    }

    #[test]
    fn deployments_are_listed_in_model_order() {
        let reg = DeploymentRegistry::new(vec![
            deployment("b", ""),
            deployment("c", ""),
            deployment("a", ""),
        ])
        .expect("registry");
        let models = reg
            .deployments()
            .into_iter()
            .map(|d| d.model.as_str())
            .collect::<Vec<_>>();
        assert_eq!(models, vec!["a", "b", "c"]);
    }
}
