use crate::config::{config_file_path, init_config_toml, load_config};
use crate::{CliError, CliResult, ConfigCommand};

pub async fn handle_config_cmd(cmd: ConfigCommand) -> CliResult<()> {
    match cmd {
        ConfigCommand::Init { force } => {
            let path = init_config_toml(force)
                .await
                .map_err(|e| CliError::ProxyConfig(e.to_string()))?;
            println!("Wrote TOML config template to {:?}", path);
        }
        ConfigCommand::Path => {
            println!("{}", config_file_path().display());
        }
        ConfigCommand::List { config } => {
            let cfg = load_config(config.as_deref())
                .await
                .map_err(|e| CliError::ProxyConfig(e.to_string()))?;
            let source = config.unwrap_or_else(config_file_path);

            if cfg.deployments.is_empty() {
                println!(
                    "No deployments in {:?} (and AZURE_OPENAI_MODEL_MAPPER is unset)",
                    source
                );
                return Ok(());
            }

            // Resolution also validates endpoints and duplicates.
            let registry = cfg
                .build_registry()
                .map_err(|e| CliError::ProxyConfig(e.to_string()))?;
            println!(
                "Deployments (from {:?}, converter: {:?}, auth header: {}):",
                source, cfg.converter, cfg.auth_header
            );
            for d in registry.deployments() {
                let key = if d.has_auth_key() {
                    "deployment key"
                } else {
                    "caller token"
                };
                println!(
                    "  {} -> {} @ {} [api-version {}] ({})",
                    d.model, d.deployment_id, d.endpoint, d.api_version, key
                );
            }
        }
    }
    Ok(())
}
