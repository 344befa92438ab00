use std::env;
use std::path::{Path, PathBuf};

use owo_colors::OwoColorize;
use serde::Serialize;

use crate::config::{ProxyConfig, config_file_path, load_config, proxy_home_dir};
use crate::logging::RequestLogger;
use crate::{CliError, CliResult};

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Level {
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Serialize)]
struct Check {
    level: Level,
    message: String,
}

fn check(level: Level, message: impl Into<String>) -> Check {
    Check {
        level,
        message: message.into(),
    }
}

fn run_checks(cfg: &ProxyConfig, source: &Path) -> Vec<Check> {
    let mut out = Vec::new();

    if source.exists() {
        out.push(check(Level::Ok, format!("config file {:?}", source)));
    } else {
        out.push(check(
            Level::Warn,
            format!("config file {:?} not found; using defaults and env", source),
        ));
    }

    match cfg.listen_addr() {
        Ok(addr) => out.push(check(Level::Ok, format!("listen address {addr}"))),
        Err(e) => out.push(check(Level::Fail, e.to_string())),
    }

    match cfg.backend_auth() {
        Ok(auth) => out.push(check(
            Level::Ok,
            format!("backend credential header '{}'", auth.header_name()),
        )),
        Err(e) => out.push(check(Level::Fail, e.to_string())),
    }

    if cfg.deployments.is_empty() {
        out.push(check(
            Level::Fail,
            "no deployments configured and AZURE_OPENAI_MODEL_MAPPER is unset",
        ));
    }
    for entry in &cfg.deployments {
        match cfg.resolve_deployment(entry) {
            Ok(d) if d.has_auth_key() => out.push(check(
                Level::Ok,
                format!("[{}] -> {} at {}", d.model, d.deployment_id, d.endpoint),
            )),
            Ok(d) => {
                let hint = match entry.api_key_env.as_deref() {
                    Some(name) if env::var(name).is_err() => format!(" (env {name} is unset)"),
                    _ => String::new(),
                };
                out.push(check(
                    Level::Warn,
                    format!(
                        "[{}] -> {} at {} has no key; callers must send a bearer token{}",
                        d.model, d.deployment_id, d.endpoint, hint
                    ),
                ));
            }
            Err(e) => out.push(check(Level::Fail, e.to_string())),
        }
    }
    if !cfg.deployments.is_empty()
        && let Err(e) = cfg.build_registry()
        && !out.iter().any(|c| c.level == Level::Fail)
    {
        out.push(check(Level::Fail, e.to_string()));
    }

    match RequestLogger::from_env().path() {
        Some(path) => out.push(check(Level::Ok, format!("request log {:?}", path))),
        None => out.push(check(
            Level::Warn,
            "request log disabled (DEPLOYMENT_PROXY_REQUEST_LOG=0)",
        )),
    }
    out
}

pub async fn handle_doctor_cmd(config: Option<PathBuf>, json: bool) -> CliResult<()> {
    let cfg = load_config(config.as_deref())
        .await
        .map_err(|e| CliError::ProxyConfig(e.to_string()))?;
    let source = config.unwrap_or_else(config_file_path);
    let checks = run_checks(&cfg, &source);

    if json {
        let text = serde_json::to_string_pretty(&checks).unwrap_or_else(|_| "[]".to_string());
        println!("{text}");
    } else {
        println!("{}", "deployment-proxy doctor".bold());
        println!("{}", "=======================".bold());
        println!("{} {:?}", "Home:".bold(), proxy_home_dir());
        for c in &checks {
            match c.level {
                Level::Ok => println!("{}   {}", "[OK]".green(), c.message),
                Level::Warn => println!("{} {}", "[WARN]".yellow(), c.message),
                Level::Fail => println!("{} {}", "[FAIL]".red(), c.message),
            }
        }
    }

    if checks.iter().any(|c| c.level == Level::Fail) {
        return Err(CliError::ProxyConfig("doctor found blocking problems".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentEntry;

    fn entry(model: &str, endpoint: Option<&str>, key: Option<&str>) -> DeploymentEntry {
        DeploymentEntry {
            model: model.to_string(),
            deployment_id: format!("{model}-dep"),
            endpoint: endpoint.map(str::to_string),
            api_version: None,
            api_key: key.map(str::to_string),
            api_key_env: None,
        }
    }

    #[test]
    fn keyless_deployment_is_a_warning_and_bad_endpoint_fails() {
        let cfg = ProxyConfig {
            deployments: vec![
                entry("gpt-4", Some("https://res.openai.azure.com"), Some("k")),
                entry("ada", Some("https://res.openai.azure.com"), None),
                entry("broken", Some("not a url"), Some("k")),
            ],
            ..Default::default()
        };
        let checks = run_checks(&cfg, Path::new("/nonexistent/config.toml"));
        let levels_for = |needle: &str| {
            checks
                .iter()
                .filter(|c| c.message.contains(needle))
                .map(|c| c.level)
                .collect::<Vec<_>>()
        };
        assert_eq!(levels_for("[gpt-4]"), vec![Level::Ok]);
        assert_eq!(levels_for("[ada]"), vec![Level::Warn]);
        assert_eq!(levels_for("'broken'"), vec![Level::Fail]);
        assert_eq!(levels_for("not found"), vec![Level::Warn]);
    }

    #[test]
    fn empty_table_fails() {
        let checks = run_checks(&ProxyConfig::default(), Path::new("/nonexistent"));
        assert!(
            checks
                .iter()
                .any(|c| c.level == Level::Fail && c.message.contains("no deployments"))
        );
    }
}
