use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use torii_core::{App, ConfigStore, ServiceDetail};

/// Where the proxy listens. The plain listener is always on; the TLS
/// listener exists only when a `https` section names its port and key
/// material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenCfg {
    #[serde(default = "all_interfaces")]
    pub bind: String,
    #[serde(default = "plain_port")]
    pub http_port: u16,
    #[serde(default)]
    pub https: Option<TlsCfg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCfg {
    pub port: u16,
    pub cert_file: String,
    pub key_file: String,
}

fn all_interfaces() -> String {
    "0.0.0.0".into()
}

fn plain_port() -> u16 {
    8080
}

fn log_directive() -> String {
    "info".into()
}

impl Default for ListenCfg {
    fn default() -> Self {
        Self {
            bind: all_interfaces(),
            http_port: plain_port(),
            https: None,
        }
    }
}

/// Whole config file: listeners, the log mode, and the published services
/// and tenant apps the data plane serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub listen: ListenCfg,
    /// `EnvFilter` directive, or `json` / `pretty` for formatted output.
    #[serde(default = "log_directive")]
    pub log: String,
    #[serde(default)]
    pub services: Vec<ServiceDetail>,
    #[serde(default)]
    pub apps: Vec<App>,
}

/// Read and parse a config file; the extension picks the format.
pub fn load_config(path: &str) -> Result<FileConfig> {
    let path = Path::new(path);
    let content =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse_config(path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<FileConfig> {
    let format = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match format {
        "yaml" | "yml" => {
            serde_yml::from_str(content).with_context(|| format!("parse {}", path.display()))
        }
        "json" => {
            serde_json::from_str(content).with_context(|| format!("parse {}", path.display()))
        }
        "toml" => toml::from_str(content).with_context(|| format!("parse {}", path.display())),
        other => bail!(
            "config {} has unsupported format {:?} (want yaml, json or toml)",
            path.display(),
            other
        ),
    }
}

/// File-backed `ConfigStore`. Every load re-reads the file, so a SIGHUP
/// reload picks up edits without restarting.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read(&self) -> Result<FileConfig> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("read config {}", self.path.display()))?;
        parse_config(&self.path, &content)
    }
}

impl ConfigStore for FileStore {
    fn load_services(&self) -> Result<Vec<ServiceDetail>> {
        Ok(self.read()?.services)
    }

    fn load_apps(&self) -> Result<Vec<App>> {
        Ok(self.read()?.apps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
listen:
  http_port: 8081
  https:
    port: 8444
    cert_file: ./certs/server.pem
    key_file: ./certs/server.key
services:
  - info:
      id: 1
      load_type: 0
      service_name: test_http_string
    http_rule:
      rule_type: 0
      rule: /test_http_string
      need_strip_uri: 1
    load_balance:
      round_type: 2
      ip_list: "127.0.0.1:2003,127.0.0.1:2004"
      weight_list: "40,60"
apps:
  - app_id: app_id_a
    secret: "449441a5a10d6e07d9c837d08f49ff2f"
    qpd: 3
    qps: 10
"#;

    #[test]
    fn yaml_config_parses() {
        let cfg = parse_config(Path::new("gateway.yaml"), YAML).unwrap();
        assert_eq!(cfg.listen.http_port, 8081);
        assert_eq!(cfg.listen.bind, "0.0.0.0");
        assert_eq!(cfg.listen.https.as_ref().unwrap().port, 8444);
        assert_eq!(cfg.log, "info");
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].info.service_name, "test_http_string");
        assert_eq!(cfg.apps[0].qpd, 3);
    }

    #[test]
    fn https_section_is_optional() {
        let cfg = parse_config(Path::new("gateway.yaml"), "log: debug\n").unwrap();
        assert!(cfg.listen.https.is_none());
        assert_eq!(cfg.log, "debug");
    }

    #[test]
    fn unsupported_format_is_an_error() {
        assert!(parse_config(Path::new("gateway.ini"), "").is_err());
        assert!(parse_config(Path::new("gateway"), "").is_err());
    }

    #[test]
    fn json_config_parses() {
        let cfg = parse_config(
            Path::new("gateway.json"),
            r#"{"listen": {"http_port": 9090}, "services": [], "apps": []}"#,
        )
        .unwrap();
        assert_eq!(cfg.listen.http_port, 9090);
    }
}
