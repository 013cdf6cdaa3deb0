//! TOML configuration for the front listeners and the backend strategy

use crate::error::Error;
use serde::Deserialize;
use std::path::Path;

/// Global configuration for the multiplexer
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Front-door listeners
    #[serde(default)]
    pub frontend: FrontendConfig,

    /// Backend provisioning strategy
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrontendConfig {
    /// Front TCP listener port
    #[serde(default = "default_front_port")]
    pub port: u16,

    /// Health endpoint port (0 disables)
    #[serde(default)]
    pub health_port: u16,

    /// WebSocket listener port (0 disables)
    #[serde(default)]
    pub ws_port: u16,

    /// Wrap the front listener with TLS; requires cert and key
    #[serde(default)]
    pub tls: bool,

    /// Path to the server certificate (PEM)
    pub cert: Option<String>,

    /// Path to the server private key (PEM)
    pub key: Option<String>,

    /// Dial backends over TLS (certificate verification is disabled)
    #[serde(default)]
    pub remote_tls: bool,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            port: default_front_port(),
            health_port: 0,
            ws_port: 0,
            tls: false,
            cert: None,
            key: None,
            remote_tls: false,
        }
    }
}

/// Which strategy produces a backend for each connection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Docker,
    Kubernetes,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Backend strategy
    #[serde(rename = "type")]
    pub kind: BackendKind,

    /// Container-internal port the backend listens on
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Image reference (docker only)
    pub image: Option<String>,

    /// Named network to attach containers to (docker only, optional)
    pub network: Option<String>,

    /// Label selector for claimable pods (kubernetes only)
    pub label_selector: Option<String>,

    /// Namespace to search for pods (kubernetes only)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Path to a kubeconfig file; empty infers in-cluster or default config
    pub kubeconfig: Option<String>,
}

fn default_front_port() -> u16 {
    5900
}

fn default_backend_port() -> u16 {
    5900
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency that serde cannot express
    pub fn validate(&self) -> Result<(), Error> {
        if self.frontend.tls {
            let cert = self.frontend.cert.as_deref().unwrap_or("");
            let key = self.frontend.key.as_deref().unwrap_or("");
            if cert.is_empty() || key.is_empty() {
                return Err(Error::ConfigInvalid(
                    "frontend.tls requires frontend.cert and frontend.key".into(),
                ));
            }
            if !Path::new(cert).exists() || !Path::new(key).exists() {
                return Err(Error::ConfigInvalid(format!(
                    "certificate or key file not found: {}, {}",
                    cert, key
                )));
            }
        }

        match self.backend.kind {
            BackendKind::Docker => {
                if self.backend.image.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::ConfigInvalid(
                        "backend.type = \"docker\" requires backend.image".into(),
                    ));
                }
            }
            BackendKind::Kubernetes => {
                if self.backend.label_selector.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::ConfigInvalid(
                        "backend.type = \"kubernetes\" requires backend.label_selector".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_config_parsing() {
        let toml = r#"
[frontend]
port = 15900
health_port = 8090

[backend]
type = "docker"
port = 5900
image = "example/vnc-session:latest"
network = "sessions"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.frontend.port, 15900);
        assert_eq!(config.frontend.health_port, 8090);
        assert_eq!(config.frontend.ws_port, 0);
        assert!(!config.frontend.tls);
        assert_eq!(config.backend.kind, BackendKind::Docker);
        assert_eq!(
            config.backend.image.as_deref(),
            Some("example/vnc-session:latest")
        );
        assert_eq!(config.backend.network.as_deref(), Some("sessions"));
    }

    #[test]
    fn test_kubernetes_config_parsing() {
        let toml = r#"
[frontend]
port = 5901

[backend]
type = "kubernetes"
port = 5900
label_selector = "role=session"
namespace = "sessions"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.backend.kind, BackendKind::Kubernetes);
        assert_eq!(config.backend.label_selector.as_deref(), Some("role=session"));
        assert_eq!(config.backend.namespace, "sessions");
        assert!(config.backend.kubeconfig.is_none());
    }

    #[test]
    fn test_defaults() {
        let toml = r#"
[backend]
type = "docker"
image = "example/session"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.frontend.port, 5900);
        assert_eq!(config.backend.port, 5900);
        assert_eq!(config.backend.namespace, "default");
    }

    #[test]
    fn test_unknown_backend_type_rejected() {
        let toml = r#"
[backend]
type = "nomad"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_docker_requires_image() {
        let toml = r#"
[backend]
type = "docker"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backend.image"));
    }

    #[test]
    fn test_kubernetes_requires_selector() {
        let toml = r#"
[backend]
type = "kubernetes"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("label_selector"));
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let toml = r#"
[frontend]
tls = true

[backend]
type = "docker"
image = "example/session"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
