//! Runtime configuration for the `kiln` binary.
//!
//! Connection settings are loaded from environment variables with sensible
//! defaults. The build itself is described by a separate JSON file.

use kiln_prism::{PrismEndpoint, DEFAULT_PORT};
use std::path::PathBuf;

/// Runtime configuration for the `kiln` binary.
#[derive(Clone)]
pub struct KilnConfig {
    /// Prism Central host name or address.
    pub endpoint: String,

    /// Prism Central HTTPS port (default: 9440).
    pub port: u16,

    pub username: String,

    pub password: String,

    /// Skip TLS certificate verification (default: false).
    pub insecure: bool,

    /// JSON build description (default: `kiln.json`).
    pub build_file: PathBuf,

    /// Directory exported images and OVAs are written to (default: `.`).
    pub output_dir: PathBuf,

    /// Login used by the ssh communicator (default: `root`).
    pub ssh_user: String,

    /// Private key passed to ssh with `-i`.
    pub ssh_key: Option<PathBuf>,
}

// Keeps the password out of logs.
impl std::fmt::Debug for KilnConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KilnConfig")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("insecure", &self.insecure)
            .field("build_file", &self.build_file)
            .field("output_dir", &self.output_dir)
            .field("ssh_user", &self.ssh_user)
            .field("ssh_key", &self.ssh_key)
            .finish_non_exhaustive()
    }
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("KILN_ENDPOINT is not set")]
    MissingEndpoint,

    #[error("KILN_USERNAME and KILN_PASSWORD must both be set")]
    MissingCredentials,

    #[error("build file not found: {0}")]
    MissingBuildFile(PathBuf),

    #[error("ssh key not found: {0}")]
    MissingSshKey(PathBuf),
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: DEFAULT_PORT,
            username: String::new(),
            password: String::new(),
            insecure: false,
            build_file: PathBuf::from("kiln.json"),
            output_dir: PathBuf::from("."),
            ssh_user: "root".into(),
            ssh_key: None,
        }
    }
}

impl KilnConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KILN_ENDPOINT` | (required) |
    /// | `KILN_PORT` | `9440` |
    /// | `KILN_USERNAME` | (required) |
    /// | `KILN_PASSWORD` | (required) |
    /// | `KILN_INSECURE` | `false` |
    /// | `KILN_BUILD_FILE` | `kiln.json` |
    /// | `KILN_OUTPUT_DIR` | `.` |
    /// | `KILN_SSH_USER` | `root` |
    /// | `KILN_SSH_KEY` | unset |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        Self {
            endpoint: var("KILN_ENDPOINT").unwrap_or(default.endpoint),
            port: var("KILN_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.port),
            username: var("KILN_USERNAME").unwrap_or(default.username),
            password: var("KILN_PASSWORD").unwrap_or(default.password),
            insecure: var("KILN_INSECURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.insecure),
            build_file: var("KILN_BUILD_FILE")
                .map(PathBuf::from)
                .unwrap_or(default.build_file),
            output_dir: var("KILN_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.output_dir),
            ssh_user: var("KILN_SSH_USER").unwrap_or(default.ssh_user),
            ssh_key: var("KILN_SSH_KEY").filter(|v| !v.is_empty()).map(PathBuf::from),
        }
    }

    /// Validate that a build can be started with this configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }

        if self.username.is_empty() || self.password.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }

        if !self.build_file.exists() {
            return Err(ConfigError::MissingBuildFile(self.build_file.clone()));
        }

        if let Some(key) = &self.ssh_key {
            if !key.exists() {
                return Err(ConfigError::MissingSshKey(key.clone()));
            }
        }

        Ok(())
    }

    /// Log problems that do not prevent a build from starting.
    pub fn validate_warn(&self) {
        if self.insecure {
            tracing::warn!(endpoint = %self.endpoint, "TLS certificate verification disabled");
        }

        if !self.output_dir.exists() {
            tracing::warn!("Output directory {:?} does not exist, it will be created", self.output_dir);
        }
    }

    /// Prism Central connection settings.
    pub fn endpoint(&self) -> PrismEndpoint {
        PrismEndpoint {
            port: self.port,
            insecure: self.insecure,
            ..PrismEndpoint::new(&self.endpoint, &self.username, &self.password)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = KilnConfig::default();
        assert_eq!(config.port, 9440);
        assert!(!config.insecure);
        assert_eq!(config.build_file, PathBuf::from("kiln.json"));
        assert_eq!(config.output_dir, PathBuf::from("."));
        assert_eq!(config.ssh_user, "root");
        assert!(config.ssh_key.is_none());
    }

    #[test]
    fn test_from_env_uses_defaults() {
        let config = KilnConfig::from_lookup(lookup(&[]));
        let default = KilnConfig::default();

        assert_eq!(config.port, default.port);
        assert_eq!(config.build_file, default.build_file);
        assert_eq!(config.ssh_user, default.ssh_user);
        assert!(config.endpoint.is_empty());
    }

    #[test]
    fn test_from_env_overrides() {
        let config = KilnConfig::from_lookup(lookup(&[
            ("KILN_ENDPOINT", "pc.example.com"),
            ("KILN_PORT", "9443"),
            ("KILN_USERNAME", "admin"),
            ("KILN_PASSWORD", "secret"),
            ("KILN_INSECURE", "1"),
            ("KILN_BUILD_FILE", "/etc/kiln/centos.json"),
            ("KILN_OUTPUT_DIR", "/srv/images"),
            ("KILN_SSH_USER", "builder"),
            ("KILN_SSH_KEY", "/home/builder/.ssh/id_ed25519"),
        ]));

        assert_eq!(config.endpoint, "pc.example.com");
        assert_eq!(config.port, 9443);
        assert!(config.insecure);
        assert_eq!(config.build_file, PathBuf::from("/etc/kiln/centos.json"));
        assert_eq!(config.output_dir, PathBuf::from("/srv/images"));
        assert_eq!(config.ssh_user, "builder");
        assert_eq!(
            config.ssh_key,
            Some(PathBuf::from("/home/builder/.ssh/id_ed25519"))
        );
    }

    #[test]
    fn test_invalid_port_falls_back() {
        let config = KilnConfig::from_lookup(lookup(&[("KILN_PORT", "not-a-port")]));
        assert_eq!(config.port, 9440);
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let build_file = dir.path().join("kiln.json");
        std::fs::write(&build_file, "{}").unwrap();

        let mut config = KilnConfig {
            build_file,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingEndpoint)));

        config.endpoint = "pc.example.com".into();
        config.username = "admin".into();
        assert!(matches!(config.validate(), Err(ConfigError::MissingCredentials)));

        config.password = "secret".into();
        config.validate().unwrap();

        config.ssh_key = Some(dir.path().join("missing"));
        assert!(matches!(config.validate(), Err(ConfigError::MissingSshKey(_))));

        config.ssh_key = None;
        config.build_file = dir.path().join("other.json");
        assert!(matches!(config.validate(), Err(ConfigError::MissingBuildFile(_))));
    }

    #[test]
    fn test_endpoint_and_debug() {
        let config = KilnConfig {
            endpoint: "pc.example.com".into(),
            port: 9443,
            username: "admin".into(),
            password: "hunter2".into(),
            insecure: true,
            ..Default::default()
        };

        let endpoint = config.endpoint();
        assert_eq!(endpoint.port, 9443);
        assert!(endpoint.insecure);
        assert_eq!(endpoint.fingerprint(), "kiln:pc.example.com:9443:admin");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
