//! Configuration loading via `ortho-config`.
//!
//! Every struct merges defaults, `selfhosted.toml` (or the file named by
//! `SELFHOSTED_CONFIG_PATH`), and environment variables, in that order of
//! precedence. Provider credentials supplied per deployment through
//! `Provider::configure` override whatever was loaded here.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration value for {field}: {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Description of the problem.
        message: String,
    },
    /// The `ortho-config` loader failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

fn program_name() -> [OsString; 1] {
    [OsString::from("selfhosted")]
}

/// SSH client settings used for every remote command.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SELFHOSTED_SSH",
    discovery(
        app_name = "selfhosted",
        env_var = "SELFHOSTED_CONFIG_PATH",
        config_file_name = "selfhosted.toml",
        dotfile_name = ".selfhosted.toml",
        project_file_name = "selfhosted.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub user: String,
    /// TCP port of the SSH daemon.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Force batch mode so SSH never prompts for a password.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Enforce host key checking; off by default because every deployment
    /// targets a fresh host.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Private key used to authenticate. Supports `~/` expansion.
    pub identity_file: Option<String>,
}

impl SshConfig {
    /// Loads SSH settings without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(program_name()).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a field is empty or the identity file path
    /// is blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.bin, "ssh.bin")?;
        require(&self.user, "ssh.user")?;
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: String::from("ssh.port"),
                message: String::from("must be non-zero"),
            });
        }
        if let Some(identity) = &self.identity_file {
            require(identity, "ssh.identity_file")?;
        }
        Ok(())
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            bin: String::from("ssh"),
            user: String::from("root"),
            port: 22,
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            identity_file: None,
        }
    }
}

/// Orchestrator settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SELFHOSTED",
    discovery(
        app_name = "selfhosted",
        env_var = "SELFHOSTED_CONFIG_PATH",
        config_file_name = "selfhosted.toml",
        dotfile_name = ".selfhosted.toml",
        project_file_name = "selfhosted.toml"
    )
)]
pub struct DeployConfig {
    /// Extra directory of installer documents loaded after the bundled ones.
    pub apps_dir: Option<String>,
    /// Public key installed on new servers, inline or as a `.pub` path.
    pub ssh_public_key: Option<String>,
    /// Seconds between keep-alive lines on progress streams.
    #[ortho_config(default = 15)]
    pub keepalive_secs: u64,
    /// Overall SSH readiness deadline in seconds.
    #[ortho_config(default = 300)]
    pub ssh_wait_timeout_secs: u64,
    /// Seconds between SSH connection attempts.
    #[ortho_config(default = 5)]
    pub ssh_retry_secs: u64,
    /// Seconds to wait after the first successful SSH connection.
    #[ortho_config(default = 5)]
    pub ssh_settle_secs: u64,
}

impl DeployConfig {
    /// Loads orchestrator settings without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(program_name()).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Keep-alive interval for progress streams.
    #[must_use]
    pub const fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// SSH readiness timings.
    #[must_use]
    pub const fn ssh_wait(&self) -> crate::deploy::SshWait {
        crate::deploy::SshWait {
            timeout: Duration::from_secs(self.ssh_wait_timeout_secs),
            retry_interval: Duration::from_secs(self.ssh_retry_secs),
            settle: Duration::from_secs(self.ssh_settle_secs),
        }
    }

    /// Rejects zero intervals, which would spin.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a zero keep-alive or retry
    /// interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("keepalive_secs", self.keepalive_secs),
            ("ssh_retry_secs", self.ssh_retry_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_owned(),
                    message: String::from("must be non-zero"),
                });
            }
        }
        Ok(())
    }
}

/// Scaleway defaults, read from the same `SCW_*` variables as the official
/// tooling.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCW",
    discovery(
        app_name = "selfhosted",
        env_var = "SELFHOSTED_CONFIG_PATH",
        config_file_name = "selfhosted.toml",
        dotfile_name = ".selfhosted.toml",
        project_file_name = "selfhosted.toml"
    )
)]
pub struct ScalewayConfig {
    /// Secret key used for authentication.
    pub secret_key: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: Option<String>,
    /// Organisation identifier used by some endpoints.
    pub default_organization_id: Option<String>,
    /// Zone used when a deployment names none.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Image label resolved to an image id at creation time.
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

impl ScalewayConfig {
    /// Loads Scaleway defaults without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(program_name()).map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

/// DigitalOcean defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "DIGITALOCEAN",
    discovery(
        app_name = "selfhosted",
        env_var = "SELFHOSTED_CONFIG_PATH",
        config_file_name = "selfhosted.toml",
        dotfile_name = ".selfhosted.toml",
        project_file_name = "selfhosted.toml"
    )
)]
pub struct DigitalOceanConfig {
    /// Personal access token.
    pub token: Option<String>,
    /// Image slug for new droplets.
    #[ortho_config(default = "ubuntu-24-04-x64".to_owned())]
    pub default_image: String,
}

impl DigitalOceanConfig {
    /// Loads DigitalOcean defaults without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(program_name()).map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

fn require(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(field.to_owned()));
    }
    Ok(())
}

/// Expands a leading `~/` to the user's home directory.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn ssh_defaults_are_valid() {
        assert_eq!(SshConfig::default().validate(), Ok(()));
    }

    #[rstest]
    #[case(SshConfig { user: String::from("  "), ..SshConfig::default() }, "ssh.user")]
    #[case(SshConfig { bin: String::new(), ..SshConfig::default() }, "ssh.bin")]
    #[case(
        SshConfig { identity_file: Some(String::from(" ")), ..SshConfig::default() },
        "ssh.identity_file"
    )]
    fn ssh_validation_names_missing_field(#[case] config: SshConfig, #[case] field: &str) {
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingField(field.to_owned()))
        );
    }

    #[test]
    fn deploy_config_rejects_zero_retry_interval() {
        let config = DeployConfig {
            apps_dir: None,
            ssh_public_key: None,
            keepalive_secs: 15,
            ssh_wait_timeout_secs: 300,
            ssh_retry_secs: 0,
            ssh_settle_secs: 5,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "ssh_retry_secs"
        ));
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths_unchanged() {
        assert_eq!(expand_tilde("/etc/key"), "/etc/key");
    }
}
