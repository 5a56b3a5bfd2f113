//! Core library for the `selfhosted` deployment tool.
//!
//! A deployment provisions a server at a cloud provider, optionally points a
//! domain at it, waits for SSH, and then runs an application's installer
//! document: a declarative list of shell steps, some of which drive
//! full-screen terminal installers through scripted keystrokes. Providers,
//! applications, and the remote shell are all injected, so the whole flow
//! runs against fakes in tests.

pub mod cloud_init;
pub mod config;
pub mod deploy;
pub mod dns;
pub mod engine;
mod http;
pub mod installer;
pub mod progress;
pub mod provider;
pub mod pty;
pub mod remote;
pub mod template;
pub mod test_support;

pub use config::{DeployConfig, DigitalOceanConfig, ScalewayConfig, SshConfig};
pub use deploy::{
    DeployError, DeployOptions, DeployOrchestrator, DeploySummary, DnsMode, DnsOutcome, SshWait,
    SslOutcome, recommend_size,
};
pub use dns::{DnsHost, RegistrarCredentials};
pub use engine::{StepError, StepExecutor};
pub use installer::{AppRegistry, InstallerError, InstallerSpec, Phase};
pub use progress::{ProgressSink, StreamWriter};
pub use provider::{
    DigitalOceanProvider, Provider, ProviderError, ProviderRegistry, ScalewayProvider,
};
pub use pty::{PtyAutomation, PtyError, SessionRegistry};
pub use remote::{RemoteShell, ShellConnector, SshConnector};
pub use template::{TemplateContext, TemplateVars};
