//! End-to-end deployment: provision, DNS, SSH readiness, install, SSL.
//!
//! Phases run in a fixed order and each has its own failure policy. Failures
//! while provisioning, waiting for SSH, or installing abort the deployment.
//! DNS and SSL failures are reported as warnings and the deployment still
//! succeeds. Every run ends its progress stream with exactly one `DONE` or
//! `ERROR` control line.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cloud_init::{authorized_keys_user_data, resolve_public_key};
use crate::dns::{
    DnsError, DohResolver, NameserverLookup, Registrar, RegistrarCredentials,
    detect_dns_provider, registrar_for, resolve_records,
};
use crate::engine::{StepError, StepExecutor};
use crate::installer::{AppRegistry, DnsAutoPolicy, InstallerSpec, Phase};
use crate::progress::{DONE_MARKER, ProgressSink, error_line};
use crate::provider::{
    Provider, ProviderError, ProviderRegistry, Server, ServerConfig, select_size_for_specs,
};
use crate::pty::{PtyAutomation, PtyError, SessionRegistry, global};
use crate::remote::ShellConnector;
use crate::template::{TemplateContext, TemplateVars};

mod options;

pub use options::{DeployOptions, DnsMode};

const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_TAG: &str = "selfhosted";

/// Timings for the SSH readiness probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SshWait {
    /// Overall deadline.
    pub timeout: Duration,
    /// Pause between failed attempts.
    pub retry_interval: Duration,
    /// Pause after the first successful connection, letting sshd finish
    /// starting.
    pub settle: Duration,
}

impl Default for SshWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retry_interval: Duration::from_secs(5),
            settle: Duration::from_secs(5),
        }
    }
}

/// Errors that end a deployment.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeployError {
    /// Bad input or missing credentials, detected before provisioning.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The provider failed to create the server.
    #[error("provisioning failed: {0}")]
    Provisioning(#[source] ProviderError),
    /// The server or its SSH daemon never became reachable.
    #[error("server not ready: {0}")]
    ReadinessTimeout(String),
    /// An install step failed.
    #[error("install phase failed: {0}")]
    InstallStep(#[source] StepError),
    /// A terminal session broke during an install step.
    #[error("install phase failed: step '{step}' lost its terminal: {source}")]
    Pty {
        /// Step label.
        step: String,
        /// Session failure.
        #[source]
        source: PtyError,
    },
    /// An SSL step failed. Only ever reported as a warning.
    #[error("SSL setup failed: {0}")]
    SslSetup(#[source] StepError),
}

impl From<StepError> for DeployError {
    fn from(value: StepError) -> Self {
        match value {
            StepError::Pty { step, source } => Self::Pty { step, source },
            other => Self::InstallStep(other),
        }
    }
}

fn configuration(err: impl fmt::Display) -> DeployError {
    DeployError::Configuration(err.to_string())
}

/// What the DNS phase did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DnsOutcome {
    /// Records were created.
    Configured {
        /// Provider or registrar that created them.
        via: String,
    },
    /// DNS was left alone.
    Skipped {
        /// Why.
        reason: String,
    },
    /// Record creation failed; reported as a warning.
    Failed {
        /// Failure message.
        message: String,
    },
}

/// What the SSL phase did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SslOutcome {
    /// No SSL setting was supplied.
    NotRequested,
    /// The SSL phase completed.
    Configured,
    /// The SSL phase failed; reported as a warning.
    Failed {
        /// Failure message.
        message: String,
    },
}

/// Result of a successful deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploySummary {
    /// Installed application.
    pub app: String,
    /// Server as last reported by the provider.
    pub server: Server,
    /// Size the server was created with.
    pub size: String,
    /// Where the application is served.
    pub url: String,
    /// DNS phase result.
    pub dns: DnsOutcome,
    /// SSL phase result.
    pub ssl: SslOutcome,
}

/// How the DNS phase should proceed, before any detection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DnsDecision {
    /// Leave DNS alone.
    Skip(String),
    /// Use the provider's own DNS service.
    Provider,
    /// Use the registrar API with the supplied credentials.
    Registrar(RegistrarCredentials),
    /// Use the provider's DNS only if it already hosts the domain.
    DetectFirst,
}

/// Decides the DNS path from the mode, the app's policy, and any registrar
/// credentials.
///
/// Registrar credentials win over the provider in every mode but `skip`.
#[must_use]
pub fn dns_decision(
    mode: DnsMode,
    policy: DnsAutoPolicy,
    registrar: Option<&RegistrarCredentials>,
) -> DnsDecision {
    match (mode, registrar) {
        (DnsMode::Skip, _) => DnsDecision::Skip(String::from("DNS mode is skip")),
        (_, Some(credentials)) => DnsDecision::Registrar(credentials.clone()),
        (DnsMode::Cloudflare, None) => {
            DnsDecision::Skip(String::from("no Cloudflare credentials supplied"))
        }
        (DnsMode::Force, None) => DnsDecision::Provider,
        (DnsMode::Auto, None) => match policy {
            DnsAutoPolicy::Never => {
                DnsDecision::Skip(String::from("app does not configure DNS automatically"))
            }
            DnsAutoPolicy::Always => DnsDecision::Provider,
            DnsAutoPolicy::ProviderMatch => DnsDecision::DetectFirst,
        },
    }
}

/// Recommends the cheapest size meeting the app's minimum hardware.
///
/// With a region the catalogue is narrowed to sizes offered there.
///
/// # Errors
///
/// Returns the provider's listing error or
/// [`ProviderError::NoMatchingSize`].
pub async fn recommend_size(
    provider: &dyn Provider,
    spec: &InstallerSpec,
    region: &str,
) -> Result<String, ProviderError> {
    if region.trim().is_empty() {
        return provider.get_size_for_specs(&spec.min_spec).await;
    }
    let sizes = provider.list_sizes_for_region(region).await?;
    select_size_for_specs(&sizes, &spec.min_spec)
}

/// Derives `<app>-<8 hex chars>` from the app name.
#[must_use]
pub fn derive_server_name(app: &str) -> String {
    let base: String = app
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    let stem = base.trim_matches('-');
    if stem.is_empty() {
        format!("app-{suffix}")
    } else {
        format!("{stem}-{suffix}")
    }
}

/// Builds registrar clients from credentials.
pub type RegistrarFactory =
    Arc<dyn Fn(&RegistrarCredentials) -> Result<Box<dyn Registrar>, DnsError> + Send + Sync>;

/// DNS path after detection.
enum DnsRoute {
    Skip(String),
    Provider,
    Registrar(RegistrarCredentials),
}

struct Prepared {
    spec: Arc<InstallerSpec>,
    provider: Box<dyn Provider>,
    answers: BTreeMap<String, String>,
    user_data: Option<String>,
}

/// Runs deployments. Holds no per-deployment state, so one orchestrator can
/// serve concurrent runs.
#[derive(Clone)]
pub struct DeployOrchestrator {
    apps: Arc<AppRegistry>,
    providers: Arc<ProviderRegistry>,
    connector: Arc<dyn ShellConnector>,
    sessions: Arc<SessionRegistry>,
    nameservers: Arc<dyn NameserverLookup>,
    registrars: RegistrarFactory,
    ssh_wait: SshWait,
}

impl fmt::Debug for DeployOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployOrchestrator")
            .field("apps", &self.apps.len())
            .field("providers", &self.providers)
            .field("ssh_wait", &self.ssh_wait)
            .finish_non_exhaustive()
    }
}

impl DeployOrchestrator {
    /// Creates an orchestrator using the process-wide session registry,
    /// DNS-over-HTTPS detection, and the built-in registrar clients.
    #[must_use]
    pub fn new(
        apps: Arc<AppRegistry>,
        providers: Arc<ProviderRegistry>,
        connector: Arc<dyn ShellConnector>,
    ) -> Self {
        Self {
            apps,
            providers,
            connector,
            sessions: global(),
            nameservers: Arc::new(DohResolver::default()),
            registrars: Arc::new(registrar_for),
            ssh_wait: SshWait::default(),
        }
    }

    /// Uses `sessions` for terminal sessions instead of the global registry.
    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Replaces nameserver detection.
    #[must_use]
    pub fn with_nameservers(mut self, nameservers: Arc<dyn NameserverLookup>) -> Self {
        self.nameservers = nameservers;
        self
    }

    /// Replaces registrar client construction.
    #[must_use]
    pub fn with_registrars(mut self, registrars: RegistrarFactory) -> Self {
        self.registrars = registrars;
        self
    }

    /// Overrides SSH readiness timings.
    #[must_use]
    pub const fn with_ssh_wait(mut self, ssh_wait: SshWait) -> Self {
        self.ssh_wait = ssh_wait;
        self
    }

    /// Runs one deployment, reporting through `progress`.
    ///
    /// The stream always ends with exactly one `DONE` or `ERROR` line.
    ///
    /// # Errors
    ///
    /// Returns the [`DeployError`] of the first fatal phase.
    pub async fn run(
        &self,
        options: &DeployOptions,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<DeploySummary, DeployError> {
        let result = self.deploy(options, &progress).await;
        match &result {
            Ok(summary) => {
                info!(app = %summary.app, server = %summary.server.id, url = %summary.url, "deployment finished");
                progress.line(DONE_MARKER);
            }
            Err(err) => {
                warn!(app = %options.app, error = %err, "deployment failed");
                progress.line(&error_line(&err.to_string()));
            }
        }
        result
    }

    async fn deploy(
        &self,
        options: &DeployOptions,
        progress: &Arc<dyn ProgressSink>,
    ) -> Result<DeploySummary, DeployError> {
        let Prepared {
            spec,
            provider,
            answers,
            user_data,
        } = self.prepare(options)?;

        let size = if options.size.trim().is_empty() || options.size.eq_ignore_ascii_case("auto") {
            let chosen = recommend_size(provider.as_ref(), &spec, &options.region)
                .await
                .map_err(DeployError::Provisioning)?;
            progress.line(&format!(
                "Selected size {chosen} for {} vCPU / {} MB",
                spec.min_spec.cpu, spec.min_spec.ram_mb
            ));
            chosen
        } else {
            options.size.trim().to_owned()
        };

        let server = self
            .provision(options, &spec, provider.as_ref(), &size, user_data, progress.as_ref())
            .await?;
        let ip = server.ip.ok_or_else(|| {
            DeployError::ReadinessTimeout(format!("server {} has no public address", server.id))
        })?;

        let mut vars = options.template_vars();
        vars.insert_string("Size", size.as_str());
        vars.insert_string("ServerIP", ip.to_string());
        vars.insert_string("ServerID", server.id.as_str());
        vars.insert_string("ServerName", server.name.as_str());
        let host = if options.domain.trim().is_empty() {
            ip.to_string()
        } else {
            options.domain.trim().to_owned()
        };
        vars.insert_string("Host", host.as_str());
        vars.merge_answers(&answers);

        let dns = self
            .configure_dns(options, &spec, provider.as_ref(), ip, &vars, progress.as_ref())
            .await;

        self.wait_for_ssh(ip, progress.as_ref()).await?;

        let shell = self.connector.connect(ip);
        let pty = PtyAutomation::new(Arc::clone(&self.sessions), Arc::clone(progress));
        let executor = StepExecutor::new(shell.as_ref(), &pty, progress.as_ref());

        progress.line(&format!("Installing {}", spec.app_name));
        executor.run_phase(&spec, Phase::Install, &vars).await?;

        let ssl = if options.ssl_requested() {
            progress.line("Configuring SSL");
            match executor.run_phase(&spec, Phase::Ssl, &vars).await {
                Ok(_) => SslOutcome::Configured,
                Err(err) => {
                    let message = DeployError::SslSetup(err).to_string();
                    progress.line(&format!("warning: {message}"));
                    SslOutcome::Failed { message }
                }
            }
        } else {
            SslOutcome::NotRequested
        };

        let scheme = if ssl == SslOutcome::Configured { "https" } else { "http" };
        let summary = DeploySummary {
            app: spec.app_name.clone(),
            url: format!("{scheme}://{host}"),
            server,
            size,
            dns,
            ssl,
        };
        report(&summary, ip, progress.as_ref());
        Ok(summary)
    }

    fn prepare(&self, options: &DeployOptions) -> Result<Prepared, DeployError> {
        let spec = self.apps.get(&options.app).map_err(configuration)?;

        let mut answers = options.answers.clone();
        spec.apply_wizard_defaults(&mut answers)
            .map_err(configuration)?;

        let mut provider = self.providers.create(&options.provider).map_err(configuration)?;
        provider
            .configure(&options.provider_settings)
            .map_err(configuration)?;
        if provider.needs_config() {
            return Err(DeployError::Configuration(format!(
                "{} needs credentials before it can deploy",
                provider.name()
            )));
        }

        if options.dns_mode == DnsMode::Cloudflare && options.registrar.is_none() {
            return Err(DeployError::Configuration(String::from(
                "DNS mode cloudflare requires registrar credentials",
            )));
        }

        let user_data = if options.ssh_public_key.trim().is_empty() {
            None
        } else {
            let key = resolve_public_key(&options.ssh_public_key).map_err(configuration)?;
            Some(authorized_keys_user_data(&[key]).map_err(configuration)?)
        };

        Ok(Prepared {
            spec,
            provider,
            answers,
            user_data,
        })
    }

    async fn provision(
        &self,
        options: &DeployOptions,
        spec: &InstallerSpec,
        provider: &dyn Provider,
        size: &str,
        user_data: Option<String>,
        progress: &dyn ProgressSink,
    ) -> Result<Server, DeployError> {
        let name = if options.server_name.trim().is_empty() {
            derive_server_name(&spec.app_name)
        } else {
            options.server_name.trim().to_owned()
        };
        let config = ServerConfig {
            name,
            region: options.region.trim().to_owned(),
            size: size.to_owned(),
            image: None,
            user_data,
            tags: vec![SERVER_TAG.to_owned(), format!("app:{}", spec.app_name)],
        };

        progress.line(&format!(
            "Creating server {} ({size}) on {}",
            config.name,
            provider.name()
        ));
        let created = provider
            .create_server(&config)
            .await
            .map_err(DeployError::Provisioning)?;
        debug!(server = %created.id, "server created");

        progress.line(&format!("Waiting for server {} to become active", created.id));
        let server = provider
            .wait_for_server(&created.id)
            .await
            .map_err(|err| match err {
                ProviderError::Timeout { .. } | ProviderError::MissingPublicIp { .. } => {
                    DeployError::ReadinessTimeout(err.to_string())
                }
                other => DeployError::Provisioning(other),
            })?;
        if let Some(ip) = server.ip {
            progress.line(&format!("Server {} is active at {ip}", server.name));
        }
        Ok(server)
    }

    async fn configure_dns(
        &self,
        options: &DeployOptions,
        spec: &InstallerSpec,
        provider: &dyn Provider,
        ip: IpAddr,
        vars: &TemplateContext,
        progress: &dyn ProgressSink,
    ) -> DnsOutcome {
        let domain = options.domain.trim();
        if domain.is_empty() {
            return DnsOutcome::Skipped {
                reason: String::from("no domain supplied"),
            };
        }

        let route = match dns_decision(options.dns_mode, spec.dns_auto, options.registrar.as_ref()) {
            DnsDecision::Skip(reason) => DnsRoute::Skip(reason),
            DnsDecision::Provider => DnsRoute::Provider,
            DnsDecision::Registrar(credentials) => DnsRoute::Registrar(credentials),
            DnsDecision::DetectFirst => self.detect(domain, provider).await,
        };

        let outcome = match route {
            DnsRoute::Skip(reason) => {
                progress.line(&format!("Skipping DNS: {reason}"));
                return DnsOutcome::Skipped { reason };
            }
            DnsRoute::Provider => {
                progress.line(&format!("Pointing {domain} at {ip} via {}", provider.name()));
                provider
                    .setup_dns(domain, ip)
                    .await
                    .map(|()| provider.name().to_owned())
                    .map_err(|err| err.to_string())
            }
            DnsRoute::Registrar(credentials) => self
                .create_records(&credentials, spec, domain, ip, vars, progress)
                .await
                .map_err(|err| err.to_string()),
        };

        match outcome {
            Ok(via) => DnsOutcome::Configured { via },
            Err(message) => {
                progress.line(&format!("warning: DNS setup failed: {message}"));
                DnsOutcome::Failed { message }
            }
        }
    }

    async fn detect(&self, domain: &str, provider: &dyn Provider) -> DnsRoute {
        match detect_dns_provider(self.nameservers.as_ref(), domain).await {
            Ok(host) if host == provider.dns_host() => DnsRoute::Provider,
            Ok(host) => DnsRoute::Skip(format!(
                "{domain} is served by {host}, not {}",
                provider.name()
            )),
            Err(err) => {
                warn!(domain, error = %err, "DNS host detection failed");
                DnsRoute::Skip(format!("could not detect DNS host: {err}"))
            }
        }
    }

    async fn create_records(
        &self,
        credentials: &RegistrarCredentials,
        spec: &InstallerSpec,
        domain: &str,
        ip: IpAddr,
        vars: &TemplateContext,
        progress: &dyn ProgressSink,
    ) -> Result<String, DnsError> {
        let registrar = (self.registrars)(credentials)?;
        for record in resolve_records(&spec.dns_records, domain, ip, vars) {
            registrar.create_record(domain, &record).await?;
            progress.line(&format!(
                "Created {} record {} -> {} via {}",
                record.record_type,
                record.name,
                record.content,
                registrar.name()
            ));
        }
        Ok(registrar.name().to_owned())
    }

    async fn wait_for_ssh(&self, ip: IpAddr, progress: &dyn ProgressSink) -> Result<(), DeployError> {
        let addr = SocketAddr::new(ip, self.connector.port());
        progress.line(&format!("Waiting for SSH on {addr}"));
        let deadline = Instant::now() + self.ssh_wait.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining.min(CONNECT_ATTEMPT_TIMEOUT), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    drop(stream);
                    break;
                }
                Ok(Err(err)) => debug!(%addr, error = %err, "SSH not reachable yet"),
                Err(_) => debug!(%addr, "SSH connection attempt timed out"),
            }
            if Instant::now() + self.ssh_wait.retry_interval >= deadline {
                return Err(DeployError::ReadinessTimeout(format!(
                    "SSH on {addr} unreachable after {}s",
                    self.ssh_wait.timeout.as_secs()
                )));
            }
            sleep(self.ssh_wait.retry_interval).await;
        }
        if !self.ssh_wait.settle.is_zero() {
            sleep(self.ssh_wait.settle).await;
        }
        progress.line("SSH is ready");
        Ok(())
    }
}

fn report(summary: &DeploySummary, ip: IpAddr, progress: &dyn ProgressSink) {
    progress.line(&format!("{} is deployed", summary.app));
    progress.line(&format!(
        "Server: {} ({}) at {ip}",
        summary.server.name, summary.server.id
    ));
    progress.line(&format!("Size: {}", summary.size));
    progress.line(&format!("URL: {}", summary.url));
    progress.line(&format!("SSH: ssh root@{ip}"));
}
