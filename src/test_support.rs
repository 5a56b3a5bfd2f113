//! Test support utilities shared across unit and integration tests.
//!
//! Every fake records what it was asked to do so tests can assert on the
//! conversation rather than on side effects.

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::oneshot;

use crate::dns::{DnsError, DnsFuture, DnsHost, DnsRecord, NameserverLookup, Registrar};
use crate::progress::ProgressSink;
use crate::provider::{
    MinSpec, Provider, ProviderError, ProviderFuture, Region, Server, ServerConfig, Size,
    select_size_for_specs,
};
use crate::remote::{
    PtyChild, RemoteCommandOutput, RemoteError, RemoteFuture, RemoteShell, ShellConnector,
};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Progress sink that keeps every line.
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded lines.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        locked(&self.lines).clone()
    }

    /// Returns the recorded lines that start with `prefix`.
    #[must_use]
    pub fn lines_starting_with(&self, prefix: &str) -> Vec<String> {
        locked(&self.lines)
            .iter()
            .filter(|line| line.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn line(&self, line: &str) {
        locked(&self.lines).push(line.to_owned());
    }
}

#[derive(Clone, Debug)]
enum TuiStep {
    Print(Vec<u8>),
    ReadLine,
}

/// Script for a fake full-screen installer behind a PTY.
///
/// Steps run in order: printed text is written to the terminal output and
/// each read waits for one line of keystrokes (terminated by `\r` or `\n`).
/// When the input closes early the program exits with its scripted code.
#[derive(Clone, Debug, Default)]
pub struct FakeTui {
    steps: Vec<TuiStep>,
    exit_code: i32,
}

impl FakeTui {
    /// Creates a program that exits with `exit_code`.
    #[must_use]
    pub const fn exiting(exit_code: i32) -> Self {
        Self {
            steps: Vec::new(),
            exit_code,
        }
    }

    /// Prints `text`, escape sequences included.
    #[must_use]
    pub fn print(mut self, text: &str) -> Self {
        self.steps.push(TuiStep::Print(text.as_bytes().to_vec()));
        self
    }

    /// Waits for one line of input.
    #[must_use]
    pub fn read_line(mut self) -> Self {
        self.steps.push(TuiStep::ReadLine);
        self
    }
}

async fn next_line(input: &mut DuplexStream) -> Option<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0_u8; 1];
        match input.read(&mut byte).await {
            Ok(1) => match byte {
                [b'\r' | b'\n'] => return Some(String::from_utf8_lossy(&line).into_owned()),
                [other] => line.push(other),
            },
            _ => return None,
        }
    }
}

#[derive(Debug, Default)]
struct ShellState {
    commands: Mutex<Vec<String>>,
    outputs: Mutex<VecDeque<RemoteCommandOutput>>,
    terminals: Mutex<VecDeque<FakeTui>>,
    typed: Mutex<Vec<String>>,
}

/// Remote shell returning scripted outputs in FIFO order.
///
/// Plain commands succeed with empty output once the script runs out;
/// terminal commands fall back to a program that exits cleanly.
#[derive(Clone, Debug, Default)]
pub struct ScriptedShell {
    state: Arc<ShellState>,
}

impl ScriptedShell {
    /// Creates a shell with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the output of the next plain command.
    pub fn push_output(&self, code: Option<i32>, stdout: &str, stderr: &str) {
        locked(&self.state.outputs).push_back(RemoteCommandOutput {
            exit_code: code,
            stdout: stdout.to_owned(),
            stderr: stderr.to_owned(),
        });
    }

    /// Queues the program behind the next terminal command.
    pub fn push_tui(&self, tui: FakeTui) {
        locked(&self.state.terminals).push_back(tui);
    }

    /// Every command received, plain and terminal, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        locked(&self.state.commands).clone()
    }

    /// Lines typed into fake terminal programs, in order.
    #[must_use]
    pub fn typed(&self) -> Vec<String> {
        locked(&self.state.typed).clone()
    }
}

impl RemoteShell for ScriptedShell {
    fn run<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, RemoteCommandOutput> {
        Box::pin(async move {
            locked(&self.state.commands).push(command.to_owned());
            let output = locked(&self.state.outputs).pop_front();
            Ok(output.unwrap_or_else(|| RemoteCommandOutput {
                exit_code: Some(0),
                ..RemoteCommandOutput::default()
            }))
        })
    }

    fn open_pty<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, PtyChild> {
        Box::pin(async move {
            locked(&self.state.commands).push(command.to_owned());
            let tui = locked(&self.state.terminals)
                .pop_front()
                .unwrap_or_else(|| FakeTui::exiting(0));

            let (mut screen, stdout) = duplex(64 * 1024);
            let (stdin, mut keyboard) = duplex(1024);
            let (exit_tx, exit_rx) = oneshot::channel();
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                for step in tui.steps {
                    match step {
                        TuiStep::Print(bytes) => {
                            if screen.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        TuiStep::ReadLine => match next_line(&mut keyboard).await {
                            Some(line) => locked(&state.typed).push(line),
                            None => break,
                        },
                    }
                }
                drop(screen);
                exit_tx.send(tui.exit_code).ok();
            });

            Ok(PtyChild {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(tokio::io::empty()),
                exit: Box::pin(async move {
                    exit_rx
                        .await
                        .map(Some)
                        .map_err(|_| RemoteError::Io(String::from("fake terminal vanished")))
                }),
            })
        })
    }
}

/// Connector handing out clones of one [`ScriptedShell`].
#[derive(Debug)]
pub struct FakeConnector {
    shell: ScriptedShell,
    port: u16,
    hosts: Mutex<Vec<IpAddr>>,
}

impl FakeConnector {
    /// Creates a connector whose readiness probe targets `port`.
    #[must_use]
    pub const fn new(shell: ScriptedShell, port: u16) -> Self {
        Self {
            shell,
            port,
            hosts: Mutex::new(Vec::new()),
        }
    }

    /// Hosts connected to, in order.
    #[must_use]
    pub fn hosts(&self) -> Vec<IpAddr> {
        locked(&self.hosts).clone()
    }
}

impl ShellConnector for FakeConnector {
    fn port(&self) -> u16 {
        self.port
    }

    fn connect(&self, ip: IpAddr) -> Box<dyn RemoteShell> {
        locked(&self.hosts).push(ip);
        Box::new(self.shell.clone())
    }
}

#[derive(Debug, Default)]
struct ProviderLog {
    calls: Mutex<Vec<String>>,
    created: Mutex<Vec<ServerConfig>>,
}

/// In-memory provider. Clones share their call log, so a test can keep one
/// clone while the registry builds others.
#[derive(Clone, Debug)]
pub struct FakeProvider {
    log: Arc<ProviderLog>,
    sizes: Vec<Size>,
    ip: Option<IpAddr>,
    dns_host: DnsHost,
    requires_token: bool,
    token: Option<String>,
    create_error: Option<ProviderError>,
    dns_error: Option<ProviderError>,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    /// Name the provider reports.
    pub const NAME: &'static str = "fake";

    /// Creates a provider whose servers come up on `127.0.0.1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: Arc::default(),
            sizes: vec![
                fake_size("fake-small", 1, 1024, 5),
                fake_size("fake-medium", 2, 2048, 10),
                fake_size("fake-large", 4, 8192, 40),
            ],
            ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            dns_host: DnsHost::Unknown(String::from("ns1.fake.test")),
            requires_token: false,
            token: None,
            create_error: None,
            dns_error: None,
        }
    }

    /// Replaces the size catalogue.
    #[must_use]
    pub fn with_sizes(mut self, sizes: Vec<Size>) -> Self {
        self.sizes = sizes;
        self
    }

    /// Sets the address servers report; `None` simulates a missing address.
    #[must_use]
    pub const fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip = ip;
        self
    }

    /// Sets the DNS host the provider operates.
    #[must_use]
    pub fn with_dns_host(mut self, host: DnsHost) -> Self {
        self.dns_host = host;
        self
    }

    /// Requires a `token` setting before the provider is usable.
    #[must_use]
    pub const fn requiring_token(mut self) -> Self {
        self.requires_token = true;
        self
    }

    /// Makes server creation fail.
    #[must_use]
    pub fn failing_create(mut self, message: &str) -> Self {
        self.create_error = Some(ProviderError::api(Self::NAME, message));
        self
    }

    /// Makes DNS setup fail.
    #[must_use]
    pub fn failing_dns(mut self, message: &str) -> Self {
        self.dns_error = Some(ProviderError::api(Self::NAME, message));
        self
    }

    /// Calls received, as `operation:argument` strings.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.log.calls).clone()
    }

    /// Server configurations passed to `create_server`.
    #[must_use]
    pub fn created(&self) -> Vec<ServerConfig> {
        locked(&self.log.created).clone()
    }

    fn record(&self, call: String) {
        locked(&self.log.calls).push(call);
    }
}

fn fake_size(id: &str, vcpus: u32, memory_mb: u64, price: u32) -> Size {
    Size {
        id: id.to_owned(),
        vcpus,
        memory_mb,
        disk_gb: 25,
        price_monthly: f64::from(price),
        regions: Vec::new(),
    }
}

impl Provider for FakeProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn dns_host(&self) -> DnsHost {
        self.dns_host.clone()
    }

    fn list_regions(&self) -> ProviderFuture<'_, Vec<Region>> {
        Box::pin(async move {
            self.record(String::from("list_regions"));
            Ok(vec![Region {
                id: String::from("fake-1"),
                name: String::from("Fake One"),
            }])
        })
    }

    fn list_sizes(&self) -> ProviderFuture<'_, Vec<Size>> {
        Box::pin(async move { Ok(self.sizes.clone()) })
    }

    fn get_size_for_specs<'a>(&'a self, min: &'a MinSpec) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.record(format!("get_size_for_specs:{}/{}", min.cpu, min.ram_mb));
            select_size_for_specs(&self.sizes, min)
        })
    }

    fn create_server<'a>(&'a self, config: &'a ServerConfig) -> ProviderFuture<'a, Server> {
        Box::pin(async move {
            self.record(format!("create_server:{}", config.name));
            locked(&self.log.created).push(config.clone());
            if let Some(err) = &self.create_error {
                return Err(err.clone());
            }
            Ok(Server {
                id: String::from("srv-1"),
                name: config.name.clone(),
                ip: None,
                status: String::from("starting"),
            })
        })
    }

    fn wait_for_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Server> {
        Box::pin(async move {
            self.record(format!("wait_for_server:{id}"));
            let ip = self.ip.ok_or_else(|| ProviderError::MissingPublicIp {
                server_id: id.to_owned(),
            })?;
            let name = locked(&self.log.created)
                .last()
                .map(|config| config.name.clone())
                .unwrap_or_default();
            Ok(Server {
                id: id.to_owned(),
                name,
                ip: Some(ip),
                status: String::from("running"),
            })
        })
    }

    fn destroy_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("destroy_server:{id}"));
            Ok(())
        })
    }

    fn setup_dns<'a>(&'a self, domain: &'a str, ip: IpAddr) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("setup_dns:{domain}:{ip}"));
            self.dns_error.clone().map_or(Ok(()), Err)
        })
    }

    fn configure(&mut self, settings: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        for (key, value) in settings {
            if key != "token" {
                return Err(ProviderError::UnknownSetting {
                    provider: Self::NAME.to_owned(),
                    key: key.clone(),
                });
            }
            self.token = Some(value.clone());
        }
        Ok(())
    }

    fn needs_config(&self) -> bool {
        self.requires_token && self.token.is_none()
    }
}

/// Nameserver lookup answering from a fixed table.
#[derive(Debug, Default)]
pub struct StaticNameservers {
    answers: BTreeMap<String, Vec<String>>,
    queries: Mutex<Vec<String>>,
}

impl StaticNameservers {
    /// Creates a lookup that knows no domains.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `domain` with `nameservers`.
    #[must_use]
    pub fn with(mut self, domain: &str, nameservers: &[&str]) -> Self {
        self.answers.insert(
            domain.to_owned(),
            nameservers.iter().map(|ns| (*ns).to_owned()).collect(),
        );
        self
    }

    /// Names queried, in order.
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        locked(&self.queries).clone()
    }
}

impl NameserverLookup for StaticNameservers {
    fn lookup_ns<'a>(&'a self, domain: &'a str) -> DnsFuture<'a, Vec<String>> {
        Box::pin(async move {
            locked(&self.queries).push(domain.to_owned());
            Ok(self.answers.get(domain).cloned().unwrap_or_default())
        })
    }
}

/// Registrar recording the records it is asked to create.
#[derive(Debug, Default)]
pub struct RecordingRegistrar {
    records: Mutex<Vec<(String, DnsRecord)>>,
    error: Option<DnsError>,
}

impl RecordingRegistrar {
    /// Creates a registrar that accepts every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registrar that rejects every record with an API error.
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            error: Some(DnsError::Api {
                registrar: String::from("cloudflare"),
                message: message.to_owned(),
            }),
        }
    }

    /// `(domain, record)` pairs received, in order.
    #[must_use]
    pub fn records(&self) -> Vec<(String, DnsRecord)> {
        locked(&self.records).clone()
    }
}

impl Registrar for RecordingRegistrar {
    fn name(&self) -> &str {
        "cloudflare"
    }

    fn create_record<'a>(&'a self, domain: &'a str, record: &'a DnsRecord) -> DnsFuture<'a, ()> {
        Box::pin(async move {
            locked(&self.records).push((domain.to_owned(), record.clone()));
            self.error.clone().map_or(Ok(()), Err)
        })
    }
}

impl Registrar for Arc<RecordingRegistrar> {
    fn name(&self) -> &str {
        "cloudflare"
    }

    fn create_record<'a>(&'a self, domain: &'a str, record: &'a DnsRecord) -> DnsFuture<'a, ()> {
        (**self).create_record(domain, record)
    }
}
