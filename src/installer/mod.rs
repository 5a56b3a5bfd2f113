//! Declarative installer documents.
//!
//! An installer document describes one self-hosted application: the smallest
//! server it runs on, the DNS records it needs, the wizard questions a caller
//! may answer, and the ordered shell steps that install it. Documents are
//! parsed from YAML once and are immutable afterwards.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::provider::MinSpec;
use crate::template::{TemplateError, parse_duration, parse_size_to_gb, parse_size_to_mb};

mod document;
pub mod registry;

pub use registry::AppRegistry;

/// Auto-answer timeout applied when `timeout_ms` is absent.
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(600);
/// Delay before an auto-answer without a `wait_for` pattern is sent.
pub const DEFAULT_ANSWER_DELAY: Duration = Duration::from_millis(350);

/// Errors raised while loading installer documents or applying wizard answers.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum InstallerError {
    /// The document is not valid YAML or does not match the expected shape.
    #[error("failed to parse installer document: {0}")]
    Parse(String),
    /// A required top-level field is missing or empty.
    #[error("installer document is missing '{0}'")]
    MissingField(&'static str),
    /// A `min_spec` size could not be parsed.
    #[error("invalid min_spec.{field}: {source}")]
    InvalidSize {
        /// Field being parsed (`ram` or `disk`).
        field: &'static str,
        /// Underlying parse failure.
        #[source]
        source: TemplateError,
    },
    /// A step carries an invalid value.
    #[error("step {index} ('{name}') is invalid: {message}")]
    InvalidStep {
        /// Zero-based position of the step.
        index: usize,
        /// Step name, possibly empty.
        name: String,
        /// Description of the problem.
        message: String,
    },
    /// A wizard question is malformed.
    #[error("wizard question '{id}' is invalid: {message}")]
    InvalidQuestion {
        /// Question identifier.
        id: String,
        /// Description of the problem.
        message: String,
    },
    /// A required wizard question has neither an answer nor a default.
    #[error("missing answer for required question '{id}' ({name})")]
    MissingAnswer {
        /// Question identifier.
        id: String,
        /// Human-readable question text.
        name: String,
    },
    /// An installer file could not be read.
    #[error("failed to read installer '{path}': {message}")]
    Read {
        /// Path that failed.
        path: String,
        /// Underlying I/O failure.
        message: String,
    },
    /// No installer is registered under the requested name.
    #[error("unknown app '{0}'")]
    UnknownApp(String),
}

/// Phase a step belongs to, decided by whether it carries a guard.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Unguarded steps that install the application.
    Install,
    /// Guarded steps that configure TLS.
    Ssl,
}

impl Phase {
    /// Lower-case phase name used in log lines and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Ssl => "ssl",
        }
    }
}

/// When the orchestrator may configure DNS on its own in `auto` mode.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DnsAutoPolicy {
    /// Only when the domain's detected DNS host is the selected provider.
    #[default]
    ProviderMatch,
    /// Always configure provider-native DNS.
    Always,
    /// Never configure DNS automatically.
    Never,
}

/// Template for a DNS record the application needs.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DnsRecordTemplate {
    /// Record type such as `A`, `AAAA`, or `CNAME`.
    pub record_type: String,
    /// Record name; empty or `@` targets the root domain.
    pub name: String,
    /// Record content; empty means the server IP for address records.
    pub content: String,
    /// Time to live in seconds; zero leaves the registrar default.
    pub ttl: u32,
    /// Whether the registrar should proxy traffic, when supported.
    pub proxied: Option<bool>,
}

/// Kind of a wizard question.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    /// Yes/no question answered with `true` or `false`.
    Boolean,
    /// Free text.
    Text,
    /// One of a fixed set of choices.
    Choice,
}

/// One option offered by a choice question.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WizardChoice {
    /// Value recorded when the choice is picked.
    pub name: String,
    /// Whether the choice is preselected.
    pub default: bool,
}

/// Question a caller may answer before deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WizardQuestion {
    /// Answer key; answers become `{opts.<id>}` variables.
    pub id: String,
    /// Question text shown to the operator.
    pub name: String,
    /// Question kind.
    pub kind: QuestionKind,
    /// Whether deployment requires an answer.
    pub required: bool,
    /// Default answer, already rendered as text.
    pub default: Option<String>,
    /// Options for choice questions.
    pub choices: Vec<WizardChoice>,
}

impl WizardQuestion {
    /// Returns the answer used when the caller supplies none.
    ///
    /// Choice questions prefer the choice flagged as default over the
    /// question-level default.
    #[must_use]
    pub fn default_answer(&self) -> Option<String> {
        if self.kind == QuestionKind::Choice
            && let Some(choice) = self.choices.iter().find(|choice| choice.default)
        {
            return Some(choice.name.clone());
        }
        self.default.clone()
    }
}

/// Scripted keystrokes for an interactive step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TtyAutoAnswer {
    /// Value template rendered against the deployment variables.
    pub value: String,
    /// Prompt to wait for before answering.
    pub wait_for: Option<String>,
    /// Treat `wait_for` as a regular expression.
    pub is_regex: bool,
    /// How long to wait for the prompt before answering anyway.
    pub timeout: Duration,
    /// Delay before answering when no prompt is awaited.
    pub delay: Duration,
}

/// Terminal settings of a step.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TtyConfig {
    /// Run the command inside a pseudo-terminal.
    pub enabled: bool,
    /// Answers sent in order while the session runs.
    pub auto_answers: Vec<TtyAutoAnswer>,
}

/// One installer step.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Step {
    /// Human-readable name.
    pub name: String,
    /// Guard expression; non-empty guards place the step in the SSL phase.
    pub condition: String,
    /// Shell script template.
    pub run: String,
    /// Pause before running the script.
    pub sleep: Option<Duration>,
    /// Log line template emitted before running.
    pub log: String,
    /// Terminal settings.
    pub tty: TtyConfig,
}

impl Step {
    /// Returns the phase this step belongs to.
    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.condition.trim().is_empty() {
            Phase::Install
        } else {
            Phase::Ssl
        }
    }
}

/// Parsed installer document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallerSpec {
    /// Registry name of the application.
    pub app_name: String,
    /// Short description.
    pub description: String,
    /// Smallest server the application supports.
    pub min_spec: MinSpec,
    /// Example domain shown to operators.
    pub domain_hint: String,
    /// DNS records to create for the application.
    pub dns_records: Vec<DnsRecordTemplate>,
    /// Policy for `auto` DNS mode.
    pub dns_auto: DnsAutoPolicy,
    /// Questions the caller may answer.
    pub wizard_questions: Vec<WizardQuestion>,
    /// Steps in declared order.
    pub steps: Vec<Step>,
}

impl InstallerSpec {
    /// Parses and validates a YAML installer document.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError`] when the document is malformed or carries an
    /// invalid size, duration, or question.
    pub fn from_yaml(text: &str) -> Result<Self, InstallerError> {
        let raw: document::RawDocument =
            serde_yaml::from_str(text).map_err(|err| InstallerError::Parse(err.to_string()))?;
        raw.into_spec()
    }

    /// Returns the steps of `phase` in declared order, before guard evaluation.
    pub fn steps_in(&self, phase: Phase) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |step| step.phase() == phase)
    }

    /// Fills unanswered questions from their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::MissingAnswer`] when a required question has
    /// neither an answer nor a default.
    pub fn apply_wizard_defaults(
        &self,
        answers: &mut BTreeMap<String, String>,
    ) -> Result<(), InstallerError> {
        for question in &self.wizard_questions {
            let answered = answers
                .get(&question.id)
                .is_some_and(|value| !value.trim().is_empty());
            if answered {
                continue;
            }
            match question.default_answer() {
                Some(value) => {
                    answers.insert(question.id.clone(), value);
                }
                None if question.required => {
                    return Err(InstallerError::MissingAnswer {
                        id: question.id.clone(),
                        name: question.name.clone(),
                    });
                }
                None => {}
            }
        }
        Ok(())
    }
}

pub(crate) fn parse_ram(value: &str) -> Result<u64, InstallerError> {
    parse_size_to_mb(value).map_err(|source| InstallerError::InvalidSize {
        field: "ram",
        source,
    })
}

pub(crate) fn parse_disk(value: &str) -> Result<u64, InstallerError> {
    parse_size_to_gb(value).map_err(|source| InstallerError::InvalidSize {
        field: "disk",
        source,
    })
}

pub(crate) fn parse_sleep(
    index: usize,
    name: &str,
    value: &str,
) -> Result<Duration, InstallerError> {
    parse_duration(value).map_err(|err| InstallerError::InvalidStep {
        index,
        name: name.to_owned(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests;
