//! Serde shape of the YAML installer document and its conversion into
//! validated [`InstallerSpec`] values.

use std::time::Duration;

use serde::Deserialize;

use super::{
    DEFAULT_ANSWER_DELAY, DEFAULT_ANSWER_TIMEOUT, DnsAutoPolicy, DnsRecordTemplate,
    InstallerError, InstallerSpec, QuestionKind, Step, TtyAutoAnswer, TtyConfig, WizardChoice,
    WizardQuestion, parse_disk, parse_ram, parse_sleep,
};
use crate::provider::MinSpec;

/// Scalar written either as text or as a YAML number/boolean.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum Scalar {
    Bool(bool),
    Int(u64),
    Text(String),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Self::Bool(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::Text(value) => value,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RawDocument {
    #[serde(default)]
    app: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    domain_hint: String,
    #[serde(default)]
    min_spec: RawMinSpec,
    #[serde(default)]
    dns: RawDns,
    #[serde(default)]
    wizard: RawWizard,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMinSpec {
    cpu: Option<u32>,
    ram: Option<Scalar>,
    disk: Option<Scalar>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDns {
    #[serde(default)]
    auto: DnsAutoPolicy,
    #[serde(default)]
    records: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    ttl: u32,
    proxied: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWizard {
    #[serde(default)]
    steps: RawWizardSteps,
}

#[derive(Debug, Default, Deserialize)]
struct RawWizardSteps {
    #[serde(default)]
    application: RawApplication,
}

#[derive(Debug, Default, Deserialize)]
struct RawApplication {
    #[serde(default)]
    custom_questions: Vec<RawQuestion>,
}

#[derive(Debug, Deserialize)]
struct RawQuestion {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: QuestionKind,
    #[serde(default)]
    required: bool,
    default: Option<Scalar>,
    #[serde(default)]
    choices: Vec<RawChoice>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    name: String,
    #[serde(default)]
    default: bool,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    name: String,
    #[serde(rename = "if", default)]
    condition: String,
    #[serde(default)]
    run: String,
    tty: Option<RawTty>,
    sleep: Option<Scalar>,
    #[serde(default)]
    log: String,
}

/// `tty: true` or `tty: { auto_answer: [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTty {
    Flag(bool),
    Scripted {
        #[serde(default)]
        auto_answer: Vec<RawAnswer>,
    },
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    value: Scalar,
    wait_for: Option<String>,
    #[serde(default)]
    wait_for_regex: bool,
    timeout_ms: Option<u64>,
    delay_ms: Option<u64>,
}

impl RawDocument {
    pub(super) fn into_spec(self) -> Result<InstallerSpec, InstallerError> {
        let app_name = self.app.trim().to_owned();
        if app_name.is_empty() {
            return Err(InstallerError::MissingField("app"));
        }

        let min_spec = MinSpec {
            cpu: self.min_spec.cpu.unwrap_or(1),
            ram_mb: self
                .min_spec
                .ram
                .map(|value| parse_ram(&value.into_text()))
                .transpose()?
                .unwrap_or(0),
            disk_gb: self
                .min_spec
                .disk
                .map(|value| parse_disk(&value.into_text()))
                .transpose()?
                .unwrap_or(0),
        };

        let dns_records = self
            .dns
            .records
            .into_iter()
            .map(|record| DnsRecordTemplate {
                record_type: record.record_type.trim().to_ascii_uppercase(),
                name: record.name,
                content: record.content,
                ttl: record.ttl,
                proxied: record.proxied,
            })
            .collect();

        let wizard_questions = self
            .wizard
            .steps
            .application
            .custom_questions
            .into_iter()
            .map(RawQuestion::into_question)
            .collect::<Result<Vec<_>, _>>()?;

        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| step.into_step(index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(InstallerSpec {
            app_name,
            description: self.description,
            min_spec,
            domain_hint: self.domain_hint,
            dns_records,
            dns_auto: self.dns.auto,
            wizard_questions,
            steps,
        })
    }
}

impl RawQuestion {
    fn into_question(self) -> Result<WizardQuestion, InstallerError> {
        let id = self.id.trim().to_owned();
        if id.is_empty() {
            return Err(InstallerError::InvalidQuestion {
                id: self.name,
                message: String::from("missing id"),
            });
        }
        if self.kind == QuestionKind::Choice && self.choices.is_empty() {
            return Err(InstallerError::InvalidQuestion {
                id,
                message: String::from("choice question without choices"),
            });
        }

        Ok(WizardQuestion {
            id,
            name: self.name,
            kind: self.kind,
            required: self.required,
            default: self.default.map(Scalar::into_text),
            choices: self
                .choices
                .into_iter()
                .map(|choice| WizardChoice {
                    name: choice.name,
                    default: choice.default,
                })
                .collect(),
        })
    }
}

impl RawStep {
    fn into_step(self, index: usize) -> Result<Step, InstallerError> {
        let sleep = self
            .sleep
            .map(|value| parse_sleep(index, &self.name, &value.into_text()))
            .transpose()?;

        let tty = match self.tty {
            None | Some(RawTty::Flag(false)) => TtyConfig::default(),
            Some(RawTty::Flag(true)) => TtyConfig {
                enabled: true,
                auto_answers: Vec::new(),
            },
            Some(RawTty::Scripted { auto_answer }) => TtyConfig {
                enabled: true,
                auto_answers: auto_answer.into_iter().map(RawAnswer::into_answer).collect(),
            },
        };

        if !tty.auto_answers.is_empty() && self.run.trim().is_empty() {
            return Err(InstallerError::InvalidStep {
                index,
                name: self.name,
                message: String::from("auto_answer requires a run command"),
            });
        }

        Ok(Step {
            name: self.name,
            condition: self.condition.trim().to_owned(),
            run: self.run,
            sleep,
            log: self.log,
            tty,
        })
    }
}

impl RawAnswer {
    fn into_answer(self) -> TtyAutoAnswer {
        TtyAutoAnswer {
            value: self.value.into_text(),
            wait_for: self.wait_for.filter(|pattern| !pattern.is_empty()),
            is_regex: self.wait_for_regex,
            timeout: self
                .timeout_ms
                .filter(|ms| *ms > 0)
                .map_or(DEFAULT_ANSWER_TIMEOUT, Duration::from_millis),
            delay: self.delay_ms.map_or(DEFAULT_ANSWER_DELAY, Duration::from_millis),
        }
    }
}
