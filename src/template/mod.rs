//! Placeholder rendering and guard evaluation for installer steps.
//!
//! Installer documents refer to deployment options through `{opts.Field}`
//! placeholders and guard steps with boolean expressions such as
//! `opts.EnableSSL && !opts.HttpToHttpsRedirection`. Both are resolved against
//! a [`TemplateContext`], which types build explicitly through
//! [`TemplateVars`] rather than by inspecting their fields at runtime.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

mod size;

pub use size::{parse_size_to_gb, parse_size_to_mb};

/// Prefix shared by every template variable and boolean flag.
pub const VAR_PREFIX: &str = "opts.";

/// Errors raised while parsing template-adjacent values.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// Raised when a duration string is neither a bare integer nor a number
    /// followed by `s`, `m`, or `h`.
    #[error("invalid duration '{0}': expected seconds or a value suffixed with s, m, or h")]
    InvalidDuration(String),
    /// Raised when a size string cannot be parsed.
    #[error("invalid size '{0}': expected a number optionally suffixed with MB, MiB, GB, or GiB")]
    InvalidSize(String),
}

/// Variables and boolean flags available to templates and guards.
///
/// Keys are stored with the `opts.` prefix, so the string variable `Domain`
/// renders `{opts.Domain}` and the flag `Domain` answers the guard
/// `opts.Domain`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TemplateContext {
    strings: BTreeMap<String, String>,
    bools: BTreeMap<String, bool>,
}

impl TemplateContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a string field: it becomes the `{opts.<field>}` variable and the
    /// `opts.<field>` flag, which is true when the value is non-empty.
    pub fn insert_string(&mut self, field: &str, value: impl Into<String>) {
        let text: String = value.into();
        let key = prefixed(field);
        self.bools.insert(key.clone(), !text.is_empty());
        self.strings.insert(key, text);
    }

    /// Adds a boolean field as the `opts.<field>` flag.
    pub fn insert_bool(&mut self, field: &str, value: bool) {
        self.bools.insert(prefixed(field), value);
    }

    /// Merges caller-supplied answers (for example wizard answers). Answers
    /// override existing entries with the same name.
    ///
    /// Values `"true"` and `"false"` set the flag literally; any other value
    /// behaves like [`TemplateContext::insert_string`].
    pub fn merge_answers<'a, I>(&mut self, answers: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (field, value) in answers {
            self.insert_string(field, value.as_str());
            if value.eq_ignore_ascii_case("true") {
                self.insert_bool(field, true);
            } else if value.eq_ignore_ascii_case("false") {
                self.insert_bool(field, false);
            }
        }
    }

    /// Returns the string variables keyed by `opts.<field>`.
    #[must_use]
    pub const fn strings(&self) -> &BTreeMap<String, String> {
        &self.strings
    }

    /// Returns the boolean flags keyed by `opts.<field>`.
    #[must_use]
    pub const fn bools(&self) -> &BTreeMap<String, bool> {
        &self.bools
    }

    /// Looks up a string variable by field name (without the prefix).
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.strings.get(&prefixed(field)).map(String::as_str)
    }

    /// Renders `text` against this context's string variables.
    #[must_use]
    pub fn render(&self, text: &str) -> String {
        render_template(text, &self.strings)
    }

    /// Evaluates a guard expression against this context's flags.
    #[must_use]
    pub fn evaluate(&self, expr: &str) -> bool {
        evaluate_condition(expr, &self.bools)
    }
}

/// Explicit mapping from an options record to template variables.
///
/// Implementors list every field by hand so the compiler keeps the mapping in
/// step with the struct.
pub trait TemplateVars {
    /// Builds the template context describing `self`.
    fn template_vars(&self) -> TemplateContext;
}

fn prefixed(field: &str) -> String {
    format!("{VAR_PREFIX}{field}")
}

/// Replaces every `{key}` token whose key is present in `vars`.
///
/// Rendering is a single left-to-right pass: substituted values are copied
/// verbatim and never re-scanned, so a value containing a placeholder is left
/// as written. Unknown tokens are kept unchanged.
#[must_use]
pub fn render_template(text: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        let (before, from_open) = rest.split_at(open);
        out.push_str(before);

        let Some(close) = from_open.find('}') else {
            out.push_str(from_open);
            return out;
        };

        let (token, after) = from_open.split_at(close + 1);
        let key = token
            .strip_prefix('{')
            .and_then(|inner| inner.strip_suffix('}'))
            .unwrap_or_default();
        match vars.get(key) {
            Some(value) if !key.contains('{') => {
                out.push_str(value);
                rest = after;
            }
            _ => {
                // Emit the brace alone so a later `{` can still open a token.
                let (brace, remainder) = from_open.split_at(1);
                out.push_str(brace);
                rest = remainder;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Evaluates an `OR(AND(NOT? IDENT))` guard expression.
///
/// The expression is split on `||`, each operand on `&&`, and each token may
/// carry a leading `!`. Identifiers missing from `bools` are false. An empty
/// expression is false.
#[must_use]
pub fn evaluate_condition(expr: &str, bools: &BTreeMap<String, bool>) -> bool {
    if expr.trim().is_empty() {
        return false;
    }

    expr.split("||").any(|operand| {
        operand.split("&&").all(|token| {
            let token = token.trim();
            let (negated, ident) = token
                .strip_prefix('!')
                .map_or((false, token), |rest| (true, rest.trim()));
            if ident.is_empty() {
                return false;
            }
            let value = bools.get(ident).copied().unwrap_or(false);
            value != negated
        })
    })
}

/// Parses a step `sleep` value.
///
/// Bare integers are seconds; `s`, `m`, and `h` suffixes select the unit.
///
/// # Errors
///
/// Returns [`TemplateError::InvalidDuration`] for any other input.
pub fn parse_duration(value: &str) -> Result<Duration, TemplateError> {
    let trimmed = value.trim();
    let invalid = || TemplateError::InvalidDuration(value.to_owned());

    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((idx, 's')) => (trimmed.split_at(idx).0, 1),
        Some((idx, 'm')) => (trimmed.split_at(idx).0, 60),
        Some((idx, 'h')) => (trimmed.split_at(idx).0, 3600),
        Some(_) => (trimmed, 1),
        None => return Err(invalid()),
    };

    let amount: u64 = digits.trim().parse().map_err(|_| invalid())?;
    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}
