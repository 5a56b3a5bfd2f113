//! Hardware size parsing for installer `min_spec` values.

use super::TemplateError;

const MB_PER_GB: u64 = 1024;

enum Unit {
    Megabytes,
    Gigabytes,
    Bare,
}

fn split_unit(value: &str) -> Result<(u64, Unit), TemplateError> {
    let trimmed = value.trim();
    let invalid = || TemplateError::InvalidSize(value.to_owned());
    let lower = trimmed.to_ascii_lowercase();

    let (digits, unit) = [
        ("gib", Unit::Gigabytes),
        ("gb", Unit::Gigabytes),
        ("g", Unit::Gigabytes),
        ("mib", Unit::Megabytes),
        ("mb", Unit::Megabytes),
        ("m", Unit::Megabytes),
    ]
    .into_iter()
    .find_map(|(suffix, unit)| lower.strip_suffix(suffix).map(|digits| (digits, unit)))
    .unwrap_or((lower.as_str(), Unit::Bare));

    let amount = digits.trim().parse::<u64>().map_err(|_| invalid())?;
    Ok((amount, unit))
}

/// Parses a memory or disk size into megabytes. Bare integers are megabytes.
///
/// # Errors
///
/// Returns [`TemplateError::InvalidSize`] when the value is not a whole number
/// with an optional `MB`, `MiB`, `GB`, or `GiB` suffix.
pub fn parse_size_to_mb(value: &str) -> Result<u64, TemplateError> {
    match split_unit(value)? {
        (amount, Unit::Megabytes | Unit::Bare) => Ok(amount),
        (amount, Unit::Gigabytes) => amount
            .checked_mul(MB_PER_GB)
            .ok_or_else(|| TemplateError::InvalidSize(value.to_owned())),
    }
}

/// Parses a disk size into gigabytes, rounding megabyte values down. Bare
/// integers are gigabytes.
///
/// # Errors
///
/// Returns [`TemplateError::InvalidSize`] when the value is not a whole number
/// with an optional `MB`, `MiB`, `GB`, or `GiB` suffix.
pub fn parse_size_to_gb(value: &str) -> Result<u64, TemplateError> {
    match split_unit(value)? {
        (amount, Unit::Gigabytes | Unit::Bare) => Ok(amount),
        (amount, Unit::Megabytes) => Ok(amount.div_euclid(MB_PER_GB)),
    }
}
