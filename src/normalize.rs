//! Coercion of nominally numeric columns to nullable integers.
//!
//! Identifiers arrive as text, and snapshots written by other tools render them as floats
//! (`"22000111.0"`) once a column contains nulls. We accept those forms, but only when the value is
//! a whole number that survives the trip through the float representation. Anything fractional is
//! an error: dm+d identifiers are SNOMED codes and a truncated one silently points at a different
//! concept.
use crate::{dmd::DmdId, table::RowSet, util};
use once_cell::sync::Lazy;
use qu::ick_use::*;
use regex::Regex;

/// The columns of the reference table that hold dm+d identifiers.
pub const ID_COLUMNS: [&str; 3] = ["id", "vtm", "vmp_previous"];

/// Largest magnitude a float can hold without skipping integers.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

/// Integer text, optionally followed by a fraction made only of zeros.
static INTEGRAL_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([+-]?[0-9]+)(?:\.0*)?$").expect("valid regex"));

/// Parse a nullable identifier: a whole number that is not negative.
///
/// Returns `Ok(None)` for the null markers (see `util::is_null_text`).
pub fn parse_nullable_int(input: &str) -> Result<Option<DmdId>> {
    let s = input.trim();
    if util::is_null_text(s) {
        return Ok(None);
    }
    if let Some(caps) = INTEGRAL_TEXT.captures(s) {
        let digits = caps[1].trim_start_matches('+');
        if let Some(magnitude) = digits.strip_prefix('-') {
            ensure!(
                magnitude.bytes().all(|b| b == b'0'),
                "identifiers cannot be negative, got \"{}\"",
                input
            );
            return Ok(Some(0));
        }
        return digits
            .parse::<DmdId>()
            .map(Some)
            .with_context(|| format!("\"{}\" is out of range for an identifier", input));
    }
    let value: f64 = s
        .parse()
        .map_err(|_| format_err!("\"{}\" is not a number", input))?;
    ensure!(value.is_finite(), "\"{}\" is not a finite number", input);
    ensure!(
        value.fract() == 0.,
        "\"{}\" has a fractional part and cannot be stored as an integer",
        input
    );
    ensure!(
        value >= 0.,
        "identifiers cannot be negative, got \"{}\"",
        input
    );
    ensure!(
        value <= MAX_EXACT_FLOAT,
        "\"{}\" is too large to have been stored exactly as a float",
        input
    );
    Ok(Some(value as DmdId))
}

/// Convert one column of `table` to nullable integers, returning a new table.
pub fn normalize_column(table: &RowSet, column: &str) -> Result<RowSet> {
    table
        .map_column(column, |row, value| match value {
            None => Ok(None),
            Some(value) => parse_nullable_int(value)
                .map(|v| v.map(|v| v.to_string().into()))
                .with_context(|| format!("in column \"{}\", row {}", column, row)),
        })
        .with_context(|| format!("normalizing column \"{}\"", column))
}

/// Convert each of `columns` to nullable integers.
pub fn normalize_columns(table: &RowSet, columns: &[&str]) -> Result<RowSet> {
    let mut out = table.clone();
    for column in columns {
        out = normalize_column(&out, column)?;
    }
    Ok(out)
}
