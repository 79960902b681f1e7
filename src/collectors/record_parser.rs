use crate::error::ParseError;
use crate::events::{LineIndex, MeasurementRecord, Timestamp};
use chrono::NaiveDate;

/// Parse one raw log line into a measurement
///
/// A valid line is `<voltage>,<timestamp>` where the timestamp is a whitespace
/// separated tuple `(YYYY MM DD HH MM)`, optionally followed by a seconds field.
/// The surrounding parentheses may be omitted. Tuple fields are read as floats and
/// truncated, matching how the acquisition clock writes them.
///
/// # Returns
///
/// `Ok(None)` for blank lines, which are expected at the end of the file and are not
/// errors. `Ok(Some(record))` for a valid reading.
///
/// # Errors
///
/// Returns a `ParseError` describing why the line was rejected. Callers skip the
/// line and carry on with the rest of the batch.
pub fn parse_record(
    line: &str,
    index: LineIndex,
) -> Result<Option<MeasurementRecord>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 2 {
        return Err(ParseError::FieldCount(fields.len()));
    }

    let voltage = parse_voltage(fields[0])?;
    let timestamp = parse_timestamp(fields[1])?;

    Ok(Some(MeasurementRecord {
        voltage,
        timestamp,
        source_line_index: index,
    }))
}

fn parse_voltage(field: &str) -> Result<f64, ParseError> {
    let field = field.trim();
    match field.parse::<f64>() {
        // "inf" and "NaN" are valid Rust literals but never valid readings
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ParseError::InvalidVoltage(field.to_string())),
    }
}

/// Parse the `(YYYY MM DD HH MM [SS])` timestamp tuple
pub fn parse_timestamp(field: &str) -> Result<Timestamp, ParseError> {
    let invalid = || ParseError::InvalidTimestamp(field.trim().to_string());

    let trimmed = field.trim();
    let inner = match (trimmed.strip_prefix('('), trimmed.strip_suffix(')')) {
        (Some(_), Some(_)) => &trimmed[1..trimmed.len() - 1],
        (None, None) => trimmed,
        _ => return Err(invalid()),
    };

    let mut parts = Vec::with_capacity(6);
    for token in inner.split_whitespace() {
        let value = token.parse::<f64>().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 || value >= f64::from(u32::MAX) + 1.0 {
            return Err(invalid());
        }
        parts.push(value.trunc() as u32);
    }

    if parts.len() != 5 && parts.len() != 6 {
        return Err(invalid());
    }
    let seconds = parts.get(5).copied().unwrap_or(0);

    let year = i32::try_from(parts[0]).map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, parts[1], parts[2])
        .and_then(|date| date.and_hms_opt(parts[3], parts[4], seconds))
        .ok_or_else(invalid)
}
