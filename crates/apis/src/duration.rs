//! Go-format duration strings, as found on PipelineRun timeouts.

use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid duration {0:?}")]
pub struct InvalidDuration(pub String);

/// Parse a Go `time.Duration` string such as "1h30m", "90s" or "500ms".
///
/// Sign prefixes are rejected; a negative timeout has no meaning here.
pub fn parse_go_duration(s: &str) -> Result<Duration, InvalidDuration> {
    let err = || InvalidDuration(s.to_string());
    if s.is_empty() || s.starts_with('+') || s.starts_with('-') {
        return Err(err());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(err)?;
        if digits == 0 {
            return Err(err());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| err())?;
        rest = &rest[digits..];

        let (scale, len) = if rest.starts_with("ns") {
            (1e-9, 2)
        } else if rest.starts_with("us") || rest.starts_with("µs") {
            (1e-6, if rest.starts_with("µs") { "µs".len() } else { 2 })
        } else if rest.starts_with("ms") {
            (1e-3, 2)
        } else if rest.starts_with('s') {
            (1.0, 1)
        } else if rest.starts_with('m') {
            (60.0, 1)
        } else if rest.starts_with('h') {
            (3600.0, 1)
        } else {
            return Err(err());
        };
        rest = &rest[len..];
        total += Duration::from_secs_f64(value * scale);
    }
    Ok(total)
}
