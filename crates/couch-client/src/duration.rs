//! Parsers for the timeout and heartbeat flags of [`crate::Configuration`].

use anyhow::Context;

/// Parse a timeout into whole seconds: "300", "300s", "30m" or "1h".
pub fn parse_duration_to_secs(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    if let Some(num_str) = s.strip_suffix("ms") {
        anyhow::bail!("Sub-second durations are not supported here: {num_str}ms");
    }
    if let Some(num_str) = s.strip_suffix('h') {
        let hours: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid hours value: {num_str}"))?;
        return hours.checked_mul(3600).context("duration too large");
    }
    if let Some(num_str) = s.strip_suffix('m') {
        let minutes: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid minutes value: {num_str}"))?;
        return minutes.checked_mul(60).context("duration too large");
    }
    if let Some(num_str) = s.strip_suffix('s') {
        let secs: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid seconds value: {num_str}"))?;
        return Ok(secs);
    }

    s.parse::<u64>()
        .with_context(|| format!("Invalid duration value: {s}"))
}

/// Parse a heartbeat interval into milliseconds.
///
/// Plain numbers are milliseconds (the unit the `_changes` API uses);
/// "ms", "s" and "m" suffixes are accepted as well.
pub fn parse_interval_to_millis(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty interval string");
    }

    if let Some(num_str) = s.strip_suffix("ms") {
        return num_str
            .parse()
            .with_context(|| format!("Invalid milliseconds value: {num_str}"));
    }
    if s.ends_with('s') || s.ends_with('m') || s.ends_with('h') {
        return parse_duration_to_secs(s)?
            .checked_mul(1000)
            .context("duration too large");
    }

    s.parse::<u64>()
        .with_context(|| format!("Invalid interval value: {s}"))
}
