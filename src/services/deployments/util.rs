use anyhow::{anyhow, Result};
use rand::RngCore;

/// Longest error detail kept from command output.
pub(super) const MAX_DETAIL_LINES: usize = 20;

pub(super) fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

pub(super) fn random_hex(bytes: usize) -> String {
    let mut raw = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

pub(super) fn validate_username(username: &str) -> Result<()> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Username is required"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(anyhow!("Username contains unsupported characters"));
    }
    Ok(())
}

/// Keeps the last `MAX_DETAIL_LINES` non-empty lines of noisy command output.
pub(super) fn tail_lines(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(MAX_DETAIL_LINES);
    lines[start..].join("\n")
}
