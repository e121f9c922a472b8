//! Deterministic, cluster-legal names derived from an owner identity.

/// Identity used when the caller supplies none (or nothing survives sanitizing).
pub const DEFAULT_OWNER: &str = "anonymous";

const SANDBOX_PREFIX: &str = "kubeshell-";
const VOLUME_PREFIX: &str = "kubeshell-home-";
const MAX_NAME_LEN: usize = 63;

/// Longest owner fragment that still keeps `kubeshell-<owner>` within the
/// 63 character object-name limit.
pub const OWNER_BUDGET: usize = MAX_NAME_LEN - SANDBOX_PREFIX.len();

/// Lowercases and replaces anything outside `[a-z0-9.-]` with `-`, then
/// trims separators, truncates to [`OWNER_BUDGET`] and trims the cut end so
/// the result starts and ends alphanumeric.
pub fn sanitize_owner(owner: &str) -> String {
    let replaced: String = owner
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let is_separator = |c: char| c == '-' || c == '.';
    let truncated: String = replaced
        .trim_matches(is_separator)
        .chars()
        .take(OWNER_BUDGET)
        .collect();
    let trimmed = truncated.trim_end_matches(is_separator);

    if trimmed.is_empty() {
        DEFAULT_OWNER.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn sandbox_name(sanitized_owner: &str) -> String {
    format!("{SANDBOX_PREFIX}{sanitized_owner}")
}

pub fn volume_name(sanitized_owner: &str) -> String {
    format!("{VOLUME_PREFIX}{sanitized_owner}")
}
