use crate::error::{Result, ToolError};

pub const MAX_TOOL_ID_LEN: usize = 63;

pub fn normalize_tool_id(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

/// Normalizes and checks a tool id: 1-63 chars of `[a-z0-9-]`, no leading or trailing hyphen.
pub fn validate_tool_id(value: &str) -> Result<String> {
    let id = normalize_tool_id(value);
    if id.is_empty() {
        return Err(ToolError::InvalidArgument("tool id is required".into()));
    }
    if id.len() > MAX_TOOL_ID_LEN {
        return Err(ToolError::InvalidArgument(format!(
            "tool id '{id}' is longer than {MAX_TOOL_ID_LEN} characters"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|ch| !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '-'))
    {
        return Err(ToolError::InvalidArgument(format!(
            "tool id '{id}' contains invalid character '{bad}'"
        )));
    }
    if id.starts_with('-') || id.ends_with('-') {
        return Err(ToolError::InvalidArgument(format!(
            "tool id '{id}' must not start or end with '-'"
        )));
    }
    Ok(id)
}

/// Derives a default tool id from the last path segment of a source URL.
pub fn slug_from_source(source_url: &str) -> Option<String> {
    let trimmed = source_url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(|ch| ch == '/' || ch == ':')
        .next()
        .unwrap_or(trimmed);
    let last = last.strip_suffix(".git").unwrap_or(last);

    let mut slug = String::with_capacity(last.len());
    for ch in last.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    let slug: String = slug.chars().take(MAX_TOOL_ID_LEN).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        None
    } else {
        Some(slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_normalizes_slugs() {
        assert_eq!(validate_tool_id("  Grafana-Lite ").unwrap(), "grafana-lite");
        assert_eq!(validate_tool_id("a1").unwrap(), "a1");
    }

    #[test]
    fn rejects_bad_ids() {
        for bad in ["", "   ", "-lead", "trail-", "under_score", "dot.ted", "sp ace", "../up"] {
            assert!(
                matches!(validate_tool_id(bad), Err(ToolError::InvalidArgument(_))),
                "expected '{bad}' to be rejected"
            );
        }
        assert!(validate_tool_id(&"a".repeat(MAX_TOOL_ID_LEN + 1)).is_err());
    }

    #[test]
    fn slug_from_common_url_shapes() {
        assert_eq!(
            slug_from_source("https://github.com/acme/Uptime_Kuma.git").as_deref(),
            Some("uptime-kuma")
        );
        assert_eq!(
            slug_from_source("git@github.com:acme/net-scan.git").as_deref(),
            Some("net-scan")
        );
        assert_eq!(slug_from_source("file:///tmp/repos/hello/").as_deref(), Some("hello"));
        assert_eq!(slug_from_source("https://example.com/___.git"), None);
    }
}
