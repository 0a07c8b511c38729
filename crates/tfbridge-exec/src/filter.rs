//! Redaction of tool output

use std::sync::Arc;

pub const REDACTED: &str = "REDACTED";

/// Rewrites tool output before it is logged or stored in an error
pub trait OutputFilter: Send + Sync {
    fn filter(&self, output: &str) -> String;
}

/// Passes output through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpFilter;

impl OutputFilter for NoOpFilter {
    fn filter(&self, output: &str) -> String {
        output.to_string()
    }
}

/// Replaces every occurrence of a known sensitive value with [`REDACTED`]
#[derive(Debug, Clone, Default)]
pub struct RedactFilter {
    secrets: Vec<String>,
}

impl RedactFilter {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        // longest first so a secret containing another is masked whole
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl OutputFilter for RedactFilter {
    fn filter(&self, output: &str) -> String {
        self.secrets
            .iter()
            .fold(output.to_string(), |acc, secret| acc.replace(secret, REDACTED))
    }
}

/// Builds the filter for a set of sensitive values
pub fn for_secrets(secrets: Vec<String>) -> Arc<dyn OutputFilter> {
    let filter = RedactFilter::new(secrets);
    if filter.is_empty() {
        Arc::new(NoOpFilter)
    } else {
        Arc::new(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_every_occurrence() {
        let filter = RedactFilter::new(["s3cr3t"]);
        assert_eq!(
            filter.filter("password=s3cr3t token=s3cr3t"),
            "password=REDACTED token=REDACTED"
        );
    }

    #[test]
    fn test_longer_secret_wins() {
        let filter = RedactFilter::new(["abc", "abcdef"]);
        assert_eq!(filter.filter("key: abcdef"), "key: REDACTED");
    }

    #[test]
    fn test_duplicate_secrets_are_collapsed() {
        let filter = RedactFilter::new(["aaa", "bbb", "aaa", "ccc", "bbb"]);
        assert_eq!(filter.secrets, ["aaa", "bbb", "ccc"]);
        assert_eq!(filter.filter("aaa-bbb-ccc"), "REDACTED-REDACTED-REDACTED");
    }

    #[test]
    fn test_empty_secrets_are_ignored() {
        let filter = RedactFilter::new(["", ""]);
        assert!(filter.is_empty());
        assert_eq!(filter.filter("unchanged"), "unchanged");
        assert_eq!(for_secrets(vec![]).filter("x"), "x");
    }
}
