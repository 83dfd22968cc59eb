//! Public-endpoint allow-list.
//!
//! Pattern forms:
//! - `/api/v1/stations`: exact match
//! - `*/health`: any path ending in `/health`
//! - `/api/v1/public/*`: `*` matches any run of characters

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Suffix(String),
    Glob(Vec<String>),
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if !raw.contains('*') {
            return Pattern::Exact(raw.to_string());
        }
        if let Some(suffix) = raw.strip_prefix('*') {
            if suffix.starts_with('/') && !suffix.contains('*') {
                return Pattern::Suffix(suffix.to_string());
            }
        }
        Pattern::Glob(raw.split('*').map(str::to_string).collect())
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Pattern::Exact(p) => path == p,
            Pattern::Suffix(s) => path.ends_with(s.as_str()),
            Pattern::Glob(parts) => glob_match(parts, path),
        }
    }
}

/// `parts` is the pattern split on `*`; there is at least one `*`, so at
/// least two parts.
fn glob_match(parts: &[String], path: &str) -> bool {
    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return false;
    };
    if path.len() < first.len() + last.len() {
        return false;
    }
    if !path.starts_with(first.as_str()) || !path.ends_with(last.as_str()) {
        return false;
    }

    let mut rest = &path[first.len()..path.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle.as_str()) {
            Some(at) => rest = &rest[at + middle.len()..],
            None => return false,
        }
    }
    true
}

/// Classifies request paths as public (never carries a token) or protected.
#[derive(Debug, Clone, Default)]
pub struct PublicPaths {
    patterns: Vec<Pattern>,
}

impl PublicPaths {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| p.as_ref())
                .filter(|p| !p.trim().is_empty())
                .map(Pattern::parse)
                .collect(),
        }
    }

    /// Query strings and a trailing slash are ignored.
    pub fn is_public(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        let trimmed = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };
        self.patterns.iter().any(|p| p.matches(trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> PublicPaths {
        PublicPaths::new(&[
            "/api/v1/auth/login",
            "/api/v1/stations",
            "*/health",
            "/api/v1/public/*",
            "/api/*/docs/*.json",
        ])
    }

    #[test]
    fn test_exact_match() {
        let p = paths();
        assert!(p.is_public("/api/v1/auth/login"));
        assert!(p.is_public("/api/v1/stations"));
        assert!(p.is_public("/api/v1/stations/"));
        assert!(p.is_public("/api/v1/stations?page=2"));
        assert!(!p.is_public("/api/v1/stations/StationA/widget"));
    }

    #[test]
    fn test_suffix_match() {
        let p = paths();
        assert!(p.is_public("/health"));
        assert!(p.is_public("/api/v1/health"));
        assert!(!p.is_public("/api/v1/healthz"));
    }

    #[test]
    fn test_wildcard_match() {
        let p = paths();
        assert!(p.is_public("/api/v1/public/stations/map"));
        assert!(p.is_public("/api/v2/docs/openapi.json"));
        assert!(!p.is_public("/api/v2/docs/openapi.yaml"));
        assert!(!p.is_public("/api/v1/private/thing"));
    }

    #[test]
    fn test_empty_list_protects_everything() {
        let p = PublicPaths::new::<&str>(&[]);
        assert!(!p.is_public("/api/v1/stations"));
    }
}
