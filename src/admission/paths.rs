//! Route classes for the admission filter.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// No authentication and no rate limiting.
    Public,
    /// No authentication, rate limited per client address.
    Anonymous,
    /// Bearer token required, rate limited per user.
    Protected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPolicy {
    public: Vec<String>,
    anonymous: Vec<String>,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::new(["/health"], ["/auth/login", "/auth/refresh"])
    }
}

impl PathPolicy {
    pub fn new<P, A>(public: P, anonymous: A) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            public: public.into_iter().map(normalize).collect(),
            anonymous: anonymous.into_iter().map(normalize).collect(),
        }
    }

    #[must_use]
    pub fn classify(&self, path: &str) -> PathClass {
        if self.public.iter().any(|prefix| segment_prefix(prefix, path)) {
            PathClass::Public
        } else if self.anonymous.iter().any(|prefix| segment_prefix(prefix, path)) {
            PathClass::Anonymous
        } else {
            PathClass::Protected
        }
    }
}

fn normalize(prefix: impl Into<String>) -> String {
    let prefix = prefix.into();
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `/auth/login` matches `/auth/login` and `/auth/login/x`, never `/auth/loginx`.
fn segment_prefix(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
