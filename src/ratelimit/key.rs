//! Namespaced rate limit keys.

/// The store key for one independent budget: configured prefix + caller identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(prefix: &str, id: &str) -> Self {
        Self(format!("{}{}", prefix, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scratch key used to create a fixed window with its expiry already set.
    pub fn temp_key(&self) -> String {
        format!("tmp:{}", self.0)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
