use serde::Deserialize;

/// Router tuning knobs.
///
/// Deserializes from JSON with every field optional:
///
/// ```
/// use waypost::router::RouterConfig;
///
/// let config = RouterConfig::from_json(r#"{ "cache_capacity": 128 }"#).unwrap();
/// assert_eq!(config.cache_capacity, Some(128));
/// assert!(config.cache_enabled);
/// assert_eq!(config.subdomain_offset, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Memoize route resolution per (host, path, method).
    pub cache_enabled: bool,
    /// Maximum number of cached keys; `None` for unbounded.
    pub cache_capacity: Option<usize>,
    /// Trailing host labels dropped when computing `subdomains`.
    pub subdomain_offset: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_capacity: Some(10_000),
            subdomain_offset: 2,
        }
    }
}

impl RouterConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    #[must_use]
    pub fn cache_capacity(mut self, capacity: Option<usize>) -> Self {
        self.cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn subdomain_offset(mut self, offset: usize) -> Self {
        self.subdomain_offset = offset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        assert_eq!(RouterConfig::from_json("{}").unwrap(), RouterConfig::default());
    }

    #[test]
    fn null_capacity_means_unbounded() {
        let config = RouterConfig::from_json(r#"{ "cache_capacity": null }"#).unwrap();
        assert_eq!(config.cache_capacity, None);
    }

    #[test]
    fn builders_override_fields() {
        let config = RouterConfig::default()
            .cache_enabled(false)
            .subdomain_offset(3);
        assert!(!config.cache_enabled);
        assert_eq!(config.subdomain_offset, 3);
    }
}
