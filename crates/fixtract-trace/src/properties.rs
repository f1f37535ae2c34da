//! Tractogram header properties.

use std::collections::BTreeMap;

/// Free-form `key: value` properties carried in a track-file header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    /// Empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Declared streamline count, if present and parseable.
    #[must_use]
    pub fn count(&self) -> Option<u64> {
        self.get("count").and_then(|v| v.trim().parse().ok())
    }

    /// Declared generation step size in millimetres, if present.
    #[must_use]
    pub fn step_size(&self) -> Option<f64> {
        self.get("step_size")
            .and_then(|v| v.trim().parse().ok())
            .filter(|s: &f64| s.is_finite() && *s > 0.0)
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let mut p = Properties::new();
        p.set("count", "120");
        p.set("step_size", "0.5");
        assert_eq!(p.count(), Some(120));
        assert_eq!(p.step_size(), Some(0.5));
        p.set("step_size", "garbage");
        assert_eq!(p.step_size(), None);
    }
}
