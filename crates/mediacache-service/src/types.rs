use std::fmt;

use sha2::{Digest, Sha256};

/// Identity of a cached resource.
///
/// Two keys are equal when both the locator and the discriminator match, so the same URI can
/// be cached several times under different variant tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    locator: String,
    discriminator: Option<String>,
}

impl ResourceKey {
    pub fn new(locator: impl Into<String>, discriminator: Option<&str>) -> Self {
        Self {
            locator: locator.into(),
            discriminator: discriminator.map(ToOwned::to_owned),
        }
    }

    /// The URI or plain path this resource is fetched from.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.discriminator.as_deref()
    }

    /// A stable identifier derived from the key, safe to use in file names.
    ///
    /// This is the lowercase hex SHA-256 over the locator and the discriminator. A key without
    /// discriminator hashes differently from one with an empty discriminator.
    pub fn cache_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.locator.as_bytes());
        if let Some(discriminator) = &self.discriminator {
            hasher.update([0u8]);
            hasher.update(discriminator.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.discriminator {
            Some(discriminator) => write!(f, "{} [{discriminator}]", self.locator),
            None => f.write_str(&self.locator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality() {
        let a = ResourceKey::new("https://example.com/a.mp4", None);
        let b = ResourceKey::new("https://example.com/a.mp4".to_owned(), None);
        let tagged = ResourceKey::new("https://example.com/a.mp4", Some("720p"));

        assert_eq!(a, b);
        assert_ne!(a, tagged);
        assert_eq!(tagged.discriminator(), Some("720p"));
    }

    #[test]
    fn test_cache_id() {
        let plain = ResourceKey::new("https://example.com/a.mp4", None);
        let empty = ResourceKey::new("https://example.com/a.mp4", Some(""));

        assert_eq!(plain.cache_id().len(), 64);
        assert_eq!(plain.cache_id(), plain.clone().cache_id());
        assert_ne!(plain.cache_id(), empty.cache_id());
        assert!(plain.cache_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_display() {
        let key = ResourceKey::new("/media/a.mp4", Some("thumb"));
        assert_eq!(key.to_string(), "/media/a.mp4 [thumb]");
    }
}
