use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::orchestration::config::{Device, Throttle};

/// Cache key component: hash of the route path plus the audit settings that
/// change its result (device, throttling, audited categories).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheFingerprint(String);

impl CacheFingerprint {
    pub fn compute(path: &str, device: Device, throttle: Throttle, categories: &[String]) -> Self {
        let mut sorted: Vec<&str> = categories.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(device.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(throttle.as_str().as_bytes());
        for category in sorted {
            hasher.update([0]);
            hasher.update(category.as_bytes());
        }
        CacheFingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheFingerprint").field(&self.0).finish()
    }
}

impl fmt::Display for CacheFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn category_order_does_not_matter() {
        let a = CacheFingerprint::compute(
            "/",
            Device::Mobile,
            Throttle::Simulate,
            &categories(&["seo", "performance"]),
        );
        let b = CacheFingerprint::compute(
            "/",
            Device::Mobile,
            Throttle::Simulate,
            &categories(&["performance", "seo"]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn relevant_settings_change_the_fingerprint() {
        let cats = categories(&["performance"]);
        let base = CacheFingerprint::compute("/", Device::Mobile, Throttle::Simulate, &cats);
        assert_ne!(
            base,
            CacheFingerprint::compute("/about", Device::Mobile, Throttle::Simulate, &cats)
        );
        assert_ne!(
            base,
            CacheFingerprint::compute("/", Device::Desktop, Throttle::Simulate, &cats)
        );
        assert_ne!(
            base,
            CacheFingerprint::compute("/", Device::Mobile, Throttle::Off, &cats)
        );
    }
}
