//! Small shared helpers: provider-ID parsing, log utilities

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Error, Result};

// ACK node spec providerID format, eg: cn-zhangjiakou.i-8vb1f7qx8iacfd7kqy2u
static INSTANCE_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<AZ>.+)\.(?P<InstanceID>.+)$").unwrap());

/// Parse the provider ID stored on the node to get the instance ID
pub fn parse_instance_id(provider_id: &str) -> Result<String> {
    INSTANCE_ID_REGEX
        .captures(provider_id)
        .and_then(|c| c.name("InstanceID"))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| Error::validation(format!("parsing instance id {provider_id}")))
}

/// Format a provider ID from a region and instance ID
pub fn format_provider_id(region: &str, instance_id: &str) -> String {
    format!("{region}.{instance_id}")
}

/// Render at most `max` elements of a slice for logging, with an ellipsis
/// marker carrying the omitted count
pub fn pretty_slice<T: std::fmt::Display>(items: &[T], max: usize) -> String {
    let shown = items.iter().take(max).map(|i| i.to_string()).collect::<Vec<_>>();
    if items.len() > max {
        format!("[{} and {} other(s)]", shown.join(", "), items.len() - max)
    } else {
        format!("[{}]", shown.join(", "))
    }
}

/// Tracks whether a keyed value changed since the last observation
///
/// Used to gate discovery logs so steady-state reconcile loops stay quiet:
/// callers log only when `has_changed` reports true.
#[derive(Default)]
pub struct ChangeMonitor {
    seen: DashMap<String, u64>,
}

impl ChangeMonitor {
    /// Create a new change monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value for `key` and report whether it differs from the
    /// previously recorded one. The first observation always reports true.
    pub fn has_changed<T: serde::Serialize>(&self, key: &str, value: &T) -> bool {
        let digest = crate::hash::content_hash(value);
        match self.seen.insert(key.to_string(), digest) {
            Some(prev) => prev != digest,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_round_trip() {
        let provider_id = format_provider_id("cn-zhangjiakou", "i-8vb1f7qx8iacfd7kqy2u");
        assert_eq!(provider_id, "cn-zhangjiakou.i-8vb1f7qx8iacfd7kqy2u");
        assert_eq!(
            parse_instance_id(&provider_id).unwrap(),
            "i-8vb1f7qx8iacfd7kqy2u"
        );
    }

    #[test]
    fn provider_id_requires_region_prefix() {
        assert!(parse_instance_id("i-nodots").is_err());
        assert!(parse_instance_id("").is_err());
    }

    #[test]
    fn pretty_slice_truncates() {
        let items = vec!["a", "b", "c", "d"];
        assert_eq!(pretty_slice(&items, 2), "[a, b and 2 other(s)]");
        assert_eq!(pretty_slice(&items, 10), "[a, b, c, d]");
    }

    #[test]
    fn change_monitor_reports_first_and_changed() {
        let cm = ChangeMonitor::new();
        assert!(cm.has_changed("zones", &vec!["cn-beijing-a"]));
        assert!(!cm.has_changed("zones", &vec!["cn-beijing-a"]));
        assert!(cm.has_changed("zones", &vec!["cn-beijing-a", "cn-beijing-b"]));
    }
}
