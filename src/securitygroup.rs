//! Security-group discovery
//!
//! Resolves the NodeClass security-group selector terms to concrete group
//! records with token paging, caching by a hash of the derived filter set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::TtlCache;
use crate::crd::{ECSNodeClass, SecurityGroupSelectorTerm};
use crate::ecs::{
    DescribeSecurityGroupsRequest, EcsApi, SecurityGroupData, Tag,
};
use crate::utils::ChangeMonitor;
use crate::Result;

const PAGE_SIZE: i32 = 100;

/// How long resolved selector results stay fresh
pub const SELECTOR_CACHE_TTL: Duration = Duration::from_secs(60);

/// Resolves security-group selectors to concrete group IDs
pub struct SecurityGroupProvider {
    region: String,
    ecs: Arc<dyn EcsApi>,
    cm: ChangeMonitor,
    cache: Mutex<TtlCache<Vec<SecurityGroupData>>>,
}

impl SecurityGroupProvider {
    /// Create a provider for a region
    pub fn new(region: impl Into<String>, ecs: Arc<dyn EcsApi>) -> Self {
        Self {
            region: region.into(),
            ecs,
            cm: ChangeMonitor::new(),
            cache: Mutex::new(TtlCache::new(SELECTOR_CACHE_TTL)),
        }
    }

    /// Resolve the NodeClass selector terms to concrete security groups
    pub async fn list(&self, node_class: &ECSNodeClass) -> Result<Vec<SecurityGroupData>> {
        let cache = self.cache.lock().await;

        let filters = filter_sets(&self.region, &node_class.spec.security_group_selector_terms);
        let cache_key = crate::hash::content_hash_string(&filters);
        if let Some(groups) = cache.get(&cache_key) {
            return Ok(groups);
        }

        let mut groups: HashMap<String, SecurityGroupData> = HashMap::new();
        for filter in &filters {
            for group in self.describe_security_groups(filter.clone()).await? {
                groups.insert(group.security_group_id.clone(), group);
            }
        }
        let resolved: Vec<SecurityGroupData> = groups.into_values().collect();
        cache.insert(cache_key, resolved.clone());

        let mut ids: Vec<&str> = resolved
            .iter()
            .map(|g| g.security_group_id.as_str())
            .collect();
        ids.sort();
        if self
            .cm
            .has_changed(&format!("security-groups/{}", node_class.name()), &ids)
        {
            debug!(
                node_class = node_class.name(),
                security_groups = ?ids,
                "discovered security groups"
            );
        }
        Ok(resolved)
    }

    async fn describe_security_groups(
        &self,
        mut request: DescribeSecurityGroupsRequest,
    ) -> Result<Vec<SecurityGroupData>> {
        let mut collected = Vec::new();
        loop {
            let response = self.ecs.describe_security_groups(request.clone()).await?;
            if response.security_groups.is_empty() {
                break;
            }
            collected.extend(response.security_groups);
            match response.next_token {
                Some(token) if !token.is_empty() => request.next_token = Some(token),
                _ => break,
            }
        }
        Ok(collected)
    }
}

// One describe request per term: id and name short-circuit tags.
fn filter_sets(
    region: &str,
    terms: &[SecurityGroupSelectorTerm],
) -> Vec<DescribeSecurityGroupsRequest> {
    terms
        .iter()
        .map(|term| {
            let mut request = DescribeSecurityGroupsRequest {
                region_id: region.to_string(),
                max_results: PAGE_SIZE,
                ..Default::default()
            };
            if !term.id.is_empty() {
                request.security_group_id = Some(term.id.clone());
            } else if !term.name.is_empty() {
                request.security_group_name = Some(term.name.clone());
            } else {
                request.tags = term
                    .tags
                    .iter()
                    .map(|(k, v)| {
                        if v == "*" {
                            Tag::key_only(k)
                        } else {
                            Tag::new(k, v)
                        }
                    })
                    .collect();
            }
            request
        })
        .collect()
}
