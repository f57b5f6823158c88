//! Image discovery and launch-template resolution
//!
//! The image provider resolves selector terms (id/alias/tag/name/owner) to
//! image records annotated with node requirements, keeping only the newest
//! image per requirement set. The resolver then maps those images onto
//! compatible instance types and produces the launch-template descriptors
//! the launch pipeline submits.

mod family;
mod resolver;

pub use family::{family_provider, BootstrapConfig, ImageFamilyProvider};
pub use resolver::{ResolvedTemplate, Resolver, ResolverOptions};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::TtlCache;
use crate::crd::{ECSNodeClass, ImageFamily};
use crate::ecs::{DescribeImagesRequest, EcsApi, Tag};
use crate::scheduling::{Requirement, Requirements};
use crate::utils::ChangeMonitor;
use crate::version::KubernetesVersionProvider;
use crate::{crd, Error, Result};

const PAGE_SIZE: i32 = 100;
// runaway guard for the page loop
const MAX_PAGES: i32 = 500;

/// How long resolved image lists stay fresh
pub const IMAGE_CACHE_TTL: Duration = Duration::from_secs(2 * 60);

/// A discovered image with the requirements a machine must satisfy to run it
#[derive(Clone, Debug)]
pub struct Image {
    /// Image name
    pub name: String,
    /// Image id
    pub image_id: String,
    /// RFC3339 creation timestamp
    pub creation_time: String,
    /// Node requirements (architecture, accelerator compatibility)
    pub requirements: Requirements,
}

/// One describe query plus the requirement knowledge it implies
#[derive(Clone, Debug, Default)]
pub struct DescribeImageQuery {
    /// The describe request, region and paging filled in later
    pub request: DescribeImagesRequest,
    /// Requirement sets known out of band (e.g. GPU compatibility); one
    /// image is emitted per set
    pub known_requirements: Vec<Requirements>,
    /// Restrict matches to names matching this pattern
    pub name_pattern: Option<Regex>,
}

impl DescribeImageQuery {
    /// The requirement sets for an image of the given architecture
    pub fn requirements_for_arch(&self, arch: &str) -> Vec<Requirements> {
        if self.known_requirements.is_empty() {
            return vec![Requirements::new([Requirement::new_in(
                crd::LABEL_ARCH,
                [arch],
            )])];
        }
        self.known_requirements
            .iter()
            .map(|reqs| {
                let mut with_arch = reqs.clone();
                with_arch.add(Requirement::new_in(crd::LABEL_ARCH, [arch]));
                with_arch
            })
            .collect()
    }
}

/// Sort images newest first; ties break on ascending image id
pub fn sort_images(images: &mut [Image]) {
    images.sort_by(|a, b| {
        let atime = parse_creation_time(&a.creation_time);
        let btime = parse_creation_time(&b.creation_time);
        btime
            .cmp(&atime)
            .then_with(|| a.image_id.cmp(&b.image_id))
    });
}

fn parse_creation_time(raw: &str) -> i64 {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.timestamp())
        .unwrap_or(i64::MIN)
}

fn kube_arch(image_architecture: &str) -> Option<&'static str> {
    match image_architecture {
        "x86_64" => Some("amd64"),
        "arm64" => Some("arm64"),
        // i386 images cannot run cluster nodes
        _ => None,
    }
}

/// Resolves image selector terms to concrete image records
pub struct ImageProvider {
    region: String,
    ecs: Arc<dyn EcsApi>,
    version: Arc<dyn KubernetesVersionProvider>,
    cm: ChangeMonitor,
    cache: Mutex<TtlCache<Vec<Image>>>,
}

impl ImageProvider {
    /// Create a provider for a region
    pub fn new(
        region: impl Into<String>,
        ecs: Arc<dyn EcsApi>,
        version: Arc<dyn KubernetesVersionProvider>,
    ) -> Self {
        Self {
            region: region.into(),
            ecs,
            version,
            cm: ChangeMonitor::new(),
            cache: Mutex::new(TtlCache::new(IMAGE_CACHE_TTL)),
        }
    }

    /// List the images selected by the NodeClass, newest first
    pub async fn list(&self, node_class: &ECSNodeClass) -> Result<Vec<Image>> {
        let queries = self.describe_image_queries(node_class).await?;
        let mut images = self.get_images(&queries).await?;
        sort_images(&mut images);

        let mut ids: Vec<&str> = images.iter().map(|i| i.image_id.as_str()).collect();
        ids.dedup();
        if self
            .cm
            .has_changed(&format!("images/{}", node_class.name()), &ids)
        {
            debug!(node_class = node_class.name(), ids = ?ids, "discovered images");
        }
        Ok(images)
    }

    // Aliases are mutually exclusive with other term fields, enforced at
    // admission; an alias term swallows the whole term list.
    async fn describe_image_queries(
        &self,
        node_class: &ECSNodeClass,
    ) -> Result<Vec<DescribeImageQuery>> {
        if let Some(term) = node_class
            .spec
            .image_selector_terms
            .iter()
            .find(|t| !t.alias.is_empty())
        {
            let kubernetes_version = self.version.get().await?;
            let (family, image_version) = ImageFamily::from_alias(&term.alias)?;
            return Ok(family_provider(family)
                .describe_image_queries(&kubernetes_version, &image_version));
        }

        let mut queries = Vec::new();
        for term in &node_class.spec.image_selector_terms {
            let mut request = DescribeImagesRequest {
                is_public: Some(true),
                ..Default::default()
            };
            if !term.owner.is_empty() {
                request.image_owner_alias = Some(term.owner.clone());
            }
            // shared images are not public
            if term.owner == "share" {
                request.is_public = Some(false);
            }
            if !term.id.is_empty() {
                request.image_id = Some(term.id.clone());
            }
            if !term.name.is_empty() {
                request.image_name = Some(term.name.clone());
            }
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
            queries.push(DescribeImageQuery {
                request,
                known_requirements: Vec::new(),
                name_pattern: None,
            });
        }
        Ok(queries)
    }

    async fn get_images(&self, queries: &[DescribeImageQuery]) -> Result<Vec<Image>> {
        let cache = self.cache.lock().await;

        let query_fingerprint: Vec<(String, Option<String>)> = queries
            .iter()
            .map(|q| {
                (
                    serde_json::to_string(&q.request).unwrap_or_default(),
                    q.name_pattern.as_ref().map(|p| p.as_str().to_string()),
                )
            })
            .collect();
        let cache_key = crate::hash::content_hash_string(&query_fingerprint);
        if let Some(images) = cache.get(&cache_key) {
            return Ok(images);
        }

        // keyed by requirement-set hash; the newest image wins per set
        let mut images: HashMap<u64, Image> = HashMap::new();
        for query in queries {
            for record in self.describe_images(&query.request).await? {
                if let Some(pattern) = &query.name_pattern {
                    if !pattern.is_match(&record.image_name) {
                        continue;
                    }
                }
                let Some(arch) = kube_arch(&record.architecture) else {
                    continue;
                };
                for requirements in query.requirements_for_arch(arch) {
                    let key = crate::hash::content_hash(&requirements.to_node_selector());
                    if let Some(existing) = images.get(&key) {
                        let candidate_time = parse_creation_time(&record.creation_time);
                        let existing_time = parse_creation_time(&existing.creation_time);
                        if candidate_time == existing_time && record.image_name < existing.name {
                            continue;
                        }
                        if candidate_time < existing_time {
                            continue;
                        }
                    }
                    images.insert(
                        key,
                        Image {
                            name: record.image_name.clone(),
                            image_id: record.image_id.clone(),
                            creation_time: record.creation_time.clone(),
                            requirements,
                        },
                    );
                }
            }
        }

        let resolved: Vec<Image> = images.into_values().collect();
        cache.insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    async fn describe_images(
        &self,
        request: &DescribeImagesRequest,
    ) -> Result<Vec<crate::ecs::ImageData>> {
        let mut collected = Vec::new();
        for page_number in 1..MAX_PAGES {
            let response = self
                .ecs
                .describe_images(DescribeImagesRequest {
                    region_id: self.region.clone(),
                    page_number,
                    page_size: PAGE_SIZE,
                    ..request.clone()
                })
                .await
                .map_err(|e| Error::cloud_api(format!("describing images, {e}")))?;
            let page_len = response.images.len();
            collected.extend(response.images);
            if response.total_count < i64::from(page_number) * i64::from(PAGE_SIZE)
                || page_len < PAGE_SIZE as usize
            {
                break;
            }
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ECSNodeClassSpec, ImageSelectorTerm};
    use crate::ecs::{DescribeImagesResponse, ImageData, MockEcsApi};
    use crate::version::MockKubernetesVersionProvider;

    fn image_data(id: &str, name: &str, arch: &str, created: &str) -> ImageData {
        ImageData {
            image_id: id.to_string(),
            image_name: name.to_string(),
            architecture: arch.to_string(),
            creation_time: created.to_string(),
        }
    }

    fn provider_with_images(images: Vec<ImageData>) -> ImageProvider {
        let mut ecs = MockEcsApi::new();
        ecs.expect_describe_images().returning(move |_| {
            Ok(DescribeImagesResponse {
                total_count: images.len() as i64,
                images: images.clone(),
            })
        });
        let mut version = MockKubernetesVersionProvider::new();
        version.expect_get().returning(|| Ok("1.31".to_string()));
        ImageProvider::new("cn-beijing", Arc::new(ecs), Arc::new(version))
    }

    fn node_class(terms: Vec<ImageSelectorTerm>) -> ECSNodeClass {
        ECSNodeClass::new(
            "default",
            ECSNodeClassSpec {
                image_selector_terms: terms,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn newest_image_wins_per_requirement_set() {
        let provider = provider_with_images(vec![
            image_data("m-old", "img-a", "x86_64", "2024-01-01T00:00:00Z"),
            image_data("m-new", "img-b", "x86_64", "2024-06-01T00:00:00Z"),
        ]);
        let nc = node_class(vec![ImageSelectorTerm {
            owner: "self".to_string(),
            ..Default::default()
        }]);
        let images = provider.list(&nc).await.unwrap();
        // both share the amd64 requirement set, so only the newest remains
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].image_id, "m-new");
    }

    #[tokio::test]
    async fn architectures_are_separate_requirement_sets() {
        let provider = provider_with_images(vec![
            image_data("m-amd", "img-a", "x86_64", "2024-01-01T00:00:00Z"),
            image_data("m-arm", "img-b", "arm64", "2024-01-01T00:00:00Z"),
            image_data("m-386", "img-c", "i386", "2024-01-01T00:00:00Z"),
        ]);
        let nc = node_class(vec![ImageSelectorTerm {
            owner: "self".to_string(),
            ..Default::default()
        }]);
        let images = provider.list(&nc).await.unwrap();
        // i386 is unsupported, the other two keep distinct sets
        assert_eq!(images.len(), 2);
    }

    #[tokio::test]
    async fn alias_terms_use_family_queries() {
        let images = vec![
            image_data(
                "m-aliyun3",
                "aliyun_3_x64_20G_alibase_20240819.vhd",
                "x86_64",
                "2024-08-19T00:00:00Z",
            ),
            image_data("m-other", "ubuntu_22_04_64.vhd", "x86_64", "2024-08-20T00:00:00Z"),
        ];
        let provider = provider_with_images(images);
        let nc = node_class(vec![ImageSelectorTerm {
            alias: "AlibabaCloudLinux3@latest".to_string(),
            ..Default::default()
        }]);
        let resolved = provider.list(&nc).await.unwrap();
        // the family name pattern drops the ubuntu image
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].image_id, "m-aliyun3");
    }

    #[test]
    fn sort_is_newest_first_then_id() {
        let mut images = vec![
            Image {
                name: "b".to_string(),
                image_id: "m-2".to_string(),
                creation_time: "2024-01-01T00:00:00Z".to_string(),
                requirements: Requirements::default(),
            },
            Image {
                name: "a".to_string(),
                image_id: "m-1".to_string(),
                creation_time: "2024-01-01T00:00:00Z".to_string(),
                requirements: Requirements::default(),
            },
            Image {
                name: "c".to_string(),
                image_id: "m-3".to_string(),
                creation_time: "2024-06-01T00:00:00Z".to_string(),
                requirements: Requirements::default(),
            },
        ];
        sort_images(&mut images);
        let ids: Vec<&str> = images.iter().map(|i| i.image_id.as_str()).collect();
        assert_eq!(ids, vec!["m-3", "m-1", "m-2"]);
    }
}
