//! Region-scoped on-demand and spot price cache
//!
//! Prices rank instance types during launch, so they must always be
//! *relatively* sane even when the price feed is unreachable. The provider
//! boots from an embedded snapshot and refreshes from the feed at most once
//! per five minutes; a failed refresh keeps the last good data.
//!
//! Spot prices are seeded to the on-demand price until the first successful
//! spot refresh; until then [`PricingProvider::spot_price`] ignores the zone
//! and returns that default.

mod feed;

pub use feed::{InstanceTypePrice, PriceFeed, RegionalInstancePrice};
#[cfg(test)]
pub use feed::MockPriceFeed;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::utils::ChangeMonitor;
use crate::{Error, Result};

static INITIAL_ON_DEMAND_PRICES: &str = include_str!("initial-on-demand-prices.json");

const DEFAULT_REGION: &str = "cn-qingdao";

/// Minimum spacing between feed syncs, shared by both update paths
pub const PRICE_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

// Per-zone spot prices plus the on-demand default used until the first
// successful spot refresh.
#[derive(Clone, Debug, Default)]
struct Zonal {
    default_price: f64,
    prices: HashMap<String, f64>,
}

struct SpotState {
    prices: HashMap<String, Zonal>,
    // cleared on reset; set after the first successful spot update
    updated: bool,
}

/// Pricing data for one region, refreshed from the external price feed
pub struct PricingProvider {
    region: String,
    feed: Arc<dyn PriceFeed>,
    cm: ChangeMonitor,

    last_updated: Mutex<Option<Instant>>,
    on_demand: RwLock<HashMap<String, f64>>,
    spot: RwLock<SpotState>,
}

impl PricingProvider {
    /// Create a provider seeded from the embedded snapshot
    ///
    /// If `region` is absent from the snapshot the always-present
    /// `cn-qingdao` data is used instead: stale relative ordering beats no
    /// ordering.
    pub fn new(region: impl Into<String>, feed: Arc<dyn PriceFeed>) -> Self {
        let provider = Self {
            region: region.into(),
            feed,
            cm: ChangeMonitor::new(),
            last_updated: Mutex::new(None),
            on_demand: RwLock::new(HashMap::new()),
            spot: RwLock::new(SpotState {
                prices: HashMap::new(),
                updated: false,
            }),
        };
        provider.reset();
        provider
    }

    /// Reload the embedded snapshot, discarding any feed data
    pub fn reset(&self) {
        let snapshot: HashMap<String, HashMap<String, f64>> =
            serde_json::from_str(INITIAL_ON_DEMAND_PRICES)
                .expect("embedded price snapshot is valid json");
        let static_pricing = snapshot
            .get(&self.region)
            .or_else(|| snapshot.get(DEFAULT_REGION))
            .cloned()
            .unwrap_or_default();

        let mut spot = self.spot.write();
        spot.prices = static_pricing
            .iter()
            .map(|(instance_type, price)| {
                (
                    instance_type.clone(),
                    Zonal {
                        default_price: *price,
                        prices: HashMap::new(),
                    },
                )
            })
            .collect();
        spot.updated = false;
        *self.on_demand.write() = static_pricing;
    }

    /// All instance types for which either a spot or on-demand price is known
    pub fn instance_types(&self) -> Vec<String> {
        let on_demand = self.on_demand.read();
        let spot = self.spot.read();
        let mut types: Vec<String> = on_demand
            .keys()
            .chain(spot.prices.keys())
            .cloned()
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// The last known on-demand price for an instance type
    pub fn on_demand_price(&self, instance_type: &str) -> Option<f64> {
        self.on_demand.read().get(instance_type).copied()
    }

    /// The last known spot price for an instance type in a zone
    ///
    /// Before the first successful spot refresh this returns the on-demand
    /// default regardless of zone.
    pub fn spot_price(&self, instance_type: &str, zone: &str) -> Option<f64> {
        let spot = self.spot.read();
        let zonal = spot.prices.get(instance_type)?;
        if !spot.updated {
            return Some(zonal.default_price);
        }
        zonal.prices.get(zone).copied()
    }

    /// Refresh on-demand prices from the feed
    pub async fn update_on_demand_pricing(&self) -> Result<()> {
        self.sync_pricing_data().await?;

        let prices = self.feed.instance_details(&self.region).ok_or_else(|| {
            Error::price_feed(format!("no price info available for region {}", self.region))
        })?;
        if prices.instance_type_prices.is_empty() {
            return Err(Error::price_feed(format!(
                "no price info available for region {}",
                self.region
            )));
        }

        let mut on_demand = self.on_demand.write();
        *on_demand = prices
            .instance_type_prices
            .iter()
            .map(|(instance_type, price)| (instance_type.clone(), price.on_demand_price_per_hour))
            .collect();
        Ok(())
    }

    /// Refresh per-zone spot prices from the feed
    pub async fn update_spot_pricing(&self) -> Result<()> {
        self.sync_pricing_data().await?;

        let prices = self.feed.instance_details(&self.region).ok_or_else(|| {
            Error::price_feed(format!("no price info available for region {}", self.region))
        })?;
        if prices.instance_type_prices.is_empty() {
            return Err(Error::price_feed(format!(
                "no price info available for region {}",
                self.region
            )));
        }

        let mut total_offerings = 0usize;
        let mut spot = self.spot.write();
        for (instance_type, price_info) in &prices.instance_type_prices {
            let zonal = spot.prices.entry(instance_type.clone()).or_default();
            for (zone, price) in &price_info.spot_price_per_hour {
                zonal.prices.insert(zone.clone(), *price);
            }
            total_offerings += price_info.spot_price_per_hour.len();
        }
        spot.updated = true;

        let zone_counts: Vec<(String, usize)> = spot
            .prices
            .iter()
            .map(|(t, z)| (t.clone(), z.prices.len()))
            .collect();
        if self.cm.has_changed("spot-prices", &zone_counts) {
            debug!(
                instance_type_count = spot.prices.len(),
                offering_count = total_offerings,
                "updated spot pricing with instance types and offerings"
            );
        }
        Ok(())
    }

    /// Verify the locks are acquirable; walked by the facade liveness probe
    pub fn liveness_probe(&self) -> Result<()> {
        drop(self.on_demand.write());
        drop(self.spot.write());
        drop(self.last_updated.lock());
        Ok(())
    }

    // Throttles feed syncs to once per refresh interval across both update
    // paths. A sync failure leaves the last refresh timestamp untouched so
    // the next caller retries.
    async fn sync_pricing_data(&self) -> Result<()> {
        {
            let last_updated = self.last_updated.lock();
            if let Some(at) = *last_updated {
                if at.elapsed() < PRICE_REFRESH_INTERVAL {
                    return Ok(());
                }
            }
        }
        if let Err(err) = self.feed.sync().await {
            error!(error = %err, "failed to sync pricing data");
            return Err(err);
        }
        *self.last_updated.lock() = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_with(
        region: &str,
        types: Vec<(&str, f64, Vec<(&str, f64)>)>,
        syncs: usize,
    ) -> MockPriceFeed {
        let mut feed = MockPriceFeed::new();
        feed.expect_sync().times(syncs).returning(|| Ok(()));
        let prices = RegionalInstancePrice {
            instance_type_prices: types
                .into_iter()
                .map(|(name, od, spot)| {
                    (
                        name.to_string(),
                        InstanceTypePrice {
                            on_demand_price_per_hour: od,
                            spot_price_per_hour: spot
                                .into_iter()
                                .map(|(z, p)| (z.to_string(), p))
                                .collect(),
                            zones: Vec::new(),
                        },
                    )
                })
                .collect(),
        };
        let want = region.to_string();
        feed.expect_instance_details()
            .withf(move |region| region == want)
            .returning(move |_| Some(prices.clone()));
        feed
    }

    #[test]
    fn snapshot_seeds_known_region() {
        let provider = PricingProvider::new("cn-beijing", Arc::new(MockPriceFeed::new()));
        assert_eq!(provider.on_demand_price("ecs.g7.large"), Some(0.171));
        assert!(provider.on_demand_price("ecs.unknown.large").is_none());
    }

    #[test]
    fn unknown_region_falls_back_to_default_snapshot() {
        let provider = PricingProvider::new("eu-test-1", Arc::new(MockPriceFeed::new()));
        // cn-qingdao prices stand in for the missing region
        assert_eq!(provider.on_demand_price("ecs.g7.large"), Some(0.163));
    }

    #[test]
    fn spot_defaults_to_on_demand_until_first_update() {
        let provider = PricingProvider::new("eu-test-1", Arc::new(MockPriceFeed::new()));
        // any zone returns the default before a spot refresh
        assert_eq!(provider.spot_price("ecs.g7.large", "eu-test-1a"), Some(0.163));
        assert_eq!(provider.spot_price("ecs.g7.large", "nonexistent"), Some(0.163));
        assert!(provider.spot_price("ecs.unknown.large", "eu-test-1a").is_none());
    }

    #[tokio::test]
    async fn spot_update_switches_to_zonal_prices() {
        let feed = feed_with(
            "eu-test-1",
            vec![("ecs.g7.large", 0.2, vec![("eu-test-1a", 0.05)])],
            1,
        );
        let provider = PricingProvider::new("eu-test-1", Arc::new(feed));
        provider.update_spot_pricing().await.unwrap();

        assert_eq!(provider.spot_price("ecs.g7.large", "eu-test-1a"), Some(0.05));
        // zones without a price are now a miss instead of the default
        assert_eq!(provider.spot_price("ecs.g7.large", "eu-test-1b"), None);
    }

    #[tokio::test]
    async fn on_demand_update_replaces_snapshot() {
        let feed = feed_with("cn-beijing", vec![("ecs.g7.large", 0.5, vec![])], 1);
        let provider = PricingProvider::new("cn-beijing", Arc::new(feed));
        provider.update_on_demand_pricing().await.unwrap();
        assert_eq!(provider.on_demand_price("ecs.g7.large"), Some(0.5));
        // the snapshot-only types are gone after a full refresh
        assert!(provider.on_demand_price("ecs.c6.large").is_none());
    }

    #[tokio::test]
    async fn failed_sync_keeps_previous_values() {
        let mut feed = MockPriceFeed::new();
        feed.expect_sync()
            .returning(|| Err(crate::Error::price_feed("feed unreachable")));
        let provider = PricingProvider::new("cn-beijing", Arc::new(feed));

        assert!(provider.update_on_demand_pricing().await.is_err());
        assert_eq!(provider.on_demand_price("ecs.g7.large"), Some(0.171));
    }

    #[tokio::test]
    async fn refresh_is_throttled_to_one_sync() {
        // both update paths within the window share a single feed sync
        let feed = feed_with("cn-beijing", vec![("ecs.g7.large", 0.5, vec![])], 1);
        let provider = PricingProvider::new("cn-beijing", Arc::new(feed));
        provider.update_on_demand_pricing().await.unwrap();
        provider.update_spot_pricing().await.unwrap();
    }

    #[test]
    fn instance_types_unions_both_maps() {
        let provider = PricingProvider::new("cn-beijing", Arc::new(MockPriceFeed::new()));
        let types = provider.instance_types();
        assert!(types.contains(&"ecs.g7.large".to_string()));
        assert!(types.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn liveness_probe_passes_when_unlocked() {
        let provider = PricingProvider::new("cn-beijing", Arc::new(MockPriceFeed::new()));
        assert!(provider.liveness_probe().is_ok());
    }
}
