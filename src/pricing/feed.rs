//! Contract of the out-of-band price feed
//!
//! The cloud SDK's pricing endpoint is rate limited far below what the
//! refresh cadence needs, so prices come from a dedicated query service.
//! Only the contract lives here; transport belongs to the binary wiring the
//! provider up.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// All known prices for one region
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionalInstancePrice {
    /// Prices keyed by instance type
    pub instance_type_prices: HashMap<String, InstanceTypePrice>,
}

/// Prices for one instance type
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypePrice {
    /// Hourly pay-as-you-go price
    pub on_demand_price_per_hour: f64,
    /// Hourly spot price per zone
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub spot_price_per_hour: HashMap<String, f64>,
    /// Zones the type is sold in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
}

/// A client of the price query service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Pull fresh data from the service into the client
    async fn sync(&self) -> Result<()>;

    /// The last synced prices for a region, if any
    fn instance_details(&self, region: &str) -> Option<RegionalInstancePrice>;
}
