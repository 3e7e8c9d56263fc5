//! Externally sourced trust profiles

use super::types::Address;
use serde::{Deserialize, Serialize};

/// Trust profile for an address, as served by the reputation API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationProfile {
    pub address: Address,
    pub score: f64,
    pub level: String,
    #[serde(default)]
    pub review_count: u32,
    #[serde(default)]
    pub vouch_count: u32,
}
