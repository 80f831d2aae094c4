//! Weighted Reciprocal Rank Fusion (RRF) across retrieval channels
//!
//! An id at 0-based position `i` of a channel list contributes
//! `weight / (k + i + 1)`. Contributions are summed per id and the ids
//! sorted by total, descending. Equal totals keep first-seen order,
//! scanning channels as vector, graph, keyword, person.

use super::Channel;
use expertmatch_common::config::WeightsConfig;
use std::collections::{BTreeMap, HashMap};

/// Rank-discount constant
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Per-channel fusion weights; an unset channel weighs 1.0
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelWeights(BTreeMap<Channel, f64>);

impl ChannelWeights {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Base weights from configuration, before any query-dependent boost
    pub fn base(config: &WeightsConfig) -> Self {
        Self::new()
            .with(Channel::Vector, config.vector)
            .with(Channel::Graph, config.graph)
            .with(Channel::Keyword, config.keyword)
            .with(Channel::Person, config.person)
    }

    pub fn with(mut self, channel: Channel, weight: f64) -> Self {
        self.set(channel, weight);
        self
    }

    pub fn set(&mut self, channel: Channel, weight: f64) {
        self.0.insert(channel, weight);
    }

    pub fn get(&self, channel: Channel) -> f64 {
        self.0.get(&channel).copied().unwrap_or(1.0)
    }
}

impl Default for ChannelWeights {
    fn default() -> Self {
        Self::base(&WeightsConfig::default())
    }
}

/// RRF parameters
#[derive(Debug, Clone)]
pub struct RRFusion {
    /// Constant k (typically 60)
    pub k: f64,
}

impl Default for RRFusion {
    fn default() -> Self {
        Self { k: DEFAULT_RRF_K }
    }
}

impl RRFusion {
    pub fn new(k: f64) -> Self {
        Self { k }
    }

    /// Fused ids, best first
    pub fn fuse(&self, lists: &BTreeMap<Channel, Vec<String>>, weights: &ChannelWeights) -> Vec<String> {
        self.fuse_scored(lists, weights)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Fused ids with their RRF totals, best first
    pub fn fuse_scored(
        &self,
        lists: &BTreeMap<Channel, Vec<String>>,
        weights: &ChannelWeights,
    ) -> Vec<(String, f64)> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut totals: Vec<(String, f64)> = Vec::new();

        // BTreeMap iteration follows Channel ordering
        for (channel, ids) in lists {
            let weight = weights.get(*channel);
            let mut seen_in_list = std::collections::HashSet::new();

            for (rank, id) in ids.iter().enumerate() {
                if !seen_in_list.insert(id.as_str()) {
                    continue;
                }
                let contribution = weight / (self.k + rank as f64 + 1.0);
                match index.get(id.as_str()) {
                    Some(&slot) => totals[slot].1 += contribution,
                    None => {
                        index.insert(id.as_str(), totals.len());
                        totals.push((id.clone(), contribution));
                    }
                }
            }
        }

        // Stable sort keeps first-seen order among equal totals
        totals.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        totals
    }
}
