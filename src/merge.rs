//! # Merge Engine
//! Combines the fragments of one cycle into a single guide.
//!
//! Policy:
//! - failed fragments are ignored; if none succeeded the merge fails with
//!   [`MergeError::NoUsableData`] so the previous guide can be kept;
//! - fragments are ranked by the configured priority list, sources missing from
//!   the list share the lowest rank, and equal ranks are ordered by source id;
//! - a channel's definition comes from the highest-ranked fragment defining it;
//! - programmes are inserted fragment by fragment in rank order and kept only if
//!   they do not overlap an already inserted programme on that channel. Losers
//!   are dropped whole, never truncated.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;

use crate::guide::{Channel, GuideFragment, MergeStats, MergedGuide, Programme};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("no usable guide data: all {attempted} sources failed")]
    NoUsableData { attempted: usize },
}

/// Ordered source precedence. Earlier ids win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePriority {
    order: Vec<String>,
}

impl SourcePriority {
    pub fn new<I, S>(order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            order: order.into_iter().map(Into::into).collect(),
        }
    }

    /// Position in the list; unlisted sources share the rank after the last entry.
    pub fn rank(&self, source_id: &str) -> usize {
        self.order
            .iter()
            .position(|s| s == source_id)
            .unwrap_or(self.order.len())
    }

    fn sort_key<'a>(&self, source_id: &'a str) -> (usize, &'a str) {
        (self.rank(source_id), source_id)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.order
    }
}

pub fn merge(
    fragments: &[GuideFragment],
    priority: &SourcePriority,
) -> Result<MergedGuide, MergeError> {
    let mut usable: Vec<&GuideFragment> = fragments.iter().filter(|f| f.success).collect();
    if usable.is_empty() {
        return Err(MergeError::NoUsableData {
            attempted: fragments.len(),
        });
    }
    usable.sort_by(|a, b| {
        priority
            .sort_key(&a.source_id)
            .cmp(&priority.sort_key(&b.source_id))
    });

    let mut stats = MergeStats {
        fragments_used: usable.len(),
        fragments_failed: fragments.len() - usable.len(),
        ..MergeStats::default()
    };

    // 1) channel definitions, first (highest-ranked) definition wins
    let mut channels: Vec<Channel> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut provenance = BTreeMap::new();
    for frag in &usable {
        for ch in &frag.channels {
            if index.contains_key(ch.id.as_str()) {
                continue;
            }
            index.insert(ch.id.as_str(), channels.len());
            provenance.insert(ch.id.clone(), frag.source_id.clone());
            channels.push(Channel {
                id: ch.id.clone(),
                display_names: ch.display_names.clone(),
                icon: ch.icon.clone(),
                programmes: Vec::new(),
            });
        }
    }

    // 2) programme timelines, first writer by rank wins each slot
    for frag in &usable {
        for ch in &frag.channels {
            let slot = index[ch.id.as_str()];
            let timeline = &mut channels[slot].programmes;
            for p in &ch.programmes {
                if !p.is_valid() {
                    stats.dropped_invalid += 1;
                    continue;
                }
                if !insert_if_free(timeline, &ch.id, p) {
                    stats.dropped_overlaps += 1;
                }
            }
        }
    }

    tracing::debug!(
        target: "merge",
        channels = channels.len(),
        dropped_overlaps = stats.dropped_overlaps,
        dropped_invalid = stats.dropped_invalid,
        "merged fragments"
    );

    Ok(MergedGuide {
        channels,
        provenance,
        sources: usable.iter().map(|f| f.source_id.clone()).collect(),
        generated_at: Utc::now(),
        stats,
    })
}

/// Insert `p` into a start-sorted, non-overlapping timeline unless it overlaps a neighbour.
fn insert_if_free(timeline: &mut Vec<Programme>, channel_id: &str, p: &Programme) -> bool {
    let pos = timeline.partition_point(|q| q.start < p.start);
    if pos > 0 && timeline[pos - 1].overlaps(p) {
        return false;
    }
    if pos < timeline.len() && timeline[pos].overlaps(p) {
        return false;
    }
    let mut owned = p.clone();
    owned.channel = channel_id.to_string();
    timeline.insert(pos, owned);
    true
}
