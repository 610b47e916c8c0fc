// src/guide/mod.rs
//! Guide data model shared by the source adapters, the merge engine and the publisher.

pub mod xmltv;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;

/// An `<episode-num system="...">` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpisodeNum {
    pub system: String,
    pub value: String,
}

/// `<credits>` of a programme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Credits {
    pub directors: Vec<String>,
    pub actors: Vec<String>,
}

impl Credits {
    pub fn is_empty(&self) -> bool {
        self.directors.is_empty() && self.actors.is_empty()
    }
}

/// One scheduled programme on a channel. Times keep the offset the source used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Programme {
    pub channel: String,
    pub start: DateTime<FixedOffset>,
    pub stop: DateTime<FixedOffset>,
    pub title: String,
    pub description: Option<String>,
    pub sub_title: Option<String>,
    pub credits: Credits,
    pub categories: Vec<String>,
    /// Running time in minutes as announced by the source.
    pub length_minutes: Option<u32>,
    pub episode_nums: Vec<EpisodeNum>,
    pub is_new: bool,
}

impl Programme {
    pub fn new(
        channel: impl Into<String>,
        start: DateTime<FixedOffset>,
        stop: DateTime<FixedOffset>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            start,
            stop,
            title: title.into(),
            description: None,
            sub_title: None,
            credits: Credits::default(),
            categories: Vec::new(),
            length_minutes: None,
            episode_nums: Vec::new(),
            is_new: false,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Half-open interval overlap: touching programmes do not overlap.
    pub fn overlaps(&self, other: &Programme) -> bool {
        self.start < other.stop && other.start < self.stop
    }

    /// A programme must end after it starts.
    pub fn is_valid(&self) -> bool {
        self.stop > self.start
    }
}

/// A channel definition and its programmes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub id: String,
    /// First entry is the primary display name.
    pub display_names: Vec<String>,
    /// Logo URL.
    pub icon: Option<String>,
    pub programmes: Vec<Programme>,
}

impl Channel {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_names: vec![display_name.into()],
            icon: None,
            programmes: Vec::new(),
        }
    }

    pub fn with_icon(mut self, url: impl Into<String>) -> Self {
        self.icon = Some(url.into());
        self
    }

    pub fn with_programme(mut self, p: Programme) -> Self {
        self.programmes.push(p);
        self
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_names.first().map(String::as_str)
    }
}

/// Output of one source adapter run. Failed fragments carry no channels.
#[derive(Debug, Clone, Serialize)]
pub struct GuideFragment {
    pub source_id: String,
    pub tool_version: Option<String>,
    pub path: Option<PathBuf>,
    pub generated_at: DateTime<Utc>,
    pub success: bool,
    pub channels: Vec<Channel>,
    pub error: Option<String>,
}

impl GuideFragment {
    pub fn succeeded(
        source_id: impl Into<String>,
        channels: Vec<Channel>,
        path: Option<PathBuf>,
        tool_version: Option<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            tool_version,
            path,
            generated_at: Utc::now(),
            success: true,
            channels,
            error: None,
        }
    }

    pub fn failed(source_id: impl Into<String>, error: impl Display) -> Self {
        Self {
            source_id: source_id.into(),
            tool_version: None,
            path: None,
            generated_at: Utc::now(),
            success: false,
            channels: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn programme_count(&self) -> usize {
        self.channels.iter().map(|c| c.programmes.len()).sum()
    }
}

/// Counters collected while merging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub fragments_used: usize,
    pub fragments_failed: usize,
    pub dropped_overlaps: usize,
    pub dropped_invalid: usize,
}

/// The final guide of one cycle. Built once by the merge engine, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct MergedGuide {
    pub channels: Vec<Channel>,
    /// Winning source per channel id.
    pub provenance: BTreeMap<String, String>,
    /// Contributing sources in precedence order.
    pub sources: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub stats: MergeStats,
}

impl MergedGuide {
    pub fn channel(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn programme_count(&self) -> usize {
        self.channels.iter().map(|c| c.programmes.len()).sum()
    }
}
