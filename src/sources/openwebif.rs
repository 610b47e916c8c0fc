// src/sources/openwebif.rs
//! Native scraper for Enigma2 receivers running OpenWebif.
//!
//! Walks `/api/bouquets` → `/api/getservices` → `/api/epgservice` and writes
//! the result as an XMLTV fragment. Programme details (categories, episode
//! numbers, sub-titles) are recovered from the free-text short description.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::OpenWebifConfig;
use crate::guide::xmltv::{self, clean_text};
use crate::guide::{Channel, Credits, EpisodeNum, Programme};
use crate::sources::{GuideSource, SourceError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct BouquetsResp {
    bouquets: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct ServicesResp {
    services: Vec<Service>,
}

#[derive(Debug, Deserialize)]
struct Service {
    servicereference: String,
    #[serde(default)]
    servicename: String,
    #[serde(default)]
    program: serde_json::Value,
    /// 0 for markers/separators.
    #[serde(default)]
    pos: u32,
}

impl Service {
    fn channel_id(&self) -> String {
        match &self.program {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => self.servicereference.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EpgResp {
    #[serde(default)]
    events: Vec<Event>,
}

#[derive(Debug, Clone, Deserialize)]
struct Event {
    #[serde(default)]
    title: String,
    #[serde(default)]
    shortdesc: String,
    #[serde(default)]
    longdesc: String,
    begin_timestamp: i64,
    /// Minutes.
    #[serde(default)]
    duration: i64,
    #[serde(default)]
    picon: Option<String>,
}

pub struct OpenWebifSource {
    id: String,
    base_url: String,
    bouquet: Option<String>,
    credentials: Option<(String, Option<String>)>,
    client: reqwest::Client,
}

impl OpenWebifSource {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bouquet: None,
            credentials: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(id: &str, cfg: &OpenWebifConfig) -> Self {
        let mut src = Self::new(id, cfg.url.clone());
        src.bouquet = cfg.bouquet.clone();
        src.credentials = cfg
            .username
            .clone()
            .map(|u| (u, cfg.password.clone()));
        src
    }

    pub fn bouquet(mut self, name: impl Into<String>) -> Self {
        self.bouquet = Some(name.into());
        self
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, sref: Option<&str>) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url).timeout(REQUEST_TIMEOUT);
        if let Some(sref) = sref {
            req = req.query(&[("sRef", sref)]);
        }
        if let Some((user, pass)) = &self.credentials {
            req = req.basic_auth(user, pass.as_ref());
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        resp.json::<T>()
            .await
            .with_context(|| format!("decoding {url}"))
    }

    async fn collect_channels(&self) -> anyhow::Result<Vec<Channel>> {
        let bouquets: BouquetsResp = self.get_json("/api/bouquets", None).await?;
        let selected: Vec<(String, String)> = bouquets
            .bouquets
            .into_iter()
            .filter(|(_, name)| self.bouquet.as_deref().map_or(true, |b| b == name))
            .collect();
        if selected.is_empty() {
            anyhow::bail!(
                "no bouquet matched {:?}",
                self.bouquet.as_deref().unwrap_or("<any>")
            );
        }

        let mut seen = HashSet::new();
        let mut channels = Vec::new();
        for (sref, name) in selected {
            let services: ServicesResp = self.get_json("/api/getservices", Some(&sref)).await?;
            tracing::debug!(target: "source", source = %self.id, bouquet = %name, services = services.services.len(), "bouquet services");
            for svc in services.services.into_iter().filter(|s| s.pos > 0) {
                let id = svc.channel_id();
                if !seen.insert(id.clone()) {
                    continue;
                }
                let epg: EpgResp = self
                    .get_json("/api/epgservice", Some(&svc.servicereference))
                    .await?;
                channels.push(self.build_channel(&id, &svc, &epg.events));
            }
        }
        Ok(channels)
    }

    fn build_channel(&self, id: &str, svc: &Service, events: &[Event]) -> Channel {
        let mut ch = Channel::new(id, clean_text(&svc.servicename));
        ch.display_names.push(svc.pos.to_string());
        ch.icon = events
            .first()
            .and_then(|e| e.picon.as_deref())
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}{}", self.base_url, p));
        ch.programmes = events
            .iter()
            .filter_map(|e| event_to_programme(id, e))
            .collect();
        ch
    }
}

#[async_trait]
impl GuideSource for OpenWebifSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(&self, output: &Path) -> Result<(), SourceError> {
        let channels = self
            .collect_channels()
            .await
            .map_err(|e| SourceError::Fetch(format!("{e:#}")))?;
        let bytes = xmltv::write_channels(&channels, Utc::now())
            .map_err(|e| SourceError::OutputUnparsable(e.to_string()))?;
        tokio::fs::write(output, bytes).await?;
        Ok(())
    }
}

static RE_CATEGORIES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(?P<c1>[\w\s]+)[.\s]*(?P<c2>[\w\s]+)*\]").expect("static regex")
});
static RE_SEASON_EPISODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:S(?P<s>\d+)(?:/|\s)*)?(?:Ep|E)\s*(?P<e>\d+)(?:/(?P<t>\d+))?")
        .expect("static regex")
});
static RE_EPISODE_OF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<e>\d+)/(?P<t>\d+)\.").expect("static regex"));
static RE_AIR_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{2})[/.\-](\d{2})[/.\-](\d{4})").expect("static regex")
});
static RE_LEADING_BRACKETS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\[.+\]\s*)").expect("static regex"));
static RE_TRAILING_EPISODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\([SE]\d+.*\)").expect("static regex"));

fn event_to_programme(channel_id: &str, ev: &Event) -> Option<Programme> {
    let start = Utc.timestamp_opt(ev.begin_timestamp, 0).single()?.fixed_offset();
    let stop = start + chrono::Duration::minutes(ev.duration);
    if stop <= start {
        return None;
    }

    let mut title = clean_text(&ev.title);
    let is_new = title.contains("New: ");
    if is_new {
        title = title.replace("New: ", "");
    }

    let mut p = Programme::new(channel_id, start, stop, title.trim());
    p.is_new = is_new;
    p.length_minutes = u32::try_from(ev.duration).ok();
    if ev.longdesc.trim().is_empty() {
        p.description = Some(clean_text(&ev.shortdesc)).filter(|d| !d.is_empty());
    } else {
        p.description = Some(clean_text(&ev.longdesc));
        p.sub_title = sub_title(&ev.shortdesc);
    }

    p.categories = parse_categories(&ev.shortdesc);
    if p.categories.first().is_some_and(|c| c == "Movie") {
        p.credits = movie_credits(&ev.longdesc);
    }
    let skip_episode = p
        .categories
        .first()
        .is_some_and(|c| c == "Movie" || c == "News");
    if !skip_episode {
        if let Some(ep) = parse_episode(&ev.shortdesc) {
            p.episode_nums.push(EpisodeNum {
                system: "xmltv_ns".to_string(),
                value: ep,
            });
            if p.categories.is_empty() {
                p.categories.push("Series".to_string());
            }
        }
        if let Some(date) = parse_air_date(&ev.shortdesc) {
            p.episode_nums.push(EpisodeNum {
                system: "original-air-date".to_string(),
                value: date,
            });
        }
    }
    Some(p)
}

/// `[Drama. Crime] ...` → `["Drama", "Crime"]`.
fn parse_categories(shortdesc: &str) -> Vec<String> {
    let Some(caps) = RE_CATEGORIES.captures(shortdesc) else {
        return Vec::new();
    };
    ["c1", "c2"]
        .iter()
        .filter_map(|n| caps.name(n))
        .map(|m| m.as_str().trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Episode number in `xmltv_ns` form: zero-based `season.episode.part`,
/// where the `/N` total fills the part field as `N - 1`.
fn parse_episode(text: &str) -> Option<String> {
    let caps = RE_SEASON_EPISODE
        .captures(text)
        .or_else(|| RE_EPISODE_OF.captures(text))?;
    let field = |name: &str| {
        caps.name(name)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .map(|n| n.saturating_sub(1).to_string())
            .unwrap_or_default()
    };
    Some(format!("{}.{}.{}", field("s"), field("e"), field("t")))
}

/// Movie long descriptions carry the director on the second line and one
/// actor per line after it.
fn movie_credits(longdesc: &str) -> Credits {
    let mut lines = longdesc.splitn(3, '\n');
    let (Some(_), Some(director), Some(cast)) = (lines.next(), lines.next(), lines.next()) else {
        return Credits::default();
    };
    let director = clean_text(director);
    Credits {
        directors: (!director.is_empty()).then_some(director).into_iter().collect(),
        actors: cast
            .lines()
            .map(clean_text)
            .filter(|a| !a.is_empty())
            .collect(),
    }
}

/// `dd/mm/yyyy` anywhere in the text → `yyyy-mm-dd`.
fn parse_air_date(text: &str) -> Option<String> {
    let caps = RE_AIR_DATE.captures(text)?;
    Some(format!("{}-{}-{}", &caps[3], &caps[2], &caps[1]))
}

fn sub_title(shortdesc: &str) -> Option<String> {
    let without_cats = RE_LEADING_BRACKETS.replace(shortdesc, "");
    let sub = RE_TRAILING_EPISODE.replace(&without_cats, "");
    let sub = clean_text(&sub);
    (!sub.is_empty()).then_some(sub)
}
