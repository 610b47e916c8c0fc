// src/guide/xmltv.rs
//! XMLTV reading and writing.
//!
//! Parsing is tolerant: programmes pointing at undeclared channels are dropped,
//! a missing `stop` is taken from the next programme on the same channel, and
//! anything that still has no positive duration is discarded. Counts of what was
//! dropped are returned so adapters can log them.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use quick_xml::de::from_str;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::guide::{Channel, Credits, EpisodeNum, MergedGuide, Programme};

pub const GENERATOR_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const TIME_FORMAT: &str = "%Y%m%d%H%M%S %z";

#[derive(Debug, thiserror::Error)]
pub enum XmltvError {
    #[error("empty document")]
    Empty,
    #[error("malformed XMLTV: {0}")]
    Malformed(String),
    #[error("reading {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("writing XMLTV: {0}")]
    Write(String),
}

#[derive(Debug, Deserialize)]
struct Tv {
    #[serde(rename = "channel", default)]
    channels: Vec<XChannel>,
    #[serde(rename = "programme", default)]
    programmes: Vec<XProgramme>,
}

#[derive(Debug, Deserialize)]
struct XChannel {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "display-name", default)]
    display_names: Vec<XText>,
    #[serde(rename = "icon", default)]
    icons: Vec<XIcon>,
}

#[derive(Debug, Deserialize)]
struct XText {
    #[serde(rename = "$text", default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct XIcon {
    #[serde(rename = "@src", default)]
    src: String,
}

#[derive(Debug, Deserialize)]
struct XEpisodeNum {
    #[serde(rename = "@system", default)]
    system: Option<String>,
    #[serde(rename = "$text", default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct XCredits {
    #[serde(rename = "director", default)]
    directors: Vec<XText>,
    #[serde(rename = "actor", default)]
    actors: Vec<XText>,
}

#[derive(Debug, Deserialize)]
struct XLength {
    #[serde(rename = "@units", default)]
    units: String,
    #[serde(rename = "$text", default)]
    text: String,
}

impl XLength {
    fn minutes(&self) -> Option<u32> {
        let n: u32 = self.text.trim().parse().ok()?;
        match self.units.as_str() {
            "seconds" => Some(n / 60),
            "hours" => n.checked_mul(60),
            _ => Some(n),
        }
    }
}

#[derive(Debug, Deserialize)]
struct XProgramme {
    #[serde(rename = "@channel")]
    channel: String,
    #[serde(rename = "@start")]
    start: String,
    #[serde(rename = "@stop", default)]
    stop: Option<String>,
    #[serde(rename = "title", default)]
    titles: Vec<XText>,
    #[serde(rename = "sub-title", default)]
    sub_titles: Vec<XText>,
    #[serde(rename = "desc", default)]
    descs: Vec<XText>,
    #[serde(default)]
    credits: Option<XCredits>,
    #[serde(rename = "category", default)]
    categories: Vec<XText>,
    #[serde(default)]
    length: Option<XLength>,
    #[serde(rename = "episode-num", default)]
    episode_nums: Vec<XEpisodeNum>,
    #[serde(default)]
    new: Option<IgnoredAny>,
}

/// Result of parsing one XMLTV document.
#[derive(Debug, Default)]
pub struct ParsedGuide {
    pub channels: Vec<Channel>,
    /// Programmes referencing a channel the document does not declare.
    pub orphans: usize,
    /// Programmes with unparsable times or no positive duration.
    pub invalid: usize,
    /// Repeated channel ids (first declaration kept).
    pub duplicate_channels: usize,
}

impl ParsedGuide {
    pub fn programme_count(&self) -> usize {
        self.channels.iter().map(|c| c.programmes.len()).sum()
    }
}

pub fn parse_file(path: &Path) -> Result<ParsedGuide, XmltvError> {
    let xml = std::fs::read_to_string(path).map_err(|e| XmltvError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_str(&xml)
}

pub fn parse_str(xml: &str) -> Result<ParsedGuide, XmltvError> {
    if xml.trim().is_empty() {
        return Err(XmltvError::Empty);
    }
    let doc: Tv = from_str(xml).map_err(|e| XmltvError::Malformed(e.to_string()))?;

    let mut out = ParsedGuide::default();
    let mut index: HashMap<String, usize> = HashMap::with_capacity(doc.channels.len());

    for xc in doc.channels {
        let id = xc.id.trim().to_string();
        if id.is_empty() || index.contains_key(&id) {
            out.duplicate_channels += 1;
            continue;
        }
        let display_names = xc
            .display_names
            .into_iter()
            .map(|t| t.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let icon = xc
            .icons
            .into_iter()
            .map(|i| i.src.trim().to_string())
            .find(|s| !s.is_empty());
        index.insert(id.clone(), out.channels.len());
        out.channels.push(Channel {
            id,
            display_names,
            icon,
            programmes: Vec::new(),
        });
    }

    // (programme, has explicit stop) per channel slot
    let mut pending: Vec<Vec<(Programme, bool)>> = vec![Vec::new(); out.channels.len()];

    for xp in doc.programmes {
        let Some(&slot) = index.get(xp.channel.trim()) else {
            out.orphans += 1;
            continue;
        };
        let Some(start) = parse_time(&xp.start) else {
            out.invalid += 1;
            continue;
        };
        let stop = xp.stop.as_deref().and_then(parse_time);

        let mut p = Programme::new(
            out.channels[slot].id.clone(),
            start,
            stop.unwrap_or(start),
            first_text(&xp.titles).unwrap_or_default(),
        );
        p.sub_title = first_text(&xp.sub_titles);
        p.description = first_text(&xp.descs);
        if let Some(c) = &xp.credits {
            p.credits = Credits {
                directors: texts(&c.directors),
                actors: texts(&c.actors),
            };
        }
        p.length_minutes = xp.length.as_ref().and_then(XLength::minutes);
        p.categories = xp
            .categories
            .into_iter()
            .map(|c| c.text.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        p.episode_nums = xp
            .episode_nums
            .into_iter()
            .filter(|e| !e.text.trim().is_empty())
            .map(|e| EpisodeNum {
                system: e.system.unwrap_or_else(|| "onscreen".to_string()),
                value: e.text.trim().to_string(),
            })
            .collect();
        p.is_new = xp.new.is_some();
        pending[slot].push((p, stop.is_some()));
    }

    for (slot, mut list) in pending.into_iter().enumerate() {
        list.sort_by_key(|(p, _)| p.start);
        let next_starts: Vec<Option<DateTime<FixedOffset>>> = (0..list.len())
            .map(|i| list.get(i + 1).map(|(n, _)| n.start))
            .collect();
        for ((mut p, has_stop), next) in list.into_iter().zip(next_starts) {
            if !has_stop {
                match next {
                    Some(ns) => p.stop = ns,
                    None => {
                        out.invalid += 1;
                        continue;
                    }
                }
            }
            if !p.is_valid() {
                out.invalid += 1;
                continue;
            }
            out.channels[slot].programmes.push(p);
        }
    }

    Ok(out)
}

fn texts(items: &[XText]) -> Vec<String> {
    items
        .iter()
        .map(|t| t.text.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn first_text(items: &[XText]) -> Option<String> {
    items
        .iter()
        .map(|t| t.text.trim())
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

/// Parse an XMLTV timestamp: `YYYYmmddHHMMSS +HHMM`. Shorter precisions
/// (`YYYYmmddHHMM`, `YYYYmmdd`) and a missing offset (UTC) are accepted.
pub fn parse_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    let (digits, tz) = match raw.split_once(char::is_whitespace) {
        Some((d, t)) => (d, Some(t.trim())),
        None => match raw.find(['+', '-']) {
            Some(pos) => (&raw[..pos], Some(&raw[pos..])),
            None => (raw, None),
        },
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let padded = match digits.len() {
        14 => digits.to_string(),
        12 => format!("{digits}00"),
        8 => format!("{digits}000000"),
        _ => return None,
    };
    let naive = NaiveDateTime::parse_from_str(&padded, "%Y%m%d%H%M%S").ok()?;
    let offset = match tz {
        None | Some("") => FixedOffset::east_opt(0)?,
        Some(t) => parse_offset(t)?,
    };
    offset.from_local_datetime(&naive).single()
}

fn parse_offset(t: &str) -> Option<FixedOffset> {
    if ["utc", "gmt", "z"].iter().any(|z| t.eq_ignore_ascii_case(z)) {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match t.as_bytes().first()? {
        b'+' => (1, &t[1..]),
        b'-' => (-1, &t[1..]),
        _ => return None,
    };
    let rest: String = rest.chars().filter(|c| *c != ':').collect();
    if rest.len() != 4 || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let h: i32 = rest[..2].parse().ok()?;
    let m: i32 = rest[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}

pub fn format_time<Tz: TimeZone>(dt: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    dt.format(TIME_FORMAT).to_string()
}

/// Decode HTML entities and drop characters that are not allowed in XML.
pub fn clean_text(raw: &str) -> String {
    let decoded = html_escape::decode_html_entities(raw);
    strip_invalid_chars(&decoded).trim().to_string()
}

pub fn strip_invalid_chars(s: &str) -> String {
    s.chars().filter(|c| is_xml_char(*c)).collect()
}

fn is_xml_char(c: char) -> bool {
    matches!(
        c as u32,
        0x9 | 0xA | 0xD | 0x20..=0xD7FF | 0xE000..=0xFFFD | 0x10000..=0x10FFFF
    )
}

pub fn write_guide(guide: &MergedGuide) -> Result<Vec<u8>, XmltvError> {
    write_channels(&guide.channels, guide.generated_at)
}

/// Serialize channels into a complete XMLTV document: all `<channel>`
/// elements first, then every programme grouped by channel.
pub fn write_channels(
    channels: &[Channel],
    generated_at: DateTime<Utc>,
) -> Result<Vec<u8>, XmltvError> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);

    emit(&mut w, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    emit(
        &mut w,
        Event::DocType(BytesText::from_escaped(r#"tv SYSTEM "xmltv.dtd""#)),
    )?;

    let date = format_time(&generated_at);
    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("date", date.as_str()));
    tv.push_attribute(("generator-info-name", GENERATOR_NAME));
    emit(&mut w, Event::Start(tv))?;

    for ch in channels {
        let id = strip_invalid_chars(&ch.id);
        let mut el = BytesStart::new("channel");
        el.push_attribute(("id", id.as_str()));
        emit(&mut w, Event::Start(el))?;
        for name in &ch.display_names {
            text_element(&mut w, "display-name", &[], name)?;
        }
        if let Some(icon) = &ch.icon {
            let src = strip_invalid_chars(icon);
            let mut el = BytesStart::new("icon");
            el.push_attribute(("src", src.as_str()));
            emit(&mut w, Event::Empty(el))?;
        }
        emit(&mut w, Event::End(BytesEnd::new("channel")))?;
    }

    for ch in channels {
        for p in &ch.programmes {
            write_programme(&mut w, &ch.id, p)?;
        }
    }

    emit(&mut w, Event::End(BytesEnd::new("tv")))?;
    let mut bytes = w.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

fn write_programme(
    w: &mut Writer<Vec<u8>>,
    channel_id: &str,
    p: &Programme,
) -> Result<(), XmltvError> {
    let channel = strip_invalid_chars(channel_id);
    let start = format_time(&p.start);
    let stop = format_time(&p.stop);

    let mut el = BytesStart::new("programme");
    el.push_attribute(("start", start.as_str()));
    el.push_attribute(("stop", stop.as_str()));
    el.push_attribute(("channel", channel.as_str()));
    emit(w, Event::Start(el))?;

    // Element order follows the XMLTV DTD.
    text_element(w, "title", &[], &p.title)?;
    if let Some(sub) = &p.sub_title {
        text_element(w, "sub-title", &[], sub)?;
    }
    if let Some(desc) = &p.description {
        text_element(w, "desc", &[], desc)?;
    }
    if !p.credits.is_empty() {
        emit(w, Event::Start(BytesStart::new("credits")))?;
        for d in &p.credits.directors {
            text_element(w, "director", &[], d)?;
        }
        for a in &p.credits.actors {
            text_element(w, "actor", &[], a)?;
        }
        emit(w, Event::End(BytesEnd::new("credits")))?;
    }
    for cat in &p.categories {
        text_element(w, "category", &[], cat)?;
    }
    if let Some(len) = p.length_minutes {
        text_element(w, "length", &[("units", "minutes")], &len.to_string())?;
    }
    for ep in &p.episode_nums {
        text_element(w, "episode-num", &[("system", ep.system.as_str())], &ep.value)?;
    }
    if p.is_new {
        emit(w, Event::Empty(BytesStart::new("new")))?;
    }

    emit(w, Event::End(BytesEnd::new("programme")))
}

fn text_element(
    w: &mut Writer<Vec<u8>>,
    name: &str,
    attrs: &[(&str, &str)],
    text: &str,
) -> Result<(), XmltvError> {
    let mut el = BytesStart::new(name);
    for (k, v) in attrs {
        el.push_attribute((*k, *v));
    }
    emit(w, Event::Start(el))?;
    let clean = strip_invalid_chars(text);
    emit(w, Event::Text(BytesText::new(&clean)))?;
    emit(w, Event::End(BytesEnd::new(name)))
}

fn emit(w: &mut Writer<Vec<u8>>, ev: Event<'_>) -> Result<(), XmltvError> {
    w.write_event(ev)
        .map_err(|e| XmltvError::Write(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE tv SYSTEM "xmltv.dtd">
<tv generator-info-name="test">
  <channel id="bbc1">
    <display-name lang="en">BBC One</display-name>
    <display-name>101</display-name>
    <icon src="http://img/bbc1.png"/>
  </channel>
  <channel id="bbc1">
    <display-name>Duplicate</display-name>
  </channel>
  <programme start="20240101060000 +0000" stop="20240101070000 +0000" channel="bbc1">
    <title lang="en">Breakfast</title>
    <desc lang="en">News &amp; weather</desc>
    <credits>
      <director>Jo Editor</director>
      <actor>Anna Anchor</actor>
      <actor>Ben Weather</actor>
    </credits>
    <category lang="en">News</category>
    <length units="hours">1</length>
  </programme>
  <programme start="20240101070000 +0000" channel="bbc1">
    <title>Morning Live</title>
    <episode-num system="xmltv_ns">0.4.</episode-num>
    <category>Magazine</category>
    <new/>
  </programme>
  <programme start="20240101080000 +0000" channel="bbc1">
    <title>No stop and nothing after</title>
  </programme>
  <programme start="20240101080000 +0000" stop="20240101090000 +0000" channel="ghost">
    <title>Orphan</title>
  </programme>
</tv>"#;

    #[test]
    fn parses_channels_and_infers_missing_stop() {
        let g = parse_str(DOC).unwrap();
        assert_eq!(g.channels.len(), 1);
        assert_eq!(g.duplicate_channels, 1);
        assert_eq!(g.orphans, 1);
        // last programme has no stop and no successor
        assert_eq!(g.invalid, 1);

        let ch = &g.channels[0];
        assert_eq!(ch.display_names, vec!["BBC One", "101"]);
        assert_eq!(ch.icon.as_deref(), Some("http://img/bbc1.png"));
        assert_eq!(ch.programmes.len(), 2);

        let breakfast = &ch.programmes[0];
        assert_eq!(breakfast.description.as_deref(), Some("News & weather"));
        assert_eq!(breakfast.categories, vec!["News"]);
        assert_eq!(breakfast.credits.directors, vec!["Jo Editor"]);
        assert_eq!(breakfast.credits.actors, vec!["Anna Anchor", "Ben Weather"]);
        assert_eq!(breakfast.length_minutes, Some(60));

        let live = &ch.programmes[1];
        assert_eq!(format_time(&live.stop), "20240101080000 +0000");
        assert!(live.is_new);
        assert_eq!(live.episode_nums[0].system, "xmltv_ns");
    }

    #[test]
    fn time_parsing_accepts_common_variants() {
        let a = parse_time("20240101120000 +0100").unwrap();
        let b = parse_time("20240101110000").unwrap();
        let c = parse_time("202401011200+0100").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(format_time(&a), "20240101120000 +0100");
        assert!(parse_time("2024-01-01").is_none());
        assert!(parse_time("20240101120000 +01").is_none());
    }

    #[test]
    fn written_document_parses_back() {
        let g = parse_str(DOC).unwrap();
        let bytes = write_channels(&g.channels, Utc::now()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("<!DOCTYPE tv SYSTEM \"xmltv.dtd\">"));
        assert!(text.contains("News &amp; weather"));
        assert!(text.contains("<length units=\"minutes\">60</length>"));
        assert!(text.contains("<director>Jo Editor</director>"));

        let again = parse_str(&text).unwrap();
        assert_eq!(again.channels, g.channels);
    }

    #[test]
    fn clean_text_unescapes_and_strips_control_chars() {
        assert_eq!(clean_text("  Tom &amp; Jerry\u{1}  "), "Tom & Jerry");
        assert_eq!(strip_invalid_chars("a\u{0}b\tc"), "ab\tc");
    }

    #[test]
    fn empty_and_garbage_documents_fail() {
        assert!(matches!(parse_str("   "), Err(XmltvError::Empty)));
        assert!(parse_str("<tv><programme channel=").is_err());
    }
}
