//! Raw-row parsing and normalization into candidate records.
//!
//! Everything here is a pure function over the noisy free-text fields of one
//! source row: day/time ranges, phone numbers, address tails, the closed
//! vocabulary of status labels. Expected bad input is a value or a typed
//! error, never a panic, so the driver's per-record error boundary stays
//! simple.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use svcdir_core::{
    Address, CandidateRecord, OpenStatus, Phone, Position, ScheduleEntry, TaxonomyNode, Weekday,
};
use svcdir_storage::GeolocationResolver;

pub const CRATE_NAME: &str = "svcdir-normalize";

/// One row of the spreadsheet-style source export, as exported to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub zipcode: Option<String>,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub hours: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub facility_type: Option<String>,
    #[serde(default)]
    pub additional_notes: Option<String>,
    #[serde(default)]
    pub id_required: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub do_not_import: bool,
}

pub fn read_raw_records(path: impl AsRef<Path>) -> anyhow::Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Drops rows that should never reach normalization: explicitly excluded,
/// status missing/unknown, stale beyond `max_age_days`, or claiming to be
/// open without any hours to show for it.
pub fn prefilter_rows(
    rows: Vec<RawRecord>,
    now: DateTime<Utc>,
    max_age_days: i64,
) -> (Vec<RawRecord>, usize) {
    let total = rows.len();
    let kept: Vec<RawRecord> = rows
        .into_iter()
        .filter(|row| {
            if row.do_not_import {
                warn!(source_id = %row.id, "row flagged do-not-import");
                return false;
            }
            let status = row.status.as_deref().map(str::trim).unwrap_or("");
            if status.is_empty() || status.eq_ignore_ascii_case("unknown") {
                warn!(source_id = %row.id, "row has no usable status");
                return false;
            }
            if now.signed_duration_since(row.last_updated) > Duration::days(max_age_days) {
                warn!(source_id = %row.id, last_updated = %row.last_updated, "row is stale");
                return false;
            }
            let has_hours = row.hours.as_deref().is_some_and(|h| !h.trim().is_empty());
            if !status.eq_ignore_ascii_case("closed") && !has_hours {
                warn!(source_id = %row.id, "open row without hours");
                return false;
            }
            true
        })
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Trims whitespace; an empty result is treated as absent.
pub fn clean_string(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `"closed"`/`"open"` map to the explicit states; anything else is
/// `Unknown`, which is distinct from an explicit `Open`.
pub fn parse_open_status(label: &str) -> OpenStatus {
    match label.trim().to_ascii_lowercase().as_str() {
        "closed" => OpenStatus::Closed,
        "open" => OpenStatus::Open,
        _ => OpenStatus::Unknown,
    }
}

pub fn parse_id_required(label: &str) -> Option<bool> {
    match label.trim().to_ascii_lowercase().as_str() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

static ADDRESS_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i),\s*(?:[a-z .'-]+,\s*)?[a-z]{2}\.?\s*\d{5}(?:-\d{4})?\s*$")
        .expect("address suffix pattern compiles")
});

/// Removes a trailing `, <city>, <ST> <zip>` tail from an address line.
/// Idempotent: a stripped stem no longer carries the tail.
pub fn strip_address_suffix(address: &str) -> String {
    ADDRESS_SUFFIX_RE
        .replace(address.trim(), "")
        .trim_end()
        .to_string()
}

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\(?\d{3}\)?[-. ]*\d{3}[-. ]*\d{4})(?:\s*(?:ext|x)\.?\s*\(?\s*(\d{3,4}))?")
        .expect("phone pattern compiles")
});

/// All non-overlapping North-American phone numbers in `text`, each with an
/// optional extension. No matches is an empty list, not an error.
pub fn parse_phones(text: &str) -> Vec<Phone> {
    PHONE_RE
        .captures_iter(text)
        .map(|caps| Phone {
            number: caps[1].to_string(),
            extension: caps.get(2).map(|m| m.as_str().to_string()),
        })
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DayRangeError {
    #[error("unrecognized day token {0:?}")]
    UnknownDay(String),
}

const DAY_PREFIXES: [&str; 7] = ["mo", "tu", "we", "th", "fr", "sa", "su"];

fn day_index(token: &str) -> Option<usize> {
    DAY_PREFIXES
        .iter()
        .position(|prefix| token.starts_with(prefix))
}

/// Expands a lowercased day token (`"mon"`, `"mon-fri"`, `"sat,sun"`) into
/// individual weekdays, walking forward circularly so wrap-around ranges like
/// `"fri-mon"` are valid.
pub fn expand_day_range(token: &str) -> Result<Vec<Weekday>, DayRangeError> {
    let mut days = Vec::new();
    for part in token.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once(['-', '–']) {
            let start_index = day_index(start.trim())
                .ok_or_else(|| DayRangeError::UnknownDay(start.trim().to_string()))?;
            let end_index = day_index(end.trim())
                .ok_or_else(|| DayRangeError::UnknownDay(end.trim().to_string()))?;
            let mut i = start_index;
            while i != end_index {
                days.push(Weekday::from_index(i));
                i = (i + 1) % 7;
            }
            days.push(Weekday::from_index(end_index));
        } else {
            let index =
                day_index(part).ok_or_else(|| DayRangeError::UnknownDay(part.to_string()))?;
            days.push(Weekday::from_index(index));
        }
    }
    Ok(days)
}

static MINUTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})([^:\d]|$)").expect("minutes pattern compiles"));

/// `"9"` -> `"9:00"`, `"9am"` -> `"9:00am"`; already-minuted times unchanged.
pub fn ensure_minutes(time: &str) -> String {
    MINUTES_RE
        .replace(time, |caps: &regex::Captures<'_>| {
            format!(
                "{}:00{}",
                &caps[1],
                caps.get(2).map_or("", |m| m.as_str())
            )
        })
        .to_string()
}

fn hour_of(time: &str) -> u32 {
    time.split(':')
        .next()
        .unwrap_or("")
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .unwrap_or(0)
}

/// Completes the start time's meridiem from the end time's, flipping AM/PM
/// when the same sign would put the start after the end.
pub fn ensure_meridiem(start: String, end: String) -> (String, String) {
    if start.ends_with("am") || start.ends_with("pm") {
        return (start, end);
    }

    let start_hour = hour_of(&start) % 12;
    let end_hour = hour_of(&end) % 12;
    let end_sign = if end.ends_with("pm") { "pm" } else { "am" };

    if start_hour <= end_hour {
        (format!("{start}{end_sign}"), end)
    } else {
        let flipped = if end_sign == "am" { "pm" } else { "am" };
        (format!("{start}{flipped}"), end)
    }
}

/// `"5:00pm"` -> 17:00. Times without a meridiem are taken as already
/// 24-hour. `None` for out-of-range components.
pub fn to_24_hour(time: &str) -> Option<NaiveTime> {
    let (body, meridiem) = if let Some(stripped) = time.strip_suffix("pm") {
        (stripped, Some(true))
    } else if let Some(stripped) = time.strip_suffix("am") {
        (stripped, Some(false))
    } else {
        (time, None)
    };

    let mut parts = body.split(':');
    let hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = match parts.next() {
        Some(m) => m.trim().parse().ok()?,
        None => 0,
    };

    let hour = match meridiem {
        Some(true) if hour < 12 => hour + 12,
        Some(false) if hour == 12 => 0,
        _ => hour,
    };

    NaiveTime::from_hms_opt(hour, minute, 0)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleParseError {
    /// Nothing matched from the start of the string; the whole field is
    /// unusable.
    #[error("unsupported hours format {0:?}")]
    Unanchored(String),
}

/// Outcome of parsing one free-text hours field: the surviving entries plus
/// what had to be thrown away along the way.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedSchedule {
    pub entries: Vec<ScheduleEntry>,
    /// Weekdays dropped because two segments disagreed on their hours.
    pub conflicting_days: Vec<Weekday>,
    /// Segment texts skipped for unparsable day or time tokens.
    pub skipped_segments: Vec<String>,
}

static HOURS_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([a-z]{3,9}(?:[-–][a-z]{3,9})?(?:,\s*[a-z]{3,9}(?:[-–][a-z]{3,9})?)*):?\s*(\d{1,2}(?::\d{2})?(?:am|pm)?)\s*[-–]\s*(\d{1,2}(?::\d{2})?(?:am|pm))[,;\s]*",
    )
    .expect("hours segment pattern compiles")
});

/// Parses a free-text hours string into per-weekday opening windows.
///
/// The string is scanned as `<days>: <start>-<end>` segments. A segment with
/// a bad day or time token is skipped (and reported), not fatal; the parse
/// fails outright only when no segment matches from position 0.
pub fn parse_hours(input: &str) -> Result<ParsedSchedule, ScheduleParseError> {
    let lowered = input.trim().to_lowercase();

    let mut segments = Vec::new();
    for caps in HOURS_SEGMENT_RE.captures_iter(&lowered) {
        let whole = caps.get(0).expect("capture 0 always present");
        segments.push((
            whole.start(),
            whole.as_str().trim().to_string(),
            caps[1].to_string(),
            caps[2].to_string(),
            caps[3].to_string(),
        ));
    }

    if segments.first().map_or(true, |(start, ..)| *start != 0) {
        return Err(ScheduleParseError::Unanchored(input.to_string()));
    }

    let mut raw_entries = Vec::new();
    let mut skipped_segments = Vec::new();

    for (_, text, day_token, start, end) in segments {
        let days = match expand_day_range(&day_token) {
            Ok(days) => days,
            Err(err) => {
                warn!(segment = %text, %err, "skipping hours segment");
                skipped_segments.push(text);
                continue;
            }
        };

        let (start, end) = ensure_meridiem(ensure_minutes(&start), ensure_minutes(&end));
        let (Some(opens_at), Some(closes_at)) = (to_24_hour(&start), to_24_hour(&end)) else {
            warn!(segment = %text, "skipping hours segment with unusable times");
            skipped_segments.push(text);
            continue;
        };

        for weekday in days {
            raw_entries.push(ScheduleEntry {
                weekday,
                opens_at,
                closes_at,
            });
        }
    }

    let (entries, conflicting_days) = dedupe_days(raw_entries);
    for day in &conflicting_days {
        warn!(weekday = %day, hours = %input, "day has conflicting hours; dropped");
    }

    Ok(ParsedSchedule {
        entries,
        conflicting_days,
        skipped_segments,
    })
}

/// Duplicate weekdays collapse to one entry when all segments agree; a
/// weekday with disagreeing windows is dropped entirely.
fn dedupe_days(entries: Vec<ScheduleEntry>) -> (Vec<ScheduleEntry>, Vec<Weekday>) {
    let mut by_day: BTreeMap<Weekday, Vec<ScheduleEntry>> = BTreeMap::new();
    for entry in entries {
        by_day.entry(entry.weekday).or_default().push(entry);
    }

    let mut kept = Vec::new();
    let mut conflicting = Vec::new();
    for (day, windows) in by_day {
        let first = windows[0];
        if windows
            .iter()
            .all(|w| w.opens_at == first.opens_at && w.closes_at == first.closes_at)
        {
            kept.push(first);
        } else {
            conflicting.push(day);
        }
    }
    (kept, conflicting)
}

/// Depth-first, case-insensitive exact-name search over the taxonomy tree.
pub fn find_taxonomy<'a>(name: &str, nodes: &'a [TaxonomyNode]) -> Option<&'a TaxonomyNode> {
    for node in nodes {
        if node.name.eq_ignore_ascii_case(name) {
            return Some(node);
        }
        if let Some(found) = find_taxonomy(name, &node.children) {
            return Some(found);
        }
    }
    None
}

/// Resolution of the run's facility-type labels against the taxonomy tree,
/// computed once per run. Labels that did not resolve are simply absent.
#[derive(Debug, Default)]
pub struct TaxonomyMapping {
    by_label: HashMap<String, (String, String)>,
}

impl TaxonomyMapping {
    pub fn build<'a>(labels: impl IntoIterator<Item = &'a str>, tree: &[TaxonomyNode]) -> Self {
        let mut by_label = HashMap::new();
        for label in labels {
            let key = label.trim().to_lowercase();
            if key.is_empty() || by_label.contains_key(&key) {
                continue;
            }
            if let Some(node) = find_taxonomy(label.trim(), tree) {
                by_label.insert(key, (node.id.clone(), node.name.clone()));
            }
        }
        Self { by_label }
    }

    /// `(taxonomy id, canonical name)` for a source label.
    pub fn resolve(&self, label: &str) -> Option<(&str, &str)> {
        self.by_label
            .get(&label.trim().to_lowercase())
            .map(|(id, name)| (id.as_str(), name.as_str()))
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("missing organization name for source row {source_id}")]
    MissingName { source_id: String },
    #[error("missing facility type for {name:?} ({source_id})")]
    MissingTaxonomy { source_id: String, name: String },
    #[error("unknown taxonomy for facility type {label:?} ({name})")]
    UnknownTaxonomy { label: String, name: String },
    #[error("resolving geography for {name:?}: {source:#}")]
    Geolocation { name: String, source: anyhow::Error },
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub state: String,
    pub country: String,
    pub default_city: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            state: "NY".to_string(),
            country: "US".to_string(),
            default_city: "New York".to_string(),
        }
    }
}

/// Turns one raw row into a candidate record, composing the pure parsers
/// with taxonomy and geolocation resolution.
pub struct RecordNormalizer {
    taxonomy: TaxonomyMapping,
    config: NormalizerConfig,
}

impl RecordNormalizer {
    pub fn new(taxonomy: TaxonomyMapping, config: NormalizerConfig) -> Self {
        Self { taxonomy, config }
    }

    pub async fn normalize(
        &self,
        geolocation: &mut GeolocationResolver,
        raw: &RawRecord,
    ) -> Result<CandidateRecord, NormalizeError> {
        let organization_name = raw
            .name
            .as_deref()
            .and_then(clean_string)
            .ok_or_else(|| NormalizeError::MissingName {
                source_id: raw.id.clone(),
            })?;

        let label = raw
            .facility_type
            .as_deref()
            .and_then(clean_string)
            .ok_or_else(|| NormalizeError::MissingTaxonomy {
                source_id: raw.id.clone(),
                name: organization_name.clone(),
            })?;
        let (taxonomy_id, service_name) = self
            .taxonomy
            .resolve(&label)
            .map(|(id, name)| (id.to_string(), name.to_string()))
            .ok_or_else(|| NormalizeError::UnknownTaxonomy {
                label: label.clone(),
                name: organization_name.clone(),
            })?;

        let status = raw
            .status
            .as_deref()
            .map(parse_open_status)
            .unwrap_or_default();

        let schedule = match raw.hours.as_deref().and_then(clean_string) {
            None => Vec::new(),
            Some(hours) => match parse_hours(&hours) {
                Ok(parsed) => parsed.entries,
                Err(err) => {
                    warn!(source_id = %raw.id, %err, "unparsable hours; leaving unspecified");
                    Vec::new()
                }
            },
        };

        let phones = raw.phone.as_deref().map(parse_phones).unwrap_or_default();
        let street = raw
            .address
            .as_deref()
            .and_then(clean_string)
            .map(|s| strip_address_suffix(&s));
        let postal_code = raw.zipcode.as_deref().and_then(clean_string);
        let neighborhood = raw.neighborhood.as_deref().and_then(clean_string);

        let city = geolocation
            .city_for(postal_code.as_deref(), neighborhood.as_deref())
            .await
            .map_err(|source| NormalizeError::Geolocation {
                name: organization_name.clone(),
                source,
            })?
            .unwrap_or_else(|| self.config.default_city.clone());

        let position = match (raw.latitude, raw.longitude) {
            (Some(latitude), Some(longitude)) => Some(Position {
                latitude,
                longitude,
            }),
            _ => match street.as_deref() {
                Some(street) => Some(
                    geolocation
                        .position_for(
                            street,
                            &city,
                            &self.config.state,
                            postal_code.as_deref().unwrap_or_default(),
                        )
                        .await
                        .map_err(|source| NormalizeError::Geolocation {
                            name: organization_name.clone(),
                            source,
                        })?,
                ),
                None => None,
            },
        };

        Ok(CandidateRecord {
            source_id: raw.id.clone(),
            last_updated: raw.last_updated,
            organization_name,
            url: raw.website.as_deref().and_then(clean_string),
            address: Address {
                street,
                postal_code,
                city: Some(city),
                state: self.config.state.clone(),
                country: self.config.country.clone(),
            },
            position,
            phones,
            taxonomy_label: label,
            taxonomy_id,
            service_name,
            status,
            schedule,
            advisory_note: raw.additional_notes.as_deref().and_then(clean_string),
            id_required: raw.id_required.as_deref().and_then(parse_id_required),
        })
    }
}
