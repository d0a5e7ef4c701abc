//! Core domain model for the job feed: listings, coordinates and stable ids.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobfeed-core";

/// A latitude/longitude pair.
///
/// `(0, 0)` is the sentinel for "resolution attempted, nothing found". Whether
/// a sentinel means "never attempted" or "attempted and failed" is decided by
/// membership in the location cache, not by the value itself.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub const SENTINEL: Coordinates = Coordinates { lat: 0.0, lng: 0.0 };

    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_sentinel(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }
}

/// One job posting as persisted in the feed file and served to the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListing {
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default)]
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
}

impl JobListing {
    pub fn cache_key(&self) -> String {
        cache_key(&self.company, &self.location)
    }

    /// Plottable coordinates, or `None` when the listing still carries the sentinel.
    pub fn coordinates(&self) -> Option<Coordinates> {
        let coords = Coordinates::new(self.lat, self.lng);
        if coords.is_sentinel() {
            None
        } else {
            Some(coords)
        }
    }

    pub fn needs_coordinates(&self) -> bool {
        self.coordinates().is_none()
    }

    pub fn set_coordinates(&mut self, coords: Coordinates) {
        self.lat = coords.lat;
        self.lng = coords.lng;
    }

    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        self.date.as_deref().and_then(parse_posting_date)
    }

    /// Fill in an id for records written before ids existed. Returns true when one was derived.
    pub fn backfill_id(&mut self) -> bool {
        if !self.id.trim().is_empty() {
            return false;
        }
        let link = if self.link.is_empty() {
            None
        } else {
            Some(self.link.as_str())
        };
        self.id = derive_listing_id(None, link, &self.company, &self.title, &self.location);
        true
    }
}

/// Composite key used by the location cache: `"{company}, {location}"`, exact and case-sensitive.
pub fn cache_key(company: &str, location: &str) -> String {
    format!("{company}, {location}")
}

/// Collapse every run of whitespace into a single space and trim the ends.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable listing id: provider entity urn, else the link without its query
/// string, else a `company-title-location` composite.
pub fn derive_listing_id(
    entity_urn: Option<&str>,
    link: Option<&str>,
    company: &str,
    title: &str,
    location: &str,
) -> String {
    if let Some(urn) = entity_urn.map(str::trim).filter(|s| !s.is_empty()) {
        return urn.to_string();
    }
    if let Some(link) = link.map(str::trim).filter(|s| !s.is_empty()) {
        let canonical = link.split('?').next().unwrap_or(link);
        if !canonical.is_empty() {
            return canonical.to_string();
        }
    }
    format!("{company}-{title}-{location}")
}

/// Accepts RFC 3339 date-times and bare `YYYY-MM-DD` dates.
pub fn parse_posting_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Newest first; listings without a usable date always sort after dated ones.
pub fn compare_by_date_desc(a: &JobListing, b: &JobListing) -> Ordering {
    match (a.posted_at(), b.posted_at()) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort, so undated listings keep their relative order at the bottom.
pub fn sort_by_date_desc(listings: &mut [JobListing]) {
    listings.sort_by(compare_by_date_desc);
}
