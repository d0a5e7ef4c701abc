//! Location resolution for listings.
//!
//! A `(company, location)` pair is resolved through three tiers, cheapest first:
//!
//! 1. the persistent [`LocationCache`], when it holds real (non-sentinel) coordinates;
//! 2. the compiled [`Gazetteer`] of well-known localities;
//! 3. an external [`Geocoder`], only for keys the cache has never seen.
//!
//! Every external outcome, including "no match", is written back to the cache,
//! so each unique key reaches the external service at most once over the
//! lifetime of the cache file.

use std::sync::Arc;

use async_trait::async_trait;
use jobfeed_core::{cache_key, Coordinates};
use jobfeed_storage::{HttpGet, LocationCacheMap};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "jobfeed-geocode";

pub const NOMINATIM_SEARCH_URL: &str = "https://nominatim.openstreetmap.org/search";

/// In-memory view of the location cache file, passed explicitly to the resolver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationCache {
    entries: LocationCacheMap,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(entries: LocationCacheMap) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<Coordinates> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, coords: Coordinates) {
        self.entries.insert(key.into(), coords);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_map(&self) -> &LocationCacheMap {
        &self.entries
    }

    pub fn into_map(self) -> LocationCacheMap {
        self.entries
    }
}

const REGION_SUFFIXES: &[&str] = &[
    ", karnataka, india",
    ", india",
    ", karnataka",
    ", bangalore urban",
    ", bengaluru",
    ", bangalore",
    " greater bengaluru area",
];

const BENGALURU_LOCALITIES: &[(&str, f64, f64)] = &[
    ("bengaluru", 12.9716, 77.5946),
    ("bangalore", 12.9716, 77.5946),
    ("bangalore urban", 12.9716, 77.5946),
    ("hsr layout", 12.9116, 77.6474),
    ("koramangala", 12.9352, 77.6245),
    ("whitefield", 12.9698, 77.7500),
    ("indiranagar", 12.9784, 77.6408),
    ("electronic city", 12.8452, 77.6602),
    ("marathahalli", 12.9591, 77.6974),
    ("bellandur", 12.9304, 77.6784),
    ("sarjapur", 12.8604, 77.7862),
    ("sarjapur road", 12.9100, 77.6870),
    ("btm layout", 12.9166, 77.6101),
    ("jp nagar", 12.9063, 77.5857),
    ("jayanagar", 12.9250, 77.5938),
    ("banashankari", 12.9255, 77.5468),
    ("mg road", 12.9756, 77.6050),
    ("domlur", 12.9610, 77.6387),
    ("hebbal", 13.0358, 77.5970),
    ("yelahanka", 13.1007, 77.5963),
    ("malleshwaram", 13.0031, 77.5643),
    ("rajajinagar", 12.9910, 77.5525),
    ("yeshwanthpur", 13.0280, 77.5409),
    ("manyata tech park", 13.0475, 77.6210),
    ("kr puram", 13.0075, 77.6959),
    ("mahadevapura", 12.9882, 77.6895),
    ("bommanahalli", 12.9081, 77.6476),
    ("hosur road", 12.8890, 77.6390),
];

/// Strip trailing region qualifiers (", Karnataka, India", ", Bengaluru", ...) from a
/// lowercased location until none remain.
pub fn normalize_locality(location: &str) -> String {
    let mut current = location.trim().to_lowercase();
    loop {
        let stripped = REGION_SUFFIXES
            .iter()
            .find_map(|suffix| current.strip_suffix(suffix).map(|rest| rest.trim_end().to_string()));
        match stripped {
            Some(rest) if !rest.is_empty() => current = rest,
            _ => return current,
        }
    }
}

/// Read-only table of known locality names to coordinates.
#[derive(Debug, Clone)]
pub struct Gazetteer {
    entries: &'static [(&'static str, f64, f64)],
}

impl Default for Gazetteer {
    fn default() -> Self {
        Self::bengaluru()
    }
}

impl Gazetteer {
    pub fn bengaluru() -> Self {
        Self {
            entries: BENGALURU_LOCALITIES,
        }
    }

    pub fn from_static(entries: &'static [(&'static str, f64, f64)]) -> Self {
        Self { entries }
    }

    fn exact(&self, name: &str) -> Option<Coordinates> {
        self.entries
            .iter()
            .find(|(known, _, _)| *known == name)
            .map(|(_, lat, lng)| Coordinates::new(*lat, *lng))
    }

    /// The raw lowercased location is tried before its suffix-stripped form.
    pub fn lookup(&self, location: &str) -> Option<Coordinates> {
        let raw = location.trim().to_lowercase();
        self.exact(&raw)
            .or_else(|| self.exact(&normalize_locality(&raw)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeocodeOutcome {
    Found(Coordinates),
    NotFound,
    Failed,
}

/// The external tier: one free-text query in, at most one best match out.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> GeocodeOutcome;
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

/// OpenStreetMap Nominatim search (`format=json`, `limit=1`) over a paced fetcher.
pub struct NominatimGeocoder {
    http: Arc<dyn HttpGet>,
    search_url: String,
}

impl NominatimGeocoder {
    pub fn new(http: Arc<dyn HttpGet>) -> Self {
        Self::with_search_url(http, NOMINATIM_SEARCH_URL)
    }

    pub fn with_search_url(http: Arc<dyn HttpGet>, search_url: impl Into<String>) -> Self {
        Self {
            http,
            search_url: search_url.into(),
        }
    }

    fn query_url(&self, query: &str) -> Result<String, url::ParseError> {
        let url = Url::parse_with_params(
            &self.search_url,
            &[("q", query), ("format", "json"), ("limit", "1")],
        )?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> GeocodeOutcome {
        let url = match self.query_url(query) {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, query, "could not build geocoder url");
                return GeocodeOutcome::Failed;
            }
        };

        let resp = match self.http.fetch_with_policy(&url, &[]).await {
            Ok(resp) => resp,
            Err(reason) => {
                warn!(%reason, query, "geocoder request exhausted");
                return GeocodeOutcome::Failed;
            }
        };
        if !resp.is_success() {
            warn!(status = %resp.status, query, "geocoder returned an error status");
            return GeocodeOutcome::Failed;
        }

        let places: Vec<NominatimPlace> = match serde_json::from_slice(&resp.body) {
            Ok(places) => places,
            Err(err) => {
                warn!(error = %err, query, "could not parse geocoder response");
                return GeocodeOutcome::Failed;
            }
        };

        let Some(best) = places.first() else {
            return GeocodeOutcome::NotFound;
        };
        match (best.lat.parse::<f64>(), best.lon.parse::<f64>()) {
            (Ok(lat), Ok(lng)) => GeocodeOutcome::Found(Coordinates::new(lat, lng)),
            _ => {
                warn!(query, lat = %best.lat, lon = %best.lon, "geocoder returned unparseable coordinates");
                GeocodeOutcome::Failed
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    Cache,
    Gazetteer,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub coordinates: Coordinates,
    pub tier: ResolutionTier,
}

impl Resolution {
    pub fn is_sentinel(&self) -> bool {
        self.coordinates.is_sentinel()
    }
}

pub struct GeocodeResolver {
    cache: LocationCache,
    gazetteer: Gazetteer,
    geocoder: Arc<dyn Geocoder>,
    external_budget: Option<usize>,
    external_calls: usize,
}

impl GeocodeResolver {
    pub fn new(cache: LocationCache, geocoder: Arc<dyn Geocoder>) -> Self {
        Self {
            cache,
            gazetteer: Gazetteer::default(),
            geocoder,
            external_budget: None,
            external_calls: 0,
        }
    }

    pub fn with_gazetteer(mut self, gazetteer: Gazetteer) -> Self {
        self.gazetteer = gazetteer;
        self
    }

    /// Cap on external lookups for the lifetime of this resolver (one run).
    pub fn with_external_budget(mut self, budget: usize) -> Self {
        self.external_budget = Some(budget);
        self
    }

    pub fn cache(&self) -> &LocationCache {
        &self.cache
    }

    pub fn into_cache(self) -> LocationCache {
        self.cache
    }

    pub fn external_calls(&self) -> usize {
        self.external_calls
    }

    pub fn budget_exhausted(&self) -> bool {
        self.external_budget
            .is_some_and(|budget| self.external_calls >= budget)
    }

    /// Raw cache entry for the pair, sentinel included.
    pub fn cache_lookup(&self, company: &str, location: &str) -> Option<Coordinates> {
        self.cache.get(&cache_key(company, location))
    }

    pub fn gazetteer_lookup(&self, location: &str) -> Option<Coordinates> {
        self.gazetteer.lookup(location)
    }

    /// Resolve one pair. `None` means the external tier was needed but the run's
    /// budget is spent; the key stays uncached and is retried on a later run.
    pub async fn resolve(&mut self, company: &str, location: &str) -> Option<Resolution> {
        let key = cache_key(company, location);
        let cached = self.cache.get(&key);

        if let Some(coords) = cached.filter(|c| !c.is_sentinel()) {
            return Some(Resolution {
                coordinates: coords,
                tier: ResolutionTier::Cache,
            });
        }

        if let Some(coords) = self.gazetteer.lookup(location) {
            debug!(%key, "resolved from gazetteer");
            return Some(Resolution {
                coordinates: coords,
                tier: ResolutionTier::Gazetteer,
            });
        }

        if let Some(sentinel) = cached {
            return Some(Resolution {
                coordinates: sentinel,
                tier: ResolutionTier::Cache,
            });
        }

        if self.budget_exhausted() {
            return None;
        }

        self.external_calls += 1;
        info!(%key, "geocoding");
        let coords = match self.geocoder.geocode(&key).await {
            GeocodeOutcome::Found(coords) => coords,
            GeocodeOutcome::NotFound => {
                info!(%key, "no geocoder match");
                Coordinates::SENTINEL
            }
            GeocodeOutcome::Failed => Coordinates::SENTINEL,
        };
        self.cache.insert(key, coords);

        Some(Resolution {
            coordinates: coords,
            tier: ResolutionTier::External,
        })
    }
}
