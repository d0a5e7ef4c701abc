//! Listing source adapters: search URL construction and result-page parsing.

use jobfeed_core::{collapse_whitespace, derive_listing_id, JobListing};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "jobfeed-adapters";

pub const LINKEDIN_SOURCE_ID: &str = "linkedin";
pub const LINKEDIN_SEARCH_URL: &str =
    "https://www.linkedin.com/jobs-guest/jobs/api/seeMoreJobPostings/search";
pub const LINKEDIN_PAGE_SIZE: u32 = 25;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
    #[error("invalid search url: {0}")]
    Url(#[from] url::ParseError),
}

/// A paginated job-search provider.
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Offset increment between consecutive result pages.
    fn page_size(&self) -> u32;

    fn search_url(&self, keyword: &str, location: &str, offset: u32) -> Result<String, AdapterError>;

    /// Extra headers sent with every page request.
    fn request_headers(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    /// Pure function of the page body; listings missing a title or company are dropped.
    fn parse_listing(&self, html: &str) -> Result<Vec<JobListing>, AdapterError>;
}

/// LinkedIn's unauthenticated "see more jobs" fragment endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedInGuestAdapter;

impl ListingSource for LinkedInGuestAdapter {
    fn source_id(&self) -> &'static str {
        LINKEDIN_SOURCE_ID
    }

    fn page_size(&self) -> u32 {
        LINKEDIN_PAGE_SIZE
    }

    fn search_url(&self, keyword: &str, location: &str, offset: u32) -> Result<String, AdapterError> {
        let start = offset.to_string();
        let url = Url::parse_with_params(
            LINKEDIN_SEARCH_URL,
            &[
                ("keywords", keyword),
                ("location", location),
                ("start", start.as_str()),
            ],
        )?;
        Ok(url.to_string())
    }

    fn request_headers(&self) -> &'static [(&'static str, &'static str)] {
        &[("Accept", "*/*")]
    }

    fn parse_listing(&self, html: &str) -> Result<Vec<JobListing>, AdapterError> {
        let page = ListingPage::parse(html)?;
        Ok(page.listings().collect())
    }
}

pub fn linkedin_adapter() -> impl ListingSource {
    LinkedInGuestAdapter
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn ListingSource>> {
    match source_id {
        LINKEDIN_SOURCE_ID => Some(Box::new(LinkedInGuestAdapter)),
        _ => None,
    }
}

struct ListingSelectors {
    item: Selector,
    card: Selector,
    title: Selector,
    company_link: Selector,
    company: Selector,
    location: Selector,
    date: Selector,
    link: Selector,
    logo: Selector,
}

impl ListingSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            item: selector("li")?,
            card: selector("div.base-search-card")?,
            title: selector("h3.base-search-card__title")?,
            company_link: selector("h4.base-search-card__subtitle a")?,
            company: selector("h4.base-search-card__subtitle")?,
            location: selector("span.job-search-card__location")?,
            date: selector("time.job-search-card__listdate, time.job-search-card__listdate--new")?,
            link: selector("a.base-card__full-link")?,
            logo: selector("img.artdeco-entity-image")?,
        })
    }
}

fn selector(css: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

/// One parsed search-results page. Iterating it is lazy and can be repeated.
pub struct ListingPage {
    document: Html,
    selectors: ListingSelectors,
}

impl ListingPage {
    pub fn parse(html: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            document: Html::parse_document(html),
            selectors: ListingSelectors::new()?,
        })
    }

    pub fn listings(&self) -> impl Iterator<Item = JobListing> + '_ {
        self.document
            .select(&self.selectors.item)
            .filter_map(move |item| self.extract(item))
    }

    fn extract(&self, item: ElementRef<'_>) -> Option<JobListing> {
        let s = &self.selectors;

        let title = first_text(item, &s.title)?;
        let company = first_text(item, &s.company_link).or_else(|| first_text(item, &s.company))?;
        let location = first_text_raw(item, &s.location).unwrap_or_default();
        let date = first_attr(item, &s.date, "datetime");
        let link = first_attr(item, &s.link, "href");
        let logo = first_attr(item, &s.logo, "data-delayed-url")
            .or_else(|| first_attr(item, &s.logo, "src"));
        let urn = first_attr(item, &s.card, "data-entity-urn");

        let id = derive_listing_id(urn.as_deref(), link.as_deref(), &company, &title, &location);

        Some(JobListing {
            id,
            title,
            company,
            location,
            date,
            link: link.unwrap_or_default(),
            logo,
            lat: 0.0,
            lng: 0.0,
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

// Location keys the geocode cache, so only the ends are trimmed.
fn first_text_raw(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    first_text_raw(scope, sel).and_then(|t| text_or_none(collapse_whitespace(&t)))
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}
