//! Searching the catalogue's OpenSearch (resto) API.
//!
//! [`Catalogue::query_features`] returns a [`FeatureQuery`], a pull-based cursor that
//! fetches one bounded page at a time as its buffer runs dry. Pagination never shows
//! through: pulling records one by one yields exactly what collecting them all would.
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::iter::FusedIterator;
use tracing::debug;
use url::Url;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::feature::Feature;
use crate::retry::{with_retry, RetryPolicy};

pub const MAX_RECORDS_KEY: &str = "maxRecords";
pub const MAX_RECORDS_LIMIT: usize = 2000;

const OPENSEARCH_NS: &str = "http://a9.com/-/spec/opensearch/1.1/";

#[derive(Clone, Debug, PartialEq)]
pub enum SearchValue {
    Text(String),
    Integer(i64),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    /// Sent as one query parameter per element.
    List(Vec<String>),
}

impl SearchValue {
    fn serialize(&self) -> Vec<String> {
        match self {
            Self::Text(s) => vec![s.clone()],
            Self::Integer(n) => vec![n.to_string()],
            Self::Date(d) => vec![d.format("%Y-%m-%d").to_string()],
            Self::DateTime(dt) => vec![dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()],
            Self::List(items) => items.clone(),
        }
    }
}

impl From<&str> for SearchValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SearchValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SearchValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<NaiveDate> for SearchValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<DateTime<Utc>> for SearchValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

impl From<Vec<String>> for SearchValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for SearchValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(str::to_string).collect())
    }
}

/// Search parameters by name. Names the client does not know are sent as they are.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchTerms {
    terms: BTreeMap<String, SearchValue>,
}

impl SearchTerms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<SearchValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<SearchValue>) {
        self.terms.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&SearchValue> {
        self.terms.get(key)
    }

    /// Parses `key=value` pairs as given on the command line.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut terms = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidSearchTerms(format!("Expected key=value, got \"{}\"", pair))
            })?;
            terms.insert(key.trim(), value.trim());
        }
        Ok(terms)
    }

    /// Page size for this search: 2000 when unset, otherwise an integer in [1, 2000].
    pub fn max_records(&self) -> Result<usize> {
        let raw = match self.terms.get(MAX_RECORDS_KEY) {
            None => return Ok(MAX_RECORDS_LIMIT),
            Some(SearchValue::Integer(n)) => n.to_string(),
            Some(SearchValue::Text(s)) => s.clone(),
            Some(other) => {
                return Err(Error::InvalidSearchTerms(format!(
                    "{} must be an integer, got {:?}",
                    MAX_RECORDS_KEY, other
                )))
            }
        };
        match raw.trim().parse::<usize>() {
            Ok(n) if (1..=MAX_RECORDS_LIMIT).contains(&n) => Ok(n),
            _ => Err(Error::InvalidSearchTerms(format!(
                "{} must be an integer between 1 and {}, got {}",
                MAX_RECORDS_KEY, MAX_RECORDS_LIMIT, raw
            ))),
        }
    }

    /// Checks values against the constraints a collection declares for them.
    /// Terms the collection does not declare are left for the server to judge.
    pub fn validate(&self, description: &CollectionDescription) -> Result<()> {
        for (key, value) in &self.terms {
            let Some(info) = description.get(key) else {
                debug!("Search term {} is not declared by the collection", key);
                continue;
            };
            for serialized in value.serialize() {
                info.check(key, &serialized)?;
            }
        }
        Ok(())
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        self.terms
            .iter()
            .flat_map(|(key, value)| {
                value
                    .serialize()
                    .into_iter()
                    .map(move |v| (key.clone(), v))
            })
            .collect()
    }
}

/// Constraints the catalogue declares for one search term.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterInfo {
    pub pattern: Option<String>,
    pub min_inclusive: Option<String>,
    pub max_inclusive: Option<String>,
    pub title: Option<String>,
}

pub type CollectionDescription = BTreeMap<String, ParameterInfo>;

impl ParameterInfo {
    fn check(&self, key: &str, value: &str) -> Result<()> {
        if let Some(pattern) = self.pattern.as_deref().filter(|p| !p.is_empty()) {
            match Regex::new(pattern) {
                // Anchored at the start only, like the server
                Ok(re) if re.find(value).is_some_and(|m| m.start() == 0) => {}
                Ok(_) => {
                    return Err(Error::InvalidSearchTerms(format!(
                        "{}={} does not match pattern {}",
                        key, value, pattern
                    )))
                }
                Err(e) => debug!("Ignoring unusable pattern for {}: {}", key, e),
            }
        }
        if let Some(min) = self.min_inclusive.as_deref().filter(|m| !m.is_empty()) {
            if parse_bound(key, value)? < parse_bound(key, min)? {
                return Err(Error::InvalidSearchTerms(format!(
                    "{}={} is less than {}",
                    key, value, min
                )));
            }
        }
        if let Some(max) = self.max_inclusive.as_deref().filter(|m| !m.is_empty()) {
            if parse_bound(key, value)? > parse_bound(key, max)? {
                return Err(Error::InvalidSearchTerms(format!(
                    "{}={} is greater than {}",
                    key, value, max
                )));
            }
        }
        Ok(())
    }
}

fn parse_bound(key: &str, value: &str) -> Result<i64> {
    value.trim().parse().map_err(|_| {
        Error::InvalidSearchTerms(format!("{}={} is not an integer", key, value))
    })
}

pub fn parse_description(content: &str) -> Result<CollectionDescription> {
    let doc = roxmltree::Document::parse(content)?;
    let mut parameters = CollectionDescription::new();

    let Some(url) = doc.descendants().find(|n| {
        n.has_tag_name((OPENSEARCH_NS, "Url")) && n.attribute("type") == Some("application/json")
    }) else {
        return Ok(parameters);
    };

    for node in url.children().filter(|n| n.is_element()) {
        if let Some(name) = node.attribute("name") {
            let info = ParameterInfo {
                pattern: node.attribute("pattern").map(str::to_string),
                min_inclusive: node.attribute("minInclusive").map(str::to_string),
                max_inclusive: node.attribute("maxInclusive").map(str::to_string),
                title: node.attribute("title").map(str::to_string),
            };
            parameters.insert(name.to_string(), info);
        }
    }
    Ok(parameters)
}

/// Entry point for catalogue searches.
pub struct Catalogue {
    base: Url,
    client: Client,
    retry: RetryPolicy,
    descriptions: Mutex<HashMap<String, CollectionDescription>>,
}

impl Catalogue {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            base: settings.catalogue.url.clone(),
            client: settings.http.api_client()?,
            retry: settings.retry,
            descriptions: Mutex::new(HashMap::new()),
        })
    }

    fn collection_url(&self, collection: &str, document: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["resto", "api", "collections", collection, document]);
        Ok(url)
    }

    /// Starts a lazy search. Nothing is requested until the first record is pulled, so an
    /// unknown collection only surfaces then. An out-of-range `maxRecords` is rejected here.
    pub fn query_features(&self, collection: &str, terms: &SearchTerms) -> Result<FeatureQuery> {
        let page_size = terms.max_records()?;
        let mut terms = terms.clone();
        terms.insert(MAX_RECORDS_KEY, page_size as i64);

        let mut search_url = self.collection_url(collection, "search.json")?;
        search_url
            .query_pairs_mut()
            .extend_pairs(terms.query_pairs());

        Ok(FeatureQuery {
            collection: collection.to_string(),
            client: self.client.clone(),
            retry: self.retry,
            search_url,
            page_size,
            buffer: VecDeque::new(),
            next_page: 1,
            offset: 0,
            total: None,
            exhausted: false,
        })
    }

    /// Search terms the collection accepts, with their declared constraints.
    pub fn describe_collection(&self, collection: &str) -> Result<CollectionDescription> {
        if let Some(description) = self.descriptions.lock().get(collection) {
            return Ok(description.clone());
        }

        let url = self.collection_url(collection, "describe.xml")?;
        let content = with_retry(&self.retry, "Collection description", || {
            let response = self
                .client
                .get(url.clone())
                .send()
                .map_err(Error::from_transport)?;
            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(Error::TransientNetwork(format!(
                    "Describe {} returned {}",
                    collection, status
                )));
            }
            if status == StatusCode::NOT_FOUND {
                return Err(Error::UnknownCollection(collection.to_string()));
            }
            response
                .error_for_status()?
                .text()
                .map_err(Error::from_transport)
        })?;

        let description = parse_description(&content)?;
        self.descriptions
            .lock()
            .insert(collection.to_string(), description.clone());
        Ok(description)
    }
}

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    features: Option<Vec<Feature>>,
    #[serde(default)]
    properties: PageProperties,
}

#[derive(Deserialize, Default)]
struct PageProperties {
    #[serde(rename = "totalResults")]
    total_results: Option<usize>,
}

/// Lazy, single-pass sequence of search results.
///
/// A page is fetched only when the buffer is empty. The sequence ends on an empty page
/// or once the number of records received reaches the server-reported total. Errors are
/// yielded once, after which the sequence is finished.
pub struct FeatureQuery {
    collection: String,
    client: Client,
    retry: RetryPolicy,
    search_url: Url,
    page_size: usize,
    buffer: VecDeque<Feature>,
    next_page: usize,
    offset: usize,
    total: Option<usize>,
    exhausted: bool,
}

impl FeatureQuery {
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pages_fetched(&self) -> usize {
        self.next_page - 1
    }

    /// Total number of matching records as reported by the server. Fetches the
    /// first page if nothing was requested yet; does not consume records.
    pub fn total_results(&mut self) -> Result<Option<usize>> {
        if self.pages_fetched() == 0 && !self.exhausted {
            self.fetch_page()?;
        }
        Ok(self.total)
    }

    /// Whether another record is available, fetching the next page if the buffer is empty.
    pub fn has_next(&mut self) -> Result<bool> {
        while self.buffer.is_empty() && !self.exhausted {
            self.fetch_page()?;
        }
        Ok(!self.buffer.is_empty())
    }

    fn page_url(&self) -> Url {
        let mut url = self.search_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("page", &self.next_page.to_string());
            // Exact counts are expensive server-side; ask once
            if self.next_page == 1 {
                pairs.append_pair("exactCount", "1");
            }
        }
        url
    }

    fn fetch_page(&mut self) -> Result<()> {
        let url = self.page_url();
        debug!("Fetching page {} of {}: {}", self.next_page, self.collection, url);

        let page: SearchPage = with_retry(&self.retry, "Search page", || {
            let response = self
                .client
                .get(url.clone())
                .send()
                .map_err(Error::from_transport)?;
            let status = response.status();
            if status.is_success() {
                let body = response.text().map_err(Error::from_transport)?;
                // Usually a truncated body, so worth another attempt
                return serde_json::from_str(&body).map_err(|e| {
                    Error::TransientNetwork(format!("Unreadable search page: {}", e))
                });
            }
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(Error::TransientNetwork(format!(
                    "Search returned {}",
                    status
                )));
            }
            if status == StatusCode::NOT_FOUND {
                return Err(Error::UnknownCollection(self.collection.clone()));
            }
            let body = response.text().unwrap_or_default();
            Err(Error::InvalidSearchTerms(format!("{}: {}", status, body)))
        })?;

        self.next_page += 1;
        if let Some(total) = page.properties.total_results {
            self.total = Some(total);
        }

        let features = page.features.unwrap_or_default();
        let received = features.len();
        self.offset += received;
        self.buffer.extend(features);

        let reached_total = self.total.is_some_and(|total| self.offset >= total);
        if received == 0 || reached_total {
            self.exhausted = true;
        }
        debug!(
            "Received {} records from {} ({} so far, total {:?})",
            received, self.collection, self.offset, self.total
        );
        Ok(())
    }
}

impl Iterator for FeatureQuery {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => self.buffer.pop_front().map(Ok),
            Ok(false) => None,
            Err(e) => {
                self.exhausted = true;
                self.buffer.clear();
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for FeatureQuery {}
