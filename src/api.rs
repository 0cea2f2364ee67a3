use crate::{
    error::BackupError,
    report::{QueryRequest, ReportRow},
};
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;
use url::Url;

pub const API_BASE: &str = "https://www.googleapis.com/webmasters/v3/";

const UNVERIFIED_PERMISSION: &str = "siteUnverifiedUser";

/// Where report rows come from.
pub trait AnalyticsSource {
    /// Property URLs the account holds a verified permission on.
    fn verified_sites(&self) -> Result<Vec<String>, BackupError>;

    fn query(&self, site_url: &str, request: &QueryRequest) -> Result<Vec<ReportRow>, BackupError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteEntry {
    pub site_url: String,
    pub permission_level: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteList {
    #[serde(default)]
    site_entry: Vec<SiteEntry>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<ReportRow>,
}

/// Keeps verified `http(s)` properties; domain properties (`sc-domain:`) are skipped.
pub fn verified_site_urls(entries: Vec<SiteEntry>) -> Vec<String> {
    entries
        .into_iter()
        .filter(|e| e.permission_level != UNVERIFIED_PERMISSION && e.site_url.starts_with("http"))
        .map(|e| e.site_url)
        .collect()
}

/// Blocking client for the Search Console v3 API.
pub struct SearchConsole {
    http: Client,
    base: Url,
    access_token: String,
}

impl SearchConsole {
    pub fn new(access_token: impl Into<String>) -> Result<Self, BackupError> {
        Self::with_base(API_BASE, access_token)
    }

    pub fn with_base(base: &str, access_token: impl Into<String>) -> Result<Self, BackupError> {
        Ok(Self {
            http: Client::builder().build()?,
            base: Url::parse(base)?,
            access_token: access_token.into(),
        })
    }

    /// Appends `segments` to the base path, percent-encoding each one (site URLs included).
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, BackupError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| BackupError::Config {
                context: "api base",
                detail: format!("{} cannot carry a path", self.base),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackupError> {
        let response = request.bearer_auth(&self.access_token).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(BackupError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json()?)
    }
}

impl AnalyticsSource for SearchConsole {
    fn verified_sites(&self) -> Result<Vec<String>, BackupError> {
        let url = self.endpoint(&["sites"])?;
        let list: SiteList = self.send(self.http.get(url))?;
        debug!(listed = list.site_entry.len(), "site list fetched");
        Ok(verified_site_urls(list.site_entry))
    }

    fn query(&self, site_url: &str, request: &QueryRequest) -> Result<Vec<ReportRow>, BackupError> {
        let url = self.endpoint(&["sites", site_url, "searchAnalytics", "query"])?;
        let response: QueryResponse = self.send(self.http.post(url).json(request))?;
        debug!(
            site = site_url,
            dimensions = ?request.dimensions,
            rows = response.rows.len(),
            "query answered"
        );
        Ok(response.rows)
    }
}
