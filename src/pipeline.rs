use crate::{
    api::AnalyticsSource,
    config::{Config, DateWindow},
    error::BackupError,
    report::{QueryRequest, ReportDataset},
};
use gsc_core::{AppendOutcome, HeaderPolicy};
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    /// Goes into the workbook file name.
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetSummary {
    pub site: String,
    pub sheet: &'static str,
    pub fetched: usize,
    pub dropped: usize,
    pub written: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sheets: Vec<SheetSummary>,
}

impl RunSummary {
    pub fn rows_written(&self) -> u64 {
        self.sheets.iter().map(|s| u64::from(s.written)).sum()
    }
}

/// One backup run: every site, every enabled report, strictly one after the other.
pub struct Pipeline<'a, S> {
    source: &'a S,
    config: &'a Config,
    window: DateWindow,
}

impl<'a, S: AnalyticsSource> Pipeline<'a, S> {
    pub fn new(source: &'a S, config: &'a Config, window: DateWindow) -> Self {
        Self {
            source,
            config,
            window,
        }
    }

    /// Configured sites, plus the verified ones when discovery is on.
    ///
    /// A configured site the account cannot see is still queried; the API answers for it.
    pub fn sites(&self) -> Result<Vec<Site>, BackupError> {
        let verified = self.source.verified_sites()?;
        let mut sites: Vec<Site> = self
            .config
            .sites
            .iter()
            .map(|(name, url)| Site {
                name: name.clone(),
                url: url.clone(),
            })
            .collect();

        for site in &sites {
            if !verified.contains(&site.url) {
                warn!(site = %site.name, url = %site.url, "site is not among the verified properties");
            }
        }

        if self.config.discover_verified_sites {
            for url in verified {
                if sites.iter().any(|s| s.url == url) {
                    continue;
                }
                let Some(name) = site_name_from_url(&url) else {
                    warn!(%url, "cannot derive a file name for site, skipped");
                    continue;
                };
                if sites.iter().any(|s| s.name == name) {
                    warn!(%url, %name, "site name already taken, skipped");
                    continue;
                }
                sites.push(Site { name, url });
            }
        }
        Ok(sites)
    }

    pub fn run(&self) -> Result<RunSummary, BackupError> {
        let sites = self.sites()?;
        info!(
            sites = sites.len(),
            start = %self.window.start,
            end = %self.window.end,
            "backup started"
        );

        let mut summary = RunSummary::default();
        for site in &sites {
            self.backup_site(site, &mut summary)?;
        }
        Ok(summary)
    }

    pub fn backup_site(&self, site: &Site, summary: &mut RunSummary) -> Result<(), BackupError> {
        let path = self.config.workbook_path(&site.name);
        let header = if self.config.write_headers {
            HeaderPolicy::WhenSheetIsNew
        } else {
            HeaderPolicy::Never
        };

        for &kind in &self.config.reports {
            let request = QueryRequest::new(kind, &self.window, self.config);
            let rows = self.source.query(&site.url, &request)?;
            let fetched = rows.len();
            let dataset = ReportDataset::reshape(kind, rows);
            let sheet = dataset.sheet_name();

            let outcome = gsc_core::append(&path, &dataset.table, sheet, header)?;
            if outcome == AppendOutcome::Skipped {
                info!(site = %site.name, sheet, "no rows returned");
            }

            summary.sheets.push(SheetSummary {
                site: site.name.clone(),
                sheet,
                fetched,
                dropped: dataset.dropped,
                written: outcome.rows_written(),
            });
        }
        Ok(())
    }
}

/// `https://www.example.com/` -> `www.example.com`
pub fn site_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_owned)
}
