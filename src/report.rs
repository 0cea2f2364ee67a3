//! Report kinds, the query bodies sent for them, and how their rows become sheet rows.

use crate::config::{Config, DateWindow};
use chrono::NaiveDate;
use gsc_core::{CellValue, Table};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const METRIC_COLUMNS: [&str; 4] = ["Clicks", "CTR", "Impressions", "Position"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Date,
    Page,
    Query,
    Device,
}

impl Dimension {
    /// Column label in the workbook.
    pub fn label(self) -> &'static str {
        match self {
            Dimension::Date => "Date",
            Dimension::Page => "Page",
            Dimension::Query => "Query",
            Dimension::Device => "Platform",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    ByDate,
    ByPageDate,
    ByQueryDate,
    ByDevice,
    ByQueryDatePage,
}

impl ReportKind {
    pub const ALL: [ReportKind; 5] = [
        ReportKind::ByDate,
        ReportKind::ByPageDate,
        ReportKind::ByQueryDate,
        ReportKind::ByDevice,
        ReportKind::ByQueryDatePage,
    ];

    /// Dimensions in the order the API returns them as `keys`.
    pub fn dimensions(self) -> &'static [Dimension] {
        use Dimension::*;
        match self {
            ReportKind::ByDate => &[Date],
            ReportKind::ByPageDate => &[Page, Date],
            ReportKind::ByQueryDate => &[Query, Date],
            ReportKind::ByDevice => &[Device],
            ReportKind::ByQueryDatePage => &[Query, Date, Page],
        }
    }

    pub fn sheet_name(self) -> &'static str {
        match self {
            ReportKind::ByDate => "Data by Date",
            ReportKind::ByPageDate => "Data by Page Date",
            ReportKind::ByQueryDate => "Data by Query Date",
            ReportKind::ByDevice => "Data by Device",
            ReportKind::ByQueryDatePage => "Data by Query Date Page",
        }
    }

    /// Metrics first, then one column per dimension.
    pub fn columns(self) -> Vec<String> {
        METRIC_COLUMNS
            .iter()
            .copied()
            .chain(self.dimensions().iter().map(|d| d.label()))
            .map(str::to_owned)
            .collect()
    }

    /// Only the three-dimension report is cleaned of incomplete rows.
    pub fn drops_incomplete_rows(self) -> bool {
        matches!(self, ReportKind::ByQueryDatePage)
    }
}

/// Body of `searchAnalytics/query`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub search_type: String,
    pub dimensions: Vec<Dimension>,
    pub row_limit: u32,
}

impl QueryRequest {
    pub fn new(kind: ReportKind, window: &DateWindow, config: &Config) -> Self {
        Self {
            start_date: window.start,
            end_date: window.end,
            search_type: config.search_type.clone(),
            dimensions: kind.dimensions().to_vec(),
            row_limit: config.row_limit,
        }
    }
}

/// One row of a Search Analytics response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReportRow {
    #[serde(default)]
    pub keys: Vec<Option<String>>,
    #[serde(default)]
    pub clicks: Option<f64>,
    #[serde(default)]
    pub ctr: Option<f64>,
    #[serde(default)]
    pub impressions: Option<f64>,
    #[serde(default)]
    pub position: Option<f64>,
}

impl ReportRow {
    fn has_all_metrics(&self) -> bool {
        self.clicks.is_some()
            && self.ctr.is_some()
            && self.impressions.is_some()
            && self.position.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportDataset {
    pub kind: ReportKind,
    pub table: Table,
    /// Rows removed because a key or metric was missing.
    pub dropped: usize,
}

impl ReportDataset {
    pub fn reshape(kind: ReportKind, rows: Vec<ReportRow>) -> Self {
        let width = kind.dimensions().len();
        let mut table = Table::new(kind.columns());
        let mut dropped = 0;

        for row in rows {
            let keys: Vec<Option<String>> = (0..width)
                .map(|i| row.keys.get(i).cloned().flatten())
                .collect();
            if kind.drops_incomplete_rows()
                && (keys.iter().any(Option::is_none) || !row.has_all_metrics())
            {
                dropped += 1;
                continue;
            }

            let mut cells: Vec<CellValue> = vec![
                row.clicks.into(),
                row.ctr.into(),
                row.impressions.map(|n| n.round() as i64).into(),
                row.position.into(),
            ];
            cells.extend(keys.into_iter().map(|key| match key {
                Some(value) => CellValue::Text(value),
                None => CellValue::Int(0),
            }));
            table.push_row(cells);
        }

        if dropped > 0 {
            debug!(report = ?kind, dropped, "incomplete rows removed");
        }
        Self {
            kind,
            table,
            dropped,
        }
    }

    pub fn sheet_name(&self) -> &'static str {
        self.kind.sheet_name()
    }
}
