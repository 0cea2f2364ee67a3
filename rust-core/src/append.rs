//! append.rs – locate a workbook, find where a sheet ends, and append a table after it.
//!
//! Every call re-reads the file, mutates it in memory and rewrites it in full. Two appends to
//! the same path must therefore never run concurrently: the second rewrite would discard the
//! first one's rows.

use crate::{CellValue, Table, Workbook};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum WorkbookLoadError {
    #[error("cannot read workbook {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is not a valid workbook: {detail}", .path.display())]
    Invalid { path: PathBuf, detail: String },
}

#[derive(Debug, Error)]
pub enum AppendError {
    #[error(transparent)]
    Load(#[from] WorkbookLoadError),
    #[error("cannot write sheet `{sheet}`: {detail}")]
    Write { sheet: String, detail: String },
    #[error("cannot persist workbook {}: {detail}", .path.display())]
    Persist { path: PathBuf, detail: String },
}

/// Result of looking for a workbook on disk. A missing file is not an error.
#[derive(Debug)]
pub enum Located<B> {
    Workbook(B),
    Empty,
}

impl<B> Located<B> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Located::Empty)
    }

    pub fn workbook(&self) -> Option<&B> {
        match self {
            Located::Workbook(b) => Some(b),
            Located::Empty => None,
        }
    }
}

/// Storage behind the appender. The spreadsheet package is one implementation; anything that
/// can report a per-sheet row count and append rows after it can stand in.
pub trait SheetStore: Sized {
    fn locate(path: &Path) -> Result<Located<Self>, WorkbookLoadError>;

    fn empty() -> Self;

    /// Occupied rows of `sheet`, `None` when the sheet does not exist.
    fn row_count(&self, sheet: &str) -> Option<u32>;

    fn ensure_sheet(&mut self, sheet: &str) -> anyhow::Result<()>;

    /// Writes `rows` starting right after `cursor`; returns the last written row.
    fn write_rows(&mut self, sheet: &str, cursor: u32, rows: &[Vec<CellValue>])
    -> anyhow::Result<u32>;

    fn persist(&self, path: &Path) -> anyhow::Result<()>;
}

impl SheetStore for Workbook {
    fn locate(path: &Path) -> Result<Located<Self>, WorkbookLoadError> {
        match std::fs::metadata(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Located::Empty),
            Err(source) => {
                return Err(WorkbookLoadError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
            Ok(_) => {}
        }

        Workbook::open(path)
            .map(Located::Workbook)
            .map_err(|err| match err.downcast::<io::Error>() {
                Ok(source) => WorkbookLoadError::Io {
                    path: path.to_path_buf(),
                    source,
                },
                Err(err) => WorkbookLoadError::Invalid {
                    path: path.to_path_buf(),
                    detail: format!("{err:#}"),
                },
            })
    }

    fn empty() -> Self {
        Workbook::new()
    }

    fn row_count(&self, sheet: &str) -> Option<u32> {
        self.last_row(sheet)
    }

    fn ensure_sheet(&mut self, sheet: &str) -> anyhow::Result<()> {
        if !self.has_sheet(sheet) {
            self.add_worksheet(sheet)?;
        }
        Ok(())
    }

    fn write_rows(
        &mut self,
        sheet: &str,
        cursor: u32,
        rows: &[Vec<CellValue>],
    ) -> anyhow::Result<u32> {
        self.write_rows_at(sheet, cursor, rows)
    }

    fn persist(&self, path: &Path) -> anyhow::Result<()> {
        self.save(path)
    }
}

/// What an append call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The dataset was empty; the file was not touched.
    Skipped,
    /// Rows `first_row..=last_row` (1-based, header included) were written.
    Written { first_row: u32, last_row: u32 },
}

impl AppendOutcome {
    pub fn rows_written(&self) -> u32 {
        match self {
            AppendOutcome::Skipped => 0,
            AppendOutcome::Written {
                first_row,
                last_row,
            } => last_row + 1 - first_row,
        }
    }
}

/// When the table's header row is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPolicy {
    Always,
    Never,
    /// Only when the sheet has no rows yet (cursor 0).
    WhenSheetIsNew,
}

impl HeaderPolicy {
    fn applies_at(self, cursor: u32) -> bool {
        match self {
            HeaderPolicy::Always => true,
            HeaderPolicy::Never => false,
            HeaderPolicy::WhenSheetIsNew => cursor == 0,
        }
    }
}

impl From<bool> for HeaderPolicy {
    fn from(write_header: bool) -> Self {
        if write_header {
            HeaderPolicy::Always
        } else {
            HeaderPolicy::Never
        }
    }
}

/// Opens the workbook at `path`, or reports [`Located::Empty`] when there is no file.
pub fn locate<P: AsRef<Path>>(path: P) -> Result<Located<Workbook>, WorkbookLoadError> {
    Workbook::locate(path.as_ref())
}

/// Index at which new rows start: the occupied row count of `sheet`, or 0 when either the
/// workbook or the sheet does not exist. Header rows count as occupied.
pub fn resolve_cursor<B: SheetStore>(located: &Located<B>, sheet: &str) -> u32 {
    located
        .workbook()
        .and_then(|book| book.row_count(sheet))
        .unwrap_or(0)
}

/// Appends `table` to `sheet` of the workbook at `path`, creating the file and the sheet when
/// needed. Other sheets keep their content. `header` is a plain `bool` or a [`HeaderPolicy`].
pub fn append<P: AsRef<Path>>(
    path: P,
    table: &Table,
    sheet: &str,
    header: impl Into<HeaderPolicy>,
) -> Result<AppendOutcome, AppendError> {
    append_to::<Workbook>(path.as_ref(), table, sheet, header)
}

/// The workbook is read once; the header decision uses the cursor resolved from that read.
pub fn append_to<B: SheetStore>(
    path: &Path,
    table: &Table,
    sheet: &str,
    header: impl Into<HeaderPolicy>,
) -> Result<AppendOutcome, AppendError> {
    if table.is_empty() {
        debug!(path = %path.display(), sheet, "empty dataset, workbook left untouched");
        return Ok(AppendOutcome::Skipped);
    }

    let located = B::locate(path)?;
    let cursor = resolve_cursor(&located, sheet);
    let write_header = header.into().applies_at(cursor);
    let mut book = match located {
        Located::Workbook(book) => book,
        Located::Empty => B::empty(),
    };

    let rows = table.rows_with_header(write_header);
    book.ensure_sheet(sheet)
        .map_err(|err| write_error(sheet, err))?;
    let last_row = book
        .write_rows(sheet, cursor, &rows)
        .map_err(|err| write_error(sheet, err))?;
    book.persist(path).map_err(|err| AppendError::Persist {
        path: path.to_path_buf(),
        detail: format!("{err:#}"),
    })?;

    info!(
        path = %path.display(),
        sheet,
        first_row = cursor + 1,
        last_row,
        header = write_header,
        "rows appended"
    );
    Ok(AppendOutcome::Written {
        first_row: cursor + 1,
        last_row,
    })
}

fn write_error(sheet: &str, err: anyhow::Error) -> AppendError {
    AppendError::Write {
        sheet: sheet.to_owned(),
        detail: format!("{err:#}"),
    }
}
