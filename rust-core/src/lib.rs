//! gsc-core – XLSX package editor and the append-only sheet writer built on top of it.
//!
//! The editor keeps the worksheet XML in memory and splices new `<row>` elements in front of
//! `</sheetData>`; everything it did not touch is copied from the source archive unchanged.

mod append;
mod files_part;
mod read_part;
pub mod table;

pub use append::{
    AppendError, AppendOutcome, HeaderPolicy, Located, SheetStore, WorkbookLoadError, append,
    append_to, locate, resolve_cursor,
};
pub use table::{CellValue, Table};

use anyhow::{Context, Result, bail};
use quick_xml::{
    Reader, Writer,
    events::{BytesStart, BytesText, Event},
};
use regex::Regex;
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::LazyLock,
};
use ::zip as zip_crate;

pub(crate) const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
pub(crate) const WORKBOOK_PART: &str = "xl/workbook.xml";
pub(crate) const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
pub(crate) const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

static CELL_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$?([A-Za-z]{1,3})\$?([0-9]+)$").expect("cell reference pattern compiles")
});

/// One worksheet of the package.
#[derive(Debug, Clone)]
pub(crate) struct SheetPart {
    name: String,
    part_path: String,
    xml: Vec<u8>,
    last_row: u32,
    dirty: bool,
}

/// `Workbook` is an XLSX package held in memory: the manifests, every worksheet, and the file
/// it was read from (if any) so untouched entries can be copied verbatim on save.
#[derive(Debug, Clone)]
pub struct Workbook {
    src_path: Option<PathBuf>,
    entry_names: Vec<String>,
    content_types_xml: Vec<u8>,
    workbook_xml: Vec<u8>,
    rels_xml: Vec<u8>,
    shared_strings: Vec<String>,
    sheets: Vec<SheetPart>,
    new_files: Vec<(String, Vec<u8>)>, // parts that only exist in memory (fresh package)
}

/// Sheets
impl Workbook {
    /// Worksheet names in tab order.
    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn has_sheet(&self, sheet_name: &str) -> bool {
        self.sheet(sheet_name).is_some()
    }

    /// Number of the last occupied row (1-based), `None` if the sheet does not exist.
    pub fn last_row(&self, sheet_name: &str) -> Option<u32> {
        self.sheet(sheet_name).map(|s| s.last_row)
    }

    /// Raw worksheet XML as it will be written on save.
    pub fn sheet_xml(&self, sheet_name: &str) -> Option<&[u8]> {
        self.sheet(sheet_name).map(|s| s.xml.as_slice())
    }

    pub(crate) fn sheet(&self, sheet_name: &str) -> Option<&SheetPart> {
        self.sheets.iter().find(|s| same_sheet_name(&s.name, sheet_name))
    }

    fn sheet_mut(&mut self, sheet_name: &str) -> Option<&mut SheetPart> {
        self.sheets
            .iter_mut()
            .find(|s| same_sheet_name(&s.name, sheet_name))
    }
}

/// Excel treats sheet names that differ only by case as the same sheet.
pub(crate) fn same_sheet_name(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Rows
impl Workbook {
    /// Writes `rows` into `sheet_name` as rows `cursor + 1 ..` and returns the new last row.
    ///
    /// The cursor must not point inside the already written part of the sheet: rows are
    /// spliced in front of `</sheetData>`, so existing rows are never rewritten.
    pub fn write_rows_at(
        &mut self,
        sheet_name: &str,
        cursor: u32,
        rows: &[Vec<CellValue>],
    ) -> Result<u32> {
        let sheet = self
            .sheet_mut(sheet_name)
            .with_context(|| format!("Sheet `{sheet_name}` not found"))?;
        if cursor < sheet.last_row {
            bail!(
                "cursor {cursor} would overwrite `{sheet_name}` (last written row is {})",
                sheet.last_row
            );
        }

        // Buffer to accumulate XML for all new rows.
        let mut bulk_rows_xml = Vec::<u8>::new();
        let mut row_num = cursor;
        let mut width = 0usize;
        for row in rows {
            row_num += 1;
            width = width.max(row.len());
            bulk_rows_xml.extend_from_slice(&render_row(row_num, row)?);
        }

        expand_self_closing(&mut sheet.xml, "sheetData");
        let pos = memchr::memmem::rfind(&sheet.xml, b"</sheetData>")
            .context("</sheetData> tag not found")?;
        sheet.xml.splice(pos..pos, bulk_rows_xml);
        sheet.last_row = row_num;
        sheet.dirty = true;
        refresh_dimension(&mut sheet.xml, width, row_num)?;

        Ok(row_num)
    }
}

fn render_row(row_num: u32, cells: &[CellValue]) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer
        .create_element("row")
        .with_attribute(("r", row_num.to_string().as_str()))
        .write_inner_content(|w| {
            for (col_idx, val) in cells.iter().enumerate() {
                let coord = format!("{}{}", col_idx_to_letters(col_idx), row_num);
                match val {
                    CellValue::Text(s) => {
                        w.create_element("c")
                            .with_attribute(("r", coord.as_str()))
                            .with_attribute(("t", "inlineStr"))
                            .write_inner_content(|w2| {
                                w2.create_element("is").write_inner_content(|w3| {
                                    let mut t = w3.create_element("t");
                                    if s.trim() != s {
                                        t = t.with_attribute(("xml:space", "preserve"));
                                    }
                                    t.write_text_content(BytesText::new(s))?;
                                    Ok(())
                                })?;
                                Ok(())
                            })?;
                    }
                    CellValue::Number(n) if n.is_finite() => {
                        write_value_cell(w, &coord, &n.to_string())?;
                    }
                    CellValue::Int(n) => {
                        write_value_cell(w, &coord, &n.to_string())?;
                    }
                    CellValue::Number(_) | CellValue::Empty => {}
                }
            }
            Ok(())
        })?;
    Ok(writer.into_inner())
}

fn write_value_cell<W: std::io::Write>(
    w: &mut Writer<W>,
    coord: &str,
    value: &str,
) -> std::io::Result<()> {
    w.create_element("c")
        .with_attribute(("r", coord))
        .write_inner_content(|w2| {
            w2.create_element("v")
                .write_text_content(BytesText::new(value))?;
            Ok(())
        })?;
    Ok(())
}

/// Turns `<tag/>` (or `<tag />`) into `<tag></tag>` so content can be inserted before the end tag.
pub(crate) fn expand_self_closing(xml: &mut Vec<u8>, tag: &str) {
    for form in [format!("<{tag}/>"), format!("<{tag} />")] {
        if let Some(pos) = memchr::memmem::find(xml, form.as_bytes()) {
            let expanded = format!("<{tag}></{tag}>");
            xml.splice(pos..pos + form.len(), expanded.into_bytes());
            return;
        }
    }
}

/// Keeps `<dimension ref="…">` covering everything up to `last_row`.
fn refresh_dimension(xml: &mut Vec<u8>, width: usize, last_row: u32) -> Result<()> {
    let Some(tag) = memchr::memmem::find(xml, b"<dimension") else {
        return Ok(());
    };
    let value_start = memchr::memmem::find(&xml[tag..], b"ref=\"")
        .map(|p| tag + p + 5)
        .context("<dimension> without ref")?;
    let value_end = memchr::memchr(b'"', &xml[value_start..])
        .map(|p| value_start + p)
        .context("unterminated <dimension ref>")?;

    let current = std::str::from_utf8(&xml[value_start..value_end])?.to_owned();
    let (first, last) = current
        .split_once(':')
        .unwrap_or((current.as_str(), current.as_str()));
    let first = if split_cell_ref(first).is_some() { first } else { "A1" };
    let known_width = split_cell_ref(last).map(|(col, _)| col + 1).unwrap_or(0);
    let last_col = col_idx_to_letters(known_width.max(width).max(1) - 1);

    let updated = format!("{first}:{last_col}{last_row}");
    xml.splice(value_start..value_end, updated.into_bytes());
    Ok(())
}

/// Converts a 0-based column index to Excel column letters (0 -> "A", 26 -> "AA").
pub(crate) fn col_idx_to_letters(mut idx: usize) -> String {
    let mut s = String::new();
    loop {
        let rem = idx % 26;
        s.insert(0, (b'A' + rem as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    s
}

/// Converts Excel column letters ("A", "AA") to a 0-based column index.
pub(crate) fn letters_to_col_idx(s: &str) -> usize {
    s.bytes().fold(0, |acc, b| {
        acc * 26 + (b.to_ascii_uppercase() - b'A' + 1) as usize
    }) - 1
}

/// "C12" -> (2, 12)
pub(crate) fn split_cell_ref(coord: &str) -> Option<(usize, u32)> {
    let caps = CELL_REF.captures(coord)?;
    let row = caps[2].parse::<u32>().ok()?;
    Some((letters_to_col_idx(&caps[1]), row))
}

pub(crate) fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes().with_checks(false).flatten().find_map(|a| {
        (a.key.as_ref() == key).then(|| unescape_lossy(&a.value))
    })
}

pub(crate) fn unescape_lossy(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    match quick_xml::escape::unescape(&s) {
        Ok(v) => v.into_owned(),
        Err(_) => s.into_owned(),
    }
}

/// Sheet names of a workbook on disk, in tab order.
pub fn scan<P: AsRef<Path>>(src: P) -> Result<Vec<String>> {
    let mut zip = zip_crate::ZipArchive::new(File::open(src)?)?;
    let mut wb = zip
        .by_name(WORKBOOK_PART)
        .context("workbook.xml not found")?;

    let mut wb_xml = Vec::with_capacity(wb.size() as usize);
    wb.read_to_end(&mut wb_xml)?;

    let mut reader = Reader::from_reader(wb_xml.as_slice());
    reader.config_mut().trim_text(true);

    let mut names = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"sheet" => {
                if let Some(n) = attr_value(e, b"name") {
                    names.push(n);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(names)
}
