use crate::{
    CONTENT_TYPES_PART, SHARED_STRINGS_PART, SheetPart, WORKBOOK_PART, WORKBOOK_RELS_PART,
    Workbook, attr_value, expand_self_closing, read_part::parse_shared_strings, same_sheet_name,
};
use ::zip as zip_crate;
use anyhow::{Context, Result, bail};
use quick_xml::{Reader, escape::escape, events::Event};
use std::{
    collections::HashSet,
    fs::{self, File},
    io::{Read, Seek, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::debug;

const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const WORKSHEET_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
const WORKSHEET_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";

const EMPTY_SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><dimension ref="A1"/><sheetData></sheetData></worksheet>"#;

// ── skeleton of a fresh package ──────────────────────────────────────
const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets></sheets></workbook>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#;

const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/></cellXfs><cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles></styleSheet>"#;

/// `<Relationship>` from workbook.xml.rels
#[derive(Debug, Clone)]
struct Relationship {
    id: String,
    rel_type: String,
    target: String,
}

impl Default for Workbook {
    fn default() -> Self {
        Self::new()
    }
}

/// Work with files
impl Workbook {
    /// An empty package with no sheets; it becomes a valid file once a sheet is added.
    pub fn new() -> Self {
        Self {
            src_path: None,
            entry_names: Vec::new(),
            content_types_xml: CONTENT_TYPES.as_bytes().to_vec(),
            workbook_xml: WORKBOOK.as_bytes().to_vec(),
            rels_xml: WORKBOOK_RELS.as_bytes().to_vec(),
            shared_strings: Vec::new(),
            sheets: Vec::new(),
            new_files: vec![
                ("_rels/.rels".to_owned(), ROOT_RELS.as_bytes().to_vec()),
                ("xl/styles.xml".to_owned(), STYLES.as_bytes().to_vec()),
            ],
        }
    }

    /// Opens a workbook and loads every worksheet so row counts are known up front.
    pub fn open<P: AsRef<Path>>(src: P) -> Result<Self> {
        let src_path = src.as_ref().to_path_buf();
        let mut zip = zip_crate::ZipArchive::new(File::open(&src_path)?)?;
        let entry_names: Vec<String> = zip.file_names().map(str::to_owned).collect();

        let content_types_xml = read_entry(&mut zip, CONTENT_TYPES_PART)?;
        let workbook_xml = read_entry(&mut zip, WORKBOOK_PART)?;
        let rels_xml = read_entry(&mut zip, WORKBOOK_RELS_PART)?;

        let shared_strings = if entry_names.iter().any(|n| n == SHARED_STRINGS_PART) {
            parse_shared_strings(&read_entry(&mut zip, SHARED_STRINGS_PART)?)?
        } else {
            Vec::new()
        };

        let relationships = parse_relationships(&rels_xml)?;
        let mut sheets = Vec::new();
        for (name, rid) in parse_sheet_entries(&workbook_xml)? {
            let rel = relationships
                .iter()
                .find(|r| r.id == rid)
                .with_context(|| {
                    format!("Relationship `{rid}` for sheet `{name}` not found in workbook.xml.rels")
                })?;
            // chartsheets and dialog sheets are carried over untouched
            if rel.rel_type != WORKSHEET_REL_TYPE {
                continue;
            }
            let part_path = resolve_target(&rel.target);
            let xml = read_entry(&mut zip, &part_path)?;
            let last_row = calc_last_row(&xml)
                .with_context(|| format!("{part_path} is not valid worksheet XML"))?;
            sheets.push(SheetPart {
                name,
                part_path,
                xml,
                last_row,
                dirty: false,
            });
        }
        debug!(path = %src_path.display(), sheets = sheets.len(), "workbook opened");

        Ok(Self {
            src_path: Some(src_path),
            entry_names,
            content_types_xml,
            workbook_xml,
            rels_xml,
            shared_strings,
            sheets,
            new_files: Vec::new(),
        })
    }

    /// Saves the package to `dst`, replacing the file atomically.
    ///
    /// Entries nobody modified are raw-copied from the source archive (compressed bytes
    /// included), so other sheets keep their exact content. The archive is assembled in a
    /// temporary file next to `dst` and renamed over it once complete.
    pub fn save<P: AsRef<Path>>(&self, dst: P) -> Result<()> {
        let dst = dst.as_ref();
        let dir = match dst.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        {
            let mut zout = zip_crate::ZipWriter::new(&mut tmp);
            let opt: zip_crate::write::FileOptions<'_, ()> =
                zip_crate::write::FileOptions::default()
                    .compression_method(zip_crate::CompressionMethod::Deflated)
                    .compression_level(Some(1));

            let mut written: HashSet<String> = HashSet::new();

            if let Some(src) = &self.src_path {
                let mut zin = zip_crate::ZipArchive::new(File::open(src)?)?;
                for i in 0..zin.len() {
                    let file = zin.by_index_raw(i)?;
                    let name = file.name().to_owned();
                    match self.in_memory_part(&name) {
                        Some(content) => {
                            zout.start_file(name.as_str(), opt)?;
                            zout.write_all(content)?;
                        }
                        None => zout.raw_copy_file(file)?,
                    }
                    written.insert(name);
                }
            }

            // parts that are not in the source archive yet
            for (name, content) in self.pending_parts() {
                if written.insert(name.to_owned()) {
                    zout.start_file(name, opt)?;
                    zout.write_all(content)?;
                }
            }

            zout.finish()?;
        }
        tmp.persist(dst)
            .with_context(|| format!("cannot replace {}", dst.display()))?;
        Ok(())
    }

    /// Content that must be written from memory instead of copied from the source.
    fn in_memory_part(&self, name: &str) -> Option<&[u8]> {
        match name {
            CONTENT_TYPES_PART => Some(self.content_types_xml.as_slice()),
            WORKBOOK_PART => Some(self.workbook_xml.as_slice()),
            WORKBOOK_RELS_PART => Some(self.rels_xml.as_slice()),
            _ => self
                .sheets
                .iter()
                .find(|s| s.dirty && s.part_path == name)
                .map(|s| s.xml.as_slice())
                .or_else(|| {
                    self.new_files
                        .iter()
                        .find(|(p, _)| p == name)
                        .map(|(_, c)| c.as_slice())
                }),
        }
    }

    /// Every part a fresh archive needs, manifests first.
    fn pending_parts(&self) -> Vec<(&str, &[u8])> {
        let mut parts: Vec<(&str, &[u8])> = vec![(CONTENT_TYPES_PART, self.content_types_xml.as_slice())];
        parts.extend(
            self.new_files
                .iter()
                .map(|(p, c)| (p.as_str(), c.as_slice())),
        );
        parts.push((WORKBOOK_PART, self.workbook_xml.as_slice()));
        parts.push((WORKBOOK_RELS_PART, self.rels_xml.as_slice()));
        parts.extend(
            self.sheets
                .iter()
                .filter(|s| s.dirty)
                .map(|s| (s.part_path.as_str(), s.xml.as_slice())),
        );
        parts
    }

    /// Adds a new empty worksheet named `sheet_name` after the existing tabs.
    pub fn add_worksheet(&mut self, sheet_name: &str) -> Result<&mut Self> {
        validate_sheet_name(sheet_name)?;
        if parse_sheet_entries(&self.workbook_xml)?
            .iter()
            .any(|(n, _)| same_sheet_name(n, sheet_name))
        {
            bail!("Sheet {} already exists", sheet_name);
        }

        // ── free sheetId / rId / sheet#.xml ─────────────────────────────
        let mut max_sheet_id = 0u32;
        let mut rdr = Reader::from_reader(self.workbook_xml.as_slice());
        rdr.config_mut().trim_text(true);
        loop {
            match rdr.read_event()? {
                Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"sheet" => {
                    if let Some(id) = attr_value(e, b"sheetId") {
                        max_sheet_id = max_sheet_id.max(id.parse::<u32>().unwrap_or(0));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        let new_sheet_id = max_sheet_id + 1;

        let new_rid = parse_relationships(&self.rels_xml)?
            .iter()
            .filter_map(|r| r.id.strip_prefix("rId")?.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1;

        let sheet_file_number = |path: &str| {
            path.strip_prefix("xl/worksheets/sheet")
                .and_then(|s| s.strip_suffix(".xml"))
                .and_then(|s| s.parse::<usize>().ok())
        };
        let max_sheet_file = self
            .entry_names
            .iter()
            .map(String::as_str)
            .chain(self.sheets.iter().map(|s| s.part_path.as_str()))
            .filter_map(sheet_file_number)
            .max()
            .unwrap_or(0);
        let new_sheet_file = max_sheet_file + 1;
        let new_sheet_path = format!("xl/worksheets/sheet{new_sheet_file}.xml");
        let new_sheet_target = format!("worksheets/sheet{new_sheet_file}.xml");

        // ── new tags ─────────────────────────────────────────────────────
        let sheet_tag = format!(
            r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
            escape(sheet_name),
            new_sheet_id,
            new_rid
        );
        let rel_tag = format!(
            r#"<Relationship Id="rId{new_rid}" Type="{WORKSHEET_REL_TYPE}" Target="{new_sheet_target}"/>"#
        );
        let override_tag = format!(
            r#"<Override PartName="/{new_sheet_path}" ContentType="{WORKSHEET_CONTENT_TYPE}"/>"#
        );

        let mut wb_xml = self.workbook_xml.clone();
        ensure_rel_namespace(&mut wb_xml)?;
        expand_self_closing(&mut wb_xml, "sheets");
        insert_before_last(&mut wb_xml, b"</sheets>", sheet_tag.as_bytes())
            .context("</sheets> not found in workbook.xml")?;

        let mut rels_xml = self.rels_xml.clone();
        insert_before_last(&mut rels_xml, b"</Relationships>", rel_tag.as_bytes())
            .context("</Relationships> not found in workbook.xml.rels")?;

        let mut ct_xml = self.content_types_xml.clone();
        insert_before_last(&mut ct_xml, b"</Types>", override_tag.as_bytes())
            .context("</Types> not found in [Content_Types].xml")?;

        // state changes only once every manifest took the new sheet
        self.workbook_xml = wb_xml;
        self.rels_xml = rels_xml;
        self.content_types_xml = ct_xml;
        self.sheets.push(SheetPart {
            name: sheet_name.to_owned(),
            part_path: new_sheet_path,
            xml: EMPTY_SHEET.as_bytes().to_vec(),
            last_row: 0,
            dirty: true,
        });
        debug!(sheet = sheet_name, sheet_id = new_sheet_id, "worksheet added");

        Ok(self)
    }
}

fn read_entry<R: Read + Seek>(zip: &mut zip_crate::ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut f = zip
        .by_name(name)
        .with_context(|| format!("{name} not found"))?;
    let mut buf = Vec::with_capacity(f.size() as usize);
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

/// (name, r:id) of every `<sheet>` in workbook.xml, in tab order.
fn parse_sheet_entries(workbook_xml: &[u8]) -> Result<Vec<(String, String)>> {
    let mut rdr = Reader::from_reader(workbook_xml);
    rdr.config_mut().trim_text(true);

    let mut entries = Vec::new();
    loop {
        match rdr.read_event()? {
            Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"sheet" => {
                let mut name = None;
                let mut rid = None;
                for a in e.attributes().with_checks(false).flatten() {
                    if a.key.as_ref() == b"name" {
                        name = Some(crate::unescape_lossy(&a.value));
                    } else if a.key.prefix().is_some() && a.key.local_name().as_ref() == b"id" {
                        rid = Some(crate::unescape_lossy(&a.value));
                    }
                }
                match (name, rid) {
                    (Some(n), Some(r)) => entries.push((n, r)),
                    _ => bail!("<sheet> without name or r:id in workbook.xml"),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

fn parse_relationships(rels_xml: &[u8]) -> Result<Vec<Relationship>> {
    let mut rdr = Reader::from_reader(rels_xml);
    rdr.config_mut().trim_text(true);

    let mut rels = Vec::new();
    loop {
        match rdr.read_event()? {
            Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr_value(e, b"Id"), attr_value(e, b"Target")) {
                    rels.push(Relationship {
                        id,
                        rel_type: attr_value(e, b"Type").unwrap_or_default(),
                        target,
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rels)
}

/// Relationship targets are relative to `xl/` unless absolute.
fn resolve_target(target: &str) -> String {
    if let Some(abs) = target.strip_prefix('/') {
        abs.to_owned()
    } else if target.starts_with("xl/") {
        target.to_owned()
    } else {
        format!("xl/{target}")
    }
}

/// Last occupied row of a worksheet; rows without `r` continue from the previous one.
pub(crate) fn calc_last_row(sheet_xml: &[u8]) -> Result<u32> {
    let mut rdr = Reader::from_reader(sheet_xml);
    rdr.config_mut().trim_text(true);

    let mut last_row = 0u32;
    loop {
        match rdr.read_event()? {
            Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"row" => {
                let row = attr_value(e, b"r")
                    .and_then(|r| r.parse::<u32>().ok())
                    .unwrap_or(last_row + 1);
                last_row = last_row.max(row);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(last_row)
}

fn validate_sheet_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().count() > 31 {
        bail!("Sheet name `{name}` must be 1..=31 characters long");
    }
    if let Some(c) = name.chars().find(|c| "[]:*?/\\".contains(*c)) {
        bail!("Sheet name `{name}` contains forbidden character `{c}`");
    }
    Ok(())
}

fn ensure_rel_namespace(wb_xml: &mut Vec<u8>) -> Result<()> {
    if memchr::memmem::find(wb_xml, b"xmlns:r=").is_some() {
        return Ok(());
    }
    let pos = memchr::memmem::find(wb_xml, b"<workbook")
        .context("<workbook> not found in workbook.xml")?
        + "<workbook".len();
    let decl = format!(r#" xmlns:r="{REL_NS}""#);
    wb_xml.splice(pos..pos, decl.into_bytes());
    Ok(())
}

fn insert_before_last(xml: &mut Vec<u8>, closing: &[u8], content: &[u8]) -> Option<()> {
    let pos = memchr::memmem::rfind(xml, closing)?;
    xml.splice(pos..pos, content.iter().copied());
    Some(())
}
