use crate::{Workbook, attr_value, split_cell_ref, unescape_lossy};
use anyhow::{Context, Result};
use quick_xml::{
    Reader,
    events::{BytesRef, Event},
};

/// Read back
impl Workbook {
    /// Values of every `<row>` of `sheet_name`, in document order.
    ///
    /// Cells are placed by their column reference, gaps are filled with empty strings. Inline
    /// strings, shared strings and plain `<v>` values are returned as text.
    pub fn rows(&self, sheet_name: &str) -> Result<Vec<Vec<String>>> {
        let sheet = self
            .sheet(sheet_name)
            .with_context(|| format!("Sheet `{sheet_name}` not found"))?;

        let mut reader = Reader::from_reader(sheet.xml.as_slice());
        let mut rows = Vec::new();
        let mut current: Vec<String> = Vec::new();
        // (column, t="…") of the cell being read
        let mut cell: Option<(usize, Option<String>)> = None;
        let mut capture = false;
        let mut phonetic = false;
        let mut text = String::new();

        loop {
            match reader.read_event()? {
                Event::Start(ref e) => match e.name().as_ref() {
                    b"row" => current.clear(),
                    b"c" => {
                        let col = attr_value(e, b"r")
                            .and_then(|r| split_cell_ref(&r))
                            .map(|(col, _)| col)
                            .unwrap_or(current.len());
                        cell = Some((col, attr_value(e, b"t")));
                        text.clear();
                    }
                    b"rPh" => phonetic = true,
                    b"v" | b"t" if !phonetic => capture = true,
                    _ => {}
                },
                Event::Empty(ref e) if e.name().as_ref() == b"row" => rows.push(Vec::new()),
                Event::End(ref e) => match e.name().as_ref() {
                    b"row" => rows.push(std::mem::take(&mut current)),
                    b"c" => {
                        if let Some((col, kind)) = cell.take() {
                            let value = match kind.as_deref() {
                                Some("s") => text
                                    .trim()
                                    .parse::<usize>()
                                    .ok()
                                    .and_then(|i| self.shared_strings.get(i).cloned())
                                    .unwrap_or_default(),
                                _ => std::mem::take(&mut text),
                            };
                            if current.len() <= col {
                                current.resize(col + 1, String::new());
                            }
                            current[col] = value;
                        }
                    }
                    b"rPh" => phonetic = false,
                    b"v" | b"t" => capture = false,
                    _ => {}
                },
                Event::Text(ref t) if capture => text.push_str(&unescape_lossy(t)),
                Event::CData(ref t) if capture => text.push_str(&String::from_utf8_lossy(t)),
                Event::GeneralRef(ref r) if capture => {
                    if let Some(ch) = resolve_entity(r) {
                        text.push(ch);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(rows)
    }
}

/// Items of xl/sharedStrings.xml; rich text runs are concatenated, phonetic hints skipped.
pub(crate) fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut strings = Vec::new();
    let mut item = String::new();
    let mut capture = false;
    let mut phonetic = false;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => match e.name().as_ref() {
                b"si" => item.clear(),
                b"rPh" => phonetic = true,
                b"t" if !phonetic => capture = true,
                _ => {}
            },
            Event::Empty(ref e) if e.name().as_ref() == b"si" => strings.push(String::new()),
            Event::End(ref e) => match e.name().as_ref() {
                b"si" => strings.push(std::mem::take(&mut item)),
                b"rPh" => phonetic = false,
                b"t" => capture = false,
                _ => {}
            },
            Event::Text(ref t) if capture => item.push_str(&unescape_lossy(t)),
            Event::GeneralRef(ref r) if capture => {
                if let Some(ch) = resolve_entity(r) {
                    item.push(ch);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(strings)
}

fn resolve_entity(r: &BytesRef<'_>) -> Option<char> {
    if let Ok(Some(ch)) = r.resolve_char_ref() {
        return Some(ch);
    }
    match &**r {
        b"amp" => Some('&'),
        b"lt" => Some('<'),
        b"gt" => Some('>'),
        b"quot" => Some('"'),
        b"apos" => Some('\''),
        _ => None,
    }
}
