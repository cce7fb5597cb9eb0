//! Bounded text previews of uploaded files for analysis prompts.
//!
//! Spreadsheets are flattened sheet by sheet (first row = headers), PDFs go
//! through lopdf, anything else is read as lossy UTF-8.

use anyhow::{Context, Result};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsb, Xlsx};
use chrono::{Duration as ChronoDuration, NaiveDate, Timelike};
use std::io::Cursor;
use std::path::Path;

/// Rows per sheet included in a preview.
const MAX_PREVIEW_ROWS: usize = 40;

/// Raw parsed sheet data.
#[derive(Debug, Clone)]
pub struct RawSheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Text handed to the analyzers, plus the structural hints the pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct DocumentPreview {
    pub text: String,
    /// Worksheet names; the indexing service creates one document per sheet.
    pub sheet_names: Vec<String>,
    pub has_tables: bool,
}

pub async fn preview_file(path: &Path, max_chars: usize) -> Result<DocumentPreview> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    tokio::task::spawn_blocking(move || preview(&filename, &data, max_chars))
        .await
        .context("Preview task panicked")?
}

/// Dispatch by extension.
pub fn preview(filename: &str, data: &[u8], max_chars: usize) -> Result<DocumentPreview> {
    let ext = extension(filename);
    let mut preview = match ext.as_str() {
        "csv" => sheets_preview(parse_csv(filename, data)?),
        "xlsx" | "xlsm" => sheets_preview(parse_excel_xlsx(data)?),
        "xlsb" => sheets_preview(parse_excel_xlsb(data)?),
        "pdf" => {
            let text = extract_pdf_text(data)?;
            let has_tables = looks_tabular(&text);
            DocumentPreview {
                text,
                sheet_names: Vec::new(),
                has_tables,
            }
        }
        _ => {
            let text = String::from_utf8_lossy(data).to_string();
            let has_tables = looks_tabular(&text);
            DocumentPreview {
                text,
                sheet_names: Vec::new(),
                has_tables,
            }
        }
    };
    let truncated_len = crate::ai::truncate_for_context(&preview.text, max_chars).len();
    preview.text.truncate(truncated_len);
    Ok(preview)
}

pub fn extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

fn sheets_preview(sheets: Vec<RawSheet>) -> DocumentPreview {
    let mut text = String::new();
    for sheet in &sheets {
        text.push_str(&format!("## Sheet: {}\n", sheet.name));
        text.push_str(&sheet.headers.join(" | "));
        text.push('\n');
        for row in sheet.rows.iter().take(MAX_PREVIEW_ROWS) {
            text.push_str(&row.join(" | "));
            text.push('\n');
        }
        if sheet.rows.len() > MAX_PREVIEW_ROWS {
            text.push_str(&format!(
                "... {} more rows\n",
                sheet.rows.len() - MAX_PREVIEW_ROWS
            ));
        }
        text.push('\n');
    }
    DocumentPreview {
        text,
        sheet_names: sheets.iter().map(|s| s.name.clone()).collect(),
        has_tables: !sheets.is_empty(),
    }
}

/// Heuristic for text documents: several pipe- or tab-delimited lines.
fn looks_tabular(text: &str) -> bool {
    text.lines()
        .filter(|l| {
            let t = l.trim();
            (t.starts_with('|') && t.ends_with('|')) || t.matches('\t').count() >= 2
        })
        .count()
        >= 3
}

/// Parse a CSV file into a single RawSheet.
fn parse_csv(filename: &str, data: &[u8]) -> Result<Vec<RawSheet>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    if headers.is_empty() {
        anyhow::bail!("CSV file has no headers");
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.context("Failed to read CSV record")?;
        rows.push(record.iter().map(|f| f.to_string()).collect());
    }

    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim_end_matches(".csv")
        .to_string();

    Ok(vec![RawSheet {
        name,
        headers,
        rows,
    }])
}

/// Parse an xlsx/xlsm file. All worksheets become separate RawSheet entries.
fn parse_excel_xlsx(data: &[u8]) -> Result<Vec<RawSheet>> {
    let mut workbook: Xlsx<_> =
        open_workbook_from_rs(Cursor::new(data)).context("Failed to open Excel workbook")?;
    let names = workbook.sheet_names().to_vec();
    let mut sheets = Vec::new();
    for name in &names {
        match workbook.worksheet_range(name) {
            Ok(range) => sheets.extend(range_to_raw_sheet(name, &range)),
            Err(e) => tracing::warn!("Skipping sheet '{}': {}", name, e),
        }
    }
    Ok(sheets)
}

/// Parse an xlsb file.
fn parse_excel_xlsb(data: &[u8]) -> Result<Vec<RawSheet>> {
    let mut workbook: Xlsb<_> =
        open_workbook_from_rs(Cursor::new(data)).context("Failed to open Excel workbook")?;
    let names = workbook.sheet_names().to_vec();
    let mut sheets = Vec::new();
    for name in &names {
        match workbook.worksheet_range(name) {
            Ok(range) => sheets.extend(range_to_raw_sheet(name, &range)),
            Err(e) => tracing::warn!("Skipping sheet '{}': {}", name, e),
        }
    }
    Ok(sheets)
}

/// Convert a calamine Range into a RawSheet. First row = headers.
/// Keeps header-only sheets: the service still creates a document for them.
fn range_to_raw_sheet(name: &str, range: &calamine::Range<Data>) -> Option<RawSheet> {
    let mut row_iter = range.rows();
    let headers: Vec<String> = row_iter.next()?.iter().map(cell_to_string).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return None;
    }

    let rows = row_iter
        .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
        .filter(|values| !values.iter().all(|v| v.is_empty()))
        .collect();

    Some(RawSheet {
        name: name.to_string(),
        headers,
        rows,
    })
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Avoid trailing ".0" for whole numbers
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_to_string(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

/// Excel serial dates count days from 1899-12-30.
fn excel_serial_to_string(serial: f64) -> String {
    let Some(epoch) = NaiveDate::from_ymd_opt(1899, 12, 30).and_then(|d| d.and_hms_opt(0, 0, 0))
    else {
        return serial.to_string();
    };
    let millis = (serial * 86_400_000.0).round() as i64;
    let dt = epoch + ChronoDuration::milliseconds(millis);
    if dt.hour() == 0 && dt.minute() == 0 && dt.second() == 0 {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// Extract text from a PDF file using lopdf.
fn extract_pdf_text(data: &[u8]) -> Result<String> {
    let doc = lopdf::Document::load_from(Cursor::new(data))
        .map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;

    let mut text = String::new();
    for (page_num, _) in doc.get_pages() {
        if let Ok(content) = doc.extract_text(&[page_num]) {
            text.push_str(&content);
            text.push('\n');
        }
    }
    Ok(text)
}
