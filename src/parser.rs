use crate::error::ChartError;
use crate::types::ChartCatalogEntry;
use csv::{ReaderBuilder, StringRecord};
use log::debug;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Reads a tab-separated catalog listing with a header row:
/// `id track_ref name author charter song_length difficulty is_rated mirror download`.
pub async fn parse_catalog(path: &Path) -> Result<Vec<ChartCatalogEntry>, ChartError> {
    let mut file = File::open(path)
        .await
        .map_err(ChartError::IoError)?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .await
        .map_err(ChartError::IoError)?;

    parse_catalog_str(&contents)
}

pub fn parse_catalog_str(contents: &str) -> Result<Vec<ChartCatalogEntry>, ChartError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_reader(contents.as_bytes());

    let mut entries = Vec::new();

    for (line, result) in reader.records().enumerate() {
        let record = result?;
        let entry = parse_record(&record)
            .map_err(|msg| ChartError::ParseError(format!("row {}: {}", line + 1, msg)))?;

        debug!("Parsed entry: {:?}", entry);
        entries.push(entry);
    }

    Ok(entries)
}

fn field(record: &StringRecord, index: usize) -> &str {
    record.get(index).unwrap_or("").trim()
}

fn optional(record: &StringRecord, index: usize) -> Option<String> {
    Some(field(record, index).to_string()).filter(|s| !s.is_empty())
}

fn number<T: std::str::FromStr>(record: &StringRecord, index: usize, name: &str) -> Result<T, String> {
    let raw = field(record, index);
    raw.parse()
        .map_err(|_| format!("invalid {} {:?}", name, raw))
}

fn parse_record(record: &StringRecord) -> Result<ChartCatalogEntry, String> {
    let track_ref = field(record, 1).to_string();
    if track_ref.is_empty() {
        return Err("missing track_ref".to_string());
    }

    let is_rated = match field(record, 7).to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" | "" => false,
        other => return Err(format!("invalid is_rated {:?}", other)),
    };

    Ok(ChartCatalogEntry {
        id: number(record, 0, "id")?,
        track_ref,
        name: field(record, 2).to_string(),
        author: field(record, 3).to_string(),
        charter: optional(record, 4),
        duration_seconds: number(record, 5, "song_length")?,
        difficulty: number(record, 6, "difficulty")?,
        is_rated,
        mirror_url: optional(record, 8),
        download_url: optional(record, 9),
    })
}
