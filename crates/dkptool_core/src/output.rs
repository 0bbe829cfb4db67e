//! Deterministic artifact writers.
//!
//! Every JSON and CSV artifact goes through this module so that re-running a
//! builder over unchanged inputs leaves the files byte-identical on disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

/// Write `bytes` to `path` through a sibling temp file. Returns `false` when the
/// existing file already holds exactly these bytes.
pub fn write_if_changed(path: &Path, bytes: &[u8]) -> Result<bool> {
    if let Ok(existing) = fs::read(path)
        && existing == bytes
    {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;

    let temp_path = temp_sibling(path);
    fs::write(&temp_path, bytes)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(true)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Pretty JSON with 2-space indent and a trailing newline. Map key order is
/// whatever the value serialises with, so callers use `BTreeMap` for objects.
pub fn render_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut rendered = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    rendered.push('\n');
    Ok(rendered)
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<bool> {
    let rendered = render_json(value)?;
    write_if_changed(path, rendered.as_bytes())
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// A typed row that knows its CSV header.
pub trait CsvRow {
    fn headers() -> &'static [&'static str];
    fn to_record(&self) -> Vec<String>;
}

pub fn write_rows<T: CsvRow>(path: &Path, rows: &[T]) -> Result<bool> {
    let mut table = CsvTable::new(T::headers().iter().map(|header| header.to_string()).collect());
    for row in rows {
        table.push(row.to_record());
    }
    table.write(path)
}

/// An untyped CSV table: one header row plus string records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Copy)]
pub struct CsvRecord<'a> {
    table: &'a CsvTable,
    row: &'a [String],
}

impl<'a> CsvRecord<'a> {
    /// Trimmed cell value, or `""` when the column is missing.
    pub fn get(&self, column: &str) -> &'a str {
        let (table, row) = (self.table, self.row);
        table
            .column(column)
            .and_then(|index| row.get(index))
            .map(|value| value.trim())
            .unwrap_or("")
    }
}

impl CsvTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Read `path` if it exists, otherwise `None`.
    pub fn read_optional(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::read(path).map(Some)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim_start_matches('\u{feff}');
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());
        let headers = reader
            .headers()
            .context("failed to read CSV header")?
            .iter()
            .map(|header| header.trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context("failed to read CSV record")?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self { headers, rows })
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn records(&self) -> impl Iterator<Item = CsvRecord<'_>> {
        self.rows.iter().map(move |row| CsvRecord { table: self, row })
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn render(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(&self.headers)
            .context("failed to write CSV header")?;
        for row in &self.rows {
            writer
                .write_record(row)
                .context("failed to write CSV record")?;
        }
        writer
            .into_inner()
            .map_err(|err| anyhow!("failed to flush CSV buffer: {}", err.error()))
    }

    pub fn write(&self, path: &Path) -> Result<bool> {
        let bytes = self.render()?;
        write_if_changed(path, &bytes)
    }
}

/// Sort key that orders numeric ids by value and keeps other strings stable.
pub fn numeric_key(value: &str) -> (u8, u64, String) {
    match value.trim().parse::<u64>() {
        Ok(number) => (0, number, String::new()),
        Err(_) => (1, 0, value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::*;

    struct Pair {
        id: u32,
        name: &'static str,
    }

    impl CsvRow for Pair {
        fn headers() -> &'static [&'static str] {
            &["id", "name"]
        }

        fn to_record(&self) -> Vec<String> {
            vec![self.id.to_string(), self.name.to_string()]
        }
    }

    #[test]
    fn json_is_sorted_indented_and_newline_terminated() {
        let mut map = BTreeMap::new();
        map.insert("b", 2);
        map.insert("a", 1);
        let rendered = render_json(&map).expect("render");
        assert_eq!(rendered, "{\n  \"a\": 1,\n  \"b\": 2\n}\n");
    }

    #[test]
    fn write_if_changed_skips_identical_bytes() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("out.json");
        assert!(write_if_changed(&path, b"one").expect("first write"));
        assert!(!write_if_changed(&path, b"one").expect("second write"));
        assert!(write_if_changed(&path, b"two").expect("third write"));
        assert_eq!(fs::read(&path).expect("read"), b"two");
        assert!(!temp.path().join("nested").join(".out.json.tmp").exists());
    }

    #[test]
    fn csv_header_is_written_for_empty_tables() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("pairs.csv");
        write_rows::<Pair>(&path, &[]).expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "id,name\n");
    }

    #[test]
    fn csv_quotes_only_when_needed() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("pairs.csv");
        write_rows(
            &path,
            &[
                Pair { id: 2, name: "Plain" },
                Pair { id: 1, name: "Comma, \"quoted\"" },
            ],
        )
        .expect("write");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "id,name\n2,Plain\n1,\"Comma, \"\"quoted\"\"\"\n"
        );
    }

    #[test]
    fn csv_table_reads_bom_and_short_rows() {
        let table = CsvTable::parse("\u{feff}raid_id,item_name,cost\n1, Sword ,5\n2,Shield\n")
            .expect("parse");
        assert_eq!(table.headers, vec!["raid_id", "item_name", "cost"]);
        let records: Vec<_> = table.records().collect();
        assert_eq!(records[0].get("item_name"), "Sword");
        assert_eq!(records[1].get("cost"), "");
        assert_eq!(records[1].get("missing"), "");
    }

    #[test]
    fn numeric_key_orders_ids_by_value() {
        let mut ids = vec!["10", "9", "abc", "100"];
        ids.sort_by_key(|id| numeric_key(id));
        assert_eq!(ids, vec!["9", "10", "100", "abc"]);
    }
}
