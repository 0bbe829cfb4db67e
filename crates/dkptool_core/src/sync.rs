//! Push local artifacts to the hosted backend and pull tables back down.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use zip::result::ZipError;
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, ZipArchive};

use crate::backend::{HostedBackend, Row, cell_text, row_from_pairs};
use crate::classify::CLASSIFICATIONS_IMPORT_FILE;
use crate::extract::{ACCOUNTS_FILE, CHARACTER_ACCOUNT_FILE, CHARACTERS_FILE, RAID_LOOT_FILE};
use crate::legacy::{
    RaidDetail, parse_date_to_iso, parse_event_attendees, parse_raid_detail,
    resolve_event_attendance,
};
use crate::assign::ASSIGNMENT_COUNTS_FILE;
use crate::output::{CsvTable, numeric_key, write_if_changed};
use crate::scrape::{RAIDS_INDEX_FILE, read_raid_index};

/// Rows sent per upsert request.
pub const UPSERT_CHUNK: usize = 1_000;
pub const DEFAULT_ASSIGNMENT_BATCH: usize = 1_000;

/// One backend table: its key columns (comma separated, used as both the
/// export `order` and the restore `on_conflict`) and the header written when
/// the table is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicTable {
    pub name: &'static str,
    pub key: &'static str,
    pub headers: &'static [&'static str],
}

const fn public(name: &'static str, key: &'static str, headers: &'static [&'static str]) -> PublicTable {
    PublicTable { name, key, headers }
}

/// Public tables exported by `backup`.
pub const PUBLIC_TABLES: [PublicTable; 18] = [
    public("profiles", "id", &["id", "email", "role", "created_at", "updated_at", "account_id"]),
    public("characters", "char_id", &["char_id", "name", "race", "class_name", "level", "guild_rank", "claim"]),
    public("accounts", "account_id", &["account_id", "char_ids", "toon_names", "toon_count", "display_name"]),
    public("character_account", "char_id,account_id", &["char_id", "account_id"]),
    public("raids", "raid_id", &["raid_id", "raid_pool", "raid_name", "date", "date_iso", "attendees", "url"]),
    public(
        "raid_events",
        "id",
        &["id", "raid_id", "event_id", "event_order", "event_name", "dkp_value", "attendee_count", "event_time"],
    ),
    public(
        "raid_loot",
        "id",
        &[
            "id",
            "raid_id",
            "event_id",
            "item_name",
            "char_id",
            "character_name",
            "cost",
            "assigned_char_id",
            "assigned_character_name",
            "assigned_via_magelo",
        ],
    ),
    public("raid_attendance", "id", &["id", "raid_id", "char_id", "character_name"]),
    public(
        "raid_event_attendance",
        "id",
        &["id", "raid_id", "event_id", "char_id", "character_name", "account_id"],
    ),
    public("raid_dkp_totals", "raid_id", &["raid_id", "total_dkp"]),
    public(
        "raid_attendance_dkp",
        "raid_id,character_key",
        &["raid_id", "character_key", "character_name", "dkp_earned"],
    ),
    public("raid_classifications", "raid_id,mob", &["raid_id", "mob", "zone"]),
    public("dkp_adjustments", "character_name", &["character_name", "earned_delta", "spent_delta"]),
    public(
        "dkp_summary",
        "character_key",
        &["character_key", "character_name", "earned", "spent", "earned_30d", "earned_60d", "last_activity_date", "updated_at"],
    ),
    public("dkp_period_totals", "period", &["period", "total_dkp"]),
    public("active_raiders", "character_key", &["character_key"]),
    public(
        "officer_audit_log",
        "id",
        &["id", "created_at", "actor_id", "actor_email", "actor_display_name", "action", "target_type", "target_id", "delta"],
    ),
    public(
        "character_loot_assignment_counts",
        "char_id",
        &["char_id", "character_name", "items_assigned"],
    ),
];

pub fn public_table(name: &str) -> Option<&'static PublicTable> {
    PUBLIC_TABLES.iter().find(|table| table.name == name)
}

/// Tables loaded by `restore`, parents before children. `profiles` is never
/// restored since it belongs to the auth side.
const RESTORE_ORDER: [&str; 17] = [
    "characters",
    "accounts",
    "character_account",
    "raids",
    "raid_events",
    "raid_loot",
    "raid_attendance",
    "raid_event_attendance",
    "raid_dkp_totals",
    "raid_attendance_dkp",
    "raid_classifications",
    "dkp_adjustments",
    "dkp_summary",
    "dkp_period_totals",
    "active_raiders",
    "officer_audit_log",
    "character_loot_assignment_counts",
];

/// Rebuilt by backend triggers while events and attendance load.
const TRIGGER_POPULATED: [&str; 2] = ["raid_dkp_totals", "raid_attendance_dkp"];

/// Tables cleared before a raid is re-uploaded, children first.
const RAID_CHILD_TABLES: [&str; 4] = [
    "raid_event_attendance",
    "raid_loot",
    "raid_attendance",
    "raid_events",
];

fn default_headers(table: &str) -> &'static [&'static str] {
    public_table(table)
        .map(|table| table.headers)
        .unwrap_or(&["id"])
}

/// Order rows by their key columns (ids by numeric value), then by content.
fn sort_rows(rows: &mut [Row], key: Option<&str>) {
    let columns: Vec<&str> = key.map(|key| key.split(',').collect()).unwrap_or_default();
    rows.sort_by_cached_key(|row| {
        let cells: Vec<(u8, u64, String)> = columns
            .iter()
            .map(|column| numeric_key(&row.get(*column).map(cell_text).unwrap_or_default()))
            .collect();
        (cells, Value::Object(row.clone()).to_string())
    });
}

fn table_rows(table: &CsvTable) -> Vec<Row> {
    table
        .records()
        .map(|record| {
            row_from_pairs(
                table
                    .headers
                    .iter()
                    .map(|header| (header.as_str(), record.get(header))),
            )
        })
        .collect()
}

fn upsert_chunked(
    backend: &mut dyn HostedBackend,
    table: &str,
    rows: &[Row],
    on_conflict: &str,
) -> Result<usize> {
    let mut written = 0;
    for chunk in rows.chunks(UPSERT_CHUNK) {
        written += backend.upsert(table, chunk, on_conflict)?;
    }
    info!(table, rows = written, "upserted");
    Ok(written)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RosterPushReport {
    pub characters: usize,
    pub accounts: usize,
    pub character_accounts: usize,
}

/// Upsert characters, accounts and their links from the structured CSVs.
pub fn push_roster(backend: &mut dyn HostedBackend, data_dir: &Path) -> Result<RosterPushReport> {
    let characters_path = data_dir.join(CHARACTERS_FILE);
    if !characters_path.exists() {
        bail!("{} not found; run `dkptool extract` first", characters_path.display());
    }
    let characters: Vec<Row> = table_rows(&CsvTable::read(&characters_path)?)
        .into_iter()
        .filter(|row| row.get("char_id").is_some_and(|id| !id.is_null()))
        .collect();
    let mut report = RosterPushReport {
        characters: upsert_chunked(backend, "characters", &characters, "char_id")?,
        ..RosterPushReport::default()
    };
    if let Some(accounts) = CsvTable::read_optional(&data_dir.join(ACCOUNTS_FILE))? {
        report.accounts = upsert_chunked(backend, "accounts", &table_rows(&accounts), "account_id")?;
    }
    if let Some(links) = CsvTable::read_optional(&data_dir.join(CHARACTER_ACCOUNT_FILE))? {
        report.character_accounts = upsert_chunked(
            backend,
            "character_account",
            &table_rows(&links),
            "char_id,account_id",
        )?;
    }
    Ok(report)
}

/// Everything one raid upload would write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaidUploadPlan {
    pub raid_id: String,
    pub raid: Row,
    pub events: Vec<Row>,
    pub loot: Vec<Row>,
    pub attendance: Vec<Row>,
    pub event_attendance: Vec<Row>,
    /// Per-event rows dropped because the account already had a character on that event.
    pub duplicate_event_rows: usize,
}

/// Build the upload plan for one cached raid. `char_to_account` collapses
/// per-event attendance to one character per account.
pub fn plan_raid_upload(
    cache_dir: &Path,
    data_dir: &Path,
    raid_id: &str,
    char_to_account: &HashMap<String, String>,
) -> Result<RaidUploadPlan> {
    let raid_id = raid_id.trim();
    let detail_path = cache_dir.join("raids").join(format!("raid_{raid_id}.html"));
    if !detail_path.exists() {
        bail!(
            "raid detail page {} is not cached\nRun `dkptool scrape raids --raid-id {raid_id}` first.",
            detail_path.display()
        );
    }
    let html = fs::read_to_string(&detail_path)
        .with_context(|| format!("failed to read {}", detail_path.display()))?;
    let detail: RaidDetail = parse_raid_detail(&html, raid_id)?;

    let index = read_raid_index(&data_dir.join(RAIDS_INDEX_FILE))?;
    let indexed = index.get(raid_id);
    let pick = |indexed_value: Option<&String>, parsed: &str| -> String {
        indexed_value
            .filter(|value| !value.is_empty())
            .cloned()
            .unwrap_or_else(|| parsed.to_string())
    };
    let date = pick(indexed.map(|row| &row.date), &detail.meta.date);
    let raid = row_from_pairs([
        ("raid_id", raid_id),
        ("raid_pool", indexed.map(|row| row.raid_pool.as_str()).unwrap_or_default()),
        ("raid_name", pick(indexed.map(|row| &row.raid_name), &detail.meta.raid_name).as_str()),
        ("date", date.as_str()),
        ("date_iso", parse_date_to_iso(&date).as_str()),
        ("attendees", pick(indexed.map(|row| &row.attendees), &detail.meta.attendees).as_str()),
        ("url", indexed.map(|row| row.url.as_str()).unwrap_or_default()),
    ]);

    let events: Vec<Row> = detail
        .events
        .iter()
        .map(|event| {
            let order = event.event_order.to_string();
            row_from_pairs([
                ("raid_id", event.raid_id.as_str()),
                ("event_id", event.event_id.as_str()),
                ("event_order", order.as_str()),
                ("event_name", event.event_name.as_str()),
                ("dkp_value", event.dkp_value.as_str()),
                ("attendee_count", event.attendee_count.as_str()),
                ("event_time", event.event_time.as_str()),
            ])
        })
        .collect();
    let loot: Vec<Row> = detail
        .loot
        .iter()
        .map(|row| {
            row_from_pairs([
                ("raid_id", row.raid_id.as_str()),
                ("event_id", row.event_id.as_str()),
                ("item_name", row.item_name.as_str()),
                ("char_id", row.char_id.as_str()),
                ("character_name", row.character_name.as_str()),
                ("cost", row.cost.as_str()),
            ])
        })
        .collect();
    let attendance: Vec<Row> = detail
        .attendees
        .iter()
        .map(|row| {
            row_from_pairs([
                ("raid_id", row.raid_id.as_str()),
                ("char_id", row.char_id.as_str()),
                ("character_name", row.character_name.as_str()),
            ])
        })
        .collect();

    let mut event_attendance = Vec::new();
    let mut duplicate_event_rows = 0;
    let attendees_path = cache_dir
        .join("raids")
        .join(format!("raid_{raid_id}_attendees.html"));
    if attendees_path.exists() && !detail.events.is_empty() {
        let attendees_html = fs::read_to_string(&attendees_path)
            .with_context(|| format!("failed to read {}", attendees_path.display()))?;
        let sections = parse_event_attendees(&attendees_html)?;
        let resolved =
            resolve_event_attendance(raid_id, &sections, &detail.events, &detail.attendees);
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for row in resolved {
            let account_id = char_to_account.get(&row.char_id).cloned();
            let identity = match (&account_id, row.char_id.is_empty()) {
                (Some(account), _) => format!("acct:{account}"),
                (None, false) => format!("char:{}", row.char_id),
                (None, true) => format!("name:{}", row.character_name.to_lowercase()),
            };
            if !seen.insert((row.event_id.clone(), identity)) {
                duplicate_event_rows += 1;
                continue;
            }
            event_attendance.push(row_from_pairs([
                ("raid_id", row.raid_id.as_str()),
                ("event_id", row.event_id.as_str()),
                ("char_id", row.char_id.as_str()),
                ("character_name", row.character_name.as_str()),
                ("account_id", account_id.as_deref().unwrap_or_default()),
            ]));
        }
    }

    Ok(RaidUploadPlan {
        raid_id: raid_id.to_string(),
        raid,
        events,
        loot,
        attendance,
        event_attendance,
        duplicate_event_rows,
    })
}

/// `char_id -> account_id` from a list of rows with those two columns; first wins.
pub fn account_map_from_rows(rows: &[Row]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for row in rows {
        let char_id = row.get("char_id").map(cell_text).unwrap_or_default();
        let account_id = row.get("account_id").map(cell_text).unwrap_or_default();
        if !char_id.trim().is_empty() && !account_id.trim().is_empty() {
            map.entry(char_id.trim().to_string())
                .or_insert_with(|| account_id.trim().to_string());
        }
    }
    map
}

/// Local `character_account.csv` as an account map, empty when absent.
pub fn local_account_map(data_dir: &Path) -> Result<HashMap<String, String>> {
    let Some(table) = CsvTable::read_optional(&data_dir.join(CHARACTER_ACCOUNT_FILE))? else {
        return Ok(HashMap::new());
    };
    Ok(account_map_from_rows(&table_rows(&table)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RaidPushReport {
    pub raid_id: String,
    pub applied: bool,
    pub events: usize,
    pub loot: usize,
    pub attendance: usize,
    pub event_attendance: usize,
    pub duplicate_event_rows: usize,
    pub deleted_via_rpc: bool,
    pub summary_refreshed: bool,
}

/// Replace one raid's rows on the backend. Without a backend this is a dry run
/// that only reports the plan.
pub fn push_raid(
    backend: Option<&mut dyn HostedBackend>,
    cache_dir: &Path,
    data_dir: &Path,
    raid_id: &str,
) -> Result<RaidPushReport> {
    let Some(backend) = backend else {
        let plan = plan_raid_upload(cache_dir, data_dir, raid_id, &local_account_map(data_dir)?)?;
        return Ok(plan_report(&plan, false));
    };

    let accounts = account_map_from_rows(&backend.select_all("character_account", Some("char_id,account_id"))?);
    let plan = plan_raid_upload(cache_dir, data_dir, raid_id, &accounts)?;
    let mut report = plan_report(&plan, true);

    backend.upsert("raids", std::slice::from_ref(&plan.raid), "raid_id")?;
    match backend.rpc("delete_raid_for_reupload", &json!({ "p_raid_id": plan.raid_id })) {
        Ok(_) => report.deleted_via_rpc = true,
        Err(error) => {
            warn!(error = %error, "delete_raid_for_reupload unavailable; deleting per table");
            for table in RAID_CHILD_TABLES {
                backend.delete_eq(table, "raid_id", &plan.raid_id)?;
            }
        }
    }
    backend.insert("raid_events", &plan.events)?;
    backend.insert("raid_loot", &plan.loot)?;
    backend.insert("raid_attendance", &plan.attendance)?;
    backend.insert("raid_event_attendance", &plan.event_attendance)?;
    info!(raid_id = plan.raid_id.as_str(), "raid uploaded");

    match backend.rpc("refresh_dkp_summary", &json!({})) {
        Ok(_) => report.summary_refreshed = true,
        Err(error) => warn!(error = %error, "refresh_dkp_summary failed"),
    }
    Ok(report)
}

fn plan_report(plan: &RaidUploadPlan, applied: bool) -> RaidPushReport {
    RaidPushReport {
        raid_id: plan.raid_id.clone(),
        applied,
        events: plan.events.len(),
        loot: plan.loot.len(),
        attendance: plan.attendance.len(),
        event_attendance: plan.event_attendance.len(),
        duplicate_event_rows: plan.duplicate_event_rows,
        deleted_via_rpc: false,
        summary_refreshed: false,
    }
}

/// Upsert `raid_classifications_import.csv` keyed on `(raid_id, mob)`.
pub fn push_classifications(backend: &mut dyn HostedBackend, data_dir: &Path) -> Result<usize> {
    let path = data_dir.join(CLASSIFICATIONS_IMPORT_FILE);
    if !path.exists() {
        bail!("{} not found; run `dkptool build classify` first", path.display());
    }
    let rows = table_rows(&CsvTable::read(&path)?);
    upsert_chunked(backend, "raid_classifications", &rows, "raid_id,mob")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignmentPushReport {
    pub rows: usize,
    pub batches: usize,
    pub updated: usize,
}

/// Positive integer row id; `"123.0"` is accepted.
fn parse_row_id(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let raw = raw.strip_suffix(".0").unwrap_or(raw);
    raw.parse::<u64>().ok().filter(|id| *id > 0)
}

/// Send loot assignment columns of `raid_loot.csv` rows that carry a backend `id`.
pub fn push_loot_assignments(
    backend: &mut dyn HostedBackend,
    csv_path: &Path,
    batch: usize,
) -> Result<AssignmentPushReport> {
    if !csv_path.exists() {
        bail!("{} not found", csv_path.display());
    }
    let table = CsvTable::read(csv_path)?;
    if !table.has_column("id") {
        bail!(
            "{} has no `id` column\nExport raid_loot from the backend with `dkptool pull raid_loot` first.",
            csv_path.display()
        );
    }
    let rows: Vec<Value> = table
        .records()
        .filter_map(|record| {
            let id = parse_row_id(record.get("id"))?;
            let text_or_null = |column: &str| {
                let value = record.get(column);
                if value.is_empty() {
                    Value::Null
                } else {
                    Value::String(value.to_string())
                }
            };
            let via_magelo = u8::from(record.get("assigned_via_magelo") == "1");
            Some(json!({
                "id": id,
                "assigned_char_id": text_or_null("assigned_char_id"),
                "assigned_character_name": text_or_null("assigned_character_name"),
                "assigned_via_magelo": via_magelo,
            }))
        })
        .collect();

    let mut report = AssignmentPushReport {
        rows: rows.len(),
        ..AssignmentPushReport::default()
    };
    let batch = batch.max(1);
    for chunk in rows.chunks(batch) {
        let response = backend.rpc("update_raid_loot_assignments", &json!({ "data": chunk }))?;
        let counted = match &response {
            Value::Number(number) => number.as_u64(),
            Value::Array(values) => values.first().and_then(Value::as_u64),
            _ => None,
        };
        report.updated += counted.map_or(chunk.len(), |count| count as usize);
        report.batches += 1;
        info!(batch = report.batches, rows = chunk.len(), "loot assignments sent");
    }
    Ok(report)
}

/// Render backend rows as CSV. Known columns keep their documented order; any
/// others follow alphabetically.
pub fn rows_to_table(table_name: &str, rows: &[Row]) -> CsvTable {
    let defaults = default_headers(table_name);
    let present: BTreeSet<&str> = rows.iter().flat_map(|row| row.keys().map(String::as_str)).collect();
    let mut headers: Vec<String> = if rows.is_empty() {
        defaults.iter().map(|header| header.to_string()).collect()
    } else {
        defaults
            .iter()
            .filter(|header| present.contains(**header))
            .map(|header| header.to_string())
            .collect()
    };
    for key in present {
        if !headers.iter().any(|header| header == key) {
            headers.push(key.to_string());
        }
    }
    let mut table = CsvTable::new(headers);
    for row in rows {
        let record = table
            .headers
            .iter()
            .map(|header| row.get(header).map(cell_text).unwrap_or_default())
            .collect();
        table.push(record);
    }
    table
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub table: String,
    pub rows: usize,
    pub path: PathBuf,
    pub wrote: bool,
}

/// Export one backend table to `<out_dir>/<table>.csv`.
pub fn pull_table(
    backend: &mut dyn HostedBackend,
    table_name: &str,
    out_dir: &Path,
) -> Result<PullReport> {
    let key = public_table(table_name).map(|table| table.key);
    let mut rows = backend.select_all(table_name, key)?;
    sort_rows(&mut rows, key);
    let path = out_dir.join(format!("{table_name}.csv"));
    let wrote = rows_to_table(table_name, &rows).write(&path)?;
    info!(table = table_name, rows = rows.len(), "exported");
    Ok(PullReport {
        table: table_name.to_string(),
        rows: rows.len(),
        path,
        wrote,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub tables: Vec<PullReport>,
    pub total_rows: usize,
    pub archive: Option<PathBuf>,
}

/// Export every public table, optionally zipping the export directory.
pub fn backup(
    backend: &mut dyn HostedBackend,
    out_dir: &Path,
    archive: Option<&Path>,
) -> Result<BackupReport> {
    let mut report = BackupReport::default();
    for table in PUBLIC_TABLES {
        let pulled = pull_table(backend, table.name, out_dir)?;
        report.total_rows += pulled.rows;
        report.tables.push(pulled);
    }
    if let Some(archive_path) = archive {
        write_archive(out_dir, archive_path)?;
        report.archive = Some(archive_path.to_path_buf());
    }
    Ok(report)
}

/// Zip the `.csv` files of `dir` in name order with fixed timestamps.
pub fn write_archive(dir: &Path, archive_path: &Path) -> Result<bool> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".csv"))
        .collect();
    names.sort();

    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut buffer);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for name in &names {
            let path = dir.join(name);
            let bytes =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            writer
                .start_file(name.as_str(), options)
                .with_context(|| format!("failed to add {name} to archive"))?;
            writer
                .write_all(&bytes)
                .with_context(|| format!("failed to write {name} into archive"))?;
        }
        writer.finish().context("failed to finish archive")?;
    }
    write_if_changed(archive_path, buffer.get_ref())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LootCountsPushReport {
    pub rows: usize,
    pub removed: usize,
}

/// Make the backend's `character_loot_assignment_counts` match the local CSV:
/// upsert every row, then delete characters the CSV no longer lists.
pub fn push_loot_counts(backend: &mut dyn HostedBackend, data_dir: &Path) -> Result<LootCountsPushReport> {
    let path = data_dir.join(ASSIGNMENT_COUNTS_FILE);
    if !path.exists() {
        bail!("{} not found; run `dkptool build loot-assignments` first", path.display());
    }
    let table = CsvTable::read(&path)?;
    let rows: Vec<Row> = table
        .records()
        .filter(|record| !record.get("char_id").is_empty())
        .map(|record| {
            let mut row = row_from_pairs([
                ("char_id", record.get("char_id")),
                ("character_name", record.get("character_name")),
            ]);
            let items = record.get("items_assigned").parse::<u64>().unwrap_or(0);
            row.insert("items_assigned".to_string(), Value::from(items));
            row
        })
        .collect();
    let listed: HashSet<String> = rows
        .iter()
        .filter_map(|row| row.get("char_id").map(cell_text))
        .collect();

    let table_name = "character_loot_assignment_counts";
    let mut report = LootCountsPushReport {
        rows: upsert_chunked(backend, table_name, &rows, "char_id")?,
        removed: 0,
    };
    for existing in backend.select_all(table_name, Some("char_id"))? {
        let char_id = existing.get("char_id").map(cell_text).unwrap_or_default();
        if !char_id.is_empty() && !listed.contains(&char_id) {
            backend.delete_eq(table_name, "char_id", &char_id)?;
            report.removed += 1;
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Empty the DKP tables through `truncate_dkp_for_restore` before loading.
    pub clear: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoredTable {
    pub table: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub tables: Vec<RestoredTable>,
    pub skipped: Vec<String>,
    pub total_rows: usize,
    pub cleared: bool,
    pub fast_load: bool,
    pub refreshed: bool,
}

/// Backup CSVs by table name, from an export directory or a zip made by `backup`.
pub fn read_backup(source: &Path) -> Result<BTreeMap<String, CsvTable>> {
    let mut tables = BTreeMap::new();
    if source.is_dir() {
        for table in RESTORE_ORDER {
            if let Some(csv) = CsvTable::read_optional(&source.join(format!("{table}.csv")))? {
                tables.insert(table.to_string(), csv);
            }
        }
        return Ok(tables);
    }

    let file = fs::File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("{} is not a zip archive", source.display()))?;
    for table in RESTORE_ORDER {
        let name = format!("{table}.csv");
        let mut entry = match archive.by_name(&name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => continue,
            Err(error) => {
                return Err(anyhow::Error::new(error)
                    .context(format!("failed to open {name} in {}", source.display())));
            }
        };
        let mut text = String::new();
        entry
            .read_to_string(&mut text)
            .with_context(|| format!("failed to read {name} from {}", source.display()))?;
        let csv = CsvTable::parse(&text)
            .with_context(|| format!("failed to parse {name} from {}", source.display()))?;
        tables.insert(table.to_string(), csv);
    }
    Ok(tables)
}

/// CSV records as backend rows: empty cells become `null` and numeric `id`s numbers.
fn restore_rows(table: &CsvTable) -> Vec<Row> {
    table
        .records()
        .map(|record| {
            table
                .headers
                .iter()
                .map(|header| {
                    let cell = record.get(header);
                    let value = if cell.is_empty() {
                        Value::Null
                    } else if header == "id"
                        && let Ok(id) = cell.parse::<u64>()
                    {
                        Value::from(id)
                    } else {
                        Value::String(cell.to_string())
                    };
                    (header.clone(), value)
                })
                .collect()
        })
        .collect()
}

/// Load a backup back into the backend, upserting each table on its key in
/// dependency order. Summary tables the backend derives itself are skipped and
/// refreshed once loading ends.
pub fn restore(
    backend: &mut dyn HostedBackend,
    source: &Path,
    options: &RestoreOptions,
) -> Result<RestoreReport> {
    if !source.exists() {
        bail!("backup {} not found", source.display());
    }
    let tables = read_backup(source)?;
    if tables.is_empty() {
        bail!("{} holds no table CSVs to restore", source.display());
    }

    let mut report = RestoreReport::default();
    if options.clear {
        backend
            .rpc("truncate_dkp_for_restore", &json!({}))
            .context("failed to clear DKP tables before restore")?;
        report.cleared = true;
    }
    match backend.rpc("begin_restore_load", &json!({})) {
        Ok(_) => report.fast_load = true,
        Err(error) => warn!(error = %error, "begin_restore_load unavailable; loading with triggers on"),
    }

    let loaded = load_backup_tables(backend, &tables, &mut report);
    let finished = if report.fast_load {
        backend.rpc("end_restore_load", &json!({})).map(|_| ())
    } else {
        backend
            .rpc("refresh_dkp_summary", &json!({}))
            .and_then(|_| backend.rpc("refresh_all_raid_attendance_totals", &json!({})))
            .map(|_| ())
    };
    loaded?;
    match finished {
        Ok(()) => report.refreshed = true,
        Err(error) if report.fast_load => return Err(error.context("end_restore_load failed")),
        Err(error) => warn!(error = %error, "summary refresh after restore failed"),
    }
    info!(rows = report.total_rows, tables = report.tables.len(), "restore finished");
    Ok(report)
}

fn load_backup_tables(
    backend: &mut dyn HostedBackend,
    tables: &BTreeMap<String, CsvTable>,
    report: &mut RestoreReport,
) -> Result<()> {
    for name in RESTORE_ORDER {
        let csv = match tables.get(name) {
            Some(csv) if !TRIGGER_POPULATED.contains(&name) => csv,
            _ => {
                report.skipped.push(name.to_string());
                continue;
            }
        };
        let key = public_table(name).map_or("id", |table| table.key);
        let rows = restore_rows(csv);
        let written = upsert_chunked(backend, name, &rows, key)
            .with_context(|| format!("failed to restore {name}"))?;
        report.total_rows += written;
        report.tables.push(RestoredTable {
            table: name.to_string(),
            rows: written,
        });
    }
    Ok(())
}

/// Default loot CSV for assignment pushes.
pub fn default_loot_csv(data_dir: &Path) -> PathBuf {
    data_dir.join(RAID_LOOT_FILE)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::backend::testing::MockBackend;

    const RAID_PAGE: &str = r#"
<div class="subtitle"><h1>Plane of Fear</h1></div>
<div class="subtitle">Date: <span>Fri Feb 13, 2026 2:00 am</span></div>
<div id="event_container_5">
  <table><tr><td><b>Dracoliche</b></td><td>Event DKP:</td><td>3</td><td>2</td></tr></table>
  <table class="raid_event_items_table">
    <tr><td>Cloak of Flames</td><td><a href="/users/characters/character_dkp.php?char=101">Frinop</a></td><td>12</td></tr>
  </table>
</div>
<div class="contentItem"><a name="attendees"></a>
  <table><tr>
    <td><a href="/users/characters/character_dkp.php?char=101">Frinop</a></td>
    <td><a href="/users/characters/character_dkp.php?char=202">Bolt</a></td>
  </tr></table>
</div>"#;

    const ATTENDEES_PAGE: &str = r#"<div id="contentItem">
  <b>Dracoliche - 2 Attendees</b>
  <div class="data1"><table><tr>
    <td><a href="/users/characters/character_dkp.php?char=101">Frinop</a></td>
    <td><a href="/users/characters/character_dkp.php?char=202">Bolt</a></td>
  </tr></table></div>
</div>"#;

    fn seed_raid(root: &Path) -> (PathBuf, PathBuf) {
        let cache_dir = root.join("cache");
        let data_dir = root.join("data");
        let raids_dir = cache_dir.join("raids");
        fs::create_dir_all(&raids_dir).expect("raids dir");
        fs::create_dir_all(&data_dir).expect("data dir");
        fs::write(raids_dir.join("raid_7.html"), RAID_PAGE).expect("raid");
        fs::write(raids_dir.join("raid_7_attendees.html"), ATTENDEES_PAGE).expect("attendees");
        (cache_dir, data_dir)
    }

    fn account_row(char_id: &str, account_id: &str) -> Row {
        row_from_pairs([("char_id", char_id), ("account_id", account_id)])
    }

    #[test]
    fn dry_run_reports_plan_without_backend() {
        let temp = tempdir().expect("tempdir");
        let (cache_dir, data_dir) = seed_raid(temp.path());
        let report = push_raid(None, &cache_dir, &data_dir, "7").expect("dry run");
        assert!(!report.applied);
        assert_eq!(report.events, 1);
        assert_eq!(report.loot, 1);
        assert_eq!(report.attendance, 2);
        assert_eq!(report.event_attendance, 2);
    }

    #[test]
    fn apply_dedupes_event_attendance_by_account_and_falls_back_to_table_deletes() {
        let temp = tempdir().expect("tempdir");
        let (cache_dir, data_dir) = seed_raid(temp.path());
        let mut backend = MockBackend::default()
            .with_rows(
                "character_account",
                vec![account_row("101", "202"), account_row("202", "202")],
            )
            .with_rows("raid_loot", vec![row_from_pairs([("raid_id", "7"), ("item_name", "old")])]);
        backend
            .missing_rpcs
            .insert("delete_raid_for_reupload".to_string());

        let report = push_raid(Some(&mut backend), &cache_dir, &data_dir, "7").expect("apply");
        assert!(report.applied);
        assert!(!report.deleted_via_rpc);
        assert!(report.summary_refreshed);
        assert_eq!(report.event_attendance, 1);
        assert_eq!(report.duplicate_event_rows, 1);

        assert_eq!(backend.rows("raid_loot").len(), 1);
        assert_eq!(
            backend.rows("raid_loot")[0].get("item_name"),
            Some(&Value::String("Cloak of Flames".to_string()))
        );
        let raid = &backend.rows("raids")[0];
        assert_eq!(raid.get("date_iso"), Some(&Value::String("2026-02-13".to_string())));
        assert_eq!(raid.get("raid_pool"), Some(&Value::Null));
        assert!(backend.calls.contains(&"delete raid_events raid_id=7".to_string()));
    }

    #[test]
    fn failed_insert_stops_the_upload() {
        let temp = tempdir().expect("tempdir");
        let (cache_dir, data_dir) = seed_raid(temp.path());
        let mut backend = MockBackend::default();
        backend.failing_tables.insert("raid_loot".to_string());
        let error = push_raid(Some(&mut backend), &cache_dir, &data_dir, "7").expect_err("fails");
        assert!(error.to_string().contains("raid_loot"));
        assert!(!backend.calls.iter().any(|call| call == "insert raid_attendance"));
    }

    #[test]
    fn roster_push_upserts_three_tables() {
        let temp = tempdir().expect("tempdir");
        let data_dir = temp.path();
        fs::write(
            data_dir.join(CHARACTERS_FILE),
            "char_id,name,race,class_name,level,guild_rank,claim\n101,Frinop,Gnome,Enchanter,60,,\n,Loner,Human,Warrior,1,,\n",
        )
        .expect("characters");
        fs::write(data_dir.join(CHARACTER_ACCOUNT_FILE), "char_id,account_id\n101,101\n")
            .expect("links");
        let mut backend = MockBackend::default();
        let report = push_roster(&mut backend, data_dir).expect("push");
        assert_eq!(report.characters, 1);
        assert_eq!(report.accounts, 0);
        assert_eq!(report.character_accounts, 1);
        assert_eq!(backend.rows("characters")[0].get("claim"), Some(&Value::Null));

        push_roster(&mut backend, data_dir).expect("push again");
        assert_eq!(backend.rows("characters").len(), 1);
    }

    #[test]
    fn loot_assignments_go_out_in_batches() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("raid_loot.csv");
        fs::write(
            &path,
            "id,raid_id,assigned_char_id,assigned_character_name,assigned_via_magelo\n\
             1,7,101,Frinop,1\n2.0,7,,,0\n0,7,,,\nx,7,,,\n3,7,202,Bolt,\n",
        )
        .expect("csv");
        let mut backend = MockBackend::default();
        let report = push_loot_assignments(&mut backend, &path, 2).expect("push");
        assert_eq!(report.rows, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(report.updated, 3);
        let (function, args) = &backend.rpc_calls[0];
        assert_eq!(function, "update_raid_loot_assignments");
        assert_eq!(args["data"][0]["assigned_via_magelo"], json!(1));
        assert_eq!(args["data"][1]["id"], json!(2));
        assert_eq!(args["data"][1]["assigned_char_id"], Value::Null);

        fs::write(&path, "raid_id\n7\n").expect("csv");
        assert!(push_loot_assignments(&mut backend, &path, 2).is_err());
    }

    #[test]
    fn backup_writes_every_table_and_a_stable_archive() {
        let temp = tempdir().expect("tempdir");
        let out_dir = temp.path().join("backup");
        let archive = temp.path().join("backup.zip");
        let mut extra = row_from_pairs([("raid_id", "7"), ("mob", "Nagafen"), ("zone", "Sol B")]);
        extra.insert("note".to_string(), json!(3));
        let mut backend = MockBackend::default().with_rows("raid_classifications", vec![extra]);

        let report = backup(&mut backend, &out_dir, Some(&archive)).expect("backup");
        assert_eq!(report.tables.len(), PUBLIC_TABLES.len());
        assert_eq!(report.total_rows, 1);
        assert_eq!(
            fs::read_to_string(out_dir.join("raid_classifications.csv")).expect("csv"),
            "raid_id,mob,zone,note\n7,Nagafen,Sol B,3\n"
        );
        assert_eq!(
            fs::read_to_string(out_dir.join("active_raiders.csv")).expect("csv"),
            "character_key\n"
        );
        let first = fs::read(&archive).expect("archive");
        assert!(!write_archive(&out_dir, &archive).expect("rezip"));
        assert_eq!(fs::read(&archive).expect("archive"), first);
    }

    #[test]
    fn pull_output_does_not_depend_on_server_row_order() {
        let temp = tempdir().expect("tempdir");
        let rows = vec![
            account_row("10", "10"),
            account_row("9", "10"),
            account_row("101", "202"),
        ];
        let mut backend = MockBackend::default().with_rows("character_account", rows.clone());
        let first = pull_table(&mut backend, "character_account", temp.path()).expect("pull");
        assert!(first.wrote);
        assert!(
            backend
                .calls
                .contains(&"select character_account order=char_id,account_id".to_string())
        );
        let bytes = fs::read(&first.path).expect("csv");
        assert_eq!(
            String::from_utf8_lossy(&bytes),
            "char_id,account_id\n9,10\n10,10\n101,202\n"
        );

        let mut reversed = rows;
        reversed.reverse();
        backend.tables.insert("character_account".to_string(), reversed);
        let second = pull_table(&mut backend, "character_account", temp.path()).expect("pull again");
        assert!(!second.wrote);
        assert_eq!(fs::read(&second.path).expect("csv"), bytes);
    }

    fn populated_backend() -> MockBackend {
        let mut event = row_from_pairs([
            ("raid_id", "7"),
            ("event_id", "5"),
            ("event_name", "Dracoliche"),
            ("dkp_value", "3"),
        ]);
        event.insert("id".to_string(), json!(12));
        MockBackend::default()
            .with_rows(
                "characters",
                vec![
                    row_from_pairs([("char_id", "202"), ("name", "Bolt")]),
                    row_from_pairs([("char_id", "101"), ("name", "Frinop")]),
                ],
            )
            .with_rows(
                "raids",
                vec![row_from_pairs([("raid_id", "7"), ("raid_name", "Plane of Fear"), ("date_iso", "2026-02-13")])],
            )
            .with_rows("raid_events", vec![event])
            .with_rows("raid_dkp_totals", vec![row_from_pairs([("raid_id", "7"), ("total_dkp", "3")])])
    }

    #[test]
    fn restore_loads_a_backup_back_in_dependency_order() {
        let temp = tempdir().expect("tempdir");
        let first_dir = temp.path().join("first");
        let archive = temp.path().join("first.zip");
        let mut source = populated_backend();
        backup(&mut source, &first_dir, Some(&archive)).expect("backup");
        assert_eq!(
            read_backup(&archive).expect("from zip"),
            read_backup(&first_dir).expect("from dir")
        );

        let mut target = MockBackend::default();
        let report = restore(&mut target, &archive, &RestoreOptions::default()).expect("restore");
        assert!(report.fast_load);
        assert!(report.refreshed);
        assert!(!report.cleared);
        assert!(report.skipped.contains(&"raid_dkp_totals".to_string()));
        assert_eq!(report.total_rows, 4);
        assert!(target.rows("raid_dkp_totals").is_empty());
        assert_eq!(target.rows("raid_events")[0].get("id"), Some(&json!(12)));
        assert_eq!(target.rows("raids")[0].get("url"), None);
        let position = |call: &str| target.calls.iter().position(|logged| logged == call);
        assert!(position("upsert characters") < position("upsert raid_events"));
        assert!(position("rpc begin_restore_load") < position("upsert characters"));
        assert!(position("upsert raid_events") < position("rpc end_restore_load"));

        let second_dir = temp.path().join("second");
        backup(&mut target, &second_dir, None).expect("backup again");
        for name in ["characters.csv", "raids.csv", "raid_events.csv"] {
            assert_eq!(
                fs::read(first_dir.join(name)).expect("first"),
                fs::read(second_dir.join(name)).expect("second"),
                "{name}"
            );
        }
    }

    #[test]
    fn restore_can_clear_first_and_refreshes_without_fast_load() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("backup");
        backup(&mut populated_backend(), &dir, None).expect("backup");

        let mut target = MockBackend::default();
        target.missing_rpcs.insert("begin_restore_load".to_string());
        let report = restore(&mut target, &dir, &RestoreOptions { clear: true }).expect("restore");
        assert!(report.cleared);
        assert!(!report.fast_load);
        assert!(report.refreshed);
        let functions: Vec<&str> = target.rpc_calls.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            functions,
            vec!["truncate_dkp_for_restore", "refresh_dkp_summary", "refresh_all_raid_attendance_totals"]
        );

        let error = restore(&mut target, &temp.path().join("absent"), &RestoreOptions::default())
            .expect_err("missing backup");
        assert!(error.to_string().contains("absent"));
    }

    #[test]
    fn loot_counts_push_replaces_stale_characters() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join(ASSIGNMENT_COUNTS_FILE),
            "char_id,character_name,items_assigned\n202,Bolt,2\n303,Zap,x\n",
        )
        .expect("counts");
        let mut backend = MockBackend::default().with_rows(
            "character_loot_assignment_counts",
            vec![row_from_pairs([("char_id", "999"), ("character_name", "Gone")])],
        );
        let report = push_loot_counts(&mut backend, temp.path()).expect("push");
        assert_eq!(report.rows, 2);
        assert_eq!(report.removed, 1);
        let stored = backend.rows("character_loot_assignment_counts");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].get("items_assigned"), Some(&json!(2)));
        assert_eq!(stored[1].get("items_assigned"), Some(&json!(0)));
    }
}
