//! Build the structured CSVs (and optional SQLite mirror) from scraped
//! roster CSVs and cached raid pages.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params_from_iter};
use serde::Serialize;
use tracing::{info, warn};

use crate::accounts::{AccountGroup, character_accounts};
use crate::html::char_id_from_href;
use crate::legacy::{
    EventAttendee, RaidAttendee, RaidEvent, RaidLoot, parse_date_to_iso, parse_event_attendees,
    parse_raid_detail, resolve_event_attendance,
};
use crate::output::{CsvRow, CsvTable, numeric_key, write_rows};
use crate::scrape::{
    ACCOUNT_GROUPS_FILE, RAIDS_INDEX_FILE, ROSTER_FILE, cached_raid_pages, read_raid_index,
};

pub const CHARACTERS_FILE: &str = "characters.csv";
pub const ACCOUNTS_FILE: &str = "accounts.csv";
pub const CHARACTER_ACCOUNT_FILE: &str = "character_account.csv";
pub const RAIDS_FILE: &str = "raids.csv";
pub const RAID_EVENTS_FILE: &str = "raid_events.csv";
pub const RAID_LOOT_FILE: &str = "raid_loot.csv";
pub const RAID_ATTENDANCE_FILE: &str = "raid_attendance.csv";
pub const RAID_EVENT_ATTENDANCE_FILE: &str = "raid_event_attendance.csv";

/// Tables mirrored into SQLite, in write order.
pub const SQLITE_TABLES: [&str; 8] = [
    "characters",
    "accounts",
    "character_account",
    "raids",
    "raid_events",
    "raid_loot",
    "raid_attendance",
    "raid_event_attendance",
];

impl CsvRow for RaidEvent {
    fn headers() -> &'static [&'static str] {
        &[
            "raid_id",
            "event_id",
            "event_order",
            "event_name",
            "dkp_value",
            "attendee_count",
            "event_time",
        ]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.raid_id.clone(),
            self.event_id.clone(),
            self.event_order.to_string(),
            self.event_name.clone(),
            self.dkp_value.clone(),
            self.attendee_count.clone(),
            self.event_time.clone(),
        ]
    }
}

impl CsvRow for RaidLoot {
    fn headers() -> &'static [&'static str] {
        &["raid_id", "event_id", "item_name", "char_id", "character_name", "cost"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.raid_id.clone(),
            self.event_id.clone(),
            self.item_name.clone(),
            self.char_id.clone(),
            self.character_name.clone(),
            self.cost.clone(),
        ]
    }
}

impl CsvRow for RaidAttendee {
    fn headers() -> &'static [&'static str] {
        &["raid_id", "char_id", "character_name"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.raid_id.clone(),
            self.char_id.clone(),
            self.character_name.clone(),
        ]
    }
}

impl CsvRow for EventAttendee {
    fn headers() -> &'static [&'static str] {
        &["raid_id", "event_id", "char_id", "character_name"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.raid_id.clone(),
            self.event_id.clone(),
            self.char_id.clone(),
            self.character_name.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacterRow {
    pub char_id: String,
    pub name: String,
    pub race: String,
    pub class_name: String,
    pub level: String,
    pub guild_rank: String,
    pub claim: String,
}

impl CsvRow for CharacterRow {
    fn headers() -> &'static [&'static str] {
        &["char_id", "name", "race", "class_name", "level", "guild_rank", "claim"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.char_id.clone(),
            self.name.clone(),
            self.race.clone(),
            self.class_name.clone(),
            self.level.clone(),
            self.guild_rank.clone(),
            self.claim.clone(),
        ]
    }
}

struct AccountRow<'a>(&'a AccountGroup);

impl CsvRow for AccountRow<'_> {
    fn headers() -> &'static [&'static str] {
        &["account_id", "toon_count", "toon_names", "char_ids"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.0.account_id.clone(),
            self.0.toon_count.to_string(),
            self.0.toon_names.join(","),
            self.0.char_ids.join(","),
        ]
    }
}

struct CharacterAccountRow(String, String);

impl CsvRow for CharacterAccountRow {
    fn headers() -> &'static [&'static str] {
        &["char_id", "account_id"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![self.0.clone(), self.1.clone()]
    }
}

struct RaidRow {
    raid_id: String,
    raid_pool: String,
    raid_name: String,
    date: String,
    date_iso: String,
    attendees: String,
    url: String,
}

impl CsvRow for RaidRow {
    fn headers() -> &'static [&'static str] {
        &[
            "raid_id",
            "raid_pool",
            "raid_name",
            "date",
            "date_iso",
            "attendees",
            "url",
        ]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.raid_id.clone(),
            self.raid_pool.clone(),
            self.raid_name.clone(),
            self.date.clone(),
            self.date_iso.clone(),
            self.attendees.clone(),
            self.url.clone(),
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Only parse the first N cached raid pages.
    pub limit: Option<usize>,
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub characters: usize,
    pub accounts: usize,
    pub character_accounts: usize,
    pub raids: usize,
    pub raid_pages: usize,
    pub raid_events: usize,
    pub raid_loot: usize,
    pub raid_attendance: usize,
    pub raid_event_attendance: usize,
    pub files_written: Vec<String>,
    pub sqlite_tables: usize,
}

pub fn extract_structured(
    cache_dir: &Path,
    data_dir: &Path,
    options: &ExtractOptions,
) -> Result<ExtractReport> {
    let mut report = ExtractReport::default();

    let roster_path = data_dir.join(ROSTER_FILE);
    if !roster_path.exists() {
        bail!(
            "{} not found; run `dkptool scrape roster` first",
            roster_path.display()
        );
    }
    let characters = build_characters(&CsvTable::read(&roster_path)?);
    report.characters = characters.len();
    let wrote = write_rows(&data_dir.join(CHARACTERS_FILE), &characters)?;
    note_write(&mut report, CHARACTERS_FILE, wrote);

    let groups_path = data_dir.join(ACCOUNT_GROUPS_FILE);
    if let Some(table) = CsvTable::read_optional(&groups_path)? {
        let groups: Vec<AccountGroup> = table.records().map(|r| AccountGroup::from_record(&r)).collect();
        let account_rows: Vec<AccountRow<'_>> = groups.iter().map(AccountRow).collect();
        report.accounts = account_rows.len();
        let wrote = write_rows(&data_dir.join(ACCOUNTS_FILE), &account_rows)?;
        note_write(&mut report, ACCOUNTS_FILE, wrote);

        let links: Vec<CharacterAccountRow> = character_accounts(&groups)
            .into_iter()
            .map(|(char_id, account_id)| CharacterAccountRow(char_id, account_id))
            .collect();
        report.character_accounts = links.len();
        let wrote = write_rows(&data_dir.join(CHARACTER_ACCOUNT_FILE), &links)?;
        note_write(&mut report, CHARACTER_ACCOUNT_FILE, wrote);
    } else {
        warn!(path = %groups_path.display(), "no account groups; skipping accounts.csv");
    }

    let index = read_raid_index(&data_dir.join(RAIDS_INDEX_FILE))?;
    let mut raids: Vec<RaidRow> = index
        .into_values()
        .map(|row| RaidRow {
            date_iso: parse_date_to_iso(&row.date),
            raid_id: row.raid_id,
            raid_pool: row.raid_pool,
            raid_name: row.raid_name,
            date: row.date,
            attendees: row.attendees,
            url: row.url,
        })
        .collect();
    raids.sort_by_key(|row| numeric_key(&row.raid_id));
    report.raids = raids.len();
    let wrote = write_rows(&data_dir.join(RAIDS_FILE), &raids)?;
    note_write(&mut report, RAIDS_FILE, wrote);

    let mut pages = cached_raid_pages(cache_dir)?;
    if let Some(limit) = options.limit {
        pages.truncate(limit);
    }
    let mut events = Vec::new();
    let mut loot = Vec::new();
    let mut attendance = Vec::new();
    let mut event_attendance = Vec::new();
    for (index, (raid_id, path)) in pages.iter().enumerate() {
        let html = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let detail = parse_raid_detail(&html, raid_id)?;
        let attendees_path = path.with_file_name(format!("raid_{raid_id}_attendees.html"));
        if attendees_path.exists() {
            let attendees_html = fs::read_to_string(&attendees_path)
                .with_context(|| format!("failed to read {}", attendees_path.display()))?;
            let sections = parse_event_attendees(&attendees_html)?;
            event_attendance.extend(resolve_event_attendance(
                raid_id,
                &sections,
                &detail.events,
                &detail.attendees,
            ));
        }
        events.extend(detail.events);
        loot.extend(detail.loot);
        attendance.extend(detail.attendees);
        report.raid_pages += 1;
        if (index + 1) % 200 == 0 {
            info!(parsed = index + 1, total = pages.len(), "parsing raid pages");
        }
    }

    report.raid_events = events.len();
    report.raid_loot = loot.len();
    report.raid_attendance = attendance.len();
    report.raid_event_attendance = event_attendance.len();
    let wrote = write_rows(&data_dir.join(RAID_EVENTS_FILE), &events)?;
    note_write(&mut report, RAID_EVENTS_FILE, wrote);
    let wrote = write_rows(&data_dir.join(RAID_LOOT_FILE), &loot)?;
    note_write(&mut report, RAID_LOOT_FILE, wrote);
    let wrote = write_rows(&data_dir.join(RAID_ATTENDANCE_FILE), &attendance)?;
    note_write(&mut report, RAID_ATTENDANCE_FILE, wrote);
    let wrote = write_rows(&data_dir.join(RAID_EVENT_ATTENDANCE_FILE), &event_attendance)?;
    note_write(&mut report, RAID_EVENT_ATTENDANCE_FILE, wrote);

    if let Some(db_path) = options.sqlite_path.as_deref() {
        report.sqlite_tables = write_sqlite_mirror(data_dir, db_path)?;
    }
    Ok(report)
}

fn note_write(report: &mut ExtractReport, file: &str, wrote: bool) {
    if wrote {
        report.files_written.push(file.to_string());
    }
}

fn build_characters(roster: &CsvTable) -> Vec<CharacterRow> {
    // Older roster exports used `class` rather than `class_name`.
    let class_column = if roster.has_column("class_name") {
        "class_name"
    } else {
        "class"
    };
    roster
        .records()
        .map(|record| CharacterRow {
            char_id: char_id_from_href(record.get("character_url")).unwrap_or_default(),
            name: record.get("name").to_string(),
            race: record.get("race").to_string(),
            class_name: record.get(class_column).to_string(),
            level: record.get("level").to_string(),
            guild_rank: record.get("guild_rank").to_string(),
            claim: record.get("claim").to_string(),
        })
        .collect()
}

/// Replace one SQLite table per structured CSV. Returns the number of tables written.
pub fn write_sqlite_mirror(data_dir: &Path, db_path: &Path) -> Result<usize> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let transaction = connection
        .transaction()
        .context("failed to start sqlite mirror transaction")?;

    let mut written = 0usize;
    for table_name in SQLITE_TABLES {
        let csv_path = data_dir.join(format!("{table_name}.csv"));
        let Some(table) = CsvTable::read_optional(&csv_path)? else {
            continue;
        };
        let columns: Vec<String> = table
            .headers
            .iter()
            .map(|header| format!("\"{}\" TEXT", header.replace('"', "")))
            .collect();
        transaction
            .execute_batch(&format!(
                "DROP TABLE IF EXISTS \"{table_name}\"; CREATE TABLE \"{table_name}\" ({});",
                columns.join(", ")
            ))
            .with_context(|| format!("failed to recreate sqlite table {table_name}"))?;

        let placeholders: Vec<String> = (1..=table.headers.len()).map(|i| format!("?{i}")).collect();
        let mut statement = transaction
            .prepare(&format!(
                "INSERT INTO \"{table_name}\" VALUES ({})",
                placeholders.join(", ")
            ))
            .with_context(|| format!("failed to prepare insert for {table_name}"))?;
        for row in &table.rows {
            let values = (0..table.headers.len()).map(|i| row.get(i).map(String::as_str).unwrap_or(""));
            statement
                .execute(params_from_iter(values))
                .with_context(|| format!("failed to insert into {table_name}"))?;
        }
        written += 1;
        info!(table = table_name, rows = table.rows.len(), "sqlite table written");
    }
    transaction
        .commit()
        .context("failed to commit sqlite mirror transaction")?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const RAID_PAGE: &str = r#"
<div class="subtitle"><h1>Plane of Fear</h1></div>
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
  <b>Dracoliche - 1 Attendees</b>
  <div class="data1"><table><tr><td>B Bolt</td></tr></table></div>
</div>"#;

    fn seed(root: &Path) -> (PathBuf, PathBuf) {
        let data_dir = root.join("data");
        let raids_dir = root.join("cache").join("raids");
        fs::create_dir_all(&data_dir).expect("data");
        fs::create_dir_all(&raids_dir).expect("raids");
        fs::write(
            data_dir.join(ROSTER_FILE),
            "name,race,class_name,level,guild_rank,claim,character_url\n\
             Frinop,Gnome,Enchanter,60,Officer,,/c.php?char=101\n\
             Bolt,Gnome,Wizard,60,Member,,/c.php?char=202\n",
        )
        .expect("roster");
        fs::write(
            data_dir.join(ACCOUNT_GROUPS_FILE),
            "account_id,char_ids,toon_names,toon_count\n202,\"101,202\",\"Bolt,Frinop\",2\n",
        )
        .expect("groups");
        fs::write(
            data_dir.join(RAIDS_INDEX_FILE),
            "raid_id,raid_pool,raid_name,date,attendees,url\n7,562,Plane of Fear,\"Fri Feb 13, 2026 2:00 am\",2,u\n",
        )
        .expect("index");
        fs::write(raids_dir.join("raid_7.html"), RAID_PAGE).expect("raid page");
        fs::write(raids_dir.join("raid_7_attendees.html"), ATTENDEES_PAGE).expect("attendees");
        (root.join("cache"), data_dir)
    }

    #[test]
    fn extract_writes_every_structured_csv() {
        let temp = tempdir().expect("tempdir");
        let (cache_dir, data_dir) = seed(temp.path());
        let report =
            extract_structured(&cache_dir, &data_dir, &ExtractOptions::default()).expect("extract");
        assert_eq!(report.characters, 2);
        assert_eq!(report.accounts, 1);
        assert_eq!(report.character_accounts, 2);
        assert_eq!(report.raids, 1);
        assert_eq!(report.raid_events, 1);
        assert_eq!(report.raid_loot, 1);
        assert_eq!(report.raid_attendance, 2);
        assert_eq!(report.raid_event_attendance, 1);
        assert_eq!(report.files_written.len(), 8);

        let raids = fs::read_to_string(data_dir.join(RAIDS_FILE)).expect("raids");
        assert!(raids.contains("2026-02-13"));
        let accounts = fs::read_to_string(data_dir.join(ACCOUNTS_FILE)).expect("accounts");
        assert!(accounts.starts_with("account_id,toon_count,toon_names,char_ids\n"));
        let event_attendance =
            fs::read_to_string(data_dir.join(RAID_EVENT_ATTENDANCE_FILE)).expect("event attendance");
        assert_eq!(
            event_attendance,
            "raid_id,event_id,char_id,character_name\n7,5,202,Bolt\n"
        );

        let again =
            extract_structured(&cache_dir, &data_dir, &ExtractOptions::default()).expect("rerun");
        assert!(again.files_written.is_empty());
    }

    #[test]
    fn sqlite_mirror_has_one_table_per_csv() {
        let temp = tempdir().expect("tempdir");
        let (cache_dir, data_dir) = seed(temp.path());
        let db_path = data_dir.join("dkp.db");
        let options = ExtractOptions {
            limit: None,
            sqlite_path: Some(db_path.clone()),
        };
        let report = extract_structured(&cache_dir, &data_dir, &options).expect("extract");
        assert_eq!(report.sqlite_tables, SQLITE_TABLES.len());
        // Running twice replaces rather than appends.
        extract_structured(&cache_dir, &data_dir, &options).expect("rerun");

        let connection = Connection::open(&db_path).expect("open");
        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM raid_loot", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
        let name: String = connection
            .query_row("SELECT name FROM characters WHERE char_id = '202'", [], |row| row.get(0))
            .expect("name");
        assert_eq!(name, "Bolt");
    }

    #[test]
    fn unreadable_raid_page_fails_the_extract() {
        let temp = tempdir().expect("tempdir");
        let (cache_dir, data_dir) = seed(temp.path());
        fs::write(cache_dir.join("raids").join("raid_8.html"), [0xff, 0xfe, 0x00]).expect("page");
        let error = extract_structured(&cache_dir, &data_dir, &ExtractOptions::default())
            .expect_err("bad page");
        assert!(format!("{error:#}").contains("raid_8.html"));
    }

    #[test]
    fn missing_roster_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let error = extract_structured(temp.path(), temp.path(), &ExtractOptions::default())
            .expect_err("missing roster");
        assert!(error.to_string().contains("scrape roster"));
    }
}
