//! DKP totals computed from the structured CSVs, without the hosted backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::extract::{
    ACCOUNTS_FILE, CHARACTER_ACCOUNT_FILE, RAID_ATTENDANCE_FILE, RAID_EVENT_ATTENDANCE_FILE,
    RAID_EVENTS_FILE, RAID_LOOT_FILE, RAIDS_FILE,
};
use crate::output::{CsvRow, CsvTable, numeric_key, write_rows};

pub const TOTALS_FILE: &str = "dkp_totals.csv";
pub const BY_ACCOUNT_FILE: &str = "dkp_by_account.csv";
pub const NO_ACCOUNT_ID: &str = "_no_account_";
pub const NO_ACCOUNT_NAME: &str = "(no account)";

/// Which attendance source credited earned points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EarnedSource {
    PerEvent,
    RaidLevel,
}

impl EarnedSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerEvent => "per_event",
            Self::RaidLevel => "raid_level",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacterDkp {
    pub char_id: String,
    pub character_name: String,
    pub earned: f64,
    pub spent: i64,
}

impl CharacterDkp {
    pub fn balance(&self) -> f64 {
        round2(self.earned - self.spent as f64)
    }
}

impl CsvRow for CharacterDkp {
    fn headers() -> &'static [&'static str] {
        &["char_id", "character_name", "earned", "spent", "balance"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.char_id.clone(),
            self.character_name.clone(),
            format_points(self.earned),
            self.spent.to_string(),
            format_points(self.balance()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountDkp {
    pub account_id: String,
    pub name: String,
    pub earned: f64,
    pub spent: i64,
}

impl AccountDkp {
    pub fn balance(&self) -> f64 {
        round2(self.earned - self.spent as f64)
    }
}

impl CsvRow for AccountDkp {
    fn headers() -> &'static [&'static str] {
        &["account_id", "name", "earned", "spent", "balance"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.account_id.clone(),
            self.name.clone(),
            format_points(self.earned),
            self.spent.to_string(),
            format_points(self.balance()),
        ]
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Points with at most two decimals and no trailing zeros.
pub fn format_points(value: f64) -> String {
    let rounded = round2(value);
    let text = format!("{rounded:.2}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" { "0".to_string() } else { text.to_string() }
}

fn parse_points(text: &str) -> f64 {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn parse_cost(text: &str) -> i64 {
    let value = parse_points(text);
    value.trunc() as i64
}

/// Numeric character id, tolerating a trailing `.0` from spreadsheet round trips.
fn numeric_char_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let raw = raw.strip_suffix(".0").unwrap_or(raw);
    (!raw.is_empty() && raw.chars().all(|ch| ch.is_ascii_digit())).then(|| raw.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct DkpOptions {
    /// ISO date; raids before it are not counted.
    pub since: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DkpReport {
    pub earned_source: EarnedSource,
    pub characters: Vec<CharacterDkp>,
    pub accounts: Option<Vec<AccountDkp>>,
    pub raids_excluded: usize,
    pub wrote_totals: bool,
    pub wrote_by_account: bool,
}

#[derive(Debug, Default)]
struct Tally {
    earned: BTreeMap<String, (String, f64)>,
    spent: BTreeMap<String, i64>,
}

impl Tally {
    fn credit(&mut self, key: &str, name: &str, points: f64) {
        let entry = self
            .earned
            .entry(key.to_string())
            .or_insert_with(|| (key.to_string(), 0.0));
        entry.1 += points;
        if !name.is_empty() {
            entry.0 = name.to_string();
        }
    }
}

pub fn compute_dkp(data_dir: &Path, options: &DkpOptions) -> Result<DkpReport> {
    let events_path = data_dir.join(RAID_EVENTS_FILE);
    if !events_path.exists() {
        bail!("{} not found; run `dkptool extract` first", events_path.display());
    }
    let events = CsvTable::read(&events_path)?;
    let mut event_points: HashMap<(String, String), f64> = HashMap::new();
    let mut raid_points: HashMap<String, f64> = HashMap::new();
    for record in events.records() {
        let (raid_id, event_id) = (record.get("raid_id"), record.get("event_id"));
        if raid_id.is_empty() || event_id.is_empty() {
            continue;
        }
        let points = parse_points(record.get("dkp_value"));
        event_points.insert((raid_id.to_string(), event_id.to_string()), points);
        *raid_points.entry(raid_id.to_string()).or_default() += points;
    }

    let window = raid_window(data_dir, options)?;
    let counted = |raid_id: &str| window.counts(raid_id);

    let attendance = CsvTable::read_optional(&data_dir.join(RAID_ATTENDANCE_FILE))?;
    let mut name_to_id: HashMap<String, String> = HashMap::new();
    for record in attendance.iter().flat_map(CsvTable::records) {
        let name = record.get("character_name");
        if let Some(char_id) = numeric_char_id(record.get("char_id"))
            && !name.is_empty()
        {
            name_to_id.entry(name.to_string()).or_insert(char_id);
        }
    }

    let mut tally = Tally::default();
    let event_attendance = CsvTable::read_optional(&data_dir.join(RAID_EVENT_ATTENDANCE_FILE))?
        .filter(|table| !table.is_empty());
    let earned_source = if let Some(table) = event_attendance {
        for record in table.records() {
            let raid_id = record.get("raid_id");
            if !counted(raid_id) {
                continue;
            }
            let points = event_points
                .get(&(raid_id.to_string(), record.get("event_id").to_string()))
                .copied()
                .unwrap_or(0.0);
            let name = record.get("character_name");
            let key = match numeric_char_id(record.get("char_id")) {
                Some(char_id) => char_id,
                None if !name.is_empty() => name_to_id.get(name).cloned().unwrap_or_else(|| name.to_string()),
                None => continue,
            };
            tally.credit(&key, name, points);
        }
        EarnedSource::PerEvent
    } else {
        let Some(table) = attendance.as_ref() else {
            bail!(
                "{} not found (and no {})",
                data_dir.join(RAID_ATTENDANCE_FILE).display(),
                RAID_EVENT_ATTENDANCE_FILE
            );
        };
        for record in table.records() {
            let raid_id = record.get("raid_id");
            if !counted(raid_id) {
                continue;
            }
            let points = raid_points.get(raid_id).copied().unwrap_or(0.0);
            let name = record.get("character_name");
            let key = match numeric_char_id(record.get("char_id")) {
                Some(char_id) => char_id,
                None if !name.is_empty() => name.to_string(),
                None => continue,
            };
            tally.credit(&key, name, points);
        }
        EarnedSource::RaidLevel
    };
    info!(source = earned_source.as_str(), "earned points credited");

    if let Some(loot) = CsvTable::read_optional(&data_dir.join(RAID_LOOT_FILE))? {
        for record in loot.records() {
            if !counted(record.get("raid_id")) {
                continue;
            }
            let key = numeric_char_id(record.get("char_id"))
                .unwrap_or_else(|| record.get("character_name").to_string());
            if key.is_empty() {
                continue;
            }
            *tally.spent.entry(key).or_default() += parse_cost(record.get("cost"));
        }
    }

    let characters = character_totals(tally);
    let accounts = account_totals(data_dir, &characters)?;

    let wrote_totals = write_rows(&data_dir.join(TOTALS_FILE), &characters)?;
    let wrote_by_account = match &accounts {
        Some(rows) => write_rows(&data_dir.join(BY_ACCOUNT_FILE), rows)?,
        None => false,
    };
    Ok(DkpReport {
        earned_source,
        characters,
        accounts,
        raids_excluded: window.excluded,
        wrote_totals,
        wrote_by_account,
    })
}

/// Raids counted under `--since`. `allowed` is `None` when every raid counts;
/// otherwise raids missing from raids.csv are dropped along with the old ones.
struct RaidWindow {
    allowed: Option<HashSet<String>>,
    excluded: usize,
}

impl RaidWindow {
    fn counts(&self, raid_id: &str) -> bool {
        self.allowed
            .as_ref()
            .is_none_or(|allowed| allowed.contains(raid_id))
    }
}

fn raid_window(data_dir: &Path, options: &DkpOptions) -> Result<RaidWindow> {
    let every_raid = RaidWindow {
        allowed: None,
        excluded: 0,
    };
    let Some(since) = options.since.as_deref() else {
        return Ok(every_raid);
    };
    let Some(raids) = CsvTable::read_optional(&data_dir.join(RAIDS_FILE))? else {
        warn!("--since set but raids.csv not found; counting every raid");
        return Ok(every_raid);
    };
    if raids.is_empty() {
        warn!("--since set but raids.csv is empty; counting every raid");
        return Ok(every_raid);
    }
    let mut allowed = HashSet::new();
    let mut excluded = 0;
    for record in raids.records() {
        let date = record.get("date_iso");
        if date.is_empty() || date < since {
            excluded += 1;
        } else {
            allowed.insert(record.get("raid_id").to_string());
        }
    }
    Ok(RaidWindow {
        allowed: Some(allowed),
        excluded,
    })
}

fn character_totals(tally: Tally) -> Vec<CharacterDkp> {
    let Tally { earned, mut spent } = tally;
    let mut rows: Vec<CharacterDkp> = earned
        .into_iter()
        .map(|(key, (name, points))| CharacterDkp {
            spent: spent.remove(&key).unwrap_or(0),
            char_id: key,
            character_name: name,
            earned: round2(points),
        })
        .collect();
    rows.extend(spent.into_iter().map(|(key, cost)| CharacterDkp {
        character_name: key.clone(),
        char_id: key,
        earned: 0.0,
        spent: cost,
    }));
    rows.sort_by(|a, b| {
        b.balance()
            .total_cmp(&a.balance())
            .then_with(|| numeric_key(&a.char_id).cmp(&numeric_key(&b.char_id)))
    });
    rows
}

fn account_totals(data_dir: &Path, characters: &[CharacterDkp]) -> Result<Option<Vec<AccountDkp>>> {
    let links = CsvTable::read_optional(&data_dir.join(CHARACTER_ACCOUNT_FILE))?;
    let accounts = CsvTable::read_optional(&data_dir.join(ACCOUNTS_FILE))?;
    let (Some(links), Some(accounts)) = (links, accounts) else {
        return Ok(None);
    };

    let char_to_account: HashMap<&str, &str> = links
        .records()
        .map(|record| (record.get("char_id"), record.get("account_id")))
        .collect();
    let account_names: HashMap<&str, String> = accounts
        .records()
        .map(|record| {
            let first = record
                .get("toon_names")
                .split(',')
                .map(str::trim)
                .find(|name| !name.is_empty())
                .unwrap_or(record.get("account_id"));
            (record.get("account_id"), first.to_string())
        })
        .collect();

    let mut by_account: BTreeMap<String, AccountDkp> = BTreeMap::new();
    for character in characters {
        let account_id = char_to_account
            .get(character.char_id.as_str())
            .copied()
            .unwrap_or(NO_ACCOUNT_ID);
        let entry = by_account
            .entry(account_id.to_string())
            .or_insert_with(|| AccountDkp {
                account_id: account_id.to_string(),
                name: match account_names.get(account_id) {
                    Some(name) => name.clone(),
                    None if account_id == NO_ACCOUNT_ID => NO_ACCOUNT_NAME.to_string(),
                    None => account_id.to_string(),
                },
                earned: 0.0,
                spent: 0,
            });
        entry.earned = round2(entry.earned + character.earned);
        entry.spent += character.spent;
    }

    let mut rows: Vec<AccountDkp> = by_account.into_values().collect();
    rows.sort_by(|a, b| {
        b.balance()
            .total_cmp(&a.balance())
            .then_with(|| numeric_key(&a.account_id).cmp(&numeric_key(&b.account_id)))
    });
    Ok(Some(rows))
}
