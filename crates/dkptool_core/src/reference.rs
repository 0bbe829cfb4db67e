//! Game-content reference site: item page parsing, mob loot tables and the
//! item stats build.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fetch::{PageFetcher, fetch_cached, read_cached};
use crate::html::{leading_digits, selector, text_compact};
use crate::output::{CsvRow, read_json, write_json, write_rows};

const STAT_LABELS: [&str; 9] = ["STR", "STA", "AGI", "DEX", "WIS", "INT", "CHA", "HP", "MANA"];
const RESIST_LABELS: [(&str, &str); 5] = [
    ("FIRE", "Fire"),
    ("COLD", "Cold"),
    ("MAGIC", "Magic"),
    ("POISON", "Poison"),
    ("DISEASE", "Disease"),
];
const ITEM_FLAGS: [&str; 4] = ["MAGIC ITEM", "LORE ITEM", "NO DROP", "NO TRADE"];
const SAVE_EVERY: usize = 25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatValue {
    pub label: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMod {
    pub label: String,
    pub value: i64,
    pub pct: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemStats {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atk_delay: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dmg: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dmg_bonus: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dmg_bonus_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ac: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mods: Vec<StatValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resists: Vec<StatValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instrument_mods: Vec<InstrumentMod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_level: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect_spell_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect_spell_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_spell_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_spell_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_mod: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub races: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gear_score: Option<i64>,
}

impl ItemStats {
    fn mod_value(&self, label: &str) -> Option<i64> {
        self.mods
            .iter()
            .find(|stat| stat.label.eq_ignore_ascii_case(label))
            .map(|stat| stat.value)
    }

    /// Total saves plus AC plus a third of HP.
    pub fn compute_gear_score(&self) -> i64 {
        let saves: i64 = self.resists.iter().map(|resist| resist.value).sum();
        saves + self.ac.unwrap_or(0) + self.mod_value("HP").unwrap_or(0).div_euclid(3)
    }
}

/// Compiled patterns for item pages, built once per batch.
pub struct ItemPageParser {
    slot: Regex,
    skill: Regex,
    dmg: Regex,
    dmg_bonus: Regex,
    ac: Regex,
    stats: Vec<(&'static str, Regex)>,
    resists: Vec<(&'static str, Regex)>,
    instrument: Regex,
    singing_value: Regex,
    singing_plain: Regex,
    required: Regex,
    recommended: Regex,
    skill_mod: Regex,
    weight: Regex,
    size: Regex,
    classes: Regex,
    races: Regex,
    light: Regex,
    tint: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("failed to compile pattern {pattern}"))
}

impl ItemPageParser {
    pub fn new() -> Result<Self> {
        let stats = STAT_LABELS
            .iter()
            .map(|label| -> Result<(&'static str, Regex)> {
                Ok((*label, compile(&format!(r"\b{label}:\s*\+?(\d+)\b"))?))
            })
            .collect::<Result<Vec<_>>>()?;
        let resists = RESIST_LABELS
            .iter()
            .map(|(token, label)| -> Result<(&'static str, Regex)> {
                Ok((*label, compile(&format!(r"(?i)(?:SV\s+)?{token}:\s*\+?(\d+)"))?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            slot: compile(
                r"(?i)Slot:\s*([A-Za-z0-9\s]+?)(?:\s+Skill:|\s+AC:|\s+STR:|\s+STA:|\s+AGI:|\s+DEX:|\s+WIS:|\s+INT:|\s+CHA:|\s+Required|\s+Recommended|\s+Effect:|\s+Focus|\s+WT:|\s+Class:|\s+Singing|\s+Wind|\s+Brass|\s+Percussion|$)",
            )?,
            skill: compile(r"Skill:\s*([^A]+?)\s+Atk Delay:\s*(\d+)")?,
            dmg: compile(r"DMG:\s*(\d+)")?,
            dmg_bonus: compile(r"Dmg Bonus:\s*(\d+)")?,
            ac: compile(r"AC:\s*(\d+)")?,
            stats,
            resists,
            instrument: compile(
                r"(?i)(Wind|Brass|Percussion|String)\s+Instruments:\s*(\d+)\s*\(([^)]+)\)",
            )?,
            singing_value: compile(r"(?i)Singing:\s*(\d+)\s*\(([^)]+)\)")?,
            singing_plain: compile(r"Singing\s*\(([^)]+)\)")?,
            required: compile(r"(?i)Required level of (\d+)")?,
            recommended: compile(r"(?i)Recommended level of (\d+)")?,
            skill_mod: compile(
                r"Skill Mod:\s*([^\n]+?)(?:\s+[A-Z][a-z]+:|\s+Required|\s+Effect:|\s+WT:)",
            )?,
            weight: compile(r"WT:\s*([\d.]+)")?,
            size: compile(r"(?i)Size:\s*(TINY|SMALL|MEDIUM|LARGE)")?,
            classes: compile(r"Class:\s*([A-Za-z\s]+?)\s*Race:")?,
            races: compile(r"Race:\s*([A-Za-z\s]+?)(?:\s+Light:|\s+Tint:|\s*$)")?,
            light: compile(r"(?i)Light:\s*(\d+)")?,
            tint: compile(r"Tint:\s*\(([^)]+)\)")?,
        })
    }

    /// Parse one item page. `None` when the page carries no recognisable stats.
    pub fn parse(&self, html: &str) -> Result<Option<ItemStats>> {
        let document = Html::parse_document(html);
        let link_sel = selector("a[href]")?;
        let text = document
            .root_element()
            .text()
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let spell_links: Vec<(u64, String)> = document
            .select(&link_sel)
            .filter_map(|link| {
                let href = link.value().attr("href")?;
                let start = href.find("spell.php?id=")? + "spell.php?id=".len();
                let id = leading_digits(&href[start..]).parse::<u64>().ok()?;
                Some((id, text_compact(link)))
            })
            .collect();

        let mut stats = ItemStats {
            flags: ITEM_FLAGS
                .iter()
                .filter(|flag| text.contains(*flag))
                .map(|flag| flag.to_string())
                .collect(),
            ..ItemStats::default()
        };

        stats.slot = capture(&self.slot, &text, 1).map(|slot| slot.trim().to_string());
        if let Some(captures) = self.skill.captures(&text) {
            stats.skill = Some(captures[1].trim().to_string());
            stats.atk_delay = captures[2].parse().ok();
        }
        stats.dmg = capture_int(&self.dmg, &text);
        if let Some(bonus) = capture_int(&self.dmg_bonus, &text) {
            stats.dmg_bonus = Some(bonus);
            stats.dmg_bonus_note = Some("(lvl 65)".to_string());
        }
        stats.ac = capture_int(&self.ac, &text);
        stats.mods = self
            .stats
            .iter()
            .filter_map(|(label, pattern)| {
                capture_int(pattern, &text).map(|value| StatValue {
                    label: label.to_string(),
                    value,
                })
            })
            .collect();
        stats.resists = self
            .resists
            .iter()
            .filter_map(|(label, pattern)| {
                capture_int(pattern, &text).map(|value| StatValue {
                    label: label.to_string(),
                    value,
                })
            })
            .collect();

        for captures in self.instrument.captures_iter(&text) {
            stats.instrument_mods.push(InstrumentMod {
                label: format!("{} Instruments", capitalize(&captures[1])),
                value: captures[2].parse().unwrap_or(0),
                pct: captures[3].trim().to_string(),
            });
        }
        for captures in self.singing_value.captures_iter(&text) {
            stats.instrument_mods.push(InstrumentMod {
                label: "Singing".to_string(),
                value: captures[1].parse().unwrap_or(0),
                pct: captures[2].trim().to_string(),
            });
        }
        for captures in self.singing_plain.captures_iter(&text) {
            stats.instrument_mods.push(InstrumentMod {
                label: "Singing".to_string(),
                value: 0,
                pct: captures[1].trim().to_string(),
            });
        }

        if let Some(level) = capture_int(&self.required, &text) {
            stats.required_level = Some(level);
            stats.level_type = Some("required".to_string());
        } else if let Some(level) = capture_int(&self.recommended, &text) {
            stats.required_level = Some(level);
            stats.level_type = Some("recommended".to_string());
        }

        if text.contains("Effect:")
            && let Some((id, name)) = spell_links.first()
        {
            stats.effect_spell_id = Some(*id);
            stats.effect_spell_name = Some(name.clone());
        }
        if text.contains("Focus Effect:") || text.contains("Focus:") {
            let focus = spell_links.get(1).or(spell_links.first());
            if let Some((id, name)) = focus {
                stats.focus_spell_id = Some(*id);
                stats.focus_spell_name = Some(name.clone());
            }
        }

        stats.skill_mod = capture(&self.skill_mod, &text, 1).map(|value| value.trim().to_string());
        stats.weight = capture(&self.weight, &text, 1).and_then(|value| value.parse::<f64>().ok());
        stats.size = capture(&self.size, &text, 1).map(|value| value.to_ascii_uppercase());
        stats.classes = capture(&self.classes, &text, 1).map(|value| value.trim().to_string());
        stats.races = capture(&self.races, &text, 1).map(|value| value.trim().to_string());
        stats.light = capture_int(&self.light, &text);
        stats.tint =
            capture(&self.tint, &text, 1).map(|value| format!("({})", value.trim()));

        if stats == ItemStats::default() {
            return Ok(None);
        }
        stats.gear_score = Some(stats.compute_gear_score());
        Ok(Some(stats))
    }
}

fn capture<'t>(pattern: &Regex, text: &'t str, group: usize) -> Option<&'t str> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(group))
        .map(|matched| matched.as_str())
}

fn capture_int(pattern: &Regex, text: &str) -> Option<i64> {
    capture(pattern, text, 1).and_then(|value| value.parse::<i64>().ok())
}

fn capitalize(value: &str) -> String {
    let lower = value.to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// One row of `item_stats.csv`.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemStatsCsvRow<'a> {
    pub item_id: u64,
    pub name: &'a str,
    pub stats: &'a ItemStats,
}

impl CsvRow for ItemStatsCsvRow<'_> {
    fn headers() -> &'static [&'static str] {
        &[
            "item_id",
            "name",
            "slot",
            "ac",
            "flags",
            "mods",
            "resists",
            "effect",
            "focus",
            "required_level",
            "classes",
            "weight",
            "size",
        ]
    }

    fn to_record(&self) -> Vec<String> {
        let stats = self.stats;
        let join_stats = |values: &[StatValue]| {
            values
                .iter()
                .map(|stat| format!("{}: {}", stat.label, stat.value))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let spell = |name: &Option<String>, id: Option<u64>| {
            name.clone()
                .filter(|name| !name.is_empty())
                .or_else(|| id.map(|id| id.to_string()))
                .unwrap_or_default()
        };
        vec![
            self.item_id.to_string(),
            self.name.to_string(),
            stats.slot.clone().unwrap_or_default(),
            stats.ac.map(|ac| ac.to_string()).unwrap_or_default(),
            stats.flags.join(" | "),
            join_stats(&stats.mods),
            join_stats(&stats.resists),
            spell(&stats.effect_spell_name, stats.effect_spell_id),
            spell(&stats.focus_spell_name, stats.focus_spell_id),
            stats
                .required_level
                .map(|level| level.to_string())
                .unwrap_or_default(),
            stats.classes.clone().unwrap_or_default(),
            stats.weight.map(|weight| weight.to_string()).unwrap_or_default(),
            stats.size.clone().unwrap_or_default(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LootItem {
    #[serde(default)]
    pub item_id: Option<u64>,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One mob (or merged group of mobs) in `dkp_mob_loot.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MobLootEntry {
    #[serde(default)]
    pub mob: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mobs: Vec<String>,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub loot: Vec<LootItem>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

pub type MobLootTable = BTreeMap<String, MobLootEntry>;

pub fn load_mob_loot(path: &Path) -> Result<MobLootTable> {
    read_json(path)
}

/// Display name of a mob from its entry, falling back to the `Mob|Zone` key.
pub fn mob_name_from_key(key: &str, entry: &MobLootEntry) -> String {
    let mob = entry.mob.trim();
    if !mob.is_empty() {
        return mob.replace('#', "");
    }
    key.split('|')
        .next()
        .unwrap_or_default()
        .replace('#', "")
        .trim()
        .to_string()
}

fn loot_signature(loot: &[LootItem]) -> Vec<(Option<u64>, String)> {
    let mut keys: Vec<(Option<u64>, String)> = loot
        .iter()
        .map(|item| (item.item_id, item.name.trim().to_string()))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateReport {
    pub entries_in: usize,
    pub entries_out: usize,
    pub merged: usize,
    pub dropped_empty: usize,
}

/// Merge mobs whose loot tables are the same set of items. Mobs without loot
/// are dropped.
pub fn aggregate_identical_loot(table: &MobLootTable) -> (MobLootTable, AggregateReport) {
    let mut group_index: HashMap<Vec<(Option<u64>, String)>, usize> = HashMap::new();
    let mut groups: Vec<Vec<(&String, &MobLootEntry)>> = Vec::new();
    let mut out = MobLootTable::new();
    let mut dropped_empty = 0;

    for (key, entry) in table {
        if entry.loot.is_empty() {
            dropped_empty += 1;
            continue;
        }
        let signature = loot_signature(&entry.loot);
        let index = *group_index.entry(signature).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[index].push((key, entry));
    }

    let mut merged = 0;
    for group in groups {
        if let [(key, entry)] = group.as_slice() {
            out.insert((*key).clone(), (*entry).clone());
            continue;
        }
        let mut mob_names: Vec<String> = Vec::new();
        let mut zones: Vec<String> = Vec::new();
        for (key, entry) in &group {
            let name = mob_name_from_key(key, entry);
            if !name.is_empty() && !mob_names.contains(&name) {
                mob_names.push(name);
            }
            let zone = entry.zone.trim();
            if !zone.is_empty() {
                zones.push(zone.to_string());
            }
        }
        mob_names.sort_by_key(|name| name.to_lowercase());
        let zone = most_common(&zones).unwrap_or_default();
        let first = mob_names.first().cloned().unwrap_or_default();
        let suffix = if mob_names.len() > 1 {
            format!(" (+{})", mob_names.len() - 1)
        } else {
            String::new()
        };
        let loot = group
            .first()
            .map(|(_, entry)| entry.loot.clone())
            .unwrap_or_default();
        merged += group.len() - 1;
        out.insert(
            format!("{first}{suffix}|{zone}"),
            MobLootEntry {
                mob: first,
                mobs: mob_names,
                zone,
                loot,
                extra: BTreeMap::new(),
            },
        );
    }

    let report = AggregateReport {
        entries_in: table.len(),
        entries_out: out.len(),
        merged,
        dropped_empty,
    };
    (out, report)
}

/// Most frequent value; ties go to the one seen first.
fn most_common(values: &[String]) -> Option<String> {
    let mut best: Option<(&String, usize)> = None;
    for value in values {
        let count = values.iter().filter(|other| *other == value).count();
        if best.is_none_or(|(_, best_count)| count > best_count) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemIdCollection {
    pub items: Vec<(u64, String)>,
    pub from_mob_loot: usize,
    pub from_raid_sources: usize,
}

/// Unique `(item_id, name)` pairs from mob loot plus raid item sources, sorted by id.
pub fn collect_item_ids(
    mob_loot: &MobLootTable,
    raid_sources: Option<&BTreeMap<String, serde_json::Value>>,
) -> ItemIdCollection {
    let mut seen: BTreeMap<u64, String> = BTreeMap::new();
    for entry in mob_loot.values() {
        for item in &entry.loot {
            let name = item.name.trim();
            if let Some(item_id) = item.item_id
                && !name.is_empty()
            {
                seen.entry(item_id).or_insert_with(|| name.to_string());
            }
        }
    }
    let from_mob_loot = seen.len();

    let mut from_raid_sources = 0;
    for (raw_id, source) in raid_sources.into_iter().flatten() {
        let Ok(item_id) = raw_id.trim().parse::<u64>() else {
            continue;
        };
        let name = source
            .get("name")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if name.is_empty() || seen.contains_key(&item_id) {
            continue;
        }
        seen.insert(item_id, name.to_string());
        from_raid_sources += 1;
    }

    ItemIdCollection {
        items: seen.into_iter().collect(),
        from_mob_loot,
        from_raid_sources,
    }
}

#[derive(Debug, Clone)]
pub struct ItemStatsOptions {
    pub mob_loot_path: PathBuf,
    pub raid_sources_path: Option<PathBuf>,
    pub out_json: PathBuf,
    pub out_csv: Option<PathBuf>,
    pub item_url_template: String,
    pub cache_dir: PathBuf,
    pub limit: Option<usize>,
    pub resume: bool,
    pub refresh: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemStatsReport {
    pub total_ids: usize,
    pub from_mob_loot: usize,
    pub from_raid_sources: usize,
    pub parsed: usize,
    pub empty: usize,
    pub skipped_existing: usize,
    pub failed: usize,
    pub missing_from_cache: usize,
    pub entries_written: usize,
    pub wrote_json: bool,
    pub wrote_csv: bool,
}

pub type ItemStatsMap = BTreeMap<u64, ItemStats>;

pub fn item_url(template: &str, item_id: u64) -> String {
    template.replace("{id}", &item_id.to_string())
}

/// Build `item_stats.json` (and optionally the flattened CSV). With no fetcher
/// only pages already in the cache are parsed.
pub fn build_item_stats(
    fetcher: Option<&mut dyn PageFetcher>,
    options: &ItemStatsOptions,
) -> Result<ItemStatsReport> {
    let mob_loot = load_mob_loot(&options.mob_loot_path)?;
    let raid_sources: Option<BTreeMap<String, serde_json::Value>> = match &options.raid_sources_path
    {
        Some(path) if path.exists() => Some(read_json(path)?),
        _ => None,
    };
    let collection = collect_item_ids(&mob_loot, raid_sources.as_ref());
    let names: HashMap<u64, String> = collection.items.iter().cloned().collect();

    let mut report = ItemStatsReport {
        total_ids: collection.items.len(),
        from_mob_loot: collection.from_mob_loot,
        from_raid_sources: collection.from_raid_sources,
        ..ItemStatsReport::default()
    };

    let mut result: ItemStatsMap = if options.resume && options.out_json.exists() {
        read_json(&options.out_json)?
    } else {
        ItemStatsMap::new()
    };
    if !result.is_empty() {
        info!(entries = result.len(), "resuming item stats");
    }

    let parser = ItemPageParser::new()?;
    let limit = options.limit.unwrap_or(usize::MAX);
    let mut fetcher = fetcher;
    let mut unsaved = 0;

    for (item_id, name) in collection.items.iter().take(limit) {
        if options.resume && result.contains_key(item_id) {
            report.skipped_existing += 1;
            continue;
        }
        let cache_path = options.cache_dir.join(format!("item_{item_id}.html"));
        let html = match fetcher.as_deref_mut() {
            Some(fetcher) => {
                let url = item_url(&options.item_url_template, *item_id);
                match fetch_cached(fetcher, &cache_path, &url, options.refresh) {
                    Ok(page) => page.body,
                    Err(error) => {
                        warn!(item_id, name = name.as_str(), error = %error, "item fetch failed");
                        report.failed += 1;
                        continue;
                    }
                }
            }
            None => match read_cached(&cache_path)? {
                Some(body) => body,
                None => {
                    report.missing_from_cache += 1;
                    continue;
                }
            },
        };

        match parser.parse(&html)? {
            Some(stats) => {
                report.parsed += 1;
                result.insert(*item_id, stats);
            }
            None => {
                report.empty += 1;
                result.insert(*item_id, ItemStats::default());
            }
        }
        unsaved += 1;
        if unsaved >= SAVE_EVERY {
            write_json(&options.out_json, &result)?;
            unsaved = 0;
            info!(entries = result.len(), "saved item stats progress");
        }
    }

    report.entries_written = result.len();
    report.wrote_json = write_json(&options.out_json, &result)?;
    if let Some(csv_path) = &options.out_csv {
        let fallback_names: HashMap<u64, String> = result
            .keys()
            .filter(|id| !names.contains_key(id))
            .map(|id| (*id, format!("Item {id}")))
            .collect();
        let rows: Vec<ItemStatsCsvRow<'_>> = result
            .iter()
            .map(|(item_id, stats)| ItemStatsCsvRow {
                item_id: *item_id,
                name: names
                    .get(item_id)
                    .or_else(|| fallback_names.get(item_id))
                    .map(String::as_str)
                    .unwrap_or_default(),
                stats,
            })
            .collect();
        report.wrote_csv = write_rows(csv_path, &rows)?;
    }
    Ok(report)
}
