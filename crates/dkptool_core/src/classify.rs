//! Classify raids by the mobs and zones their loot drops from.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::extract::RAID_LOOT_FILE;
use crate::output::{CsvRow, CsvTable, numeric_key, read_json, write_json, write_rows};
use crate::reference::{MobLootTable, load_mob_loot};

pub const ITEMS_SEEN_FILE: &str = "items_seen.json";
pub const ITEMS_TO_MOBS_FILE: &str = "items_seen_to_mobs.json";
pub const OVERRIDES_FILE: &str = "raid_loot_classification.json";
pub const MOB_LOOT_FILE: &str = "dkp_mob_loot.json";
pub const CLASSIFICATIONS_FILE: &str = "raid_classifications.csv";
pub const CLASSIFICATIONS_IMPORT_FILE: &str = "raid_classifications_import.csv";
pub const UNCLASSIFIED_FILE: &str = "unclassified_loot_items.csv";
pub const SOURCES_LOOKUP_FILE: &str = "item_sources_lookup.json";

/// Lowercased name with whitespace runs collapsed.
pub fn match_key(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Mob name for allow-list matching: leading `#` and trailing `|` removed.
pub fn mob_key(name: &str) -> String {
    let trimmed = name.trim();
    let trimmed = trimmed.strip_prefix('#').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix('|').unwrap_or(trimmed);
    trimmed.to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub mob: String,
    #[serde(default)]
    pub zone: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassificationOverrides {
    #[serde(default)]
    pub classifications: BTreeMap<String, Source>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

/// `match_key(item) -> sources`, in first-seen order per item.
pub type SourceLookup = BTreeMap<String, Vec<Source>>;

fn push_source(sources: &mut Vec<Source>, mob: &str, zone: &str) {
    let source = Source {
        mob: mob.trim().to_string(),
        zone: zone.trim().to_string(),
    };
    if !sources.contains(&source) {
        sources.push(source);
    }
}

/// Sources from `items_seen_to_mobs.json` (`item name -> [{mob, zone}]`).
pub fn sources_from_items_to_mobs(raw: &BTreeMap<String, Vec<Source>>) -> SourceLookup {
    let mut lookup = SourceLookup::new();
    for (item_name, sources) in raw {
        let key = match_key(item_name);
        if key.is_empty() {
            continue;
        }
        for source in sources {
            let entry = lookup.entry(key.clone()).or_default();
            push_source(entry, &source.mob, &source.zone);
        }
    }
    lookup.retain(|_, sources| !sources.is_empty());
    lookup
}

/// Sources derived from the mob loot table when no item map is available.
pub fn sources_from_mob_loot(table: &MobLootTable) -> SourceLookup {
    let mut lookup = SourceLookup::new();
    for (key, entry) in table {
        let mob = if entry.mob.trim().is_empty() {
            key.split('|').next().unwrap_or_default()
        } else {
            entry.mob.as_str()
        };
        for item in &entry.loot {
            let item_key = match_key(&item.name);
            if item_key.is_empty() || mob.trim().is_empty() {
                continue;
            }
            push_source(lookup.entry(item_key).or_default(), mob, &entry.zone);
        }
    }
    lookup
}

/// Overrides replace an item's sources outright; aliases copy a canonical
/// item's sources onto a misspelt name.
pub fn apply_overrides(lookup: &mut SourceLookup, overrides: &ClassificationOverrides) {
    for (item_name, source) in &overrides.classifications {
        if source.mob.trim().is_empty() {
            continue;
        }
        let mut sources = Vec::new();
        push_source(&mut sources, &source.mob, &source.zone);
        lookup.insert(match_key(item_name), sources);
    }
    for (typo, canonical) in &overrides.aliases {
        if let Some(sources) = lookup.get(&match_key(canonical)).cloned() {
            lookup.insert(match_key(typo), sources);
        }
    }
}

/// Allowed mob keys and each mob's preferred zone from the mob loot table.
fn mob_allow_list(table: &MobLootTable) -> (HashSet<String>, HashMap<String, String>) {
    let mut allowed = HashSet::new();
    let mut zones: HashMap<String, String> = HashMap::new();
    for (key, entry) in table {
        let raw = if entry.mob.trim().is_empty() {
            key.as_str()
        } else {
            entry.mob.as_str()
        };
        let mob = mob_key(raw);
        if mob.is_empty() {
            continue;
        }
        allowed.insert(mob.clone());
        let zone = entry.zone.trim();
        let slot = zones.entry(mob).or_default();
        if slot.is_empty() && !zone.is_empty() {
            *slot = zone.to_string();
        }
    }
    (allowed, zones)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct RaidClassification {
    pub raid_id: String,
    pub mob: String,
    pub zone: String,
}

impl CsvRow for RaidClassification {
    fn headers() -> &'static [&'static str] {
        &["raid_id", "mob", "zone"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![self.raid_id.clone(), self.mob.clone(), self.zone.clone()]
    }
}

struct UnclassifiedRow(String, usize);

impl CsvRow for UnclassifiedRow {
    fn headers() -> &'static [&'static str] {
        &["item_name", "times_seen"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![self.0.clone(), self.1.to_string()]
    }
}

fn sort_classifications(rows: &mut [RaidClassification]) {
    rows.sort_by(|a, b| {
        a.zone
            .cmp(&b.zone)
            .then_with(|| a.mob.cmp(&b.mob))
            .then_with(|| numeric_key(&a.raid_id).cmp(&numeric_key(&b.raid_id)))
    });
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub rows: Vec<RaidClassification>,
    pub import_rows: Vec<RaidClassification>,
    /// `(item_name, times_seen)`, most frequent first.
    pub unclassified: Vec<(String, usize)>,
}

/// Classify `(raid_id, item_name)` loot pairs against the source lookup.
pub fn classify_loot<'a>(
    loot: impl IntoIterator<Item = (&'a str, &'a str)>,
    lookup: &SourceLookup,
    mob_loot: Option<&MobLootTable>,
) -> Classification {
    let (allowed, preferred_zone) = mob_loot.map(mob_allow_list).unwrap_or_default();

    let mut found: BTreeSet<RaidClassification> = BTreeSet::new();
    let mut unclassified: HashMap<String, usize> = HashMap::new();
    for (raid_id, item_name) in loot {
        let item_name = item_name.trim();
        if item_name.is_empty() {
            continue;
        }
        let Some(sources) = lookup.get(&match_key(item_name)) else {
            *unclassified.entry(item_name.to_string()).or_default() += 1;
            continue;
        };
        for source in sources {
            if source.mob.is_empty() {
                continue;
            }
            let key = mob_key(&source.mob);
            if !allowed.is_empty() && !allowed.contains(&key) {
                continue;
            }
            let zone = preferred_zone
                .get(&key)
                .filter(|zone| !zone.is_empty())
                .cloned()
                .unwrap_or_else(|| source.zone.clone());
            found.insert(RaidClassification {
                raid_id: raid_id.trim().to_string(),
                mob: source.mob.clone(),
                zone,
            });
        }
    }

    let mut rows: Vec<RaidClassification> = found.into_iter().collect();
    sort_classifications(&mut rows);

    let mut by_key: BTreeMap<(String, String), String> = BTreeMap::new();
    for row in &rows {
        let zone = by_key
            .entry((row.raid_id.clone(), row.mob.clone()))
            .or_insert_with(|| row.zone.clone());
        if zone.is_empty() && !row.zone.is_empty() {
            *zone = row.zone.clone();
        }
    }
    let mut import_rows: Vec<RaidClassification> = by_key
        .into_iter()
        .map(|((raid_id, mob), zone)| RaidClassification { raid_id, mob, zone })
        .collect();
    sort_classifications(&mut import_rows);

    let mut unclassified: Vec<(String, usize)> = unclassified.into_iter().collect();
    unclassified.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    Classification {
        rows,
        import_rows,
        unclassified,
    }
}

#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    pub data_dir: PathBuf,
    /// Restrict item sources to names in `items_seen.json`.
    pub use_items_seen: bool,
    /// Restrict mobs to those in `dkp_mob_loot.json` and prefer its zones.
    pub use_mob_loot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifyReport {
    pub loot_rows: usize,
    pub item_keys: usize,
    pub classifications: usize,
    pub import_rows: usize,
    pub unclassified_items: usize,
    pub files_written: Vec<String>,
}

pub fn build_classifications(options: &ClassifyOptions) -> Result<ClassifyReport> {
    let data_dir = &options.data_dir;
    let loot_path = data_dir.join(RAID_LOOT_FILE);
    if !loot_path.exists() {
        bail!("{} not found; run `dkptool extract` first", loot_path.display());
    }
    let loot = CsvTable::read(&loot_path)?;
    if !loot.has_column("raid_id") || !loot.has_column("item_name") {
        bail!("{} must have raid_id and item_name columns", loot_path.display());
    }

    let mob_loot_path = data_dir.join(MOB_LOOT_FILE);
    let mob_loot = if mob_loot_path.exists() {
        Some(load_mob_loot(&mob_loot_path)?)
    } else {
        None
    };

    let items_to_mobs_path = data_dir.join(ITEMS_TO_MOBS_FILE);
    let mut lookup = if items_to_mobs_path.exists() {
        let raw: BTreeMap<String, Vec<Source>> = read_json(&items_to_mobs_path)?;
        sources_from_items_to_mobs(&raw)
    } else if let Some(table) = &mob_loot {
        info!("no item-to-mob map; deriving sources from the mob loot table");
        sources_from_mob_loot(table)
    } else {
        SourceLookup::new()
    };

    let overrides_path = data_dir.join(OVERRIDES_FILE);
    if overrides_path.exists() {
        let overrides: ClassificationOverrides = read_json(&overrides_path)?;
        apply_overrides(&mut lookup, &overrides);
    }

    let items_seen_path = data_dir.join(ITEMS_SEEN_FILE);
    if options.use_items_seen && items_seen_path.exists() {
        let seen: Vec<String> = read_json(&items_seen_path)?;
        let allowed: HashSet<String> = seen.iter().map(|name| match_key(name)).collect();
        if !allowed.is_empty() {
            lookup.retain(|key, _| allowed.contains(key));
            info!(items = allowed.len(), "restricted sources to items seen");
        }
    }

    let records: Vec<(String, String)> = loot
        .records()
        .map(|record| {
            (
                record.get("raid_id").to_string(),
                record.get("item_name").to_string(),
            )
        })
        .collect();
    let mob_filter = if options.use_mob_loot {
        mob_loot.as_ref()
    } else {
        None
    };
    let classification = classify_loot(
        records.iter().map(|(raid, item)| (raid.as_str(), item.as_str())),
        &lookup,
        mob_filter,
    );

    let mut report = ClassifyReport {
        loot_rows: records.len(),
        item_keys: lookup.len(),
        classifications: classification.rows.len(),
        import_rows: classification.import_rows.len(),
        unclassified_items: classification.unclassified.len(),
        files_written: Vec::new(),
    };

    let unclassified: Vec<UnclassifiedRow> = classification
        .unclassified
        .into_iter()
        .map(|(name, count)| UnclassifiedRow(name, count))
        .collect();
    let outputs = [
        (
            CLASSIFICATIONS_FILE,
            write_rows(&data_dir.join(CLASSIFICATIONS_FILE), &classification.rows)?,
        ),
        (
            CLASSIFICATIONS_IMPORT_FILE,
            write_rows(
                &data_dir.join(CLASSIFICATIONS_IMPORT_FILE),
                &classification.import_rows,
            )?,
        ),
        (
            UNCLASSIFIED_FILE,
            write_rows(&data_dir.join(UNCLASSIFIED_FILE), &unclassified)?,
        ),
        (
            SOURCES_LOOKUP_FILE,
            write_json(&data_dir.join(SOURCES_LOOKUP_FILE), &lookup)?,
        ),
    ];
    report.files_written = outputs
        .iter()
        .filter(|(_, wrote)| *wrote)
        .map(|(name, _)| name.to_string())
        .collect();
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemsSeenReport {
    pub items: usize,
    pub wrote_json: bool,
}

/// Write `items_seen.json`: the sorted distinct item names of `raid_loot.csv`.
pub fn build_items_seen(data_dir: &Path) -> Result<ItemsSeenReport> {
    let loot_path = data_dir.join(RAID_LOOT_FILE);
    if !loot_path.exists() {
        bail!("{} not found; run `dkptool extract` first", loot_path.display());
    }
    let loot = CsvTable::read(&loot_path)?;
    if !loot.has_column("item_name") {
        bail!("{} must have an item_name column", loot_path.display());
    }
    let names: BTreeSet<String> = loot
        .records()
        .map(|record| record.get("item_name").to_string())
        .filter(|name| !name.is_empty())
        .collect();
    let names: Vec<String> = names.into_iter().collect();
    let wrote_json = write_json(&data_dir.join(ITEMS_SEEN_FILE), &names)?;
    Ok(ItemsSeenReport {
        items: names.len(),
        wrote_json,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn source(mob: &str, zone: &str) -> Source {
        Source {
            mob: mob.to_string(),
            zone: zone.to_string(),
        }
    }

    #[test]
    fn names_match_case_and_whitespace_insensitively() {
        assert_eq!(match_key("  Cloak   of\tFlames "), "cloak of flames");
        assert_eq!(mob_key("#Lord Nagafen|"), "lord nagafen");
    }

    #[test]
    fn overrides_replace_and_aliases_copy() {
        let mut raw = BTreeMap::new();
        raw.insert(
            "Cloak of Flames".to_string(),
            vec![source("Nagafen", "Sol B"), source("Nagafen", "Sol B")],
        );
        raw.insert("Time Shard".to_string(), vec![source("Quarm", "PoTime")]);
        let mut lookup = sources_from_items_to_mobs(&raw);
        assert_eq!(lookup["cloak of flames"].len(), 1);

        let overrides = ClassificationOverrides {
            classifications: BTreeMap::from([(
                "time shard".to_string(),
                source("Phase 1", "PoTime"),
            )]),
            aliases: BTreeMap::from([("Cloak of Flame".to_string(), "Cloak of Flames".to_string())]),
        };
        apply_overrides(&mut lookup, &overrides);
        assert_eq!(lookup["time shard"], vec![source("Phase 1", "PoTime")]);
        assert_eq!(lookup["cloak of flame"], vec![source("Nagafen", "Sol B")]);
    }

    #[test]
    fn classify_dedupes_and_counts_unclassified() {
        let mut lookup = SourceLookup::new();
        lookup.insert(
            "cloak of flames".to_string(),
            vec![source("Nagafen", ""), source("Vox", "Permafrost")],
        );
        let loot = [
            ("7", "Cloak of Flames"),
            ("7", "cloak of  flames"),
            ("10", "Rusty Axe"),
            ("11", "Rusty Axe"),
            ("11", "Bone Chips"),
        ];
        let result = classify_loot(loot, &lookup, None);
        assert_eq!(
            result.rows,
            vec![
                RaidClassification {
                    raid_id: "7".to_string(),
                    mob: "Nagafen".to_string(),
                    zone: String::new(),
                },
                RaidClassification {
                    raid_id: "7".to_string(),
                    mob: "Vox".to_string(),
                    zone: "Permafrost".to_string(),
                },
            ]
        );
        assert_eq!(
            result.unclassified,
            vec![("Rusty Axe".to_string(), 2), ("Bone Chips".to_string(), 1)]
        );
    }

    #[test]
    fn mob_loot_filters_mobs_and_supplies_zone() {
        let table: MobLootTable = serde_json::from_str(
            r##"{"Nagafen|Sol B": {"mob": "#Nagafen", "zone": "Nagafen's Lair", "loot": []}}"##,
        )
        .expect("table");
        let mut lookup = SourceLookup::new();
        lookup.insert(
            "cloak of flames".to_string(),
            vec![source("Nagafen", ""), source("Vox", "Permafrost")],
        );
        let result = classify_loot([("7", "Cloak of Flames")], &lookup, Some(&table));
        assert_eq!(
            result.import_rows,
            vec![RaidClassification {
                raid_id: "7".to_string(),
                mob: "Nagafen".to_string(),
                zone: "Nagafen's Lair".to_string(),
            }]
        );
    }

    #[test]
    fn build_writes_outputs_and_items_seen() {
        let temp = tempdir().expect("tempdir");
        let data_dir = temp.path().to_path_buf();
        fs::write(
            data_dir.join(RAID_LOOT_FILE),
            "raid_id,event_id,item_name,char_id,character_name,cost\n\
             7,1,Cloak of Flames,101,Frinop,12\n\
             8,2,Rusty Axe,202,Bolt,0\n\
             9,3,Cloak of Flames,202,Bolt,5\n",
        )
        .expect("loot");
        fs::write(
            data_dir.join(MOB_LOOT_FILE),
            r#"{"Nagafen|Sol B": {"mob": "Nagafen", "zone": "Sol B", "loot": [{"item_id": 1, "name": "Cloak of Flames"}]}}"#,
        )
        .expect("mob loot");

        let seen = build_items_seen(&data_dir).expect("items seen");
        assert_eq!(seen.items, 2);
        let items: Vec<String> =
            read_json(&data_dir.join(ITEMS_SEEN_FILE)).expect("read items seen");
        assert_eq!(items, vec!["Cloak of Flames", "Rusty Axe"]);

        let options = ClassifyOptions {
            data_dir: data_dir.clone(),
            use_items_seen: true,
            use_mob_loot: true,
        };
        let report = build_classifications(&options).expect("classify");
        assert_eq!(report.classifications, 2);
        assert_eq!(report.unclassified_items, 1);
        assert_eq!(report.files_written.len(), 4);
        let csv = fs::read_to_string(data_dir.join(CLASSIFICATIONS_IMPORT_FILE)).expect("csv");
        assert_eq!(csv, "raid_id,mob,zone\n7,Nagafen,Sol B\n9,Nagafen,Sol B\n");

        let again = build_classifications(&options).expect("rerun");
        assert!(again.files_written.is_empty());
    }
}
