//! Scrape loops over the legacy guild site. Listing pages are always fetched
//! fresh; detail pages are reused from the cache unless a refresh is asked for.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::accounts::{AccountGroup, LinkedToons, group_accounts};
use crate::fetch::{PageFetcher, fetch_cached};
use crate::html::char_id_from_href;
use crate::legacy::{
    MemberDkp, RaidListing, parse_date_to_iso, parse_linked_toons, parse_members_dkp,
    parse_raid_list_page, parse_raid_meta, parse_roster_page,
};
use crate::output::{CsvRecord, CsvRow, CsvTable, numeric_key, write_json, write_rows};

pub const ROSTER_FILE: &str = "roster_full.csv";
pub const LINKED_FILE: &str = "roster_linked.csv";
pub const ACCOUNT_GROUPS_FILE: &str = "account_groups.csv";
pub const RAIDS_INDEX_FILE: &str = "raids_index.csv";
pub const MEMBERS_SNAPSHOT_FILE: &str = "members_dkp_snapshot.json";

/// URL builder for the legacy guild site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacySite {
    pub base_url: String,
    pub guild_id: u64,
}

impl LegacySite {
    pub fn new(base_url: &str, guild_id: u64) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            guild_id,
        }
    }

    pub fn roster_url(&self, page: Option<u32>) -> String {
        let mut url = format!(
            "{}/roster.php?no_min_roster=&roster_mode=&sorter=&guild_game_id=&gid={}",
            self.base_url, self.guild_id
        );
        if let Some(page) = page {
            url.push_str(&format!("&paging_page={page}"));
        }
        url
    }

    pub fn raid_list_url(&self, raid_pool: Option<&str>, page: Option<u32>) -> String {
        match (raid_pool, page) {
            (Some(pool), Some(page)) => format!(
                "{}/rapid_raid/raids.php?raid_pool={pool}&mode=past&paging_page={page}&sorter=&gid={}",
                self.base_url, self.guild_id
            ),
            _ => format!(
                "{}/rapid_raid/raids.php?mode=past&gid={}&ts=3:1",
                self.base_url, self.guild_id
            ),
        }
    }

    pub fn raid_details_url(&self, raid_pool: &str, raid_id: &str) -> String {
        format!(
            "{}/rapid_raid/raid_details.php?raid_pool={raid_pool}&raidId={raid_id}&gid={}",
            self.base_url, self.guild_id
        )
    }

    pub fn raid_attendees_url(&self, raid_pool: &str, raid_id: &str) -> String {
        format!(
            "{}/rapid_raid/raid_details_attendees.php?raidId={raid_id}&gid={}&raid_pool={raid_pool}",
            self.base_url, self.guild_id
        )
    }

    pub fn members_dkp_url(&self) -> String {
        format!("{}/rapid_raid/members.php?gid={}", self.base_url, self.guild_id)
    }

    /// Resolve a site-relative link such as a roster `character_url`.
    pub fn absolute(&self, href: &str) -> String {
        let href = href.trim();
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if let Some(path) = href.strip_prefix('/') {
            format!("{}/{path}", self.base_url)
        } else {
            format!("{}/{href}", self.base_url)
        }
    }
}

fn cache_file(cache_dir: &Path, kind: &str, name: &str) -> PathBuf {
    cache_dir.join(kind).join(format!("{name}.html"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RosterScrapeReport {
    pub pages_fetched: usize,
    pub last_page: u32,
    pub rows_seen: usize,
    pub unique_rows: usize,
    pub stopped_early: Option<String>,
    pub wrote_csv: bool,
}

/// Walk every roster page and write `roster_full.csv`.
pub fn scrape_roster<F: PageFetcher + ?Sized>(
    fetcher: &mut F,
    site: &LegacySite,
    cache_dir: &Path,
    data_dir: &Path,
) -> Result<RosterScrapeReport> {
    let mut report = RosterScrapeReport::default();
    let first_url = site.roster_url(None);
    let first = fetch_cached(
        fetcher,
        &cache_file(cache_dir, "roster", "roster_0"),
        &first_url,
        true,
    )
    .context("failed to fetch the first roster page; check the cookie file")?;
    let first_page = parse_roster_page(&first.body)?;
    if !first.body.to_ascii_lowercase().contains("characters found") {
        warn!("first roster page has no \"Characters Found\" marker; the session may be logged out");
    }
    report.pages_fetched = 1;
    report.last_page = first_page.last_page;
    info!(page = 0, rows = first_page.rows.len(), last_page = first_page.last_page, "roster page");

    let mut rows = first_page.rows;
    for page in 1..=report.last_page {
        let url = site.roster_url(Some(page));
        let cache_path = cache_file(cache_dir, "roster", &format!("roster_{page}"));
        match fetch_cached(fetcher, &cache_path, &url, true) {
            Ok(fetched) => {
                let parsed = parse_roster_page(&fetched.body)?;
                info!(page, rows = parsed.rows.len(), "roster page");
                rows.extend(parsed.rows);
                report.pages_fetched += 1;
            }
            Err(error) => {
                warn!(page, error = %error, "roster page failed; stopping");
                report.stopped_early = Some(format!("page {page}: {error}"));
                break;
            }
        }
    }

    report.rows_seen = rows.len();
    let mut seen = HashSet::new();
    rows.retain(|row| seen.insert((row.name.clone(), row.character_url.clone())));
    report.unique_rows = rows.len();
    report.wrote_csv = write_rows(&data_dir.join(ROSTER_FILE), &rows)?;
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkedScrapeReport {
    pub characters: usize,
    pub fetched: usize,
    pub reused_from_account: usize,
    pub failed: usize,
    pub accounts: usize,
    pub wrote_linked: bool,
    pub wrote_groups: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LinkedScrapeOptions {
    pub limit: Option<usize>,
    pub refresh: bool,
}

/// Visit each roster character page, collect its linked characters and write
/// `roster_linked.csv` plus `account_groups.csv`.
pub fn scrape_linked<F: PageFetcher + ?Sized>(
    fetcher: &mut F,
    site: &LegacySite,
    cache_dir: &Path,
    data_dir: &Path,
    options: &LinkedScrapeOptions,
) -> Result<LinkedScrapeReport> {
    let roster_path = data_dir.join(ROSTER_FILE);
    if !roster_path.exists() {
        bail!(
            "{} not found; run `dkptool scrape roster` first",
            roster_path.display()
        );
    }
    let roster = CsvTable::read(&roster_path)?;
    if !roster.has_column("name") || !roster.has_column("character_url") {
        bail!("{} must have `name` and `character_url` columns", roster_path.display());
    }

    let mut targets: Vec<(String, String, String)> = Vec::new();
    let mut seen_ids = HashSet::new();
    for record in roster.records() {
        let url = record.get("character_url");
        let Some(char_id) = char_id_from_href(url) else {
            continue;
        };
        if seen_ids.insert(char_id.clone()) {
            targets.push((record.get("name").to_string(), char_id, url.to_string()));
        }
    }
    if let Some(limit) = options.limit {
        targets.truncate(limit);
    }

    let mut report = LinkedScrapeReport {
        characters: targets.len(),
        ..LinkedScrapeReport::default()
    };
    let mut covered: HashMap<String, Vec<(String, String)>> = HashMap::new();
    let mut linked_rows = Vec::with_capacity(targets.len());

    for (name, char_id, url) in targets {
        let mut linked = if let Some(known) = covered.get(&char_id) {
            report.reused_from_account += 1;
            known.clone()
        } else {
            let cache_path = cache_file(cache_dir, "characters", &format!("char_{char_id}"));
            match fetch_cached(fetcher, &cache_path, &site.absolute(&url), options.refresh) {
                Ok(page) => {
                    report.fetched += 1;
                    parse_linked_toons(&page.body)?
                }
                Err(error) => {
                    warn!(character = name.as_str(), error = %error, "character page failed");
                    report.failed += 1;
                    Vec::new()
                }
            }
        };
        if !linked.iter().any(|(id, _)| *id == char_id) {
            linked.insert(0, (char_id.clone(), name.clone()));
        }
        for (linked_id, _) in &linked {
            covered.insert(linked_id.clone(), linked.clone());
        }
        linked_rows.push(LinkedToons {
            name,
            char_id,
            linked_names: linked.iter().map(|(_, name)| name.clone()).collect(),
            linked_char_ids: linked.iter().map(|(id, _)| id.clone()).collect(),
        });
    }

    let groups: Vec<AccountGroup> = group_accounts(&linked_rows);
    report.accounts = groups.len();
    report.wrote_linked = write_rows(&data_dir.join(LINKED_FILE), &linked_rows)?;
    report.wrote_groups = write_rows(&data_dir.join(ACCOUNT_GROUPS_FILE), &groups)?;
    Ok(report)
}

/// One row of `raids_index.csv`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RaidIndexRow {
    pub raid_id: String,
    pub raid_pool: String,
    pub raid_name: String,
    pub date: String,
    pub attendees: String,
    pub url: String,
}

impl RaidIndexRow {
    pub fn from_record(record: &CsvRecord<'_>) -> Self {
        Self {
            raid_id: record.get("raid_id").to_string(),
            raid_pool: record.get("raid_pool").to_string(),
            raid_name: record.get("raid_name").to_string(),
            date: record.get("date").to_string(),
            attendees: record.get("attendees").to_string(),
            url: record.get("url").to_string(),
        }
    }
}

impl CsvRow for RaidIndexRow {
    fn headers() -> &'static [&'static str] {
        &["raid_id", "raid_pool", "raid_name", "date", "attendees", "url"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.raid_id.clone(),
            self.raid_pool.clone(),
            self.raid_name.clone(),
            self.date.clone(),
            self.attendees.clone(),
            self.url.clone(),
        ]
    }
}

pub fn read_raid_index(path: &Path) -> Result<BTreeMap<String, RaidIndexRow>> {
    let mut rows = BTreeMap::new();
    if let Some(table) = CsvTable::read_optional(path)? {
        for record in table.records() {
            let row = RaidIndexRow::from_record(&record);
            if !row.raid_id.is_empty() {
                rows.insert(row.raid_id.clone(), row);
            }
        }
    }
    Ok(rows)
}

fn write_raid_index(path: &Path, rows: &BTreeMap<String, RaidIndexRow>) -> Result<bool> {
    let mut ordered: Vec<&RaidIndexRow> = rows.values().collect();
    ordered.sort_by_key(|row| numeric_key(&row.raid_id));
    let owned: Vec<RaidIndexRow> = ordered.into_iter().cloned().collect();
    write_rows(path, &owned)
}

#[derive(Debug, Clone, Default)]
pub struct RaidScrapeOptions {
    pub limit_pages: Option<u32>,
    pub limit_raids: Option<usize>,
    /// ISO date; raids before it are skipped.
    pub since_date: Option<String>,
    /// Fetch only these raids instead of walking the list.
    pub raid_ids: Vec<String>,
    pub with_attendees: bool,
    pub refresh: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RaidScrapeReport {
    pub raid_pool: String,
    pub list_pages: usize,
    pub listed: usize,
    pub selected: usize,
    pub details_fetched: usize,
    pub details_cached: usize,
    pub attendee_pages: usize,
    pub failed: usize,
    pub index_rows: usize,
    pub wrote_index: bool,
}

/// Walk the past-raids list, save each raid detail page (and optionally the
/// by-event attendees page) and merge the results into `raids_index.csv`.
pub fn scrape_raids<F: PageFetcher + ?Sized>(
    fetcher: &mut F,
    site: &LegacySite,
    cache_dir: &Path,
    data_dir: &Path,
    options: &RaidScrapeOptions,
) -> Result<RaidScrapeReport> {
    let first_url = site.raid_list_url(None, None);
    let first = fetch_cached(
        fetcher,
        &cache_file(cache_dir, "raids", "raids_list_0"),
        &first_url,
        true,
    )
    .context("failed to fetch the past raids list; check the cookie file")?;
    let first_page = parse_raid_list_page(&first.body)?;
    let Some(raid_pool) = first_page.raid_pool.clone() else {
        bail!("could not determine raid_pool from the first raid list page");
    };
    info!(raid_pool = raid_pool.as_str(), last_page = first_page.last_page, "raid list");

    let mut report = RaidScrapeReport {
        raid_pool: raid_pool.clone(),
        list_pages: 1,
        ..RaidScrapeReport::default()
    };

    let mut listings: Vec<RaidListing> = Vec::new();
    if options.raid_ids.is_empty() {
        listings.extend(first_page.raids);
        let mut last_page = first_page.last_page;
        if let Some(limit) = options.limit_pages {
            last_page = last_page.min(limit);
        }
        for page in 1..=last_page {
            let url = site.raid_list_url(Some(&raid_pool), Some(page));
            let cache_path = cache_file(cache_dir, "raids", &format!("raids_list_{page}"));
            match fetch_cached(fetcher, &cache_path, &url, true) {
                Ok(fetched) => {
                    let parsed = parse_raid_list_page(&fetched.body)?;
                    info!(page, raids = parsed.raids.len(), "raid list page");
                    listings.extend(parsed.raids);
                    report.list_pages += 1;
                }
                Err(error) => {
                    warn!(page, error = %error, "raid list page failed");
                }
            }
        }
    } else {
        listings.extend(options.raid_ids.iter().map(|raid_id| RaidListing {
            raid_id: raid_id.trim().to_string(),
            raid_pool: raid_pool.clone(),
            raid_name: String::new(),
            date: String::new(),
        }));
    }

    let mut seen = HashSet::new();
    listings.retain(|listing| !listing.raid_id.is_empty() && seen.insert(listing.raid_id.clone()));
    report.listed = listings.len();
    listings.sort_by(|a, b| {
        parse_date_to_iso(&b.date)
            .cmp(&parse_date_to_iso(&a.date))
            .then_with(|| numeric_key(&b.raid_id).cmp(&numeric_key(&a.raid_id)))
    });
    if options.raid_ids.is_empty()
        && let Some(since) = options.since_date.as_deref()
    {
        listings.retain(|listing| parse_date_to_iso(&listing.date).as_str() >= since);
    }
    if let Some(limit) = options.limit_raids {
        listings.truncate(limit);
    }
    report.selected = listings.len();

    let index_path = data_dir.join(RAIDS_INDEX_FILE);
    let mut index = read_raid_index(&index_path)?;

    for listing in &listings {
        let pool = if listing.raid_pool.is_empty() {
            raid_pool.as_str()
        } else {
            listing.raid_pool.as_str()
        };
        let url = site.raid_details_url(pool, &listing.raid_id);
        let cache_path = cache_file(cache_dir, "raids", &format!("raid_{}", listing.raid_id));
        let page = match fetch_cached(fetcher, &cache_path, &url, options.refresh) {
            Ok(page) => page,
            Err(error) => {
                warn!(raid_id = listing.raid_id.as_str(), error = %error, "raid detail failed");
                report.failed += 1;
                continue;
            }
        };
        if page.from_cache {
            report.details_cached += 1;
        } else {
            report.details_fetched += 1;
        }

        if options.with_attendees {
            let attendees_path =
                cache_file(cache_dir, "raids", &format!("raid_{}_attendees", listing.raid_id));
            let attendees_url = site.raid_attendees_url(pool, &listing.raid_id);
            match fetch_cached(fetcher, &attendees_path, &attendees_url, options.refresh) {
                Ok(_) => report.attendee_pages += 1,
                Err(error) => {
                    warn!(raid_id = listing.raid_id.as_str(), error = %error, "attendees page failed");
                }
            }
        }

        let meta = parse_raid_meta(&page.body)?;
        index.insert(
            listing.raid_id.clone(),
            RaidIndexRow {
                raid_id: listing.raid_id.clone(),
                raid_pool: pool.to_string(),
                raid_name: first_non_empty(&meta.raid_name, &listing.raid_name),
                date: first_non_empty(&listing.date, &meta.date),
                attendees: meta.attendees,
                url,
            },
        );
    }

    report.index_rows = index.len();
    report.wrote_index = write_raid_index(&index_path, &index)?;
    Ok(report)
}

fn first_non_empty(preferred: &str, fallback: &str) -> String {
    if preferred.trim().is_empty() {
        fallback.trim().to_string()
    } else {
        preferred.trim().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexRefreshReport {
    pub pages_read: usize,
    pub rows_updated: usize,
    pub index_rows: usize,
    pub wrote_index: bool,
}

/// Re-derive raid names, dates and attendee counts in `raids_index.csv` from
/// the raid detail pages already in the cache.
pub fn refresh_raid_index(
    site: Option<&LegacySite>,
    cache_dir: &Path,
    data_dir: &Path,
) -> Result<IndexRefreshReport> {
    let index_path = data_dir.join(RAIDS_INDEX_FILE);
    let mut index = read_raid_index(&index_path)?;
    let mut report = IndexRefreshReport::default();

    for (raid_id, path) in cached_raid_pages(cache_dir)? {
        let html = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let meta = parse_raid_meta(&html)?;
        report.pages_read += 1;
        let row = index.entry(raid_id.clone()).or_insert_with(|| RaidIndexRow {
            raid_id: raid_id.clone(),
            ..RaidIndexRow::default()
        });
        let before = row.clone();
        if !meta.raid_name.is_empty() {
            row.raid_name = meta.raid_name;
        }
        if !meta.date.is_empty() {
            row.date = meta.date;
        }
        if !meta.attendees.is_empty() {
            row.attendees = meta.attendees;
        }
        if row.url.is_empty()
            && !row.raid_pool.is_empty()
            && let Some(site) = site
        {
            row.url = site.raid_details_url(&row.raid_pool, &raid_id);
        }
        if *row != before {
            report.rows_updated += 1;
        }
    }

    report.index_rows = index.len();
    report.wrote_index = write_raid_index(&index_path, &index)?;
    Ok(report)
}

/// `(raid_id, path)` for every cached `raid_<id>.html`, ascending by numeric id.
pub fn cached_raid_pages(cache_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    cached_pages_with(cache_dir, "")
}

/// `(raid_id, path)` for every cached `raid_<id>_attendees.html`.
pub fn cached_attendee_pages(cache_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    cached_pages_with(cache_dir, "_attendees")
}

fn cached_pages_with(cache_dir: &Path, suffix: &str) -> Result<Vec<(String, PathBuf)>> {
    let raids_dir = cache_dir.join("raids");
    if !raids_dir.exists() {
        return Ok(Vec::new());
    }
    let mut pages = Vec::new();
    for entry in fs::read_dir(&raids_dir)
        .with_context(|| format!("failed to read {}", raids_dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read {}", raids_dir.display()))?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = file_name
            .strip_prefix("raid_")
            .and_then(|rest| rest.strip_suffix(".html"))
            .and_then(|rest| rest.strip_suffix(suffix))
        else {
            continue;
        };
        if !stem.is_empty() && stem.chars().all(|ch| ch.is_ascii_digit()) {
            pages.push((stem.to_string(), entry.path()));
        }
    }
    pages.sort_by(|a, b| numeric_key(&a.0).cmp(&numeric_key(&b.0)));
    Ok(pages)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembersScrapeReport {
    pub members: usize,
    pub wrote_snapshot: bool,
}

/// Fetch the members DKP page and write a snapshot used to audit computed totals.
pub fn scrape_members<F: PageFetcher + ?Sized>(
    fetcher: &mut F,
    site: &LegacySite,
    cache_dir: &Path,
    data_dir: &Path,
) -> Result<MembersScrapeReport> {
    // The members page only honours the session after a raid list visit.
    fetcher
        .fetch(&site.raid_list_url(None, None))
        .context("failed to warm up the session on the raid list")?;
    let page = fetch_cached(
        fetcher,
        &cache_file(cache_dir, "roster", "members_dkp"),
        &site.members_dkp_url(),
        true,
    )?;
    let members: Vec<MemberDkp> = parse_members_dkp(&page.body)?;
    let wrote_snapshot = write_json(&data_dir.join(MEMBERS_SNAPSHOT_FILE), &members)?;
    Ok(MembersScrapeReport {
        members: members.len(),
        wrote_snapshot,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::fetch::testing::MockFetcher;

    fn site() -> LegacySite {
        LegacySite::new("https://guild.test/", 9)
    }

    fn roster_page(rows: &[(&str, u32)], paging: &str) -> String {
        let body: String = rows
            .iter()
            .map(|(name, id)| {
                format!(
                    "<tr><td><a href=\"/users/characters/character_dkp.php?char={id}&gid=9\">{name}</a></td>\
                     <td>Gnome</td><td>Enchanter</td><td>60</td><td>Member</td><td></td></tr>"
                )
            })
            .collect();
        format!(
            "<p>3 Characters Found</p><table><tr><th>Name</th><th>Race</th><th>Class</th><th>Level</th><th>Rank</th><th>Claim</th></tr>{body}</table>{paging}"
        )
    }

    #[test]
    fn urls_follow_site_layout() {
        let site = site();
        assert_eq!(
            site.roster_url(Some(2)),
            "https://guild.test/roster.php?no_min_roster=&roster_mode=&sorter=&guild_game_id=&gid=9&paging_page=2"
        );
        assert_eq!(
            site.raid_list_url(None, None),
            "https://guild.test/rapid_raid/raids.php?mode=past&gid=9&ts=3:1"
        );
        assert_eq!(
            site.raid_details_url("562", "77"),
            "https://guild.test/rapid_raid/raid_details.php?raid_pool=562&raidId=77&gid=9"
        );
        assert_eq!(site.absolute("/a.php?char=1"), "https://guild.test/a.php?char=1");
        assert_eq!(site.absolute("https://x.test/a"), "https://x.test/a");
    }

    #[test]
    fn roster_scrape_walks_pages_and_dedupes() {
        let temp = tempdir().expect("tempdir");
        let site = site();
        let mut fetcher = MockFetcher::default()
            .with_page(
                &site.roster_url(None),
                &roster_page(&[("Frinop", 101), ("Bolt", 202)], "<a href='?paging_page=1'>2</a>"),
            )
            .with_page(
                &site.roster_url(Some(1)),
                &roster_page(&[("Bolt", 202), ("Zed", 300)], ""),
            );
        let report = scrape_roster(
            &mut fetcher,
            &site,
            &temp.path().join("cache"),
            &temp.path().join("data"),
        )
        .expect("scrape roster");
        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.rows_seen, 4);
        assert_eq!(report.unique_rows, 3);
        assert!(report.stopped_early.is_none());
        let csv = fs::read_to_string(temp.path().join("data").join(ROSTER_FILE)).expect("csv");
        assert!(csv.starts_with("name,race,class_name,level,guild_rank,claim,character_url\n"));
        assert_eq!(csv.lines().count(), 4);
    }

    #[test]
    fn linked_scrape_reuses_known_accounts() {
        let temp = tempdir().expect("tempdir");
        let data_dir = temp.path().join("data");
        fs::create_dir_all(&data_dir).expect("data dir");
        fs::write(
            data_dir.join(ROSTER_FILE),
            "name,race,class_name,level,guild_rank,claim,character_url\n\
             Frinop,Gnome,Enchanter,60,Member,,/c.php?char=101\n\
             Bolt,Gnome,Wizard,60,Member,,/c.php?char=202\n\
             Zed,Human,Warrior,60,Member,,/c.php?char=300\n",
        )
        .expect("roster");
        let site = site();
        let selector = |options: &[(u32, &str)]| {
            let body: String = options
                .iter()
                .map(|(id, name)| format!("<option value=\"/c.php?char={id}\">{name}</option>"))
                .collect();
            format!("<select id=\"character_selector\">{body}</select>")
        };
        let mut fetcher = MockFetcher::default()
            .with_page(
                "https://guild.test/c.php?char=101",
                &selector(&[(101, "Frinop"), (202, "Bolt")]),
            )
            .with_page("https://guild.test/c.php?char=300", &selector(&[(300, "Zed")]));

        let report = scrape_linked(
            &mut fetcher,
            &site,
            &temp.path().join("cache"),
            &data_dir,
            &LinkedScrapeOptions::default(),
        )
        .expect("scrape linked");
        assert_eq!(report.characters, 3);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.reused_from_account, 1);
        assert_eq!(report.accounts, 2);
        let groups = fs::read_to_string(data_dir.join(ACCOUNT_GROUPS_FILE)).expect("groups");
        assert!(groups.contains("\"101,202\""));
    }

    const LIST_PAGE: &str = r#"<table class="data-table">
      <tr><th>Raid</th><th>Date</th></tr>
      <tr><td><a href="/rapid_raid/raid_details.php?raid_pool=562&raidId=11&gid=9">Fear</a></td><td><span>Fri Feb 13, 2026 2:00 am</span></td></tr>
      <tr><td><a href="/rapid_raid/raid_details.php?raid_pool=562&raidId=10&gid=9">Hate</a></td><td><span>Thu Feb 12, 2026 9:00 pm</span></td></tr>
    </table>"#;

    const DETAIL_PAGE: &str = r#"<div class="subtitle"><h1>Plane of Fear</h1></div>
      <div class="subtitle">Attendees: 18</div>"#;

    #[test]
    fn raid_scrape_filters_by_date_and_writes_index() {
        let temp = tempdir().expect("tempdir");
        let site = site();
        let cache_dir = temp.path().join("cache");
        let data_dir = temp.path().join("data");
        let mut fetcher = MockFetcher::default()
            .with_page(&site.raid_list_url(None, None), LIST_PAGE)
            .with_page(&site.raid_details_url("562", "11"), DETAIL_PAGE);

        let options = RaidScrapeOptions {
            since_date: Some("2026-02-13".to_string()),
            ..RaidScrapeOptions::default()
        };
        let report = scrape_raids(&mut fetcher, &site, &cache_dir, &data_dir, &options)
            .expect("scrape raids");
        assert_eq!(report.raid_pool, "562");
        assert_eq!(report.listed, 2);
        assert_eq!(report.selected, 1);
        assert_eq!(report.details_fetched, 1);
        assert!(cache_dir.join("raids").join("raid_11.html").exists());

        let index = read_raid_index(&data_dir.join(RAIDS_INDEX_FILE)).expect("index");
        let row = index.get("11").expect("row");
        assert_eq!(row.raid_name, "Plane of Fear");
        assert_eq!(row.date, "Fri Feb 13, 2026 2:00 am");
        assert_eq!(row.attendees, "18");

        let again = scrape_raids(&mut fetcher, &site, &cache_dir, &data_dir, &options)
            .expect("scrape again");
        assert_eq!(again.details_cached, 1);
        assert!(!again.wrote_index);
    }

    #[test]
    fn refresh_index_reads_cached_pages_in_id_order() {
        let temp = tempdir().expect("tempdir");
        let cache_dir = temp.path().join("cache");
        let raids_dir = cache_dir.join("raids");
        fs::create_dir_all(&raids_dir).expect("raids dir");
        fs::write(raids_dir.join("raid_100.html"), DETAIL_PAGE).expect("page");
        fs::write(raids_dir.join("raid_9.html"), DETAIL_PAGE).expect("page");
        fs::write(raids_dir.join("raid_9_attendees.html"), "<p></p>").expect("page");
        fs::write(raids_dir.join("raids_list_0.html"), "<p></p>").expect("page");

        let pages = cached_raid_pages(&cache_dir).expect("pages");
        let ids: Vec<_> = pages.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["9", "100"]);
        assert_eq!(cached_attendee_pages(&cache_dir).expect("attendees").len(), 1);

        let report = refresh_raid_index(None, &cache_dir, &temp.path().join("data"))
            .expect("refresh");
        assert_eq!(report.pages_read, 2);
        assert_eq!(report.index_rows, 2);
        assert_eq!(report.rows_updated, 2);
    }
}
