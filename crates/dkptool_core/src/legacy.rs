//! Parsers for pages of the legacy guild-management site.
//!
//! Every function here is a pure `&str -> records` transform; fetching and
//! caching live in `scrape`.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use scraper::{ElementRef, Html};
use serde::Serialize;

use crate::html::{
    cells, char_id_from_href, first_numeric_param, has_class, leading_digits, max_paging_page,
    query_param, selector, text_compact, text_spaced,
};
use crate::output::CsvRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterRow {
    pub name: String,
    pub race: String,
    pub class_name: String,
    pub level: String,
    pub guild_rank: String,
    pub claim: String,
    pub character_url: String,
}

impl RosterRow {
    pub fn char_id(&self) -> Option<String> {
        char_id_from_href(&self.character_url)
    }
}

impl CsvRow for RosterRow {
    fn headers() -> &'static [&'static str] {
        &[
            "name",
            "race",
            "class_name",
            "level",
            "guild_rank",
            "claim",
            "character_url",
        ]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.race.clone(),
            self.class_name.clone(),
            self.level.clone(),
            self.guild_rank.clone(),
            self.claim.clone(),
            self.character_url.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterPage {
    pub rows: Vec<RosterRow>,
    pub last_page: u32,
}

pub fn parse_roster_page(html: &str) -> Result<RosterPage> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let th_sel = selector("th")?;
    let tr_sel = selector("tr")?;
    let link_sel = selector("a")?;
    let img_sel = selector("img")?;

    let mut rows = Vec::new();
    let roster_table = document.select(&table_sel).find(|table| {
        let headers: Vec<String> = table.select(&th_sel).map(text_spaced).collect();
        ["Name", "Race", "Level"]
            .iter()
            .all(|wanted| headers.iter().any(|header| header.contains(wanted)))
    });

    if let Some(table) = roster_table {
        for tr in table.select(&tr_sel) {
            let tds = cells(tr);
            if tds.len() < 6 {
                continue;
            }
            let link = tds[0].select(&link_sel).next();
            let name = link.map(text_compact).unwrap_or_else(|| text_compact(tds[0]));
            if name.is_empty() {
                continue;
            }
            let character_url = link
                .and_then(|link| link.value().attr("href"))
                .unwrap_or_default()
                .to_string();
            let class_name = tds[2]
                .select(&img_sel)
                .find_map(|img| img.value().attr("title"))
                .map(|title| title.trim().to_string())
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| text_spaced(tds[2]));
            rows.push(RosterRow {
                name,
                race: text_spaced(tds[1]),
                class_name,
                level: text_compact(tds[3]),
                guild_rank: text_spaced(tds[4]),
                claim: text_spaced(tds[5]),
                character_url,
            });
        }
    }

    Ok(RosterPage {
        rows,
        last_page: max_paging_page(html),
    })
}

/// `(char_id, name)` pairs from the linked-character selector of a character page.
pub fn parse_linked_toons(html: &str) -> Result<Vec<(String, String)>> {
    let document = Html::parse_document(html);
    let option_sel = selector("select#character_selector option")?;
    let mut out = Vec::new();
    for option in document.select(&option_sel) {
        let value = option.value().attr("value").unwrap_or_default();
        let Some(char_id) = char_id_from_href(value) else {
            continue;
        };
        let name = text_compact(option);
        if name.is_empty() {
            continue;
        }
        out.push((char_id, name));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaidListing {
    pub raid_id: String,
    pub raid_pool: String,
    pub raid_name: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidListPage {
    pub raid_pool: Option<String>,
    pub raids: Vec<RaidListing>,
    pub last_page: u32,
}

pub fn parse_raid_list_page(html: &str) -> Result<RaidListPage> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let tr_sel = selector("tr")?;
    let link_sel = selector("a[href*='raid_details.php']")?;
    let span_sel = selector("span")?;

    let raid_pool = first_numeric_param(html, "raid_pool");
    let mut raids = Vec::new();
    let table = document.select(&table_sel).find(|table| {
        table
            .value()
            .classes()
            .any(|class| class.contains("data-table") || class.contains("forumline"))
    });

    if let Some(table) = table {
        for tr in table.select(&tr_sel).skip(1) {
            let tds = cells(tr);
            if tds.len() < 2 {
                continue;
            }
            let Some(link) = tds[0].select(&link_sel).next() else {
                continue;
            };
            let href = link.value().attr("href").unwrap_or_default();
            let Some(raid_id) = query_param(href, "raidId")
                .map(|value| leading_digits(&value))
                .filter(|value| !value.is_empty())
            else {
                continue;
            };
            let pool = query_param(href, "raid_pool")
                .map(|value| leading_digits(&value))
                .filter(|value| !value.is_empty())
                .or_else(|| raid_pool.clone())
                .unwrap_or_default();
            let date = tds[1]
                .select(&span_sel)
                .next()
                .map(text_compact)
                .unwrap_or_else(|| text_compact(tds[1]));
            raids.push(RaidListing {
                raid_id,
                raid_pool: pool,
                raid_name: text_compact(link),
                date,
            });
        }
    }

    Ok(RaidListPage {
        raid_pool,
        raids,
        last_page: max_paging_page(html),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RaidMeta {
    pub raid_name: String,
    pub date: String,
    pub attendees: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaidEvent {
    pub raid_id: String,
    pub event_id: String,
    pub event_order: u32,
    pub event_name: String,
    pub dkp_value: String,
    pub attendee_count: String,
    pub event_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaidLoot {
    pub raid_id: String,
    pub event_id: String,
    pub item_name: String,
    pub char_id: String,
    pub character_name: String,
    pub cost: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaidAttendee {
    pub raid_id: String,
    pub char_id: String,
    pub character_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventAttendee {
    pub raid_id: String,
    pub event_id: String,
    pub char_id: String,
    pub character_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaidDetail {
    pub meta: RaidMeta,
    pub events: Vec<RaidEvent>,
    pub loot: Vec<RaidLoot>,
    pub attendees: Vec<RaidAttendee>,
}

pub fn parse_raid_meta(html: &str) -> Result<RaidMeta> {
    let document = Html::parse_document(html);
    raid_meta_from_document(&document)
}

fn raid_meta_from_document(document: &Html) -> Result<RaidMeta> {
    let subtitle_sel = selector("div.subtitle")?;
    let h1_sel = selector("h1")?;
    let span_sel = selector("span")?;

    let mut meta = RaidMeta::default();
    let mut subtitles = document.select(&subtitle_sel).peekable();
    if let Some(first) = subtitles.peek()
        && let Some(h1) = first.select(&h1_sel).next()
    {
        meta.raid_name = text_compact(h1);
    }
    for subtitle in subtitles {
        let text = text_spaced(subtitle);
        if meta.date.is_empty()
            && text.contains("Date:")
            && let Some(span) = subtitle.select(&span_sel).next()
        {
            meta.date = text_compact(span);
        }
        if meta.attendees.is_empty()
            && let Some((_, rest)) = text.split_once("Attendees:")
        {
            meta.attendees = rest.split_whitespace().next().unwrap_or_default().to_string();
        }
    }
    Ok(meta)
}

pub fn parse_raid_detail(html: &str, raid_id: &str) -> Result<RaidDetail> {
    let document = Html::parse_document(html);
    let container_sel = selector("div[id^='event_container_']")?;
    let table_sel = selector("table")?;
    let bold_sel = selector("b")?;
    let td_sel = selector("td")?;
    let tr_sel = selector("tr")?;
    let site_time_sel = selector("span[title*='Site Time']")?;
    let items_sel = selector("table[class*='raid_event_items_table']")?;
    let item_link_sel = selector("a[href*='item_report']")?;
    let char_link_sel = selector("a[href*='character_dkp.php']")?;
    let anchor_sel = selector("a[name='attendees']")?;

    let meta = raid_meta_from_document(&document)?;
    let mut events = Vec::new();
    let mut loot = Vec::new();

    for container in document.select(&container_sel) {
        let event_id = container
            .value()
            .id()
            .and_then(|id| id.strip_prefix("event_container_"))
            .unwrap_or_default();
        if event_id.is_empty() || !event_id.chars().all(|ch| ch.is_ascii_digit()) {
            continue;
        }

        let mut event = RaidEvent {
            raid_id: raid_id.to_string(),
            event_id: event_id.to_string(),
            event_order: u32::try_from(events.len() + 1).unwrap_or(u32::MAX),
            event_name: String::new(),
            dkp_value: String::new(),
            attendee_count: String::new(),
            event_time: String::new(),
        };
        if let Some(header) = container.select(&table_sel).next() {
            if let Some(bold) = header.select(&bold_sel).next() {
                event.event_name = text_compact(bold);
            }
            for (index, td) in header.select(&td_sel).enumerate() {
                let text = text_compact(td);
                let markup = td.html();
                let digits_only = text.replace('.', "");
                if markup.contains("Event DKP")
                    || (index == 2 && is_ascii_number(&digits_only))
                {
                    if let Some(number) = first_number(&text) {
                        event.dkp_value = number;
                    }
                }
                if markup.contains("Event Attendees") || (index == 3 && is_ascii_number(&text)) {
                    event.attendee_count = text.clone();
                }
                if let Some(span) = td.select(&site_time_sel).next() {
                    event.event_time = text_compact(span);
                }
            }
        }

        if let Some(items) = container.select(&items_sel).next() {
            for tr in items.select(&tr_sel) {
                let tds: Vec<ElementRef<'_>> = tr.select(&td_sel).collect();
                if tds.len() < 2 {
                    continue;
                }
                if text_compact(tds[0]).starts_with("Total") {
                    continue;
                }
                let mut item_name = text_compact(tds[0]);
                if item_name.is_empty() {
                    item_name = tds[0]
                        .select(&item_link_sel)
                        .map(text_compact)
                        .find(|text| !text.is_empty())
                        .unwrap_or_default();
                }
                let (char_id, character_name) = tds[1]
                    .select(&char_link_sel)
                    .find(|link| link.value().attr("href").is_some_and(|h| h.contains("char=")))
                    .map(|link| {
                        let href = link.value().attr("href").unwrap_or_default();
                        (
                            char_id_from_href(href).unwrap_or_default(),
                            text_compact(link),
                        )
                    })
                    .unwrap_or_default();
                let cost = tds.get(2).map(|td| text_compact(*td)).unwrap_or_default();
                if item_name.is_empty() && character_name.is_empty() {
                    continue;
                }
                loot.push(RaidLoot {
                    raid_id: raid_id.to_string(),
                    event_id: event.event_id.clone(),
                    item_name,
                    char_id,
                    character_name,
                    cost,
                });
            }
        }

        events.push(event);
    }

    let mut attendees = Vec::new();
    let container = document.select(&anchor_sel).next().and_then(|anchor| {
        anchor
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|element| element.value().name() == "div" && has_class(*element, "contentItem"))
    });
    if let Some(table) = container.and_then(|container| container.select(&table_sel).next()) {
        for link in table.select(&char_link_sel) {
            let href = link.value().attr("href").unwrap_or_default();
            if !href.contains("char=") {
                continue;
            }
            let name = text_compact(link);
            if name.is_empty() {
                continue;
            }
            attendees.push(RaidAttendee {
                raid_id: raid_id.to_string(),
                char_id: char_id_from_href(href).unwrap_or_default(),
                character_name: name,
            });
        }
    }

    Ok(RaidDetail {
        meta,
        events,
        loot,
        attendees,
    })
}

/// One `<b>Event - N Attendees</b>` section of the by-event attendees page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendeeSection {
    pub event_name: String,
    /// `(char_id, name)`; `char_id` may be empty when the site omitted it.
    pub attendees: Vec<(String, String)>,
}

pub fn parse_event_attendees(html: &str) -> Result<Vec<AttendeeSection>> {
    let document = Html::parse_document(html);
    let content_sel = selector("div#contentItem")?;
    let marker_sel = selector("b, div.data1")?;
    let td_sel = selector("td")?;
    let char_link_sel = selector("a[href*='character_dkp.php']")?;
    let heading = Regex::new(r"(?i)^\s*(.+?)\s*-\s*\d+\s*Attendees\s*$")
        .context("failed to compile attendee heading pattern")?;
    let letter_prefix =
        Regex::new(r"^[A-Za-z]\s+").context("failed to compile attendee name pattern")?;

    let Some(content) = document.select(&content_sel).next() else {
        return Ok(Vec::new());
    };

    let mut sections = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for element in content.select(&marker_sel) {
        if element.value().name() == "b" {
            if let Some(captures) = heading.captures(&text_compact_spaced(element)) {
                pending.push(captures[1].trim().to_string());
            }
            continue;
        }
        if pending.is_empty() {
            continue;
        }

        let mut attendees: Vec<(String, String)> = Vec::new();
        for td in element.select(&td_sel) {
            let entry = match td.select(&char_link_sel).find(|link| {
                link.value()
                    .attr("href")
                    .is_some_and(|href| href.contains("char="))
            }) {
                Some(link) => {
                    let name = text_compact(link);
                    if name.is_empty() {
                        continue;
                    }
                    let href = link.value().attr("href").unwrap_or_default();
                    let char_id = query_param(href, "char")
                        .map(|value| leading_digits(&value))
                        .unwrap_or_default();
                    (char_id, name)
                }
                None => {
                    let raw = text_compact(td);
                    let stripped = letter_prefix.replace(&raw, "").trim().to_string();
                    let name = if stripped.is_empty() { raw } else { stripped };
                    if name.chars().count() <= 1 {
                        continue;
                    }
                    (String::new(), name)
                }
            };
            if !attendees.contains(&entry) {
                attendees.push(entry);
            }
        }
        for event_name in pending.drain(..) {
            if !attendees.is_empty() {
                sections.push(AttendeeSection {
                    event_name,
                    attendees: attendees.clone(),
                });
            }
        }
    }
    Ok(sections)
}

fn text_compact_spaced(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Map attendee sections onto the raid's events by position and fill missing
/// character ids from raid-level attendance.
pub fn resolve_event_attendance(
    raid_id: &str,
    sections: &[AttendeeSection],
    events: &[RaidEvent],
    raid_attendees: &[RaidAttendee],
) -> Vec<EventAttendee> {
    let mut ordered: Vec<&RaidEvent> = events.iter().filter(|e| e.raid_id == raid_id).collect();
    ordered.sort_by_key(|event| event.event_order);

    let mut by_name: HashMap<&str, &str> = HashMap::new();
    for attendee in raid_attendees
        .iter()
        .filter(|a| a.raid_id == raid_id && !a.char_id.is_empty())
    {
        by_name.insert(attendee.character_name.trim(), attendee.char_id.as_str());
        by_name.insert(strip_marker(&attendee.character_name), attendee.char_id.as_str());
    }

    let mut out = Vec::new();
    for (section, event) in sections.iter().zip(ordered) {
        for (char_id, name) in &section.attendees {
            let resolved = if char_id.is_empty() {
                by_name
                    .get(name.trim())
                    .or_else(|| by_name.get(strip_marker(name)))
                    .map(|id| id.to_string())
                    .unwrap_or_default()
            } else {
                char_id.clone()
            };
            out.push(EventAttendee {
                raid_id: raid_id.to_string(),
                event_id: event.event_id.clone(),
                char_id: resolved,
                character_name: name.clone(),
            });
        }
    }
    out
}

fn strip_marker(name: &str) -> &str {
    let trimmed = name.trim();
    trimmed
        .strip_prefix("(*)")
        .map(str::trim_start)
        .unwrap_or(trimmed)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberDkp {
    pub account_name: String,
    pub char_id: String,
    pub earned: i64,
    pub spent: i64,
    pub total: i64,
}

pub fn parse_members_dkp(html: &str) -> Result<Vec<MemberDkp>> {
    let document = Html::parse_document(html);
    let tbody_sel = selector("tbody")?;
    let table_sel = selector("table")?;
    let th_sel = selector("th")?;
    let tr_sel = selector("tr")?;
    let td_sel = selector("td")?;
    let checkbox_sel = selector("input[name='compare_char_id[]']")?;
    let char_link_sel = selector("a[href*='character_dkp.php']")?;
    let earned_sel = selector("span.dkp_earned")?;
    let spent_sel = selector("span.dkp_spent")?;
    let current_sel = selector("span.dkp_current")?;

    let container = document
        .select(&tbody_sel)
        .find(|tbody| tbody.value().classes().any(|class| class.contains("data_table")))
        .or_else(|| {
            document.select(&table_sel).find(|table| {
                table
                    .select(&th_sel)
                    .any(|th| text_spaced(th).to_ascii_lowercase().contains("earned"))
            })
        });
    let Some(container) = container else {
        bail!("could not find the member DKP table in the page");
    };

    let mut out = Vec::new();
    for tr in container.select(&tr_sel) {
        let tds: Vec<ElementRef<'_>> = tr.select(&td_sel).collect();
        if tds.len() < 8 {
            continue;
        }
        let char_id = tr
            .select(&checkbox_sel)
            .next()
            .and_then(|input| input.value().attr("value"))
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        let account_name = tds[1]
            .select(&char_link_sel)
            .find(|link| link.value().attr("href").is_some_and(|h| h.contains("char=")))
            .map(text_compact)
            .unwrap_or_default();
        if account_name.is_empty() && char_id.is_empty() {
            continue;
        }
        let span_value = |sel: &scraper::Selector| {
            tr.select(sel)
                .next()
                .map(|span| parse_dkp_int(&text_compact(span)))
                .unwrap_or(0)
        };
        out.push(MemberDkp {
            account_name,
            char_id,
            earned: span_value(&earned_sel),
            spent: span_value(&spent_sel),
            total: span_value(&current_sel),
        });
    }
    Ok(out)
}

/// Integer DKP value with commas and whitespace removed; anything else is 0.
pub fn parse_dkp_int(text: &str) -> i64 {
    let cleaned: String = text
        .chars()
        .filter(|ch| *ch != ',' && !ch.is_whitespace())
        .collect();
    cleaned.parse::<i64>().unwrap_or(0)
}

/// Legacy site dates to ISO `YYYY-MM-DD`; unparseable input yields `""`.
pub fn parse_date_to_iso(raw: &str) -> String {
    let text = raw.trim();
    if text.is_empty() {
        return String::new();
    }
    let upper = text.to_ascii_uppercase();
    if let Ok(parsed) = NaiveDateTime::parse_from_str(&upper, "%a %b %d, %Y %I:%M %p") {
        return parsed.date().format("%Y-%m-%d").to_string();
    }
    if let Ok((date, _)) = NaiveDate::parse_and_remainder(text, "%a %b %d, %Y") {
        return date.format("%Y-%m-%d").to_string();
    }
    if let Some(prefix) = text.get(..10)
        && let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
    {
        return date.format("%Y-%m-%d").to_string();
    }
    String::new()
}

fn is_ascii_number(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|ch| ch.is_ascii_digit())
}

fn first_number(text: &str) -> Option<String> {
    let start = text.find(|ch: char| ch.is_ascii_digit() || ch == '.')?;
    let number: String = text[start..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    Some(number)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER_HTML: &str = r#"
<html><body>
<table class="data-table">
  <tr><th>Name</th><th>Race</th><th>Class</th><th>Level</th><th>Rank</th><th>Claim</th></tr>
  <tr>
    <td><a href="/users/characters/character_dkp.php?char=101&amp;gid=547766">Frinop</a></td>
    <td>Gnome</td><td><img src="c.png" title="Enchanter"></td><td>60</td><td>Officer</td><td>Yes</td>
  </tr>
  <tr>
    <td>Loner</td><td>Human</td><td>Warrior</td><td>55</td><td>Member</td><td></td>
  </tr>
  <tr><td colspan="6">42 Characters Found</td></tr>
</table>
<a href="roster.php?gid=547766&paging_page=1">2</a>
<a href="roster.php?gid=547766&paging_page=3">4</a>
</body></html>"#;

    #[test]
    fn roster_rows_and_last_page() {
        let page = parse_roster_page(ROSTER_HTML).expect("parse roster");
        assert_eq!(page.last_page, 3);
        assert_eq!(page.rows.len(), 2);
        let first = &page.rows[0];
        assert_eq!(first.name, "Frinop");
        assert_eq!(first.class_name, "Enchanter");
        assert_eq!(first.level, "60");
        assert_eq!(first.char_id().as_deref(), Some("101"));
        let second = &page.rows[1];
        assert_eq!(second.class_name, "Warrior");
        assert_eq!(second.character_url, "");
        assert_eq!(second.char_id(), None);
    }

    #[test]
    fn linked_toons_from_selector() {
        let html = r#"<select id="character_selector">
            <option value="">Choose</option>
            <option value="/users/characters/character_dkp.php?char=101&gid=1">Frinop</option>
            <option value="/users/characters/character_dkp.php?char=202&gid=1"> Frinbot </option>
        </select>"#;
        let toons = parse_linked_toons(html).expect("parse");
        assert_eq!(
            toons,
            vec![
                ("101".to_string(), "Frinop".to_string()),
                ("202".to_string(), "Frinbot".to_string()),
            ]
        );
    }

    #[test]
    fn raid_list_rows() {
        let html = r#"<table class="forumline">
          <tr><th>Raid</th><th>Date</th></tr>
          <tr><td><a href="/rapid_raid/raid_details.php?raid_pool=562&amp;raidId=1598436&amp;gid=1">Plane of Fear</a></td>
              <td><span>Fri Feb 13, 2026 2:00 am</span></td></tr>
          <tr><td>No link</td><td>x</td></tr>
        </table>
        <a href="raids.php?raid_pool=562&mode=past&paging_page=4">5</a>"#;
        let page = parse_raid_list_page(html).expect("parse");
        assert_eq!(page.raid_pool.as_deref(), Some("562"));
        assert_eq!(page.last_page, 4);
        assert_eq!(
            page.raids,
            vec![RaidListing {
                raid_id: "1598436".to_string(),
                raid_pool: "562".to_string(),
                raid_name: "Plane of Fear".to_string(),
                date: "Fri Feb 13, 2026 2:00 am".to_string(),
            }]
        );
    }

    const RAID_DETAIL_HTML: &str = r#"
<html><body>
<div class="subtitle"><h1>Plane of Fear</h1></div>
<div class="subtitle">Date: <span>Fri Feb 13, 2026 2:00 am</span></div>
<div class="subtitle">Attendees: 24 characters</div>
<div id="event_container_2499232">
  <table>
    <tr><td><b>Dracoliche</b></td><td>Event DKP:</td><td>3</td><td>21</td>
        <td><span title="Site Time">2:15 am</span></td></tr>
  </table>
  <table class="raid_event_items_table">
    <tr><td><a href="item_report.php?id=1"><img src="i.png"></a> <a href="item_report.php?id=1">Cloak of Flames</a></td>
        <td><a href="/users/characters/character_dkp.php?char=101&amp;gid=1">Frinop</a></td><td>12</td></tr>
    <tr><td>Total:</td><td></td><td>12</td></tr>
  </table>
</div>
<div id="event_container_2499233">
  <table>
    <tr><td><b>Phobos</b></td><td>x</td><td>2.5</td><td>19</td></tr>
  </table>
</div>
<div class="contentItem">
  <a name="attendees"></a>
  <table>
    <tr><td><a href="/users/characters/character_dkp.php?char=101&gid=1">Frinop</a></td>
        <td><a href="/users/characters/character_dkp.php?char=202&gid=1">(*) Bolt</a></td></tr>
  </table>
</div>
</body></html>"#;

    #[test]
    fn raid_detail_meta_events_loot_and_attendees() {
        let detail = parse_raid_detail(RAID_DETAIL_HTML, "1598436").expect("parse detail");
        assert_eq!(detail.meta.raid_name, "Plane of Fear");
        assert_eq!(detail.meta.date, "Fri Feb 13, 2026 2:00 am");
        assert_eq!(detail.meta.attendees, "24");

        assert_eq!(detail.events.len(), 2);
        let first = &detail.events[0];
        assert_eq!(first.event_id, "2499232");
        assert_eq!(first.event_order, 1);
        assert_eq!(first.event_name, "Dracoliche");
        assert_eq!(first.dkp_value, "3");
        assert_eq!(first.attendee_count, "21");
        assert_eq!(first.event_time, "2:15 am");
        assert_eq!(detail.events[1].event_order, 2);
        assert_eq!(detail.events[1].dkp_value, "2.5");

        assert_eq!(detail.loot.len(), 1);
        assert_eq!(detail.loot[0].item_name, "Cloak of Flames");
        assert_eq!(detail.loot[0].char_id, "101");
        assert_eq!(detail.loot[0].cost, "12");

        assert_eq!(detail.attendees.len(), 2);
        assert_eq!(detail.attendees[1].character_name, "(*) Bolt");
        assert_eq!(detail.attendees[1].char_id, "202");
    }

    #[test]
    fn event_attendees_sections_resolve_missing_ids() {
        let html = r#"<div id="contentItem">
          <b>Dracoliche - 2 Attendees</b>
          <div class="data1"><table><tr>
            <td><a href="/users/characters/character_dkp.php?char=101&gid=1">Frinop</a></td>
            <td><a href="/users/characters/character_dkp.php?char=&gid=1">Bolt</a></td>
          </tr></table></div>
          <b>Phobos - 1 Attendees</b>
          <div class="data1"><table><tr><td>W Stray</td></tr></table></div>
        </div>"#;
        let sections = parse_event_attendees(html).expect("parse");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].event_name, "Dracoliche");
        assert_eq!(
            sections[0].attendees,
            vec![
                ("101".to_string(), "Frinop".to_string()),
                (String::new(), "Bolt".to_string()),
            ]
        );
        assert_eq!(sections[1].attendees, vec![(String::new(), "Stray".to_string())]);

        let detail = parse_raid_detail(RAID_DETAIL_HTML, "1598436").expect("parse detail");
        let rows =
            resolve_event_attendance("1598436", &sections, &detail.events, &detail.attendees);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].event_id, "2499232");
        assert_eq!(rows[1].character_name, "Bolt");
        assert_eq!(rows[1].char_id, "202");
        assert_eq!(rows[2].event_id, "2499233");
        assert_eq!(rows[2].char_id, "");
    }

    #[test]
    fn members_dkp_rows() {
        let html = r#"<table><tbody class="data_table">
          <tr>
            <td><input type="checkbox" name="compare_char_id[]" value="101"></td>
            <td><a href="/users/characters/character_dkp.php?char=101">Frinop</a></td>
            <td></td><td></td><td></td>
            <td><span class="dkp_earned">1,204</span></td>
            <td><span class="dkp_spent"> 300 </span></td>
            <td><span class="dkp_current">n/a</span></td>
          </tr>
          <tr><td>short</td></tr>
        </tbody></table>"#;
        let rows = parse_members_dkp(html).expect("parse");
        assert_eq!(
            rows,
            vec![MemberDkp {
                account_name: "Frinop".to_string(),
                char_id: "101".to_string(),
                earned: 1204,
                spent: 300,
                total: 0,
            }]
        );
        assert!(parse_members_dkp("<p>nothing</p>").is_err());
    }

    #[test]
    fn dates_parse_to_iso() {
        assert_eq!(parse_date_to_iso("Fri Feb 13, 2026 2:00 am"), "2026-02-13");
        assert_eq!(parse_date_to_iso("Fri Feb 13, 2026"), "2026-02-13");
        assert_eq!(parse_date_to_iso("2026-02-13T10:00:00"), "2026-02-13");
        assert_eq!(parse_date_to_iso("sometime"), "");
        assert_eq!(parse_date_to_iso("  "), "");
    }
}
