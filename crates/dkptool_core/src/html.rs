//! Small helpers shared by the HTML parsers.

use anyhow::{Result, anyhow};
use scraper::{ElementRef, Selector};

pub fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|err| anyhow!("invalid CSS selector `{css}`: {err}"))
}

/// Text nodes trimmed and concatenated without separators.
pub fn text_compact(element: ElementRef<'_>) -> String {
    element.text().map(str::trim).collect::<String>()
}

/// Text nodes trimmed, empty ones dropped, joined by single spaces.
pub fn text_spaced(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Direct `td` children of a row.
pub fn cells<'a>(row: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|child| child.value().name() == "td")
        .collect()
}

pub fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|name| name == class)
}

/// Value of `key=` in a URL or query string, `&amp;` tolerated.
pub fn query_param(href: &str, key: &str) -> Option<String> {
    let decoded = href.replace("&amp;", "&");
    let query = decoded.split_once('?').map_or(decoded.as_str(), |(_, query)| query);
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == key).then(|| value.to_string())
    })
}

/// Leading ASCII digits of `value`.
pub fn leading_digits(value: &str) -> String {
    value.chars().take_while(char::is_ascii_digit).collect()
}

/// Numeric `char=` id of a character link, if any.
pub fn char_id_from_href(href: &str) -> Option<String> {
    let digits = leading_digits(&query_param(href, "char")?);
    (!digits.is_empty()).then_some(digits)
}

/// Digits following the first `key=` anywhere in `text`, e.g. `raid_pool=`.
pub fn first_numeric_param(text: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=");
    let start = text.find(&needle)? + needle.len();
    let digits = leading_digits(&text[start..]);
    (!digits.is_empty()).then_some(digits)
}

/// Largest `paging_page=` value linked from the page, `0` when unpaged.
pub fn max_paging_page(text: &str) -> u32 {
    text.match_indices("paging_page=")
        .filter_map(|(index, needle)| {
            leading_digits(&text[index + needle.len()..])
                .parse::<u32>()
                .ok()
        })
        .max()
        .unwrap_or(0)
}
