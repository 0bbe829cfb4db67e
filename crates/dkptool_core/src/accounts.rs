use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::output::{CsvRecord, CsvRow, numeric_key};

/// One scraped character with the characters its page lists as linked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedToons {
    pub name: String,
    pub char_id: String,
    pub linked_names: Vec<String>,
    pub linked_char_ids: Vec<String>,
}

impl LinkedToons {
    pub fn from_record(record: &CsvRecord<'_>) -> Self {
        Self {
            name: record.get("name").to_string(),
            char_id: record.get("char_id").to_string(),
            linked_names: split_list(record.get("linked_names")),
            linked_char_ids: split_list(record.get("linked_char_ids")),
        }
    }
}

impl CsvRow for LinkedToons {
    fn headers() -> &'static [&'static str] {
        &["name", "char_id", "linked_names", "linked_char_ids"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.char_id.clone(),
            self.linked_names.join(","),
            self.linked_char_ids.join(","),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountGroup {
    pub account_id: String,
    pub char_ids: Vec<String>,
    pub toon_names: Vec<String>,
    pub toon_count: usize,
}

impl AccountGroup {
    pub fn from_record(record: &CsvRecord<'_>) -> Self {
        let char_ids = split_list(record.get("char_ids"));
        let toon_names = split_list(record.get("toon_names"));
        let toon_count = record
            .get("toon_count")
            .parse::<usize>()
            .unwrap_or(char_ids.len());
        Self {
            account_id: record.get("account_id").to_string(),
            char_ids,
            toon_names,
            toon_count,
        }
    }
}

impl CsvRow for AccountGroup {
    fn headers() -> &'static [&'static str] {
        &["account_id", "char_ids", "toon_names", "toon_count"]
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.account_id.clone(),
            self.char_ids.join(","),
            self.toon_names.join(","),
            self.toon_count.to_string(),
        ]
    }
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Disjoint-set over character ids, remembering first-seen order.
#[derive(Debug, Default)]
struct UnionFind {
    parent: HashMap<String, String>,
    order: Vec<String>,
}

impl UnionFind {
    fn find(&mut self, id: &str) -> String {
        if !self.parent.contains_key(id) {
            self.parent.insert(id.to_string(), id.to_string());
            self.order.push(id.to_string());
            return id.to_string();
        }
        let mut root = id.to_string();
        while let Some(next) = self.parent.get(&root)
            && *next != root
        {
            root = next.clone();
        }
        let mut cursor = id.to_string();
        while cursor != root {
            let next = self
                .parent
                .insert(cursor.clone(), root.clone())
                .unwrap_or_else(|| root.clone());
            cursor = next;
        }
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            self.parent.insert(root_a, root_b);
        }
    }
}

/// Group characters into accounts. The group root becomes `account_id`,
/// `char_ids` keep discovery order and `toon_names` are sorted.
pub fn group_accounts(rows: &[LinkedToons]) -> Vec<AccountGroup> {
    let mut sets = UnionFind::default();
    let mut names: HashMap<String, String> = HashMap::new();

    for row in rows {
        if row.char_id.is_empty() {
            continue;
        }
        sets.find(&row.char_id);
        names.insert(row.char_id.clone(), row.name.clone());
        for (index, linked_id) in row.linked_char_ids.iter().enumerate() {
            sets.union(&row.char_id, linked_id);
            match row.linked_names.get(index) {
                Some(name) => {
                    names.insert(linked_id.clone(), name.clone());
                }
                None => {
                    names.entry(linked_id.clone()).or_default();
                }
            }
        }
    }

    let ids = sets.order.clone();
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    let mut roots = Vec::new();
    for id in ids {
        let root = sets.find(&id);
        let members = groups.entry(root.clone()).or_insert_with(|| {
            roots.push(root.clone());
            Vec::new()
        });
        members.push(id);
    }

    let mut out: Vec<AccountGroup> = roots
        .into_iter()
        .map(|root| {
            let char_ids = groups.remove(&root).unwrap_or_default();
            let toon_names: BTreeSet<String> = char_ids
                .iter()
                .filter_map(|id| names.get(id))
                .filter(|name| !name.is_empty())
                .cloned()
                .collect();
            AccountGroup {
                toon_count: char_ids.len(),
                account_id: root,
                char_ids,
                toon_names: toon_names.into_iter().collect(),
            }
        })
        .collect();
    out.sort_by(|a, b| numeric_key(&a.account_id).cmp(&numeric_key(&b.account_id)));
    out
}

/// `(char_id, account_id)` pairs, one per character.
pub fn character_accounts(groups: &[AccountGroup]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = groups
        .iter()
        .flat_map(|group| {
            group
                .char_ids
                .iter()
                .map(move |char_id| (char_id.clone(), group.account_id.clone()))
        })
        .collect();
    out.sort_by(|a, b| {
        numeric_key(&a.0)
            .cmp(&numeric_key(&b.0))
            .then_with(|| numeric_key(&a.1).cmp(&numeric_key(&b.1)))
    });
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::CsvTable;

    fn linked(name: &str, char_id: &str, links: &[(&str, &str)]) -> LinkedToons {
        LinkedToons {
            name: name.to_string(),
            char_id: char_id.to_string(),
            linked_names: links.iter().map(|(_, name)| name.to_string()).collect(),
            linked_char_ids: links.iter().map(|(id, _)| id.to_string()).collect(),
        }
    }

    #[test]
    fn linked_characters_share_one_account() {
        let rows = vec![
            linked("Frinop", "101", &[("101", "Frinop"), ("202", "Bolt")]),
            linked("Zed", "300", &[("300", "Zed")]),
            linked("Bolt", "202", &[("202", "Bolt"), ("250", "Abby")]),
        ];
        let groups = group_accounts(&rows);
        assert_eq!(groups.len(), 2);

        let shared = groups
            .iter()
            .find(|group| group.char_ids.contains(&"101".to_string()))
            .expect("shared account");
        assert_eq!(shared.toon_count, 3);
        assert_eq!(shared.char_ids, vec!["101", "202", "250"]);
        assert_eq!(shared.toon_names, vec!["Abby", "Bolt", "Frinop"]);
        assert!(shared.char_ids.contains(&shared.account_id));

        let solo = groups
            .iter()
            .find(|group| group.account_id == "300")
            .expect("solo account");
        assert_eq!(solo.toon_names, vec!["Zed"]);
    }

    #[test]
    fn groups_are_sorted_by_account_id() {
        let rows = vec![
            linked("B", "20", &[]),
            linked("A", "3", &[]),
            linked("C", "100", &[]),
        ];
        let ids: Vec<_> = group_accounts(&rows)
            .into_iter()
            .map(|group| group.account_id)
            .collect();
        assert_eq!(ids, vec!["3", "20", "100"]);
    }

    #[test]
    fn character_accounts_explodes_groups() {
        let groups = vec![AccountGroup {
            account_id: "202".to_string(),
            char_ids: vec!["202".to_string(), "101".to_string()],
            toon_names: vec![],
            toon_count: 2,
        }];
        assert_eq!(
            character_accounts(&groups),
            vec![
                ("101".to_string(), "202".to_string()),
                ("202".to_string(), "202".to_string()),
            ]
        );
    }

    #[test]
    fn linked_toons_round_trip_through_csv_columns() {
        let table = CsvTable::parse(
            "name,char_id,linked_names,linked_char_ids\nFrinop,101,\"Frinop,Bolt\",\"101,202\"\n",
        )
        .expect("parse");
        let record = table.records().next().expect("record");
        let row = LinkedToons::from_record(&record);
        assert_eq!(row.linked_names, vec!["Frinop", "Bolt"]);
        assert_eq!(row.to_record()[3], "101,202");
    }
}
