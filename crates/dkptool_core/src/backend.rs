//! Client for the hosted Postgres backend's REST surface.
//!
//! Every call is a single attempt: a failed request surfaces immediately and
//! the caller stops.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{DkpConfig, env_value};

/// One JSON row as returned by, or sent to, the backend.
pub type Row = Map<String, Value>;

pub trait HostedBackend {
    fn select_all(&mut self, table: &str, order: Option<&str>) -> Result<Vec<Row>>;
    fn upsert(&mut self, table: &str, rows: &[Row], on_conflict: &str) -> Result<usize>;
    fn insert(&mut self, table: &str, rows: &[Row]) -> Result<usize>;
    fn delete_eq(&mut self, table: &str, column: &str, value: &str) -> Result<()>;
    fn rpc(&mut self, function: &str, args: &Value) -> Result<Value>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub key: String,
    pub key_source: &'static str,
    pub page_size: usize,
    pub user_agent: String,
    pub timeout_ms: u64,
}

const KEY_VARS: [&str; 4] = [
    "SUPABASE_SERVICE_ROLE_KEY",
    "VITE_SUPABASE_SERVICE_ROLE_KEY",
    "SUPABASE_ANON_KEY",
    "VITE_SUPABASE_ANON_KEY",
];

impl BackendConfig {
    /// Backend URL and key from env (config file for the URL). Errors before any
    /// request when either is missing.
    pub fn from_config(config: &DkpConfig) -> Result<Self> {
        Self::from_lookup(config, env_value)
    }

    fn from_lookup<F>(config: &DkpConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("SUPABASE_URL")
            .or_else(|| lookup("VITE_SUPABASE_URL"))
            .or_else(|| config.backend.url.clone())
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        let Some(url) = url else {
            bail!("backend URL is not set\nSet SUPABASE_URL in .env or [backend].url in config.toml.");
        };
        let Some((key_source, key)) = KEY_VARS
            .iter()
            .find_map(|name| lookup(name).map(|key| (*name, key)))
        else {
            bail!("backend key is not set\nSet SUPABASE_SERVICE_ROLE_KEY (or SUPABASE_ANON_KEY) in .env.");
        };
        let settings = config.http_settings();
        Ok(Self {
            url,
            key,
            key_source,
            page_size: config.backend_page_size(),
            user_agent: settings.user_agent,
            timeout_ms: settings.timeout_ms,
        })
    }
}

pub struct RestBackend {
    client: Client,
    config: BackendConfig,
    request_count: usize,
}

impl RestBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&config.key).context("backend key is not a valid header value")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.key))
                .context("backend key is not a valid header value")?,
        );
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("failed to build backend HTTP client")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.config.url)
    }

    fn send(&mut self, what: &str, request: RequestBuilder) -> Result<Response> {
        self.request_count += 1;
        debug!(request = what, "backend request");
        let response = request
            .send()
            .with_context(|| format!("failed to call backend ({what})"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("backend {what} failed with HTTP {status}: {}", body.trim());
        }
        Ok(response)
    }

    fn read_rows(what: &str, response: Response) -> Result<Vec<Row>> {
        response
            .json::<Vec<Row>>()
            .with_context(|| format!("failed to decode backend rows ({what})"))
    }
}

impl HostedBackend for RestBackend {
    fn select_all(&mut self, table: &str, order: Option<&str>) -> Result<Vec<Row>> {
        let page_size = self.config.page_size.max(1);
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut query = vec![
                ("select", "*".to_string()),
                ("offset", offset.to_string()),
                ("limit", page_size.to_string()),
            ];
            if let Some(order) = order {
                query.push(("order", order.to_string()));
            }
            let what = format!("select {table}");
            let request = self.client.get(self.table_url(table)).query(&query);
            let response = self.send(&what, request)?;
            let page = Self::read_rows(&what, response)?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < page_size {
                break;
            }
            offset += page_size;
        }
        Ok(rows)
    }

    fn upsert(&mut self, table: &str, rows: &[Row], on_conflict: &str) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let request = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        self.send(&format!("upsert {table}"), request)?;
        Ok(rows.len())
    }

    fn insert(&mut self, table: &str, rows: &[Row]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(rows);
        self.send(&format!("insert {table}"), request)?;
        Ok(rows.len())
    }

    fn delete_eq(&mut self, table: &str, column: &str, value: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.table_url(table))
            .query(&[(column, format!("eq.{value}"))]);
        self.send(&format!("delete {table}"), request)?;
        Ok(())
    }

    fn rpc(&mut self, function: &str, args: &Value) -> Result<Value> {
        let url = format!("{}/rest/v1/rpc/{function}", self.config.url);
        let what = format!("rpc {function}");
        let response = self.send(&what, self.client.post(url).json(args))?;
        let body = response
            .text()
            .with_context(|| format!("failed to read backend response ({what})"))?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).with_context(|| format!("failed to decode backend response ({what})"))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Build a row from CSV-style string pairs; empty values become `null`.
pub fn row_from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Row {
    pairs
        .into_iter()
        .map(|(key, value)| {
            let value = value.trim();
            let json = if value.is_empty() {
                Value::Null
            } else {
                Value::String(value.to_string())
            };
            (key.to_string(), json)
        })
        .collect()
}

/// Render a backend value as a CSV cell: `null` is empty, strings are bare.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, BTreeSet};

    use anyhow::{Result, bail};
    use serde_json::Value;

    use super::{HostedBackend, Row};

    /// In-memory tables plus a log of every call.
    #[derive(Debug, Default)]
    pub struct MockBackend {
        pub tables: BTreeMap<String, Vec<Row>>,
        pub calls: Vec<String>,
        pub rpc_calls: Vec<(String, Value)>,
        /// RPC functions that answer with an error.
        pub missing_rpcs: BTreeSet<String>,
        /// Table writes that answer with an error.
        pub failing_tables: BTreeSet<String>,
    }

    impl MockBackend {
        pub fn with_rows(mut self, table: &str, rows: Vec<Row>) -> Self {
            self.tables.insert(table.to_string(), rows);
            self
        }

        pub fn rows(&self, table: &str) -> &[Row] {
            self.tables.get(table).map(Vec::as_slice).unwrap_or_default()
        }

        fn check_write(&self, table: &str) -> Result<()> {
            if self.failing_tables.contains(table) {
                bail!("backend insert {table} failed with HTTP 400 Bad Request");
            }
            Ok(())
        }
    }

    impl HostedBackend for MockBackend {
        fn select_all(&mut self, table: &str, order: Option<&str>) -> Result<Vec<Row>> {
            match order {
                Some(order) => self.calls.push(format!("select {table} order={order}")),
                None => self.calls.push(format!("select {table}")),
            }
            Ok(self.rows(table).to_vec())
        }

        fn upsert(&mut self, table: &str, rows: &[Row], on_conflict: &str) -> Result<usize> {
            self.calls.push(format!("upsert {table}"));
            self.check_write(table)?;
            let keys: Vec<&str> = on_conflict.split(',').collect();
            let stored = self.tables.entry(table.to_string()).or_default();
            for row in rows {
                let same_key = |existing: &Row| keys.iter().all(|key| existing.get(*key) == row.get(*key));
                match stored.iter_mut().find(|existing| same_key(existing)) {
                    Some(existing) => {
                        for (key, value) in row {
                            existing.insert(key.clone(), value.clone());
                        }
                    }
                    None => stored.push(row.clone()),
                }
            }
            Ok(rows.len())
        }

        fn insert(&mut self, table: &str, rows: &[Row]) -> Result<usize> {
            self.calls.push(format!("insert {table}"));
            self.check_write(table)?;
            self.tables
                .entry(table.to_string())
                .or_default()
                .extend(rows.iter().cloned());
            Ok(rows.len())
        }

        fn delete_eq(&mut self, table: &str, column: &str, value: &str) -> Result<()> {
            self.calls.push(format!("delete {table} {column}={value}"));
            if let Some(rows) = self.tables.get_mut(table) {
                rows.retain(|row| row.get(column).and_then(Value::as_str) != Some(value));
            }
            Ok(())
        }

        fn rpc(&mut self, function: &str, args: &Value) -> Result<Value> {
            self.calls.push(format!("rpc {function}"));
            if self.missing_rpcs.contains(function) {
                bail!("backend rpc {function} failed with HTTP 404: function does not exist");
            }
            self.rpc_calls.push((function.to_string(), args.clone()));
            Ok(Value::Null)
        }

        fn request_count(&self) -> usize {
            self.calls.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSection;

    fn lookup_from(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key: &str| {
            pairs
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn config_prefers_service_role_key_and_trims_url() {
        let config = DkpConfig::default();
        let resolved = BackendConfig::from_lookup(
            &config,
            lookup_from(&[
                ("VITE_SUPABASE_URL", "https://xyz.supabase.co/"),
                ("SUPABASE_ANON_KEY", "anon"),
                ("VITE_SUPABASE_SERVICE_ROLE_KEY", "service"),
            ]),
        )
        .expect("config");
        assert_eq!(resolved.url, "https://xyz.supabase.co");
        assert_eq!(resolved.key, "service");
        assert_eq!(resolved.key_source, "VITE_SUPABASE_SERVICE_ROLE_KEY");
        assert_eq!(resolved.page_size, crate::config::DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn missing_url_or_key_fails_before_any_request() {
        let config = DkpConfig::default();
        let error = BackendConfig::from_lookup(&config, lookup_from(&[("SUPABASE_ANON_KEY", "k")]))
            .expect_err("missing url");
        assert!(error.to_string().contains("backend URL"));

        let config = DkpConfig {
            backend: BackendSection {
                url: Some("https://cfg.supabase.co".to_string()),
                page_size: Some(50),
            },
            ..DkpConfig::default()
        };
        let error = BackendConfig::from_lookup(&config, lookup_from(&[])).expect_err("missing key");
        assert!(error.to_string().contains("backend key"));
    }

    #[test]
    fn rows_turn_empty_strings_into_null() {
        let row = row_from_pairs([("raid_id", "7"), ("cost", " ")]);
        assert_eq!(row.get("raid_id"), Some(&Value::String("7".to_string())));
        assert_eq!(row.get("cost"), Some(&Value::Null));
        assert_eq!(cell_text(&Value::Null), "");
        assert_eq!(cell_text(&serde_json::json!(12)), "12");
        assert_eq!(cell_text(&serde_json::json!("x")), "x");
    }
}
