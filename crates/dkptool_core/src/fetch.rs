use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, REFERER};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::HttpSettings;
use crate::output::write_if_changed;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE_VALUE: &str = "en-US,en;q=0.9";

const LOGGED_OUT_MARKERS: [&str; 6] = [
    "attention required",
    "cf-error",
    "cloudflare",
    "login",
    "sign in",
    "password",
];
const LOGGED_IN_MARKERS: [&str; 3] = ["characters found", "data-table", "roster.php?"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: String,
}

/// Source of HTML pages. `HttpFetcher` talks to the network; tests use in-memory fakes.
pub trait PageFetcher {
    fn fetch(&mut self, url: &str) -> Result<FetchedPage>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub settings: HttpSettings,
    /// Sent as `Referer` and used as the cookie domain.
    pub site_url: Option<String>,
    pub cookies: Vec<(String, String)>,
    /// Treat pages that look logged-out or challenged as failures.
    pub login_check: bool,
    pub manifest_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    url: &'a str,
    status: Option<u16>,
    final_url: &'a str,
    bytes: usize,
    sha256: String,
    ok: bool,
    note: &'a str,
}

pub struct HttpFetcher {
    client: Client,
    options: FetcherOptions,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl HttpFetcher {
    pub fn new(options: FetcherOptions) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static(ACCEPT_LANGUAGE_VALUE),
        );

        let mut builder = Client::builder()
            .user_agent(options.settings.user_agent.clone())
            .timeout(Duration::from_millis(options.settings.timeout_ms));

        if let Some(site_url) = options.site_url.as_deref() {
            let referer = format!("{}/", site_url.trim_end_matches('/'));
            headers.insert(
                REFERER,
                HeaderValue::from_str(&referer)
                    .with_context(|| format!("invalid referer header value {referer}"))?,
            );
            if !options.cookies.is_empty() {
                let url = Url::parse(site_url)
                    .with_context(|| format!("invalid legacy site URL {site_url}"))?;
                let jar = Jar::default();
                for (name, value) in &options.cookies {
                    jar.add_cookie_str(&format!("{name}={value}; Path=/"), &url);
                }
                builder = builder.cookie_provider(Arc::new(jar));
            }
        } else if !options.cookies.is_empty() {
            bail!("cookies were provided without a site URL to attach them to");
        }

        let client = builder
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            options,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn apply_politeness(&mut self) {
        let delay = Duration::from_millis(
            self.options
                .settings
                .delay_ms
                .saturating_add(jitter_ms(self.options.settings.jitter_ms)),
        );
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .options
            .settings
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        sleep(Duration::from_millis(
            base.saturating_add(jitter_ms(self.options.settings.jitter_ms)),
        ));
    }

    fn record(&self, entry: &ManifestEntry<'_>) -> Result<()> {
        let Some(path) = self.options.manifest_path.as_deref() else {
            return Ok(());
        };
        append_manifest(path, entry)
    }
}

impl PageFetcher for HttpFetcher {
    fn fetch(&mut self, url: &str) -> Result<FetchedPage> {
        let retries = self.options.settings.retries;
        let mut last_error = None::<String>;
        for attempt in 0..=retries {
            self.apply_politeness();
            match self.client.get(url).send() {
                Ok(response) => {
                    let status = response.status();
                    let final_url = response.url().to_string();
                    match response.text() {
                        Ok(body) => {
                            let note = if !status.is_success() {
                                format!("HTTP {status}")
                            } else if self.options.login_check && looks_logged_out(&body) {
                                "looks_logged_out_or_challenged".to_string()
                            } else {
                                String::new()
                            };
                            self.record(&ManifestEntry {
                                url,
                                status: Some(status.as_u16()),
                                final_url: &final_url,
                                bytes: body.len(),
                                sha256: sha256_hex(body.as_bytes()),
                                ok: note.is_empty(),
                                note: &note,
                            })?;
                            if note.is_empty() {
                                return Ok(FetchedPage {
                                    url: url.to_string(),
                                    final_url,
                                    status: status.as_u16(),
                                    body,
                                });
                            }
                            last_error = Some(note);
                        }
                        Err(error) => {
                            let note = format!("failed to read body: {error}");
                            self.record(&ManifestEntry {
                                url,
                                status: Some(status.as_u16()),
                                final_url: &final_url,
                                bytes: 0,
                                sha256: String::new(),
                                ok: false,
                                note: &note,
                            })?;
                            last_error = Some(note);
                        }
                    }
                }
                Err(error) => {
                    let note = format!("exception: {error}");
                    self.record(&ManifestEntry {
                        url,
                        status: None,
                        final_url: "",
                        bytes: 0,
                        sha256: String::new(),
                        ok: false,
                        note: &note,
                    })?;
                    last_error = Some(note);
                }
            }

            if attempt < retries {
                debug!(
                    url,
                    attempt = attempt + 1,
                    error = last_error.as_deref().unwrap_or_default(),
                    "retrying page fetch"
                );
                self.wait_before_retry(attempt);
            }
        }

        let message = last_error.unwrap_or_else(|| "request failed".to_string());
        bail!(
            "failed to fetch {url} after {} attempt(s): {message}",
            retries + 1
        )
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn append_manifest(path: &Path, entry: &ManifestEntry<'_>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let line = serde_json::to_string(entry).context("failed to serialize manifest entry")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))
}

/// True when a page looks like a login wall or a bot challenge instead of guild data.
pub fn looks_logged_out(html: &str) -> bool {
    let lowered = html.to_ascii_lowercase();
    LOGGED_OUT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
        && !LOGGED_IN_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn jitter_ms(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::from(duration.subsec_nanos()) % (max + 1))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub body: String,
    pub from_cache: bool,
}

/// Return the page saved at `cache_path`, fetching and saving it first when it is
/// missing or `refresh` is set.
pub fn fetch_cached<F: PageFetcher + ?Sized>(
    fetcher: &mut F,
    cache_path: &Path,
    url: &str,
    refresh: bool,
) -> Result<CachedPage> {
    if !refresh && cache_path.exists() {
        let body = fs::read_to_string(cache_path)
            .with_context(|| format!("failed to read {}", cache_path.display()))?;
        return Ok(CachedPage {
            body,
            from_cache: true,
        });
    }
    let page = fetcher.fetch(url)?;
    if page.final_url != page.url && !page.final_url.is_empty() {
        warn!(url, final_url = %page.final_url, "page was redirected");
    }
    write_if_changed(cache_path, page.body.as_bytes())?;
    Ok(CachedPage {
        body: page.body,
        from_cache: false,
    })
}

/// Read a cached page if present.
pub fn read_cached(cache_path: &Path) -> Result<Option<String>> {
    if !cache_path.exists() {
        return Ok(None);
    }
    fs::read_to_string(cache_path)
        .map(Some)
        .with_context(|| format!("failed to read {}", cache_path.display()))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use anyhow::{Result, bail};

    use super::{FetchedPage, PageFetcher};

    /// Serves canned bodies by URL and records every request.
    #[derive(Debug, Default)]
    pub struct MockFetcher {
        pub pages: HashMap<String, String>,
        pub requests: Vec<String>,
    }

    impl MockFetcher {
        pub fn with_page(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }
    }

    impl PageFetcher for MockFetcher {
        fn fetch(&mut self, url: &str) -> Result<FetchedPage> {
            self.requests.push(url.to_string());
            match self.pages.get(url) {
                Some(body) => Ok(FetchedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: 200,
                    body: body.clone(),
                }),
                None => bail!("HTTP 404 Not Found for {url}"),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::testing::MockFetcher;
    use super::*;

    #[test]
    fn logged_out_heuristic_requires_marker_without_guild_content() {
        assert!(looks_logged_out("<title>Attention Required! | Cloudflare</title>"));
        assert!(looks_logged_out("<form><input name=password></form>"));
        assert!(!looks_logged_out(
            "<a href='login.php'>Login</a> 42 Characters Found"
        ));
        assert!(!looks_logged_out("<table class='data-table'></table>"));
        assert!(!looks_logged_out("<p>nothing here</p>"));
    }

    #[test]
    fn sha256_hex_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fetch_cached_reuses_saved_page_unless_refresh() {
        let temp = tempdir().expect("tempdir");
        let cache_path = temp.path().join("raids").join("raid_1.html");
        let mut fetcher = MockFetcher::default().with_page("https://x/raid?id=1", "<html>v1</html>");

        let first = fetch_cached(&mut fetcher, &cache_path, "https://x/raid?id=1", false)
            .expect("first fetch");
        assert!(!first.from_cache);
        assert_eq!(fs::read_to_string(&cache_path).expect("read"), "<html>v1</html>");

        let second = fetch_cached(&mut fetcher, &cache_path, "https://x/raid?id=1", false)
            .expect("second fetch");
        assert!(second.from_cache);
        assert_eq!(fetcher.request_count(), 1);

        fetcher
            .pages
            .insert("https://x/raid?id=1".to_string(), "<html>v2</html>".to_string());
        let third = fetch_cached(&mut fetcher, &cache_path, "https://x/raid?id=1", true)
            .expect("refresh fetch");
        assert_eq!(third.body, "<html>v2</html>");
        assert_eq!(fetcher.request_count(), 2);
    }

    #[test]
    fn manifest_lines_are_appended_as_json() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("manifest.jsonl");
        let entry = ManifestEntry {
            url: "https://x/a",
            status: Some(200),
            final_url: "https://x/a",
            bytes: 3,
            sha256: sha256_hex(b"abc"),
            ok: true,
            note: "",
        };
        append_manifest(&path, &entry).expect("append");
        append_manifest(&path, &entry).expect("append again");
        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(parsed["status"], 200);
        assert_eq!(parsed["ok"], true);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        assert_eq!(jitter_ms(0), 0);
        assert!(jitter_ms(10) <= 10);
    }
}
