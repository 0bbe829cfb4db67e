use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "dkptool/0.2 (guild DKP roster and loot ledger)";
pub const DEFAULT_ITEM_URL: &str = "https://www.takproject.net/allaclone/item.php?id={id}";
pub const DEFAULT_COOKIES_FILE: &str = "cookies.txt";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_DELAY_MS: u64 = 2_500;
pub const DEFAULT_JITTER_MS: u64 = 1_000;
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DkpConfig {
    #[serde(default)]
    pub legacy: LegacySection,
    #[serde(default)]
    pub reference: ReferenceSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub backend: BackendSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LegacySection {
    pub base_url: Option<String>,
    pub guild_id: Option<u64>,
    pub cookies_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ReferenceSection {
    pub item_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub delay_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BackendSection {
    pub url: Option<String>,
    pub page_size: Option<usize>,
}

/// Effective HTTP politeness and retry settings after env overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub retries: usize,
    pub retry_delay_ms: u64,
    pub delay_ms: u64,
    pub jitter_ms: u64,
}

impl DkpConfig {
    /// Legacy guild site base URL: env DKP_LEGACY_URL > config > None.
    pub fn legacy_base_url(&self) -> Option<String> {
        env_value("DKP_LEGACY_URL")
            .or_else(|| self.legacy.base_url.clone())
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
    }

    /// Guild id: env DKP_GUILD_ID > config > None.
    pub fn guild_id(&self) -> Option<u64> {
        env_value("DKP_GUILD_ID")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.legacy.guild_id)
    }

    /// Cookie file path, relative paths resolved from the project root.
    pub fn cookies_file(&self, project_root: &Path) -> PathBuf {
        let raw = env_value("DKP_COOKIES_FILE")
            .or_else(|| self.legacy.cookies_file.clone())
            .unwrap_or_else(|| DEFAULT_COOKIES_FILE.to_string());
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            project_root.join(path)
        }
    }

    pub fn item_url_template(&self) -> String {
        self.reference
            .item_url
            .clone()
            .filter(|url| url.contains("{id}"))
            .unwrap_or_else(|| DEFAULT_ITEM_URL.to_string())
    }

    /// Resolve user agent: env DKP_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_value("DKP_USER_AGENT")
            .or_else(|| self.http.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            user_agent: self.user_agent(),
            timeout_ms: env_value_u64("DKP_HTTP_TIMEOUT_MS")
                .or(self.http.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            retries: env_value_usize("DKP_HTTP_RETRIES")
                .or(self.http.retries)
                .unwrap_or(DEFAULT_RETRIES),
            retry_delay_ms: self.http.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            delay_ms: env_value_u64("DKP_HTTP_DELAY_MS")
                .or(self.http.delay_ms)
                .unwrap_or(DEFAULT_DELAY_MS),
            jitter_ms: self.http.jitter_ms.unwrap_or(DEFAULT_JITTER_MS),
        }
    }

    /// Hosted backend URL: env SUPABASE_URL > VITE_SUPABASE_URL > config.
    pub fn backend_url(&self) -> Option<String> {
        env_value("SUPABASE_URL")
            .or_else(|| env_value("VITE_SUPABASE_URL"))
            .or_else(|| self.backend.url.clone())
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
    }

    pub fn backend_page_size(&self) -> usize {
        self.backend
            .page_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

/// Load and parse a DkpConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<DkpConfig> {
    if !config_path.exists() {
        return Ok(DkpConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: DkpConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Split a browser `Cookie:` header into ordered `(name, value)` pairs.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    let trimmed = header.trim();
    let body = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("cookie:") => &trimmed[7..],
        _ => trimmed,
    };
    body.split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Read the one-line cookie file exported from a logged-in browser session.
pub fn load_cookie_file(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.exists() {
        bail!(
            "cookie file not found: {}\nPaste the Cookie header from a logged-in browser session on one line.",
            path.display()
        );
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let header = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .unwrap_or_default();
    let cookies = parse_cookie_header(header);
    if cookies.is_empty() {
        bail!(
            "cookie file {} has no `name=value` pairs\nPaste the Cookie header from a logged-in browser session on one line.",
            path.display()
        );
    }
    Ok(cookies)
}

pub fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_value_u64(key: &str) -> Option<u64> {
    env_value(key).and_then(|value| value.parse::<u64>().ok())
}

fn env_value_usize(key: &str) -> Option<usize> {
    env_value(key).and_then(|value| value.parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, DkpConfig::default());
        assert_eq!(config.backend_page_size(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[legacy]
base_url = "https://guild.example.com/"
guild_id = 547766
cookies_file = "secrets/cookies.txt"

[reference]
item_url = "https://items.example.com/item.php?id={id}"

[http]
timeout_ms = 15000
retry_delay_ms = 250
jitter_ms = 0

[backend]
url = "https://project.example.co"
page_size = 500
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.legacy.guild_id, Some(547766));
        assert_eq!(
            config.legacy.base_url.as_deref(),
            Some("https://guild.example.com/")
        );
        assert_eq!(
            config.item_url_template(),
            "https://items.example.com/item.php?id={id}"
        );
        assert_eq!(config.backend_page_size(), 500);
        assert_eq!(
            config.cookies_file(Path::new("/guild")),
            Path::new("/guild").join("secrets/cookies.txt")
        );
        let http = config.http_settings();
        assert_eq!(http.retry_delay_ms, 250);
        assert_eq!(http.jitter_ms, 0);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[legacy\nbase_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn item_url_without_placeholder_falls_back_to_default() {
        let mut config = DkpConfig::default();
        config.reference.item_url = Some("https://items.example.com/item.php".to_string());
        assert_eq!(config.item_url_template(), DEFAULT_ITEM_URL);
    }

    #[test]
    fn parse_cookie_header_keeps_order_and_strips_prefix() {
        let pairs = parse_cookie_header("Cookie: a=1; gl[session_id]=abc=def;; =skip; noequals; b = 2");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("gl[session_id]".to_string(), "abc=def".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn parse_cookie_header_without_prefix() {
        let pairs = parse_cookie_header("  sid=xyz  ");
        assert_eq!(pairs, vec![("sid".to_string(), "xyz".to_string())]);
        assert!(parse_cookie_header("").is_empty());
    }

    #[test]
    fn load_cookie_file_rejects_missing_and_empty_files() {
        let temp = tempdir().expect("tempdir");
        let missing = temp.path().join("cookies.txt");
        let error = load_cookie_file(&missing).expect_err("missing must fail");
        assert!(error.to_string().contains("cookie file not found"));

        fs::write(&missing, "\n# comment\n").expect("write cookies");
        let error = load_cookie_file(&missing).expect_err("empty must fail");
        assert!(error.to_string().contains("no `name=value` pairs"));

        fs::write(&missing, "# exported\nCookie: sid=1; theme=dark\n").expect("write cookies");
        let cookies = load_cookie_file(&missing).expect("load cookies");
        assert_eq!(cookies.len(), 2);
    }
}
