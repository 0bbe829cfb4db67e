use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

use crate::output::write_if_changed;

pub const STATE_DIR_NAME: &str = ".dkptool";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const MANIFEST_FILENAME: &str = "manifest.jsonl";

/// Cache sub-directories, one per kind of saved page.
pub const CACHE_KINDS: [&str; 4] = ["roster", "characters", "raids", "items"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub config_path: PathBuf,
    pub manifest_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub state_dir_exists: bool,
    pub cache_dir_exists: bool,
    pub data_dir_exists: bool,
    pub backup_dir_exists: bool,
    pub config_exists: bool,
    pub manifest_exists: bool,
    pub cached_pages: usize,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ncache_dir={}\ndata_dir={} ({})\nbackup_dir={}\nconfig_path={} ({})\nmanifest_path={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.cache_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.backup_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.manifest_path),
        )
    }

    /// Location of a saved page, e.g. `cache/raids/raid_1598436.html`.
    pub fn cache_path(&self, kind: &str, name: &str) -> PathBuf {
        self.cache_dir.join(kind).join(format!("{name}.html"))
    }

    pub fn data_file(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let project_root_exists = paths.project_root.exists();
    let state_dir_exists = paths.state_dir.exists();
    let cache_dir_exists = paths.cache_dir.exists();
    let data_dir_exists = paths.data_dir.exists();
    let backup_dir_exists = paths.backup_dir.exists();
    let config_exists = paths.config_path.exists();
    let manifest_exists = paths.manifest_path.exists();
    let cached_pages = if cache_dir_exists {
        count_cached_pages(&paths.cache_dir)?
    } else {
        0
    };

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(".dkptool/ is missing; run `dkptool init` before scraping".to_string());
    }
    if !data_dir_exists {
        warnings.push(format!(
            "{} is missing; artifact commands will create it on first write",
            normalize_for_display(&paths.data_dir)
        ));
    }
    if !config_exists {
        warnings.push("config.toml is missing; built-in defaults and env vars apply".to_string());
    }

    Ok(RuntimeStatus {
        project_root_exists,
        state_dir_exists,
        cache_dir_exists,
        data_dir_exists,
        backup_dir_exists,
        config_exists,
        manifest_exists,
        cached_pages,
        warnings,
    })
}

fn count_cached_pages(cache_dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in WalkDir::new(cache_dir) {
        let entry = entry
            .with_context(|| format!("failed to walk {}", normalize_for_display(cache_dir)))?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|ext| ext.to_str()) == Some("html")
        {
            count += 1;
        }
    }
    Ok(count)
}

pub fn ensure_runtime_ready_for_scrape(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.state_dir_exists {
        bail!(
            "Runtime layout is not initialized for scraping.\nMissing required path:\n  - .dkptool/ (missing)\nRun: dkptool init --project-root {}",
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;

    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = non_empty(lookup_env("DKPTOOL_DATA_DIR")) {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (project_root.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("DKPTOOL_CONFIG")) {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        cache_dir: state_dir.join("cache"),
        manifest_path: state_dir.join(MANIFEST_FILENAME),
        backup_dir: project_root.join("backup"),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let mut required_dirs = vec![
        paths.state_dir.clone(),
        paths.cache_dir.clone(),
        paths.data_dir.clone(),
        paths.backup_dir.clone(),
    ];
    required_dirs.extend(CACHE_KINDS.iter().map(|kind| paths.cache_dir.join(kind)));

    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let keep_existing = paths.config_path.exists() && !options.force;
    let wrote_config = options.materialize_config
        && !keep_existing
        && write_if_changed(&paths.config_path, render_materialized_config().as_bytes())?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config() -> String {
    format!(
        "# dkptool runtime configuration (materialized by `dkptool init`)\n# Environment variables override every value below.\n\n[legacy]\n# base_url = \"https://guild.example.com\"   # DKP_LEGACY_URL\n# guild_id = 547766                        # DKP_GUILD_ID\ncookies_file = \"cookies.txt\"               # DKP_COOKIES_FILE\n\n[reference]\nitem_url = \"{item_url}\"\n\n[http]\n# user_agent = \"{user_agent}\"   # DKP_USER_AGENT\ntimeout_ms = 30000\nretries = 3\nretry_delay_ms = 1000\ndelay_ms = 2500\njitter_ms = 1000\n\n[backend]\n# url = \"https://your-project.supabase.co\"   # SUPABASE_URL\npage_size = 1000\n",
        item_url = crate::config::DEFAULT_ITEM_URL,
        user_agent = crate::config::DEFAULT_USER_AGENT,
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }
    if let Some(value) = non_empty(lookup_env("DKPTOOL_PROJECT_ROOT")) {
        return Ok((absolutize(Path::new(&value), &context.cwd), ValueSource::Env));
    }
    let found = find_initialized_root(&context.cwd, context.executable_dir.as_deref());
    Ok((
        found.unwrap_or_else(|| context.cwd.clone()),
        ValueSource::Heuristic,
    ))
}

/// Nearest ancestor of `cwd`, then of the executable, that holds `.dkptool/`.
fn find_initialized_root(cwd: &Path, executable_dir: Option<&Path>) -> Option<PathBuf> {
    let mut visited = HashSet::new();
    cwd.ancestors()
        .chain(executable_dir.into_iter().flat_map(Path::ancestors))
        .filter(|candidate| visited.insert(candidate.to_path_buf()))
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
