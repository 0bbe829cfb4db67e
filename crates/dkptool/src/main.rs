use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use dkptool_core::assign::{AssignOptions, assign_loot};
use dkptool_core::backend::{BackendConfig, HostedBackend, RestBackend};
use dkptool_core::classify::{
    ClassifyOptions, MOB_LOOT_FILE, build_classifications, build_items_seen,
};
use dkptool_core::config::{DkpConfig, load_config, load_cookie_file};
use dkptool_core::dkp::{DkpOptions, compute_dkp};
use dkptool_core::extract::{ExtractOptions, extract_structured};
use dkptool_core::fetch::{FetcherOptions, HttpFetcher, PageFetcher};
use dkptool_core::output::write_json;
use dkptool_core::reference::{
    ItemStatsOptions, aggregate_identical_loot, build_item_stats, load_mob_loot,
};
use dkptool_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready_for_scrape, init_layout, inspect_runtime, normalize_for_display,
    resolve_paths,
};
use dkptool_core::scrape::{
    LegacySite, LinkedScrapeOptions, RaidScrapeOptions, refresh_raid_index, scrape_linked,
    scrape_members, scrape_raids, scrape_roster,
};
use dkptool_core::sync::{
    DEFAULT_ASSIGNMENT_BATCH, RaidPushReport, RestoreOptions, backup, default_loot_csv,
    pull_table, push_classifications, push_loot_assignments, push_loot_counts, push_raid,
    push_roster, restore,
};
use tracing_subscriber::EnvFilter;

const ITEM_STATS_JSON: &str = "item_stats.json";
const ITEM_STATS_CSV: &str = "item_stats.csv";
const RAID_ITEM_SOURCES_FILE: &str = "raid_item_sources.json";

#[derive(Debug, Parser)]
#[command(
    name = "dkptool",
    version,
    about = "Guild DKP scraper, ledger builder and backend sync"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create .dkptool/, the cache, data/ and a commented config.toml
    Init(InitArgs),
    /// Show the resolved layout and what exists on disk
    Status,
    /// Fetch pages from the legacy guild site or the item reference site
    Scrape(ScrapeArgs),
    /// Turn cached pages and scrape CSVs into structured CSVs
    Extract(ExtractArgs),
    /// Build derived reference and classification artifacts
    Build(BuildArgs),
    /// Compute DKP totals from the structured CSVs
    Dkp(DkpArgs),
    /// Upload local data to the hosted backend
    Push(PushArgs),
    /// Export every public backend table to CSV
    Backup(BackupArgs),
    /// Export one backend table to CSV
    Pull(PullArgs),
    /// Load a backup directory or zip back into the backend
    Restore(RestoreArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
    #[arg(long, help = "Skip writing .dkptool/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct ScrapeArgs {
    #[command(subcommand)]
    command: ScrapeSubcommand,
}

#[derive(Debug, Subcommand)]
enum ScrapeSubcommand {
    /// Walk every roster page into roster_full.csv
    Roster,
    /// Visit character pages and group linked characters into accounts
    Linked {
        #[arg(long, value_name = "N", help = "Only visit the first N characters")]
        limit: Option<usize>,
        #[arg(long, help = "Re-fetch character pages already cached")]
        refresh: bool,
    },
    /// List raids and cache their detail pages
    Raids {
        #[arg(long, value_name = "N", help = "Stop after N list pages")]
        limit_pages: Option<u32>,
        #[arg(long, value_name = "N", help = "Fetch at most N raid detail pages")]
        limit_raids: Option<usize>,
        #[arg(long, value_name = "YYYY-MM-DD", help = "Skip raids dated before this day")]
        since: Option<String>,
        #[arg(long = "raid-id", value_name = "ID", help = "Only these raid ids (repeatable)")]
        raid_ids: Vec<String>,
        #[arg(long, help = "Also cache the attendees-by-event page of each raid")]
        with_attendees: bool,
        #[arg(long, help = "Re-fetch detail pages already cached")]
        refresh: bool,
    },
    /// Snapshot the members DKP page for auditing computed totals
    Members,
    /// Rebuild raids_index.csv fields from cached raid pages
    Index,
    /// Fetch item pages and write item_stats.json
    Items(ItemStatsArgs),
}

#[derive(Debug, Args)]
struct ItemStatsArgs {
    #[arg(long, value_name = "N", help = "Process at most N item ids")]
    limit: Option<usize>,
    #[arg(long, help = "Re-parse ids already present in item_stats.json")]
    no_resume: bool,
    #[arg(long, help = "Re-fetch item pages already cached")]
    refresh: bool,
    #[arg(long, help = "Skip writing item_stats.csv")]
    no_csv: bool,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    #[arg(long, value_name = "N", help = "Only parse the first N cached raid pages")]
    limit: Option<usize>,
    #[arg(long, value_name = "PATH", help = "Also mirror every CSV into this SQLite file")]
    sqlite: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct BuildArgs {
    #[command(subcommand)]
    command: BuildSubcommand,
}

#[derive(Debug, Subcommand)]
enum BuildSubcommand {
    /// Parse cached item pages only (no network) into item_stats.json
    ItemStats(ItemStatsArgs),
    /// Merge mobs with identical loot tables in dkp_mob_loot.json
    MobLoot {
        #[arg(long, value_name = "PATH", help = "Write here instead of replacing the input")]
        out: Option<PathBuf>,
    },
    /// Distinct item names seen in raid_loot.csv
    ItemsSeen,
    /// Classify raids by the mobs and zones their loot drops from
    Classify {
        #[arg(long, help = "Ignore items_seen.json as an allow-list")]
        no_items_seen: bool,
        #[arg(long, help = "Ignore dkp_mob_loot.json as a mob allow-list")]
        no_mob_loot: bool,
    },
    /// Attribute raid_loot.csv rows to the toon holding each item in Magelo
    LootAssignments(LootAssignmentArgs),
}

#[derive(Debug, Args)]
struct LootAssignmentArgs {
    #[arg(long, value_name = "DIR", help = "Magelo dump root (default: <project>/magelo)")]
    magelo_dir: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Default: <magelo>/character/TAKP_character.txt")]
    character_file: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Default: <magelo>/inventory/TAKP_character_inventory.txt")]
    inventory_file: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Default: <magelo>/elemental_armor.json")]
    elemental_armor_json: Option<PathBuf>,
    #[arg(long = "elemental-source-name", value_name = "NAME", help = "Extra pre-turn-in item name (repeatable)")]
    elemental_sources: Vec<String>,
    #[arg(long, value_name = "PATH", help = "Write loot here instead of replacing raid_loot.csv")]
    out_loot: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Counts CSV path")]
    out_counts: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DkpArgs {
    #[arg(long, value_name = "YYYY-MM-DD", help = "Only count raids on or after this day")]
    since: Option<String>,
}

#[derive(Debug, Args)]
struct PushArgs {
    #[command(subcommand)]
    command: PushSubcommand,
}

#[derive(Debug, Subcommand)]
enum PushSubcommand {
    /// Upsert characters, accounts and their links
    Roster,
    /// Replace one raid's events, loot and attendance
    Raid {
        raid_id: String,
        #[arg(long, help = "Write to the backend (default is a dry run)")]
        apply: bool,
    },
    /// Upsert raid_classifications_import.csv
    Classifications,
    /// Send loot assignment columns for rows with a backend id
    LootAssignments {
        #[arg(long, value_name = "PATH", help = "CSV with id and assigned_* columns")]
        csv: Option<PathBuf>,
        #[arg(long, value_name = "N", default_value_t = DEFAULT_ASSIGNMENT_BATCH)]
        batch: usize,
    },
    /// Replace character_loot_assignment_counts with the local counts CSV
    LootCounts,
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(long, value_name = "DIR", help = "Export directory (default: backup/)")]
    out: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Also zip the export into this file")]
    archive: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(value_name = "DIR|ZIP", help = "Export directory or archive (default: backup/)")]
    source: Option<PathBuf>,
    #[arg(long, help = "Empty the DKP tables before loading")]
    clear: bool,
}

#[derive(Debug, Args)]
struct PullArgs {
    table: String,
    #[arg(long, value_name = "DIR", help = "Export directory (default: the data dir)")]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Scrape(ScrapeArgs { command })) => run_scrape(&runtime, command),
        Some(Commands::Extract(args)) => run_extract(&runtime, args),
        Some(Commands::Build(BuildArgs { command })) => run_build(&runtime, command),
        Some(Commands::Dkp(args)) => run_dkp(&runtime, args),
        Some(Commands::Push(PushArgs { command })) => run_push(&runtime, command),
        Some(Commands::Backup(args)) => run_backup(&runtime, args),
        Some(Commands::Pull(args)) => run_pull(&runtime, args),
        Some(Commands::Restore(args)) => run_restore(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("DKPTOOL_LOG")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized dkptool runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("cache_dir: {}", normalize_path(&paths.cache_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let config = load_config(&paths.config_path)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("project_root_exists: {}", format_flag(status.project_root_exists));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("cache_dir_exists: {}", format_flag(status.cache_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("backup_dir_exists: {}", format_flag(status.backup_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("manifest_exists: {}", format_flag(status.manifest_exists));
    println!("cached_pages: {}", status.cached_pages);
    println!(
        "legacy.base_url: {}",
        config.legacy_base_url().unwrap_or_else(|| "<unset>".to_string())
    );
    println!(
        "legacy.guild_id: {}",
        config
            .guild_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<unset>".to_string())
    );
    println!(
        "backend.url: {}",
        config.backend_url().unwrap_or_else(|| "<unset>".to_string())
    );
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_scrape(runtime: &RuntimeOptions, command: ScrapeSubcommand) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_scrape(&paths, &status)?;
    let config = load_config(&paths.config_path)?;

    match command {
        ScrapeSubcommand::Items(args) => {
            let mut fetcher = reference_fetcher(&paths, &config)?;
            run_item_stats(
                runtime,
                &paths,
                &config,
                args,
                Some(&mut fetcher as &mut dyn PageFetcher),
            )
        }
        ScrapeSubcommand::Index => {
            let site = legacy_site(&config).ok();
            let report = refresh_raid_index(site.as_ref(), &paths.cache_dir, &paths.data_dir)?;
            println!("scrape index");
            println!("pages_read: {}", report.pages_read);
            println!("rows_updated: {}", report.rows_updated);
            println!("index_rows: {}", report.index_rows);
            println!("wrote_index: {}", report.wrote_index);
            print_diagnostics(runtime, &paths);
            Ok(())
        }
        ScrapeSubcommand::Roster => run_legacy_scrape(runtime, &paths, &config, |fetcher, site| {
            let report = scrape_roster(fetcher, site, &paths.cache_dir, &paths.data_dir)?;
            println!("scrape roster");
            println!("pages_fetched: {}", report.pages_fetched);
            println!("last_page: {}", report.last_page);
            println!("rows_seen: {}", report.rows_seen);
            println!("unique_rows: {}", report.unique_rows);
            if let Some(reason) = &report.stopped_early {
                println!("stopped_early: {reason}");
            }
            println!("wrote_csv: {}", report.wrote_csv);
            Ok(())
        }),
        ScrapeSubcommand::Linked { limit, refresh } => {
            run_legacy_scrape(runtime, &paths, &config, |fetcher, site| {
                let report = scrape_linked(
                    fetcher,
                    site,
                    &paths.cache_dir,
                    &paths.data_dir,
                    &LinkedScrapeOptions { limit, refresh },
                )?;
                println!("scrape linked");
                println!("characters: {}", report.characters);
                println!("fetched: {}", report.fetched);
                println!("reused_from_account: {}", report.reused_from_account);
                println!("failed: {}", report.failed);
                println!("accounts: {}", report.accounts);
                println!("wrote_linked: {}", report.wrote_linked);
                println!("wrote_groups: {}", report.wrote_groups);
                Ok(())
            })
        }
        ScrapeSubcommand::Raids {
            limit_pages,
            limit_raids,
            since,
            raid_ids,
            with_attendees,
            refresh,
        } => {
            let options = RaidScrapeOptions {
                limit_pages,
                limit_raids,
                since_date: since,
                raid_ids,
                with_attendees,
                refresh,
            };
            run_legacy_scrape(runtime, &paths, &config, |fetcher, site| {
                let report = scrape_raids(fetcher, site, &paths.cache_dir, &paths.data_dir, &options)?;
                println!("scrape raids");
                println!("raid_pool: {}", report.raid_pool);
                println!("list_pages: {}", report.list_pages);
                println!("listed: {}", report.listed);
                println!("selected: {}", report.selected);
                println!("details_fetched: {}", report.details_fetched);
                println!("details_cached: {}", report.details_cached);
                println!("attendee_pages: {}", report.attendee_pages);
                println!("failed: {}", report.failed);
                println!("index_rows: {}", report.index_rows);
                println!("wrote_index: {}", report.wrote_index);
                Ok(())
            })
        }
        ScrapeSubcommand::Members => run_legacy_scrape(runtime, &paths, &config, |fetcher, site| {
            let report = scrape_members(fetcher, site, &paths.cache_dir, &paths.data_dir)?;
            println!("scrape members");
            println!("members: {}", report.members);
            println!("wrote_snapshot: {}", report.wrote_snapshot);
            Ok(())
        }),
    }
}

/// Connect to the legacy site, run one scrape, then report request totals.
fn run_legacy_scrape<S>(
    runtime: &RuntimeOptions,
    paths: &ResolvedPaths,
    config: &DkpConfig,
    scrape: S,
) -> Result<()>
where
    S: FnOnce(&mut HttpFetcher, &LegacySite) -> Result<()>,
{
    let site = legacy_site(config)?;
    let mut fetcher = legacy_fetcher(paths, config, &site)?;
    scrape(&mut fetcher, &site)?;
    println!("requests: {}", fetcher.request_count());
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_item_stats(
    runtime: &RuntimeOptions,
    paths: &ResolvedPaths,
    config: &DkpConfig,
    args: ItemStatsArgs,
    fetcher: Option<&mut dyn PageFetcher>,
) -> Result<()> {
    let options = ItemStatsOptions {
        mob_loot_path: paths.data_file(MOB_LOOT_FILE),
        raid_sources_path: Some(paths.data_file(RAID_ITEM_SOURCES_FILE)),
        out_json: paths.data_file(ITEM_STATS_JSON),
        out_csv: (!args.no_csv).then(|| paths.data_file(ITEM_STATS_CSV)),
        item_url_template: config.item_url_template(),
        cache_dir: paths.cache_dir.join("items"),
        limit: args.limit,
        resume: !args.no_resume,
        refresh: args.refresh,
    };
    let report = build_item_stats(fetcher, &options)?;
    println!("item stats");
    println!("total_ids: {}", report.total_ids);
    println!("from_mob_loot: {}", report.from_mob_loot);
    println!("from_raid_sources: {}", report.from_raid_sources);
    println!("parsed: {}", report.parsed);
    println!("empty: {}", report.empty);
    println!("skipped_existing: {}", report.skipped_existing);
    println!("failed: {}", report.failed);
    println!("missing_from_cache: {}", report.missing_from_cache);
    println!("entries_written: {}", report.entries_written);
    println!("wrote_json: {}", report.wrote_json);
    println!("wrote_csv: {}", report.wrote_csv);
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_extract(runtime: &RuntimeOptions, args: ExtractArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = extract_structured(
        &paths.cache_dir,
        &paths.data_dir,
        &ExtractOptions {
            limit: args.limit,
            sqlite_path: args.sqlite,
        },
    )?;

    println!("extract");
    println!("characters: {}", report.characters);
    println!("accounts: {}", report.accounts);
    println!("character_accounts: {}", report.character_accounts);
    println!("raids: {}", report.raids);
    println!("raid_pages: {}", report.raid_pages);
    println!("raid_events: {}", report.raid_events);
    println!("raid_loot: {}", report.raid_loot);
    println!("raid_attendance: {}", report.raid_attendance);
    println!("raid_event_attendance: {}", report.raid_event_attendance);
    print_list("files_written", &report.files_written);
    println!("sqlite_tables: {}", report.sqlite_tables);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_build(runtime: &RuntimeOptions, command: BuildSubcommand) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    match command {
        BuildSubcommand::ItemStats(args) => {
            let config = load_config(&paths.config_path)?;
            return run_item_stats(runtime, &paths, &config, args, None);
        }
        BuildSubcommand::MobLoot { out } => {
            let input = paths.data_file(MOB_LOOT_FILE);
            let table = load_mob_loot(&input)?;
            let (merged, report) = aggregate_identical_loot(&table);
            let out = out.unwrap_or(input);
            let wrote = write_json(&out, &merged)?;
            println!("build mob-loot");
            println!("entries_in: {}", report.entries_in);
            println!("entries_out: {}", report.entries_out);
            println!("merged: {}", report.merged);
            println!("dropped_empty: {}", report.dropped_empty);
            println!("out: {}", normalize_path(&out));
            println!("wrote_json: {wrote}");
        }
        BuildSubcommand::ItemsSeen => {
            let report = build_items_seen(&paths.data_dir)?;
            println!("build items-seen");
            println!("items: {}", report.items);
            println!("wrote_json: {}", report.wrote_json);
        }
        BuildSubcommand::Classify {
            no_items_seen,
            no_mob_loot,
        } => {
            let report = build_classifications(&ClassifyOptions {
                data_dir: paths.data_dir.clone(),
                use_items_seen: !no_items_seen,
                use_mob_loot: !no_mob_loot,
            })?;
            println!("build classify");
            println!("loot_rows: {}", report.loot_rows);
            println!("item_keys: {}", report.item_keys);
            println!("classifications: {}", report.classifications);
            println!("import_rows: {}", report.import_rows);
            println!("unclassified_items: {}", report.unclassified_items);
            print_list("files_written", &report.files_written);
        }
        BuildSubcommand::LootAssignments(args) => {
            let magelo_dir = args
                .magelo_dir
                .unwrap_or_else(|| paths.project_root.join("magelo"));
            let report = assign_loot(&AssignOptions {
                data_dir: paths.data_dir.clone(),
                character_file: args
                    .character_file
                    .unwrap_or_else(|| magelo_dir.join("character").join("TAKP_character.txt")),
                inventory_file: args.inventory_file.unwrap_or_else(|| {
                    magelo_dir
                        .join("inventory")
                        .join("TAKP_character_inventory.txt")
                }),
                elemental_armor: args
                    .elemental_armor_json
                    .unwrap_or_else(|| magelo_dir.join("elemental_armor.json")),
                extra_elemental_sources: args.elemental_sources,
                out_loot: args.out_loot,
                out_counts: args.out_counts,
            })?;
            println!("build loot-assignments");
            println!("loot_rows: {}", report.loot_rows);
            println!("single_holder: {}", report.single_holder);
            println!("multiple_holders: {}", report.multiple_holders);
            println!("kept_on_buyer: {}", report.kept_on_buyer);
            println!("characters_with_loot: {}", report.characters_with_loot);
            println!("wrote_loot: {}", report.wrote_loot);
            println!("wrote_counts: {}", report.wrote_counts);
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_dkp(runtime: &RuntimeOptions, args: DkpArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = compute_dkp(&paths.data_dir, &DkpOptions { since: args.since })?;

    println!("dkp");
    println!("earned_source: {}", report.earned_source.as_str());
    println!("characters: {}", report.characters.len());
    println!(
        "accounts: {}",
        report
            .accounts
            .as_ref()
            .map(|accounts| accounts.len().to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("raids_excluded: {}", report.raids_excluded);
    println!("wrote_totals: {}", report.wrote_totals);
    println!("wrote_by_account: {}", report.wrote_by_account);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_push(runtime: &RuntimeOptions, command: PushSubcommand) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;

    if let PushSubcommand::Raid {
        raid_id,
        apply: false,
    } = &command
    {
        let report = push_raid(None, &paths.cache_dir, &paths.data_dir, raid_id)?;
        print_raid_push(&report);
        println!("mode: dry-run (pass --apply to write)");
        print_diagnostics(runtime, &paths);
        return Ok(());
    }

    let mut backend = connect_backend(&config)?;
    match command {
        PushSubcommand::Roster => {
            let report = push_roster(&mut backend, &paths.data_dir)?;
            println!("push roster");
            println!("characters: {}", report.characters);
            println!("accounts: {}", report.accounts);
            println!("character_accounts: {}", report.character_accounts);
        }
        PushSubcommand::Raid { raid_id, .. } => {
            let report = push_raid(
                Some(&mut backend as &mut dyn HostedBackend),
                &paths.cache_dir,
                &paths.data_dir,
                &raid_id,
            )?;
            print_raid_push(&report);
            println!("deleted_via_rpc: {}", report.deleted_via_rpc);
            println!("summary_refreshed: {}", report.summary_refreshed);
        }
        PushSubcommand::Classifications => {
            let rows = push_classifications(&mut backend, &paths.data_dir)?;
            println!("push classifications");
            println!("rows: {rows}");
        }
        PushSubcommand::LootAssignments { csv, batch } => {
            let csv = csv.unwrap_or_else(|| default_loot_csv(&paths.data_dir));
            let report = push_loot_assignments(&mut backend, &csv, batch)?;
            println!("push loot-assignments");
            println!("csv: {}", normalize_path(&csv));
            println!("rows: {}", report.rows);
            println!("batches: {}", report.batches);
            println!("updated: {}", report.updated);
        }
        PushSubcommand::LootCounts => {
            let report = push_loot_counts(&mut backend, &paths.data_dir)?;
            println!("push loot-counts");
            println!("rows: {}", report.rows);
            println!("removed: {}", report.removed);
        }
    }
    println!("requests: {}", backend.request_count());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_raid_push(report: &RaidPushReport) {
    println!("push raid");
    println!("raid_id: {}", report.raid_id);
    println!("applied: {}", report.applied);
    println!("events: {}", report.events);
    println!("loot: {}", report.loot);
    println!("attendance: {}", report.attendance);
    println!("event_attendance: {}", report.event_attendance);
    println!("duplicate_event_rows: {}", report.duplicate_event_rows);
}

fn run_backup(runtime: &RuntimeOptions, args: BackupArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut backend = connect_backend(&config)?;
    let out_dir = args.out.unwrap_or_else(|| paths.backup_dir.clone());
    let report = backup(&mut backend, &out_dir, args.archive.as_deref())?;

    println!("backup");
    println!("out_dir: {}", normalize_path(&out_dir));
    for table in &report.tables {
        println!("tables.{}: {}", table.table, table.rows);
    }
    println!("total_rows: {}", report.total_rows);
    println!(
        "archive: {}",
        report
            .archive
            .as_deref()
            .map(normalize_path)
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("requests: {}", backend.request_count());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_restore(runtime: &RuntimeOptions, args: RestoreArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let source = args.source.unwrap_or_else(|| paths.backup_dir.clone());
    let mut backend = connect_backend(&config)?;
    let report = restore(&mut backend, &source, &RestoreOptions { clear: args.clear })?;

    println!("restore");
    println!("source: {}", normalize_path(&source));
    println!("cleared: {}", report.cleared);
    for table in &report.tables {
        println!("tables.{}: {}", table.table, table.rows);
    }
    print_list("skipped", &report.skipped);
    println!("total_rows: {}", report.total_rows);
    println!("fast_load: {}", report.fast_load);
    println!("refreshed: {}", report.refreshed);
    println!("requests: {}", backend.request_count());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_pull(runtime: &RuntimeOptions, args: PullArgs) -> Result<()> {
    let table = args.table.trim();
    if table.is_empty() {
        bail!("pull requires a non-empty table name");
    }
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut backend = connect_backend(&config)?;
    let out_dir = args.out.unwrap_or_else(|| paths.data_dir.clone());
    let report = pull_table(&mut backend, table, &out_dir)?;

    println!("pull");
    println!("table: {}", report.table);
    println!("rows: {}", report.rows);
    println!("path: {}", normalize_path(&report.path));
    println!("wrote_csv: {}", report.wrote);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn legacy_site(config: &DkpConfig) -> Result<LegacySite> {
    let Some(base_url) = config.legacy_base_url() else {
        bail!("legacy site URL is not set\nSet DKP_LEGACY_URL or [legacy].base_url in config.toml.");
    };
    let Some(guild_id) = config.guild_id() else {
        bail!("guild id is not set\nSet DKP_GUILD_ID or [legacy].guild_id in config.toml.");
    };
    Ok(LegacySite::new(&base_url, guild_id))
}

fn legacy_fetcher(paths: &ResolvedPaths, config: &DkpConfig, site: &LegacySite) -> Result<HttpFetcher> {
    let cookies = load_cookie_file(&config.cookies_file(&paths.project_root))?;
    HttpFetcher::new(FetcherOptions {
        settings: config.http_settings(),
        site_url: Some(site.base_url.clone()),
        cookies,
        login_check: true,
        manifest_path: Some(paths.manifest_path.clone()),
    })
}

fn reference_fetcher(paths: &ResolvedPaths, config: &DkpConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(FetcherOptions {
        settings: config.http_settings(),
        site_url: None,
        cookies: Vec::new(),
        login_check: false,
        manifest_path: Some(paths.manifest_path.clone()),
    })
}

fn connect_backend(config: &DkpConfig) -> Result<RestBackend> {
    let backend_config = BackendConfig::from_config(config)?;
    tracing::info!(
        url = backend_config.url.as_str(),
        key_source = backend_config.key_source,
        "using hosted backend"
    );
    RestBackend::new(backend_config)
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn print_list(label: &str, values: &[String]) {
    if values.is_empty() {
        println!("{label}: <none>");
    } else {
        for value in values {
            println!("{label}: {value}");
        }
    }
}

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
