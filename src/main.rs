use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use menu_regress::cache::RouteCacheStore;
use menu_regress::capability::{MockBrowser, MockPage, prompts};
use menu_regress::config::{self, Config};
use menu_regress::regression::{ComparisonOutcome, EngineConfig, RegressionEngine, ScreenshotKey};
use menu_regress::runner::{RunOptions, Runner};
use menu_regress::session::{
    FileSnapshotStore, SessionStateMachine, TargetDescriptor, latest_resumable, list_sessions,
};

/// Menu Regress - navigation menu regression testing
#[derive(Parser, Debug)]
#[command(
    name = "menu-regress",
    about = "Navigation menu regression testing with resumable sessions and screenshot diffing",
    after_help = "ENVIRONMENT VARIABLES:\n\
        MENU_REGRESS_THRESHOLD         Mismatch ratio (0-1) under which a capture matches\n\
        MENU_REGRESS_BASELINE_DIR      Baseline screenshot directory\n\
        MENU_REGRESS_DIFF_DIR          Diff image directory\n\
        MENU_REGRESS_SESSION_DIR       Session snapshot directory\n\
        MENU_REGRESS_CACHE_PATH        Route cache file\n\
        MENU_REGRESS_DOMAIN_PATTERNS   Comma-separated owned URL substrings\n\
        RUST_LOG                       Log filter (default: info)"
)]
struct Args {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Baseline screenshot directory
    #[arg(long, global = true, env = "MENU_REGRESS_BASELINE_DIR")]
    baseline_dir: Option<PathBuf>,

    /// Diff image directory
    #[arg(long, global = true, env = "MENU_REGRESS_DIFF_DIR")]
    diff_dir: Option<PathBuf>,

    /// Session snapshot directory
    #[arg(long, global = true, env = "MENU_REGRESS_SESSION_DIR")]
    session_dir: Option<PathBuf>,

    /// Route cache file
    #[arg(long, global = true, env = "MENU_REGRESS_CACHE_PATH")]
    cache_path: Option<PathBuf>,

    /// Mismatch ratio (0-1) under which a capture still matches
    #[arg(long, global = true)]
    threshold: Option<f64>,

    /// Overwrite baselines with new captures
    #[arg(long, global = true)]
    update_baseline: bool,

    /// Fail when a screenshot differs from its baseline
    #[arg(long, global = true)]
    fail_on_diff: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the screenshot key derived from a URL or label
    Key {
        /// Page URL (preferred)
        #[arg(short, long)]
        url: Option<String>,

        /// Fallback text label
        #[arg(short, long, default_value = "")]
        label: String,

        /// Scenario name appended to the key
        #[arg(short, long)]
        scenario: Option<String>,
    },

    /// Compare a PNG against its baseline, saving it if there is none
    Compare {
        /// Captured PNG
        image: PathBuf,

        /// Page URL used to derive the key
        #[arg(short, long)]
        url: Option<String>,

        /// Key or label used when no URL is given
        #[arg(short, long, default_value = "capture")]
        key: String,

        /// Output the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the keys that have a baseline
    Baselines {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored sessions, newest first
    Sessions {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the targets a session would resume with
    Resumable {
        /// Session id (default: newest unfinished session)
        session_id: Option<String>,
    },

    /// Inspect or clear the route cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Delete diff images older than the given age
    CleanDiffs {
        /// Maximum age in hours
        #[arg(long, default_value = "168")]
        max_age_hours: u64,
    },

    /// Run against a scripted in-memory site
    Demo {
        /// Resume the given session instead of starting fresh
        #[arg(long)]
        resume: Option<String>,

        /// Resume the newest unfinished session
        #[arg(long, conflicts_with = "resume")]
        resume_latest: bool,

        /// Skip screenshot comparison
        #[arg(long)]
        no_screenshots: bool,

        /// Output the run result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Print cached routes
    Show {
        /// Application URL the cache was written for
        #[arg(long, default_value = DEMO_URL)]
        app_url: String,
    },
    /// Remove every cached route
    Clear {
        #[arg(long, default_value = DEMO_URL)]
        app_url: String,
    },
}

const DEMO_URL: &str = "https://demo.test/";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.verbose);
    let cfg = effective_config(&args);

    match args.command {
        Some(Commands::Key { url, label, scenario }) => {
            let key = ScreenshotKey::derive(url.as_deref(), &label, scenario.as_deref());
            println!("{}", key);
        }

        Some(Commands::Compare { image, url, key, json }) => {
            let capture = std::fs::read(&image)?;
            let key = match url.as_deref() {
                Some(u) => ScreenshotKey::derive(Some(u), &key, None),
                None => ScreenshotKey::from_label(&key),
            };
            let engine = RegressionEngine::new(EngineConfig::from(&cfg));
            let outcome = engine.compare_or_save_baseline(&key, &capture);

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{}", outcome.summary());
                if let Some(path) = outcome.reference_path() {
                    println!("  File: {}", path.display());
                }
            }

            if let ComparisonOutcome::Error { error, .. } = &outcome {
                return Err(error.clone().into());
            }
            if outcome.fails_target(cfg.screenshot.fail_on_diff) {
                return Err(format!("{} differs from its baseline", key).into());
            }
        }

        Some(Commands::Baselines { json }) => {
            let engine = RegressionEngine::new(EngineConfig::from(&cfg));
            let keys = engine.list_baselines()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&keys)?);
            } else if keys.is_empty() {
                println!("No baselines in {}", cfg.screenshot.baseline_dir.display());
            } else {
                for key in &keys {
                    println!("  {:<32} {}", key, engine.baseline_path(key).display());
                }
            }
        }

        Some(Commands::Sessions { json }) => {
            let sessions = list_sessions(&cfg.storage.session_dir)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No sessions in {}", cfg.storage.session_dir.display());
            } else {
                for s in &sessions {
                    println!(
                        "{}  {:<12} {}/{} done ({} failed, {} skipped)  started {}",
                        s.session_id,
                        s.status.to_string(),
                        s.completed_menus + s.failed_menus + s.skipped_menus,
                        s.total_menus,
                        s.failed_menus,
                        s.skipped_menus,
                        s.start_time.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }

        Some(Commands::Resumable { session_id }) => {
            let store = FileSnapshotStore::new(&cfg.storage.session_dir);
            let id = resolve_session(&store, session_id)?;
            let snapshot = SessionStateMachine::load_for_resume(&store, &id)?;
            let targets = SessionStateMachine::resumable_targets(&snapshot);
            println!("Session {}: {} resumable targets", id, targets.len());
            for t in &targets {
                println!("  {} ({}, attempts: {})", t.id, t.display_text, t.attempts);
            }
        }

        Some(Commands::Cache { action }) => match action {
            CacheCommand::Show { app_url } => {
                let cache = RouteCacheStore::load(&cfg.storage.cache_path, &app_url, cfg.cache_max_age());
                if cache.is_empty() {
                    println!("No cached routes for {}", app_url);
                }
                for (text, entry) in cache.routes() {
                    println!("  {:<24} {} (level {})", text, entry.url, entry.level);
                }
            }
            CacheCommand::Clear { app_url } => {
                let mut cache = RouteCacheStore::new(&cfg.storage.cache_path, &app_url, cfg.cache_max_age());
                cache.clear();
                cache.save()?;
                println!("Cleared route cache: {}", cfg.storage.cache_path.display());
            }
        },

        Some(Commands::CleanDiffs { max_age_hours }) => {
            let engine = RegressionEngine::new(EngineConfig::from(&cfg));
            let removed = engine.clean_old_diffs(Duration::from_secs(max_age_hours * 3600))?;
            println!("Removed {} diff images from {}", removed, cfg.screenshot.diff_dir.display());
        }

        Some(Commands::Demo {
            resume,
            resume_latest,
            no_screenshots,
            json,
        }) => {
            let store = Arc::new(FileSnapshotStore::new(&cfg.storage.session_dir));

            let (targets, resumed_from) = if resume.is_some() || resume_latest {
                let id = resolve_session(store.as_ref(), resume)?;
                let snapshot = SessionStateMachine::load_for_resume(store.as_ref(), &id)?;
                let targets = SessionStateMachine::resumable_targets(&snapshot);
                println!("Resuming {} with {} targets", id, targets.len());
                (targets, Some(id))
            } else {
                (demo_targets(), None)
            };

            let mut cfg = cfg;
            if cfg.boundary.domain_patterns.is_empty() {
                cfg.boundary.domain_patterns = vec!["demo.test".to_string()];
            }

            let options = RunOptions::new(DEMO_URL)
                .screenshots(!no_screenshots)
                .overflow_label("More");
            let cache = RouteCacheStore::load(&cfg.storage.cache_path, DEMO_URL, cfg.cache_max_age());

            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Interrupt received, stopping after the current target...");
                    flag.store(true, Ordering::SeqCst);
                }
            });

            let mut runner = Runner::new(Arc::new(demo_site()), store, &cfg, options)
                .with_cache(cache)
                .with_cancel(cancel);
            if let Some(id) = resumed_from {
                runner = runner.resuming(id);
            }
            let result = runner.run(&targets).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Session {}: {}", result.session_id, result.status);
                for t in &result.targets {
                    let status = if t.skipped {
                        "SKIP"
                    } else if t.success {
                        "PASS"
                    } else {
                        "FAIL"
                    };
                    println!("  [{}] {}", status, t.id);
                    if let Some(err) = &t.error {
                        println!("         {}", err);
                    }
                    if let Some(cmp) = &t.comparison {
                        println!("         {}", cmp.summary());
                    }
                }
                println!("{}", result.summary.message);
            }
        }

        None => {
            println!("Menu Regress - navigation menu regression testing");
            println!();
            println!("Usage: menu-regress <COMMAND>");
            println!();
            println!("Commands:");
            println!("  key          Print the screenshot key for a URL or label");
            println!("  compare      Compare a PNG against its baseline");
            println!("  sessions     List stored sessions");
            println!("  baselines    List the keys that have a baseline");
            println!("  resumable    Show what a session would resume with");
            println!("  cache        Inspect or clear the route cache");
            println!("  clean-diffs  Delete old diff images");
            println!("  demo         Run against a scripted in-memory site");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Environment configuration with command-line flags layered on top
fn effective_config(args: &Args) -> Config {
    let mut cfg = config::get().clone();
    if let Some(dir) = &args.baseline_dir {
        cfg.screenshot.baseline_dir = dir.clone();
    }
    if let Some(dir) = &args.diff_dir {
        cfg.screenshot.diff_dir = dir.clone();
    }
    if let Some(dir) = &args.session_dir {
        cfg.storage.session_dir = dir.clone();
    }
    if let Some(path) = &args.cache_path {
        cfg.storage.cache_path = path.clone();
    }
    if let Some(t) = args.threshold.filter(|t| (0.0..=1.0).contains(t)) {
        cfg.screenshot.threshold = t;
    }
    cfg.screenshot.update_baseline |= args.update_baseline;
    cfg.screenshot.fail_on_diff |= args.fail_on_diff;
    cfg
}

fn resolve_session(
    store: &FileSnapshotStore,
    requested: Option<String>,
) -> Result<String, Box<dyn Error>> {
    match requested {
        Some(id) => Ok(id),
        None => latest_resumable(store)?
            .map(|info| info.session_id)
            .ok_or_else(|| "no unfinished session to resume".into()),
    }
}

fn demo_targets() -> Vec<TargetDescriptor> {
    vec![
        TargetDescriptor::new("reports", "Reports").url("https://demo.test/reports"),
        TargetDescriptor::new("users", "Users"),
        TargetDescriptor::new("settings", "Settings"),
        TargetDescriptor::new("help", "Help"),
        TargetDescriptor::new("audit", "Audit log").level(2),
    ]
}

/// A small site: a shared menu on every page, one page behind an overlay,
/// one link leaving the domain and one entry under an overflow menu.
fn demo_site() -> MockBrowser {
    let pages = [
        ("https://demo.test/", MockPage::new()),
        ("https://demo.test/reports", MockPage::new().color([230, 240, 255, 255])),
        ("https://demo.test/users", MockPage::new().color([235, 255, 235, 255])),
        ("https://demo.test/settings", MockPage::new().overlay()),
        ("https://demo.test/audit", MockPage::new().color([255, 245, 230, 255])),
        ("https://docs.vendor.net/help", MockPage::new().color([250, 250, 250, 255])),
    ];
    let menu = [
        ("Reports", "https://demo.test/reports"),
        ("Users", "https://demo.test/users"),
        ("Settings", "https://demo.test/settings"),
        ("Help", "https://docs.vendor.net/help"),
        ("Audit log", "https://demo.test/audit"),
    ];

    let mut browser = MockBrowser::new().with_viewport(320, 200);
    for (url, page) in pages {
        let page = menu
            .iter()
            .fold(page, |p, (text, target)| p.link(prompts::menu_entry(text), *target));
        browser = browser.page(url, page);
    }
    browser.start_at(DEMO_URL)
}
