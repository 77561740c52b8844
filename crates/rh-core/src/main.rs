//! roguehound CLI: daemon control and history queries.
//!
//! The daemon holds the single writer connection; every query subcommand
//! opens its own read-only connection.

use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use rh_common::{Error, Result};
use rh_config::Config;
use rh_core::storage;
use rh_core::storage::events::{
    get_process_event_detail, get_process_events, get_process_snapshots,
};
use rh_core::storage::forensics::get_forensic_captures;

#[derive(Parser)]
#[command(name = "roguehound", about = "Rogue-process hunter for macOS", version)]
struct Cli {
    /// Increase logging verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode: errors only.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sampling daemon in the foreground.
    Daemon,
    /// Report whether the daemon is running.
    Status,
    /// List or inspect rogue process events.
    Events {
        #[command(subcommand)]
        action: Option<EventsAction>,
    },
    /// Event history over a time window.
    History {
        /// Window in hours.
        #[arg(long, default_value = "24")]
        hours: u64,
        #[arg(long, value_enum, default_value = "table")]
        format: HistoryFormat,
    },
    /// Delete closed events older than the retention window.
    Prune {
        /// Override the configured retention in days.
        #[arg(long)]
        events_days: Option<i64>,
        /// Show what would be deleted without deleting.
        #[arg(long)]
        dry_run: bool,
        /// Delete without confirmation.
        #[arg(long)]
        force: bool,
    },
    /// Show, edit, or reset the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum EventsAction {
    /// Show one event in detail.
    Show { id: i64 },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Edit,
    Reset,
}

#[derive(Clone, Copy, ValueEnum)]
enum HistoryFormat {
    Table,
    Json,
    Csv,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("rh_core={level}").parse().expect("directive"))
        .add_directive(format!("roguehound={level}").parse().expect("directive"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Command::Daemon => cmd_daemon(),
        Command::Status => cmd_status(),
        Command::Events { action } => match action {
            Some(EventsAction::Show { id }) => cmd_event_show(id),
            None => cmd_events_list(),
        },
        Command::History { hours, format } => cmd_history(hours, format),
        Command::Prune {
            events_days,
            dry_run,
            force,
        } => cmd_prune(events_days, dry_run, force),
        Command::Config { action } => cmd_config(action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error[{}]: {e}", e.code());
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "macos")]
fn cmd_daemon() -> Result<()> {
    use rh_core::collect::gpu::IoregGpuSource;
    use rh_core::collect::LibprocSource;
    use rh_core::daemon::Daemon;

    let config = Config::load(None)?;
    Daemon::new(config, LibprocSource::new(), IoregGpuSource::new()).run()
}

#[cfg(not(target_os = "macos"))]
fn cmd_daemon() -> Result<()> {
    use rh_core::collect::gpu::MockGpuSource;
    use rh_core::collect::MockSource;
    use rh_core::daemon::Daemon;

    // Development fallback off-macOS: mock adapters, empty process table.
    let config = Config::load(None)?;
    Daemon::new(config, MockSource::new(), MockGpuSource::default()).run()
}

fn cmd_status() -> Result<()> {
    let pid_path = Config::pid_path();
    let running = std::fs::read_to_string(&pid_path)
        .ok()
        .and_then(|text| text.trim().parse::<i32>().ok())
        .filter(|&pid| unsafe { libc::kill(pid, 0) } == 0);

    match running {
        Some(pid) => println!("daemon: running (pid {pid})"),
        None => println!("daemon: stopped"),
    }

    let db_path = Config::db_path();
    if db_path.exists() {
        let size_mb = std::fs::metadata(&db_path)?.len() as f64 / (1024.0 * 1024.0);
        println!("database: {} ({size_mb:.1} MB)", db_path.display());
    } else {
        println!("database: not initialized");
    }
    Ok(())
}

fn fmt_epoch(t: f64) -> String {
    chrono::DateTime::from_timestamp(t as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{t:.0}"))
}

fn cmd_events_list() -> Result<()> {
    let conn = storage::open_read_only(&Config::db_path())?;
    let events = get_process_events(&conn, None, None, 50)?;
    if events.is_empty() {
        println!("no events recorded");
        return Ok(());
    }
    println!(
        "{:>6}  {:>7}  {:<20}  {:>5}  {:<9}  {:<19}  {:<19}",
        "id", "pid", "command", "peak", "band", "entered", "exited"
    );
    for e in events {
        println!(
            "{:>6}  {:>7}  {:<20}  {:>5}  {:<9}  {:<19}  {:<19}",
            e.id,
            e.pid,
            truncate(&e.command, 20),
            e.peak_score,
            e.peak_band.as_str(),
            fmt_epoch(e.entry_time),
            e.exit_time.map(fmt_epoch).unwrap_or_else(|| "open".into()),
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{cut}…")
    }
}

fn cmd_event_show(id: i64) -> Result<()> {
    let conn = storage::open_read_only(&Config::db_path())?;
    let Some(detail) = get_process_event_detail(&conn, id)? else {
        return Err(Error::Config(format!("no event with id {id}")));
    };

    println!("event {}  {} [{}]", detail.id, detail.command, detail.pid);
    println!("  entered:  {} ({})", fmt_epoch(detail.entry_time), detail.entry_band);
    match detail.exit_time {
        Some(t) => println!("  exited:   {}", fmt_epoch(t)),
        None => println!("  exited:   still open"),
    }
    println!("  peak:     {} ({})", detail.peak_score, detail.peak_band);

    if let Some(peak) = &detail.peak_snapshot {
        let s = &peak.score;
        println!(
            "  at peak:  cpu {:.1}%  mem {:.1} MB  disk {:.0} B/s  {} {:.1}x",
            s.cpu,
            s.mem as f64 / (1024.0 * 1024.0),
            s.disk_io_rate,
            s.dominant_resource,
            s.disproportionality,
        );
    }

    let snapshots = get_process_snapshots(&conn, id)?;
    println!("  snapshots: {}", snapshots.len());

    let captures = get_forensic_captures(&conn, id)?;
    for c in captures {
        println!(
            "  capture {}  {}  trace_save={} trace_decode={} logs={}",
            c.id,
            c.trigger,
            c.trace_save_status.as_deref().unwrap_or("-"),
            c.trace_decode_status.as_deref().unwrap_or("-"),
            c.logs_status.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn cmd_history(hours: u64, format: HistoryFormat) -> Result<()> {
    let conn = storage::open_read_only(&Config::db_path())?;
    let cutoff = storage::now_epoch() - (hours as f64) * 3600.0;
    let events = get_process_events(&conn, None, Some(cutoff), 1000)?;

    match format {
        HistoryFormat::Table => {
            println!("{} events in the last {hours}h", events.len());
            for e in &events {
                println!(
                    "  {}  {} [{}]  peak {} ({})",
                    fmt_epoch(e.entry_time),
                    e.command,
                    e.pid,
                    e.peak_score,
                    e.peak_band.as_str(),
                );
            }
        }
        HistoryFormat::Json => {
            let rows: Vec<serde_json::Value> = events
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "id": e.id,
                        "pid": e.pid,
                        "command": e.command,
                        "entry_time": e.entry_time,
                        "exit_time": e.exit_time,
                        "entry_band": e.entry_band.as_str(),
                        "peak_band": e.peak_band.as_str(),
                        "peak_score": e.peak_score,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        HistoryFormat::Csv => {
            println!("id,pid,command,entry_time,exit_time,entry_band,peak_band,peak_score");
            for e in &events {
                println!(
                    "{},{},{},{},{},{},{},{}",
                    e.id,
                    e.pid,
                    e.command.replace(',', "_"),
                    e.entry_time,
                    e.exit_time.map(|t| t.to_string()).unwrap_or_default(),
                    e.entry_band.as_str(),
                    e.peak_band.as_str(),
                    e.peak_score,
                );
            }
        }
    }
    Ok(())
}

fn cmd_prune(events_days: Option<i64>, dry_run: bool, force: bool) -> Result<()> {
    let config = Config::load(None)?;
    let days = events_days.unwrap_or(config.retention.events_days);
    if days < 1 {
        return Err(Error::InvalidRetention { days });
    }

    let db_path = Config::db_path();
    let cutoff = storage::now_epoch() - (days as f64) * 86_400.0;

    if dry_run {
        let conn = storage::open_read_only(&db_path)?;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM process_events WHERE exit_time IS NOT NULL AND exit_time < ?1",
            [cutoff],
            |r| r.get(0),
        )?;
        println!("would delete {count} closed events older than {days} days");
        return Ok(());
    }

    if !force {
        return Err(Error::Config(
            "refusing to prune without --force (use --dry-run to preview)".into(),
        ));
    }

    let conn = storage::open(&db_path)?;
    let deleted = storage::prune_old_events(&conn, days)?;
    println!("deleted {deleted} closed events older than {days} days");
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let path = Config::config_path();
    match action {
        ConfigAction::Show => {
            let config = Config::load(None)?;
            print!(
                "{}",
                toml::to_string_pretty(&config)
                    .map_err(|e| Error::Config(format!("serialize failed: {e}")))?
            );
        }
        ConfigAction::Edit => {
            if !path.exists() {
                Config::default().save(None)?;
            }
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            let status = std::process::Command::new(editor).arg(&path).status()?;
            if !status.success() {
                return Err(Error::Config("editor exited with failure".into()));
            }
            // Validate the result so a broken edit fails here, not at boot.
            Config::load(None)?;
        }
        ConfigAction::Reset => {
            Config::default().save(None)?;
            println!("config reset to defaults at {}", path.display());
        }
    }
    Ok(())
}
