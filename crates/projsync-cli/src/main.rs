mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use progress::CliReporter;
use projsync_core::{AppConfig, BackupRun, Engine, EngineEvent, FileAction, RunStatus};
use tracing::{error, info, warn};

fn main() {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match projsync_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    let command = match args.command {
        Some(command) => command,
        None => {
            let _ = Cli::command().print_long_help();
            return;
        }
    };

    if let Err(err) = run(command, config) {
        error!("Error: {:#}", err);
        process::exit(1);
    }
}

fn run(command: Commands, config: AppConfig) -> Result<()> {
    if let Commands::PrintConfig = command {
        let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
        println!("{}", rendered);
        return Ok(());
    }

    let engine = Engine::open_with_reporter(config, Arc::new(CliReporter::new()))
        .context("opening engine")?;

    match command {
        Commands::Backup => run_backup(&engine),
        Commands::Plan { all } => run_plan(&engine, all),
        Commands::Schedule => run_schedule(&engine),
        Commands::Index { root } => {
            let root = root.unwrap_or_else(|| engine.config().sync.source_root.clone());
            run_index(&engine, &root)
        }
        Commands::Search { query, limit, root } => {
            run_search(&engine, &query, limit, root.as_deref())
        }
        Commands::Duplicates { root } => run_duplicates(&engine, root.as_deref()),
        Commands::Remove { path } => {
            if engine.remove_path(&path)? {
                info!("Removed {} from the index", path.display());
            } else {
                warn!("{} was not indexed", path.display());
            }
            Ok(())
        }
        Commands::History => run_history(&engine),
        Commands::Stats { root } => run_stats(&engine, root.as_deref()),
        Commands::Restore {
            backup_root,
            target_root,
            overwrite,
        } => {
            let run = engine.restore(&backup_root, &target_root, overwrite)?;
            report_run(&run)
        }
        Commands::ClearIndex => {
            if prompt_confirm(
                "Are you SURE you want to remove EVERY index entry?",
                Some(false),
            )? {
                let removed = engine.clear_index()?;
                println!("{} index entries removed", removed);
            }
            Ok(())
        }
        Commands::PrintConfig => Ok(()),
    }
}

fn run_backup(engine: &Engine) -> Result<()> {
    engine.start_manual_backup()?;
    let run = engine
        .wait_for_backup()
        .context("backup worker finished without a result")?;
    report_run(&run)
}

fn report_run(run: &BackupRun) -> Result<()> {
    println!();
    info!(
        "{} copied ({} bytes), {} skipped, {} deleted",
        format!("{}", run.files_copied()).green(),
        format!("{}", run.bytes_copied()).green(),
        format!("{}", run.files_skipped()).cyan(),
        format!("{}", run.files_deleted()).yellow(),
    );
    for failure in run.failures() {
        warn!(
            "  {} {} ({})",
            failure.kind.to_string().red(),
            failure.path,
            failure.message
        );
    }
    match run.status() {
        RunStatus::Failed => anyhow::bail!("{}", run.summary()),
        _ => {
            info!("{}", run.summary());
            Ok(())
        }
    }
}

fn run_plan(engine: &Engine, all: bool) -> Result<()> {
    let plan = engine.plan_backup()?;
    for action in &plan.actions {
        match action {
            FileAction::Copy { relative, size, group, .. } => {
                let store = if group.is_some() { " (store)" } else { "" };
                println!("{} {} {} bytes{}", "copy  ".green(), relative, size, store);
            }
            FileAction::Delete { relative, .. } => {
                println!("{} {}", "delete".red(), relative);
            }
            FileAction::Skip { relative, reason, .. } if all => {
                println!("{} {} ({})", "skip  ".dimmed(), relative, reason);
            }
            FileAction::Skip { .. } => {}
        }
    }
    for rejected in &plan.rejected {
        println!("{} {}", "reject".magenta(), rejected);
    }
    info!(
        "{} to copy ({} bytes), {} to delete, {} unchanged",
        format!("{}", plan.copies().count()).green(),
        format!("{}", plan.copy_bytes()).green(),
        format!("{}", plan.deletes().count()).red(),
        format!("{}", plan.skips().count()).cyan(),
    );
    if plan.is_noop() {
        info!("Destination is up to date");
    }
    Ok(())
}

fn run_schedule(engine: &Engine) -> Result<()> {
    let events = engine.subscribe()?;
    engine.start_scheduler()?;

    thread::spawn(move || {
        for event in events {
            match event {
                EngineEvent::BackupCompleted { run } => info!("{}", run.summary()),
                EngineEvent::BackupSkipped { trigger } => {
                    warn!("{} backup skipped: previous run still active", trigger.as_str())
                }
                EngineEvent::BackupError { message } => error!("Backup failed: {}", message),
                _ => {}
            }
        }
    });

    println!("Scheduler running. Press Enter to stop.");
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    engine.shutdown();
    Ok(())
}

fn run_index(engine: &Engine, root: &Path) -> Result<()> {
    let summary = engine.index_project(root)?;
    info!(
        "{} scanned, {} new, {} updated, {} removed, {} unchanged",
        summary.scanned,
        format!("{}", summary.inserted).green(),
        format!("{}", summary.updated).yellow(),
        format!("{}", summary.removed).red(),
        summary.unchanged,
    );
    for failure in &summary.failures {
        warn!("  {} {} ({})", failure.kind, failure.path, failure.message);
    }
    Ok(())
}

fn run_search(engine: &Engine, query: &str, limit: usize, root: Option<&Path>) -> Result<()> {
    let hits = engine.search_hits(query, limit, root)?;
    if hits.is_empty() {
        info!("No matches for '{}'", query);
        return Ok(());
    }
    for hit in hits {
        println!(
            "{:>4}  {}",
            format!("{}", hit.score).cyan(),
            hit.entry.path.bold()
        );
        let preview: String = hit.entry.preview.lines().take(2).collect::<Vec<_>>().join(" ");
        if !preview.is_empty() {
            println!("      {}", preview.dimmed());
        }
    }
    Ok(())
}

fn run_duplicates(engine: &Engine, root: Option<&Path>) -> Result<()> {
    let groups = match root {
        Some(root) => engine.find_duplicates_in(root)?,
        None => engine.find_duplicates(),
    };
    let mut wasted = 0;
    for group in &groups {
        let size = group
            .paths
            .first()
            .and_then(|path| engine.index_entry(path))
            .map(|entry| entry.size)
            .unwrap_or(0);
        wasted += group.wasted_bytes(size);
        println!("{} ({} bytes each)", group.content_hash.to_string().yellow(), size);
        for path in &group.paths {
            println!("    {}", path);
        }
    }
    info!(
        "{} duplicate groups, {} bytes wasted",
        format!("{}", groups.len()).red(),
        format!("{}", wasted).red(),
    );
    Ok(())
}

fn run_history(engine: &Engine) -> Result<()> {
    for run in engine.run_history()? {
        let status = match run.status() {
            RunStatus::Completed if run.is_clean() => run.status().as_str().green(),
            RunStatus::Completed => run.status().as_str().yellow(),
            _ => run.status().as_str().red(),
        };
        println!(
            "#{:<5} {} {:<9} {:<9} {} copied, {} failures",
            run.id().unwrap_or_default(),
            run.started_at().format("%Y-%m-%d %H:%M:%S"),
            run.trigger().as_str(),
            status,
            run.files_copied(),
            run.failures().len(),
        );
    }
    Ok(())
}

fn run_stats(engine: &Engine, root: Option<&Path>) -> Result<()> {
    let stats = match root {
        Some(root) => engine.index_statistics_in(root)?,
        None => engine.index_statistics(),
    };
    info!(
        "{} files, {} bytes, {} duplicate groups",
        format!("{}", stats.file_count).cyan(),
        format!("{}", stats.total_bytes).cyan(),
        format!("{}", stats.duplicate_groups).red(),
    );
    if let Some(last) = stats.last_indexed {
        info!("Last indexed {}", last.format("%Y-%m-%d %H:%M:%S"));
    }
    for (extension, count) in &stats.by_extension {
        let name = if extension.is_empty() { "(none)" } else { extension };
        println!("  {:<10} {}", name, count);
    }
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
