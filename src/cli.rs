use crate::{
    branch::Branch,
    catalog::{self, TARGET_APP},
    clock::{CancelToken, SystemClock},
    config::{self, BranchRegistry, Config},
    launch,
    manifest::{LiveManifest, RemoteBranch},
    observer::{Event, LogFileObserver, LogLevel, Observer},
    orchestrator::{SwitchOrchestrator, SyncOptions, SyncOutcome, TreeCopier},
    status::{BranchRecord, BranchStatusEvaluator},
    steam::LibraryLocator,
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::Mutex,
    thread,
    time::Duration,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct GlobalOptions {
    format: OutputFormat,
    config_path: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Locate,
    Status,
    Select(Vec<Branch>),
    Sync(SyncArgs),
    Launch {
        branch: Branch,
        launcher: Option<PathBuf>,
    },
    Config,
    Help,
    Version,
}

#[derive(Debug, PartialEq, Eq, Default)]
struct SyncArgs {
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, tokens) = parse_global_options(&args)?;
    let command = parse_command(&tokens)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("branchsmith v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let config_path = match &global.config_path {
                Some(path) => path.clone(),
                None => config::default_config_path()?,
            };
            let log_path = config_path.with_file_name("branchsmith.log");
            let observer = ConsoleObserver::new(LogFileObserver::new(log_path));
            let registry = BranchRegistry::new(config_path);
            run_command(command, global.format, &registry, &observer)
        }
    }
}

fn run_command(
    command: CliCommand,
    format: OutputFormat,
    registry: &BranchRegistry,
    observer: &ConsoleObserver,
) -> Result<()> {
    let mut config = load_config(registry, observer)?;
    match command {
        CliCommand::Locate => {
            locate(&mut config, observer)?;
            registry.save(&mut config)?;
            print_config(&config, format)
        }
        CliCommand::Status => {
            let records = evaluate(&config, observer);
            print_status(&records, format)
        }
        CliCommand::Select(branches) => {
            config.select_branches(branches);
            registry.save(&mut config)?;
            print_config(&config, format)
        }
        CliCommand::Sync(args) => {
            ensure_located(&mut config, observer)?;
            let result = sync(&mut config, args, observer);
            registry.save(&mut config)?;
            let outcome = result?;
            print_outcome(&outcome, format)
        }
        CliCommand::Launch { branch, launcher } => {
            let clock = SystemClock;
            let evaluator = BranchStatusEvaluator::new(TARGET_APP, &clock);
            let record =
                evaluator.evaluate(branch, &config, &config.source_install_path, observer);
            let pid = launch::launch_branch(&record, launcher.as_deref(), observer)?;
            println!("{pid}");
            Ok(())
        }
        CliCommand::Config => {
            println!("{}", registry.path().display());
            print_config(&config, format)
        }
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

fn load_config(registry: &BranchRegistry, observer: &dyn Observer) -> Result<Config> {
    let mut config = registry.load(observer);
    config.resolve_snapshot_root()?;
    Ok(config)
}

fn locate(config: &mut Config, observer: &dyn Observer) -> Result<()> {
    let roots = LibraryLocator::with_default_roots().discover(observer);
    let Some(app) = catalog::find_target_across_roots(&TARGET_APP, &roots, observer) else {
        bail!("{} is not installed in any Steam library", TARGET_APP.names[0]);
    };
    config.source_library_path = app.library_root;
    config.source_install_path = app.install_path;
    config.resolve_snapshot_root()?;
    config.touch();
    Ok(())
}

fn ensure_located(config: &mut Config, observer: &dyn Observer) -> Result<()> {
    if config.source_install_path.is_dir() {
        return Ok(());
    }
    locate(config, observer)
}

fn live_manifest(config: &Config) -> Result<LiveManifest> {
    LiveManifest::for_install(&config.source_install_path, TARGET_APP.app_id)
        .context("source install path has no library root")
}

fn evaluate(config: &Config, observer: &dyn Observer) -> Vec<BranchRecord> {
    let clock = SystemClock;
    let evaluator = BranchStatusEvaluator::new(TARGET_APP, &clock);
    match live_manifest(config) {
        Ok(live) => {
            live.warn_if_missing(observer);
            evaluator.evaluate_all(config, &live, observer)
        }
        Err(_) => config
            .selected_branches
            .iter()
            .map(|branch| {
                evaluator.evaluate(*branch, config, &config.source_install_path, observer)
            })
            .collect(),
    }
}

fn sync(config: &mut Config, args: SyncArgs, observer: &dyn Observer) -> Result<SyncOutcome> {
    let live = live_manifest(config)?;
    live.warn_if_missing(observer);
    let defaults = SyncOptions::default();
    let options = SyncOptions {
        poll_interval: args
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval),
        switch_timeout: args
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.switch_timeout),
    };

    let cancel = CancelToken::new();
    spawn_cancel_listener(cancel.clone());
    let clock = SystemClock;
    let mut orchestrator = SwitchOrchestrator::new(&live, &TreeCopier, &clock, observer)
        .with_options(options)
        .with_cancel(cancel);
    let current = live.current_branch();
    observer.info(format!(
        "Live branch: {}",
        current.map(|branch| branch.as_str()).unwrap_or("unknown")
    ));
    Ok(orchestrator.run(config)?)
}

/// Typing `q` on stdin cancels a running sync.
fn spawn_cancel_listener(cancel: CancelToken) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                return;
            };
            if matches!(line.trim(), "q" | "quit" | "cancel") {
                cancel.cancel();
                return;
            }
        }
    });
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut format = OutputFormat::Text;
    let mut config_path = None;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            format = OutputFormat::parse(value).context("--format expects json or text")?;
            continue;
        }
        if arg == "--format" {
            let value = iter.next().context("--format requires a value")?;
            format = OutputFormat::parse(value).context("--format expects json or text")?;
            continue;
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            config_path = Some(PathBuf::from(value));
            continue;
        }
        if arg == "--config" {
            let value = iter.next().context("--config requires a path")?;
            config_path = Some(PathBuf::from(value));
            continue;
        }
        tokens.push(arg.to_string());
    }

    Ok((
        GlobalOptions {
            format,
            config_path,
        },
        tokens,
    ))
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Status);
    };
    let rest = &tokens[1..];
    match head.as_str() {
        "locate" => Ok(CliCommand::Locate),
        "status" => Ok(CliCommand::Status),
        "config" => Ok(CliCommand::Config),
        "select" => {
            if rest.is_empty() {
                bail!("select needs at least one branch");
            }
            let branches = rest
                .iter()
                .map(|value| parse_branch(value))
                .collect::<Result<Vec<_>>>()?;
            Ok(CliCommand::Select(branches))
        }
        "sync" => parse_sync(rest).map(CliCommand::Sync),
        "launch" => {
            let branch = parse_branch(rest.first().context("launch needs a branch")?)?;
            let mut launcher = None;
            let mut iter = rest[1..].iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--with" => {
                        launcher = Some(PathBuf::from(
                            iter.next().context("--with requires a program")?,
                        ))
                    }
                    other => bail!("unknown launch option {other}"),
                }
            }
            Ok(CliCommand::Launch { branch, launcher })
        }
        "help" | "--help" | "-h" => Ok(CliCommand::Help),
        "version" | "--version" | "-V" => Ok(CliCommand::Version),
        other => bail!("unknown command {other}; see --help"),
    }
}

fn parse_sync(args: &[String]) -> Result<SyncArgs> {
    let mut parsed = SyncArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let slot = match arg.as_str() {
            "--interval" => &mut parsed.interval_secs,
            "--timeout" => &mut parsed.timeout_secs,
            other => bail!("unknown sync option {other}"),
        };
        let value = iter.next().with_context(|| format!("{arg} requires seconds"))?;
        *slot = Some(
            value
                .parse()
                .with_context(|| format!("{arg} expects whole seconds, got {value}"))?,
        );
    }
    if parsed.interval_secs == Some(0) {
        bail!("--interval must be at least one second");
    }
    Ok(parsed)
}

fn parse_branch(value: &str) -> Result<Branch> {
    Branch::parse(value).with_context(|| {
        let known: Vec<&str> = Branch::ALL.iter().map(|branch| branch.as_str()).collect();
        format!("unknown branch {value}; expected one of {}", known.join(", "))
    })
}

fn print_config(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => {
            println!("Library:   {}", config.source_library_path.display());
            println!("Install:   {}", config.source_install_path.display());
            println!("Snapshots: {}", config.snapshot_root_path.display());
            let selected: Vec<&str> = config
                .selected_branches
                .iter()
                .map(|branch| branch.as_str())
                .collect();
            println!("Branches:  {}", selected.join(", "));
            if let Some(branch) = config.installed_branch {
                println!("Live:      {branch}");
            }
        }
    }
    Ok(())
}

fn print_status(records: &[BranchRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(records)?),
        OutputFormat::Text => {
            for record in records {
                let live = if record.is_current_remote_branch { "*" } else { " " };
                println!(
                    "{live} {name:<22} {status:<17} {files:>7} files {size:>10} {build}",
                    name = record.name.as_str(),
                    status = record.status.label(),
                    files = record.file_count,
                    size = format_size(record.directory_size),
                    build = record.local_build_id.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct OutcomeItem {
    outcome: &'static str,
    copied: Vec<Branch>,
    skipped: Vec<Branch>,
    failed_files: usize,
    waiting_for: Option<Branch>,
}

fn print_outcome(outcome: &SyncOutcome, format: OutputFormat) -> Result<()> {
    let report = outcome.report();
    let (label, waiting_for) = match outcome {
        SyncOutcome::Completed(_) => ("completed", None),
        SyncOutcome::Cancelled(_) => ("cancelled", None),
        SyncOutcome::TimedOut { branch, .. } => ("timed_out", Some(*branch)),
    };
    let item = OutcomeItem {
        outcome: label,
        copied: report.copied_branches(),
        skipped: report.skipped.clone(),
        failed_files: report.copied.iter().map(|(_, result)| result.failed_count).sum(),
        waiting_for,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&item)?),
        OutputFormat::Text => {
            println!("Sync {}", item.outcome.replace('_', " "));
            for branch in &item.copied {
                println!("  copied  {branch}");
            }
            for branch in &item.skipped {
                println!("  skipped {branch} (live)");
            }
            if item.failed_files > 0 {
                println!("  {} file(s) could not be copied; see log", item.failed_files);
            }
            if let SyncOutcome::TimedOut {
                branch,
                elapsed,
                budget,
                ..
            } = outcome
            {
                println!(
                    "  Steam never switched to {branch} ({}s of {}s)",
                    elapsed.as_secs(),
                    budget.as_secs()
                );
            }
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Terminal front-end: logs through `log`, draws progress on stderr and
/// mirrors everything into the log file.
struct ConsoleObserver {
    file: LogFileObserver,
    last_percent: Mutex<Option<(Branch, u8)>>,
}

impl ConsoleObserver {
    fn new(file: LogFileObserver) -> Self {
        Self {
            file,
            last_percent: Mutex::new(None),
        }
    }
}

impl Observer for ConsoleObserver {
    fn notify(&self, event: Event) {
        match &event {
            Event::Log { level, message } => match level {
                LogLevel::Info => log::info!("{message}"),
                LogLevel::Warn => log::warn!("{message}"),
                LogLevel::Error => log::error!("{message}"),
            },
            Event::CopyProgress { branch, progress } => {
                let percent = progress.percent();
                let mut last = self
                    .last_percent
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if *last != Some((*branch, percent)) {
                    *last = Some((*branch, percent));
                    let mut err = io::stderr();
                    let _ = write!(
                        err,
                        "\r{branch}: {percent:>3}% ({}/{})",
                        progress.current, progress.total
                    );
                    if progress.current >= progress.total {
                        let _ = writeln!(err);
                    }
                }
            }
            Event::SwitchRequested { to, .. } => {
                println!(
                    "Switch {} to the \"{}\" branch in Steam (Properties > Betas) and let it update.",
                    TARGET_APP.names[0],
                    if to.beta_key().is_empty() {
                        "None"
                    } else {
                        to.beta_key()
                    }
                );
                println!("Waiting for the switch... type q and Enter to cancel.");
            }
            Event::StateChanged(state) => log::debug!("state: {state}"),
        }
        self.file.notify(event);
    }
}

fn print_help() {
    println!("branchsmith v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  branchsmith [status]                 Show the state of every selected branch");
    println!("  branchsmith locate                   Find the game in your Steam libraries");
    println!("  branchsmith select <branch...>       Choose which branches to keep");
    println!("  branchsmith sync                     Snapshot every selected branch");
    println!("  branchsmith launch <branch>          Start a branch snapshot");
    println!("  branchsmith config                   Show the saved configuration");
    println!();
    println!("Branches: main, beta, alternate, alternate-beta");
    println!();
    println!("Global options:");
    println!("  --format <json|text>                 Output format");
    println!("  --config <path>                      Use another config file");
    println!("  -h, --help                           Show help");
    println!("  -V, --version                        Show version");
    println!();
    println!("Sync options:");
    println!("  --interval <secs>                    Seconds between Steam checks (default 5)");
    println!("  --timeout <secs>                     Seconds to wait for each switch (default 300)");
    println!();
    println!("Launch options:");
    println!("  --with <program>                     Run the executable through a launcher");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;
    use tempfile::TempDir;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn global_options_are_stripped() {
        let (global, tokens) =
            parse_global_options(&args(&["--format", "json", "status", "--config=/tmp/c.json"]))
                .unwrap();
        assert_eq!(global.format, OutputFormat::Json);
        assert_eq!(global.config_path, Some(PathBuf::from("/tmp/c.json")));
        assert_eq!(tokens, args(&["status"]));
        assert!(parse_global_options(&args(&["--format", "xml"])).is_err());
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command(&[]).unwrap(), CliCommand::Status);
        assert_eq!(
            parse_command(&args(&["select", "main", "beta-branch"])).unwrap(),
            CliCommand::Select(vec![Branch::MainBranch, Branch::BetaBranch])
        );
        assert_eq!(
            parse_command(&args(&["sync", "--interval", "2", "--timeout", "60"])).unwrap(),
            CliCommand::Sync(SyncArgs {
                interval_secs: Some(2),
                timeout_secs: Some(60),
            })
        );
        assert_eq!(
            parse_command(&args(&["launch", "alternate", "--with", "wine"])).unwrap(),
            CliCommand::Launch {
                branch: Branch::AlternateBranch,
                launcher: Some(PathBuf::from("wine")),
            }
        );
        assert!(parse_command(&args(&["select", "nightly"])).is_err());
        assert!(parse_command(&args(&["sync", "--interval", "0"])).is_err());
        assert!(parse_command(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn fresh_config_points_branches_at_the_default_root() {
        let dir = TempDir::new().unwrap();
        let registry = BranchRegistry::new(dir.path().join("config.json"));
        let config = load_config(&registry, &NullObserver).unwrap();

        let records = evaluate(&config, &NullObserver);
        assert_eq!(records.len(), 1);
        assert!(records[0].folder_path.is_absolute());
        assert!(records[0].executable_path.is_absolute());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }
}
