use clap::{App, Arg, ArgMatches};
use colored::*;
use forgebus::config::{HarnessConfig, RunMode};
use forgebus::coupling::{RecordingBackend, WakeChamber};
use forgebus::exchange::{scalar_link, LinkEnd};
use forgebus::harness::{Harness, HarnessError, RunSummary};
use forgebus::jobs::{load_jobs_from_path, load_or_empty, Job};
use forgebus::telemetry::CsvSink;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_JOBS_FILE: &str = "jobs.csv";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let matches = App::new("forgebus-sim")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Power/thermal co-simulation harness for orbital beam-growth jobs")
        .arg(
            Arg::with_name("mode")
                .long("mode")
                .value_name("MODE")
                .help("Run mode: power, wake, dual or legacy")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file; flags override its values")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("jobs")
                .long("jobs")
                .value_name("FILE")
                .help("Job table CSV (default: <input>/jobs.csv)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("nticks")
                .short("n")
                .long("nticks")
                .value_name("N")
                .help("Number of engine ticks")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dt")
                .long("dt")
                .value_name("SECONDS")
                .help("Tick duration in seconds")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("couple-every")
                .long("couple-every")
                .value_name("TICKS")
                .help("Solver coupling cadence in engine ticks")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("sparta-block")
                .long("sparta-block")
                .value_name("STEPS")
                .help("Solver steps per coupling point")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("wake-deck")
                .long("wake-deck")
                .value_name("DECK")
                .help("Solver input deck name")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("input-subdir")
                .long("input-subdir")
                .value_name("DIR")
                .help("Solver input directory")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Telemetry output directory (default: $SF_LOG_DIR or data/raw)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("run-id")
                .long("run-id")
                .value_name("ID")
                .help("Run identifier appended to the log directory (default: $RUN_ID)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("groups")
                .long("groups")
                .value_name("N")
                .help("Process groups (1 or 2); group 0 publishes the cell temperature to group 1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print the run summary as JSON"),
        )
        .get_matches();

    let json = matches.is_present("json");
    match run(&matches).await {
        Ok(summaries) => print_summaries(&summaries, json),
        Err(e) => {
            eprintln!("{} {}", "Run failed:".bright_red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Parses a flag value, keeping `current` when it is absent or unparseable.
fn flag_or<T>(matches: &ArgMatches, name: &str, current: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match matches.value_of(name) {
        None => current,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("--{} '{}' is not a valid number, using {}", name, raw, current);
            current
        }),
    }
}

fn build_config(matches: &ArgMatches) -> Result<HarnessConfig, HarnessError> {
    let mut config = match matches.value_of("config") {
        Some(path) => HarnessConfig::from_json_file(Path::new(path))?,
        None => HarnessConfig::default(),
    };

    if let Some(raw) = matches.value_of("mode") {
        config.mode = RunMode::from_str(raw).unwrap_or_else(|e| {
            warn!("{}, using {:?}", e, RunMode::default());
            RunMode::default()
        });
    }
    config.nticks = flag_or(matches, "nticks", config.nticks);
    config.dt_s = flag_or(matches, "dt", config.dt_s);
    config.couple_every = flag_or(matches, "couple-every", config.couple_every);
    config.solver_block = flag_or(matches, "sparta-block", config.solver_block);
    config.groups = flag_or(matches, "groups", config.groups);
    if let Some(deck) = matches.value_of("wake-deck") {
        config.wake_deck = deck.to_string();
    }
    if let Some(dir) = matches.value_of("input-subdir") {
        config.input_dir = PathBuf::from(dir);
    }
    if let Some(dir) = matches.value_of("log-dir") {
        config.log_dir = Some(PathBuf::from(dir));
    }
    if let Some(id) = matches.value_of("run-id") {
        config.run_id = Some(id.to_string());
    }
    if let Some(path) = matches.value_of("jobs") {
        config.jobs_file = Some(PathBuf::from(path));
    }

    Ok(config.sanitized())
}

fn load_jobs(config: &HarnessConfig) -> Result<Vec<Job>, HarnessError> {
    match &config.jobs_file {
        Some(path) => Ok(load_jobs_from_path(path)?),
        None => Ok(load_or_empty(&config.input_dir.join(DEFAULT_JOBS_FILE))),
    }
}

async fn run(matches: &ArgMatches<'_>) -> Result<Vec<RunSummary>, HarnessError> {
    let config = Arc::new(build_config(matches)?);
    let jobs = load_jobs(&config)?;
    let log_dir = config.resolve_log_dir();
    info!(
        "Run {} in {:?} mode: {} ticks of {} s, {} jobs, {} group(s), logs in {}",
        config.run_id(),
        config.mode,
        config.nticks,
        config.dt_s,
        jobs.len(),
        config.groups,
        log_dir.display()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let ctrl_c_stop = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, stopping after the current tick");
            ctrl_c_stop.store(true, Ordering::Relaxed);
        }
    });

    let links: Vec<Option<LinkEnd>> = if config.groups == 2 {
        let (publisher, subscriber) = scalar_link();
        vec![Some(LinkEnd::Publisher(publisher)), Some(LinkEnd::Subscriber(subscriber))]
    } else {
        vec![None]
    };

    let mut tasks = Vec::with_capacity(config.groups);
    for (group, link) in links.into_iter().enumerate() {
        let config = Arc::clone(&config);
        let jobs = jobs.clone();
        let stop = Arc::clone(&stop);
        let dir = match group {
            0 => log_dir.clone(),
            g => log_dir.join(format!("group{}", g)),
        };
        tasks.push(tokio::task::spawn_blocking(move || run_group(&config, jobs, &dir, group, link, &stop)));
    }

    let mut summaries = Vec::with_capacity(tasks.len());
    let mut first_error = None;
    for task in tasks {
        match task.await {
            Ok(Ok(summary)) => summaries.push(summary),
            Ok(Err(e)) => {
                // The failed group already raised the shared stop flag.
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!("Group task panicked: {}", e);
                stop.store(true, Ordering::Relaxed);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}

fn run_group(
    config: &HarnessConfig,
    jobs: Vec<Job>,
    log_dir: &Path,
    group: usize,
    link: Option<LinkEnd>,
    stop: &AtomicBool,
) -> Result<RunSummary, HarnessError> {
    // The link is still held here, so peers see the stop flag before the hangup.
    let mut harness = match build_group(config, jobs, log_dir, group) {
        Ok(harness) => harness,
        Err(e) => {
            error!("Group {} failed to start: {}", group, e);
            stop.store(true, Ordering::Relaxed);
            return Err(e);
        }
    };
    if let Some(link) = link {
        harness = harness.with_link(link);
    }
    harness.run(config.nticks, stop)
}

fn build_group(
    config: &HarnessConfig,
    jobs: Vec<Job>,
    log_dir: &Path,
    group: usize,
) -> Result<Harness<CsvSink>, HarnessError> {
    let mut sink = CsvSink::new(log_dir)?;

    let coupling = if config.mode.uses_solver() {
        let label = match group {
            0 => "WakeChamber".to_string(),
            g => format!("WakeChamber{}", g),
        };
        let mut chamber = WakeChamber::new(RecordingBackend::new(), &label);
        chamber.init(&config.wake_deck, &config.input_dir, &mut sink)?;
        Some(chamber)
    } else {
        None
    };

    let mut harness = Harness::from_config(config, jobs, log_dir, group, sink)?;
    if let Some(chamber) = coupling {
        harness = harness.with_coupling(Box::new(chamber));
    }
    Ok(harness)
}

fn print_summaries(summaries: &[RunSummary], json: bool) {
    if json {
        match serde_json::to_string_pretty(summaries) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Cannot serialize run summary: {}", e),
        }
        return;
    }

    for s in summaries {
        println!("{} {}", "Group".bright_blue().bold(), s.group.to_string().bright_blue().bold());
        println!("  {} {}", "Ticks run:".bright_white(), s.ticks_run);
        println!("  {} {} of {}", "Activations:".bright_white(), s.activations, s.jobs_total);
        if s.aborted_jobs.is_empty() {
            println!("  {} {}", "Aborted jobs:".bright_white(), "none".bright_green());
        } else {
            let list = s.aborted_jobs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
            println!("  {} {}", "Aborted jobs:".bright_white(), list.bright_red());
        }
        println!(
            "  {} {} advances, {} reloads",
            "Coupling:".bright_white(),
            s.coupling_advances,
            s.coupling_reloads
        );
        println!("  {} {:.1} Wh", "Final charge:".bright_white(), s.final_charge_wh);
        println!("  {} {:.1} K", "Cell temperature:".bright_white(), s.final_temperature_k);
        if s.stopped_early {
            println!("  {}", "Stopped early".yellow());
        }
    }
}
