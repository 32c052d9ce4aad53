use clap::{Parser, Subcommand};
use cohort_core::*;
use std::path::PathBuf;
use std::time::Duration;

/// Exit status after an interrupt, as shells report SIGINT
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "cohort")]
#[command(about = "Synthetic patient cohort generator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $XDG_CONFIG_HOME/cohort/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the engine modules directory
    #[arg(long, global = true)]
    modules_dir: Option<PathBuf>,

    /// Override the record output directory
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Override the state directory (locks, journal, run log)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a cohort for the selected pathologies
    Generate {
        /// Pathology id (repeatable)
        #[arg(short = 'P', long = "pathology", required = true)]
        pathologies: Vec<String>,

        /// Number of patients
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,

        /// Random seed for reproducible cohorts
        #[arg(long)]
        seed: Option<u64>,

        /// Prevalence override as ID=P with P in [0, 1] (repeatable)
        #[arg(long = "prevalence", value_parser = parse_override)]
        prevalence: Vec<(String, f64)>,

        /// Age range as MIN-MAX
        #[arg(long, value_parser = parse_age_range)]
        age: Option<(u32, u32)>,

        /// Only keep patients alive at the end of the simulation
        #[arg(long)]
        only_alive: bool,

        /// Kill the engine after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Keep records left by previous runs
        #[arg(long)]
        keep_output: bool,
    },

    /// Show the gender filter implied by a pathology selection
    Resolve {
        /// Pathology ids
        #[arg(required = true)]
        pathologies: Vec<String>,
    },

    /// List the pathology catalog by category
    List,

    /// Restore modules left calibrated by an interrupted run
    Recover,

    /// Show recent runs from the run log
    History {
        /// Number of runs to show
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    cohort_core::logging::init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = cli.modules_dir {
        config.paths.modules_dir = dir;
    }
    if let Some(dir) = cli.output_dir {
        config.paths.output_dir = dir;
    }
    if let Some(dir) = cli.state_dir {
        config.paths.state_dir = dir;
    }

    match cli.command {
        Commands::Generate {
            pathologies,
            count,
            seed,
            prevalence,
            age,
            only_alive,
            timeout_secs,
            keep_output,
        } => {
            if timeout_secs.is_some() {
                config.engine.timeout_secs = timeout_secs;
            }
            if keep_output {
                config.generation.clear_output = false;
            }

            let mut request = CohortRequest::new(pathologies, count);
            request.seed = seed;
            request.age_range = age;
            request.only_alive = only_alive;
            request.prevalence_overrides = prevalence.into_iter().collect();
            cmd_generate(&config, &request)
        }
        Commands::Resolve { pathologies } => cmd_resolve(&config, &pathologies),
        Commands::List => cmd_list(&config),
        Commands::Recover => cmd_recover(&config),
        Commands::History { limit } => cmd_history(&config, limit),
    }
}

fn load_registry(config: &Config) -> Result<PathologyRegistry> {
    match &config.generation.registry_path {
        Some(path) => PathologyRegistry::load_from(path),
        None => Ok(PathologyRegistry::builtin()),
    }
}

fn calibrator(config: &Config) -> PrevalenceCalibrator {
    PrevalenceCalibrator::new(
        config.modules_dir(),
        &config.paths.state_dir,
        config.calibration.lock_policy,
    )
}

fn cmd_generate(config: &Config, request: &CohortRequest) -> Result<()> {
    let recovered = calibrator(config).recover_orphans()?;
    for module in &recovered {
        println!("Recovered module {} from an interrupted run", module);
    }

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, restoring modules...");
        trigger.cancel();
    }) {
        tracing::warn!("Unable to install Ctrl-C handler: {}", e);
    }

    let orchestrator = GenerationOrchestrator::from_config(config)?
        .with_progress(ProgressHook::new(report_progress));
    let outcome = orchestrator.run(request, &cancel);
    eprintln!();

    match outcome {
        Ok(result) => {
            println!("Run {}", result.run_id);
            println!(
                "Generated {} patient(s) in {}",
                result.patient_count,
                format_elapsed(result.elapsed)
            );
            match result.gender {
                Some(gender) => println!("Gender filter: {}", gender),
                None => println!("Gender filter: none"),
            }
            println!("Output: {}", result.output_location.display());
            Ok(())
        }
        Err(error) => {
            eprintln!("Generation failed at {} stage: {}", error.stage, error.cause);
            for failure in &error.restore_failures {
                eprintln!("  module not restored: {}", failure);
            }
            if !error.restored_cleanly() {
                eprintln!("Run `cohort recover` once the cause is fixed.");
            }
            let code = match error.cause {
                Error::Cancelled => EXIT_INTERRUPTED,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}

fn report_progress(progress: Progress) {
    eprint!("\r  {}/{} patient(s)", progress.current, progress.total);
}

fn cmd_resolve(config: &Config, pathologies: &[String]) -> Result<()> {
    let registry = load_registry(config)?;
    let specs = registry.lookup(pathologies)?;

    match resolve(&specs) {
        ResolvedFilter::Forced(gender) => println!("Gender filter: {}", gender),
        ResolvedFilter::None => println!("Gender filter: none"),
        ResolvedFilter::Conflict(pairs) => {
            eprintln!("Conflicting gender constraints:");
            for (female, male) in pairs {
                eprintln!("  {} (female only) vs {} (male only)", female, male);
            }
            std::process::exit(1);
        }
    }

    for (id, fraction) in advisory_skews(&specs) {
        println!("  {}: {:.0}% female (advisory)", id, fraction * 100.0);
    }
    Ok(())
}

fn cmd_list(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;

    for (category, specs) in registry.by_category() {
        println!("{:?}", category);
        for spec in specs {
            let mut notes = Vec::new();
            match spec.gender_rule {
                GenderRule::Forced(gender) => notes.push(format!("{} only", gender)),
                GenderRule::Weighted(fraction) => {
                    notes.push(format!("{:.0}% female", fraction * 100.0))
                }
                GenderRule::None => {}
            }
            if spec.adjustable {
                notes.push("adjustable".to_string());
            }

            if notes.is_empty() {
                println!("  {:<32} {}", spec.id, spec.display_name);
            } else {
                println!(
                    "  {:<32} {} [{}]",
                    spec.id,
                    spec.display_name,
                    notes.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn cmd_recover(config: &Config) -> Result<()> {
    let recovered = calibrator(config).recover_orphans()?;
    if recovered.is_empty() {
        println!("Nothing to recover");
    } else {
        for module in recovered {
            println!("Restored {}", module);
        }
    }
    Ok(())
}

fn cmd_history(config: &Config, limit: usize) -> Result<()> {
    let runs = read_runs(&config.run_log_path())?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }

    for run in runs.iter().rev().take(limit) {
        let status = match run.status {
            RunStatus::Succeeded => format!("ok, {} patient(s)", run.patient_count.unwrap_or(0)),
            RunStatus::Failed => format!(
                "failed at {}",
                run.stage
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".into())
            ),
        };
        println!(
            "{}  {}  [{}]  {}",
            run.finished_at.format("%Y-%m-%d %H:%M:%S"),
            run.id,
            run.pathology_ids.join(","),
            status
        );
    }
    Ok(())
}

fn parse_override(s: &str) -> std::result::Result<(String, f64), String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=P, got '{}'", s))?;
    let prevalence: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    Ok((id.trim().to_string(), prevalence))
}

fn parse_age_range(s: &str) -> std::result::Result<(u32, u32), String> {
    let (min, max) = s
        .split_once('-')
        .ok_or_else(|| format!("expected MIN-MAX, got '{}'", s))?;
    let min = min.trim().parse().map_err(|_| format!("bad minimum age '{}'", min))?;
    let max = max.trim().parse().map_err(|_| format!("bad maximum age '{}'", max))?;
    Ok((min, max))
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
