//! LessonLab simulator CLI
//!
//! Runs the scripted lesson scenarios, lists the module registry, exports a
//! scenario session, or auto-runs one module on the wall clock.

use clap::Parser;
use lessonlab_env::TokioClock;
use lessonlab_sim::scenarios::ScenarioId;
use lessonlab_sim::scheduler::lock;
use lessonlab_sim::{Engine, EngineConfig, ScenarioResult, ScenarioRunner, Scheduler};
use std::process;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// LessonLab simulation CLI
#[derive(Parser, Debug)]
#[command(name = "lessonlab-sim")]
#[command(about = "Drive LessonLab teaching modules from the command line", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Scenario to run (cpu_program, partition_majority, ..., all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// List modules and scenarios, then exit
    #[arg(short, long)]
    list: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the scenario session to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// Auto-run this module instead of running scenarios
    #[arg(long, value_name = "MODULE")]
    autorun: Option<String>,

    /// Ticks to auto-run
    #[arg(short, long, default_value = "20")]
    ticks: u64,

    /// Milliseconds between auto-run ticks
    #[arg(long, default_value = "500")]
    interval_ms: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn list_registry() {
    let engine = Engine::new(EngineConfig::default());
    for category in engine.registry().categories() {
        println!("{}:", category);
        for module in engine.list_modules(category) {
            println!("  {:<10} {}", module.id, module.title);
        }
    }
    println!();
    println!("scenarios:");
    for scenario in ScenarioId::all() {
        println!("  {:<20} {}", scenario.name(), scenario.description());
    }
}

/// Auto-runs `module` for `ticks` ticks through the scheduler.
fn autorun(module: &str, args: &Args, seed: u64) -> bool {
    let config = EngineConfig::default()
        .with_seed(seed)
        .with_tick_interval(Duration::from_millis(args.interval_ms));

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return false;
        }
    };

    runtime.block_on(async {
        let mut scheduler = Scheduler::new(Engine::new(config), TokioClock::shared());
        if let Err(e) = scheduler.mount(module) {
            error!("{}", e);
            return false;
        }
        info!("Auto-running {} for {} ticks every {}ms", module, args.ticks, args.interval_ms);
        if !scheduler.run_for(args.ticks) {
            return false;
        }
        scheduler.join().await;

        let engine = scheduler.engine();
        let engine = lock(&engine);
        match engine.current_snapshot().map(|s| s.to_json()) {
            Some(Ok(json)) => println!("{:#}", json),
            Some(Err(e)) => error!("{}", e),
            None => error!("no snapshot"),
        }
        for entry in engine.current_log() {
            println!("{}", entry);
        }
        !engine.current_log().iter().any(|e| e.is_violation())
    })
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!("✓ {} (seed={}) PASSED", result.scenario.name(), result.seed);
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if args.list {
        list_registry();
        return;
    }

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    if let Some(module) = &args.autorun {
        if !autorun(module, &args, base_seed) {
            process::exit(1);
        }
        return;
    }

    if !args.json {
        info!("LessonLab simulator v{}", env!("CARGO_PKG_VERSION"));
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                process::exit(1);
            }
        }
    };

    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            process::exit(1);
        }

        let (result, export) = ScenarioRunner::new(base_seed).run_with_export(scenarios[0]);
        report(&result);
        match export.write_to_file(export_path) {
            Ok(()) => info!("Exported {} frames to {}", export.frames.len(), export_path),
            Err(e) => {
                error!("Failed to write export: {}", e);
                process::exit(1);
            }
        }
        if !result.passed {
            process::exit(1);
        }
        return;
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let runner = ScenarioRunner::new(base_seed.wrapping_add(seed_offset as u64));
        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result);
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed: Vec<&ScenarioResult> = all_results.iter().filter(|r| !r.passed).collect();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed.len(),
            "failed": failed.len(),
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to encode summary: {}", e),
        }
    } else if failed.is_empty() {
        info!("All {} scenario runs passed", total);
    } else {
        error!("{}/{} scenario runs failed", failed.len(), total);
        for result in &failed {
            error!(
                "  - {} seed={}: {}",
                result.scenario.name(),
                result.seed,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }

    if !failed.is_empty() {
        process::exit(1);
    }
}
