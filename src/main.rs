//! Simulator entry point — CLI wiring and engine construction.

use std::collections::BTreeMap;
use std::path::Path;
use std::process;

use fleetsim::config::SimOptions;
use fleetsim::io::export::export_csv;
use fleetsim::scenario::Scenario;
use fleetsim::sim::{Engine, SummaryReport};
use fleetsim::strategy;

/// Parsed CLI arguments.
struct CliArgs {
    scenario_path: Option<String>,
    options_path: Option<String>,
    strategy_override: Option<String>,
    output: Option<String>,
}

fn print_help() {
    eprintln!("fleetsim — EV fleet charging simulator");
    eprintln!();
    eprintln!("Usage: fleetsim --scenario <path> [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>   Scenario document (JSON)");
    eprintln!("  --options <path>    Simulation options (TOML)");
    eprintln!("  --strategy <name>   Override the configured strategy");
    eprintln!(
        "                      ({})",
        strategy::STRATEGIES.join(", ")
    );
    eprintln!("  --output <path>     Export the time series to CSV");
    eprintln!("  --help              Show this help message");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        scenario_path: None,
        options_path: None,
        strategy_override: None,
        output: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--scenario" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --scenario requires a path argument");
                    process::exit(1);
                }
                cli.scenario_path = Some(args[i].clone());
            }
            "--options" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --options requires a path argument");
                    process::exit(1);
                }
                cli.options_path = Some(args[i].clone());
            }
            "--strategy" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --strategy requires a name argument");
                    process::exit(1);
                }
                cli.strategy_override = Some(args[i].clone());
            }
            "--output" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --output requires a path argument");
                    process::exit(1);
                }
                cli.output = Some(args[i].clone());
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn main() {
    env_logger::init();
    let cli = parse_args();

    let Some(scenario_path) = cli.scenario_path else {
        eprintln!("error: --scenario is required");
        print_help();
        process::exit(1);
    };

    // options: file, then CLI override
    let mut options = match cli.options_path {
        Some(ref path) => match SimOptions::from_toml_file(Path::new(path)) {
            Ok(options) => options,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        },
        None => SimOptions::default(),
    };
    if let Some(name) = cli.strategy_override {
        options.strategy.name = name;
    }
    let errors = options.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    // load scenario, build strategy and engine
    let scenario = match Scenario::from_file(Path::new(&scenario_path)) {
        Ok(scenario) => scenario,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };
    let Scenario {
        config,
        world,
        events: mut queue,
    } = scenario;
    let strat = match strategy::build(&world, &mut queue, &options, &config) {
        Ok(strat) => strat,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };
    eprintln!(
        "Simulating {} intervals of {} min with strategy \"{}\"",
        config.n_intervals,
        config.interval_min,
        strat.name()
    );

    // nominal PV power per connector, for the feed-in remuneration
    let mut pv_nominal: BTreeMap<String, f64> = BTreeMap::new();
    for pv in world.photovoltaics.values() {
        *pv_nominal.entry(pv.parent.clone()).or_insert(0.0) += pv.nominal_power;
    }

    let dt_hours = config.dt_hours();
    let engine = Engine::new(config, world, queue, strat, &options);
    let result = engine.run();

    // summary
    let report = SummaryReport::from_result(&result, dt_hours, &pv_nominal);
    println!("{report}");

    // export CSV if requested
    if let Some(ref path) = cli.output {
        if let Err(e) = export_csv(&result.records, Path::new(path)) {
            eprintln!("error: failed to write CSV: {e}");
            process::exit(1);
        }
        eprintln!("Time series written to {path}");
    }

    if result.error.is_some() {
        process::exit(2);
    }
}
