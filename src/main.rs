// lisa-launch - distributed fine-tuning launcher for LISA
// Main entry point
//
// The same binary runs in two roles. Invoked by a user it is the launcher;
// re-executed with LISA_LAUNCH_WORKER=1 it is one training worker.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, Instrument};

use lisa_launch::cli::Args;
use lisa_launch::config::load_settings;
use lisa_launch::errors::{self, EXIT_CONFIG};
use lisa_launch::launcher::Launcher;
use lisa_launch::telemetry::init_tracing;
use lisa_launch::worker::{self, is_worker_process, CommandEngine, WorkerEnv};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    if is_worker_process() {
        run_worker(args).await
    } else {
        run_launcher(args).await
    }
}

async fn run_launcher(args: Args) -> ExitCode {
    let config = match args.launch_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\x1b[1;31mError:\x1b[0m {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let mut settings = match load_settings(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("\x1b[1;31mError:\x1b[0m {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    args.apply_overrides(&mut settings);

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("\x1b[1;31mError:\x1b[0m cannot locate the launcher binary: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let launcher = match Launcher::new(config, settings, exe) {
        Ok(launcher) => launcher,
        Err(e) => {
            eprintln!("\x1b[1;31mError:\x1b[0m {}", errors::describe_launch_error(&e));
            return ExitCode::from(e.exit_code());
        }
    };

    if args.dry_run {
        return match launcher.plan().await {
            Ok(plan) => {
                print!(
                    "{}",
                    plan.render(launcher.worker_exe(), launcher.config(), launcher.settings())
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("\x1b[1;31mError:\x1b[0m {}", errors::describe_launch_error(&e));
                ExitCode::from(e.exit_code())
            }
        };
    }

    match launcher.run().await {
        Ok(report) => {
            info!(
                run_id = %report.run_id,
                world_size = report.world_size,
                run_dir = %report.run_dir.display(),
                "Training job completed"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Training job failed");
            eprintln!("\x1b[1;31mError:\x1b[0m {}", errors::describe_launch_error(&e));
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run_worker(args: Args) -> ExitCode {
    let env = match WorkerEnv::from_env() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("\x1b[1;31mError:\x1b[0m {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    // The launcher validated these flags already; a failure here means the
    // worker was started by hand with a broken command line
    let config = match args.launch_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\x1b[1;31mError:\x1b[0m {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let span = tracing::info_span!("worker", rank = env.rank);
    let mut engine = CommandEngine::new(&env, &config);

    match worker::run(&env, &config, &mut engine).instrument(span).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(rank = env.rank, error = %e, "Worker failed");
            eprintln!("{}", errors::describe_worker_error(&e));
            ExitCode::from(e.exit_code())
        }
    }
}
