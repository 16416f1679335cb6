use std::{error::Error, process, sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use procsentry::{
    cli::{Cli, Commands, RunArgs, parse_args, sampling_window},
    constants::EXIT_CODE_NOT_RUN,
    logs::TracingLogger,
    supervisor::{ProcessSupervisor, resolve_launch_paths},
    system_info::{self, HostSummary},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run(run) => {
            let code = run_supervised(&run)?;
            process::exit(code);
        }
        Commands::Info { json } => print_info(json)?,
        Commands::Ps { cmdline, json } => print_processes(cmdline, json)?,
        Commands::Usage { pids, seconds } => {
            let usage = system_info::core_usage_by_process_id(&pids, sampling_window(seconds));
            println!("{usage:.3}");
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Runs the configured program to completion and returns the exit code to report.
fn run_supervised(run: &RunArgs) -> Result<i32, Box<dyn Error>> {
    let config = run.to_config()?;
    resolve_launch_paths(&config)?;

    let mut supervisor = ProcessSupervisor::new(config);
    supervisor.set_logger(Arc::new(TracingLogger));
    let supervisor = Arc::new(supervisor);

    let handle = Arc::clone(&supervisor);
    ctrlc::set_handler(move || {
        warn!("Interrupted; stopping '{}'", handle.name());
        handle.stop(true);
    })?;

    supervisor.start()?;
    info!("Supervising '{}'", supervisor.name());
    while !supervisor.wait_for_idle(Duration::from_secs(60)) {
        debug!(
            "'{}' still active ({} launches)",
            supervisor.name(),
            supervisor.launch_count()
        );
    }

    let cached = supervisor.cached_console_output();
    if !cached.is_empty() {
        debug!("Captured output of '{}':\n{}", supervisor.name(), cached.trim_end());
    }

    Ok(match supervisor.exit_code() {
        EXIT_CODE_NOT_RUN => 1,
        code => code,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_mb(value: Option<u64>) -> String {
    value.map_or_else(|| "unknown".to_string(), |mb| format!("{mb} MB"))
}

fn print_info(json: bool) -> Result<(), Box<dyn Error>> {
    let summary = HostSummary::collect();
    if json {
        return print_json(&summary);
    }

    println!("os:                 {}", summary.os);
    println!("cores:              {}", summary.cores);
    println!("logical cores:      {}", summary.logical_cores);
    println!("processor packages: {}", summary.processor_packages);
    println!("numa nodes:         {}", summary.numa_nodes);
    println!("free memory:        {}", format_mb(summary.free_memory_mb));
    println!("total memory:       {}", format_mb(summary.total_memory_mb));
    Ok(())
}

fn print_processes(cmdline: bool, json: bool) -> Result<(), Box<dyn Error>> {
    let mut processes: Vec<_> = system_info::processes(cmdline).into_values().collect();
    processes.sort_by_key(|sample| sample.pid);
    if json {
        return print_json(&processes);
    }

    println!("{:>8}  {:<24}  COMMAND", "PID", "NAME");
    for sample in processes {
        println!(
            "{:>8}  {:<24}  {}",
            sample.pid,
            sample.name,
            sample.command_line.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
