use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sched_simulator::{Simulation, Workload};

#[derive(Parser)]
#[command(name = "sched-simulator", about = "Replay a scheduling event log and report per-process metrics")]
struct Args {
    /// Event log: one `time event id duration arg` per line
    file: PathBuf,

    /// Print every per-tick scheduling decision before the report
    #[arg(long)]
    trace: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let input = match std::fs::read_to_string(&args.file) {
        Ok(input) => input,
        Err(err) => {
            eprintln!("error: cannot open {}: {err}", args.file.display());
            return ExitCode::FAILURE;
        }
    };

    let workload = match Workload::parse(&input) {
        Ok(workload) => workload,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    println!("Scheduling {}", args.file.display());

    let mut sim = Simulation::new(workload);
    sim.run();

    if args.trace {
        for (tick, slot) in sim.trace().iter().enumerate() {
            match slot {
                Some(pid) => println!("{tick}: scheduling {pid}"),
                None => println!("{tick}: -"),
            }
        }
    }

    print!("{}", sim.stats());
    ExitCode::SUCCESS
}
