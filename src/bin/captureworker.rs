//! Capture worker: attach to one live camera, remux it into rolling
//! recording files and stream JPEG snapshots to the supervisor.
//!
//! Usage: `captureworker <url> <output_directory> <hwaccel_name>`

use std::env;
use std::path::Path;
use std::process::ExitCode;

use argus_workers::input::Backend;
use argus_workers::{capture, init};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        eprintln!("Usage: {} <url> <output_directory> <hwaccel_name>", args[0]);
        return ExitCode::from(1);
    }
    let backend = match Backend::parse(&args[3]) {
        Some(backend) => backend,
        None => {
            eprintln!("unknown hwaccel '{}', expected none|cuda|vaapi|qsv", args[3]);
            return ExitCode::from(1);
        }
    };

    init();

    match capture::run(&args[1], Path::new(&args[2]), backend) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("capture worker exiting: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
