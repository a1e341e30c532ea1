//! Playback worker: seek into a finished recording and stream paced JPEG
//! frames to the supervisor until the file runs out or the channel closes.
//!
//! Usage: `playbackworker <input_path> <offset_microseconds> [<playback_rate>]`

use std::env;
use std::process::ExitCode;

use argus_workers::{init, playback};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "Usage: {} <input_path> <offset_microseconds> [<playback_rate>]",
            args[0]
        );
        return ExitCode::from(1);
    }
    let offset_us: i64 = match args[2].parse() {
        Ok(offset) => offset,
        Err(_) => {
            eprintln!("offset '{}' is not a microsecond count", args[2]);
            return ExitCode::from(1);
        }
    };
    let playback_rate: i64 = match args.get(3) {
        Some(rate) => match rate.parse() {
            Ok(rate) if rate >= 1 => rate,
            _ => {
                eprintln!("playback rate '{rate}' must be an integer >= 1");
                return ExitCode::from(1);
            }
        },
        None => 1,
    };

    init();

    match playback::run(&args[1], offset_us, playback_rate) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("playback worker exiting: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
