//! Add UBI headers to a binary image.
//!
//! The output is a run of PEBs for a single volume, without a volume table. It's written to stdout
//! unless an output file is given, so nothing but the image may ever be printed there; all
//! diagnostics go to stderr.
use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use ubigen::{config, generate};

fn run(opts: &config::RawOptions) -> anyhow::Result<()> {
    let config::Resolved {
        geometry,
        volume,
        input,
        output,
    } = config::resolve(opts)?;

    log::debug!("{geometry:?}");
    log::debug!("{volume:?}");

    generate::generate(geometry, volume, input, output)?;
    Ok(())
}

fn main() -> ExitCode {
    let opts = config::RawOptions::parse();

    let level = match opts.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // Log lines and the progress line would trample each other
    let progress = opts.verbose == 0 && io::stderr().is_terminal();
    if progress {
        howudoin::init(howudoin::consumers::TermLine::default());
    }

    let result = run(&opts);

    if progress {
        howudoin::disable();
        thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("[-] {error:#}");
            ExitCode::FAILURE
        }
    }
}
