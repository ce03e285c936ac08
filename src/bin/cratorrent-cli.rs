//! The command-line entry point: `cratorrent-cli <metainfo-path>
//! <destination-directory>`.
//!
//! Translates the two positional arguments into a [`cratorrent::conf::Conf`]
//! and hands off to [`cratorrent::engine::run`], mapping its outcome to the
//! process exit codes documented for this client: 0 on a completed download,
//! 1 on an argument error, 2 on a metainfo or I/O error, 3 on a user
//! interrupt (after the resume file has been flushed).

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use cratorrent::{conf::Conf, engine};

/// A leeching BitTorrent client: downloads the content described by a
/// metainfo file into a destination directory, verifying every piece.
#[derive(Parser, Debug)]
#[command(name = "cratorrent-cli", version, about)]
struct Args {
    /// Path to the `.torrent` metainfo file to download.
    metainfo_path: PathBuf,

    /// Directory the torrent's files (and its resume record) are written
    /// under.
    destination_dir: PathBuf,
}

const EXIT_SUCCESS: u8 = 0;
const EXIT_ARGUMENT_ERROR: u8 = 1;
const EXIT_IO_ERROR: u8 = 2;
const EXIT_INTERRUPTED: u8 = 3;

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap prints its own usage/help text to stdout/stderr; we only
            // need to keep the exit code on the contract this client
            // documents rather than clap's own convention.
            let _ = e.print();
            return ExitCode::from(EXIT_ARGUMENT_ERROR);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start async runtime: {}", e);
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    let conf = Conf::new(args.destination_dir);
    match runtime.block_on(engine::run(args.metainfo_path, conf)) {
        Ok(engine::Outcome::Completed) => ExitCode::from(EXIT_SUCCESS),
        Ok(engine::Outcome::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            eprintln!("cratorrent-cli: {}", e);
            ExitCode::from(EXIT_IO_ERROR)
        }
    }
}
