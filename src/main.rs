use std::process::ExitCode;

use camvision_lib::config::Cli;
use camvision_lib::logging;
use clap::Parser;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    camvision_lib::run(&cli)
}
