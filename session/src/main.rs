use clap::Parser;
use log::error;

use secure_session::cli::{CliArgs, CliCommand};
use secure_session::cmd::Command;

pub fn main() {
    let args = CliArgs::parse();

    let mut log_builder = env_logger::Builder::from_default_env();
    if let Some(level) = args.get_log_level() {
        log_builder.filter_level(level);
    }
    log_builder.init();

    let res = match args.command {
        Some(CliCommand::GenConfig(genconfig)) => genconfig.run(),
        Some(CliCommand::Validate(validate)) => validate.run(),
        Some(CliCommand::Demo(demo)) => demo.run(),
        None => Ok(()), // clap prints the help if no command is given
    };

    if let Err(e) = res {
        error!("{e:?}");
        std::process::exit(1);
    }
}
