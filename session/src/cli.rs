//! Command line parameters of the secure-session binary.
//!
//! The binary is a companion tool to the library: it writes and checks
//! configuration files and runs an in-process demo of a client and a server
//! session talking over a loopback transport.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about, arg_required_else_help = true)]
pub struct CliArgs {
    /// Lowest log level to show
    #[arg(long = "log-level", value_name = "LOG_LEVEL", group = "log-level")]
    log_level: Option<log::LevelFilter>,

    /// Show verbose log output – sets log level to "info"
    #[arg(short, long, group = "log-level")]
    verbose: bool,

    /// Show less log output – sets log level to "warn"
    #[arg(short, long, group = "log-level")]
    quiet: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

impl CliArgs {
    /// The log level filter requested on the command line, if any.
    ///
    /// The "log-level" argument group keeps the three options mutually
    /// exclusive.
    pub fn get_log_level(&self) -> Option<log::LevelFilter> {
        if self.verbose {
            return Some(log::LevelFilter::Info);
        }
        if self.quiet {
            return Some(log::LevelFilter::Warn);
        }
        self.log_level
    }
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Write a configuration file holding the default session settings
    GenConfig(GenConfig),

    /// Validate configuration files
    ///
    /// Every file is parsed and then checked for logical errors such as a
    /// rollover interval longer than the renewal interval.
    Validate(Validate),

    /// Run a client and a server session in process
    ///
    /// The client exchanges messages with the server, renews its key halfway
    /// through and closes the session.
    Demo(Demo),
}

#[derive(Args, Debug)]
pub struct GenConfig {
    pub config_file: PathBuf,

    /// Forcefully overwrite an existing config file
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct Validate {
    pub config_files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct Demo {
    /// Session settings to use instead of the defaults
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Number of messages the client sends
    #[clap(short, long, default_value_t = 4)]
    pub messages: usize,

    /// Use duplex channels instead of request-reply
    #[clap(long)]
    pub duplex: bool,
}
