use anyhow::{ensure, Result};
use log::info;

use super::Command;
use crate::cli;
use crate::config::SessionConfig;

impl Command for cli::GenConfig {
    fn run(self) -> Result<()> {
        ensure!(
            self.force || !self.config_file.exists(),
            "config file {0:?} already exists",
            self.config_file
        );

        SessionConfig::default().store(&self.config_file)?;
        info!("wrote default session settings to {:?}", self.config_file);
        Ok(())
    }
}
