use anyhow::{bail, Result};

use super::Command;
use crate::cli;
use crate::config::SessionConfig;

impl Command for cli::Validate {
    fn run(self) -> Result<()> {
        eprintln!("Validate config files");
        let mut invalid = 0;
        for file in self.config_files {
            match SessionConfig::load(&file) {
                Ok(config) => {
                    eprintln!("{file:?} is valid TOML and conforms to the expected schema");
                    match config.validate() {
                        Ok(()) => eprintln!("{file:?} has passed all logical checks"),
                        Err(e) => {
                            invalid += 1;
                            eprintln!("{file:?} contains logical errors: {e:#}");
                        }
                    }
                }
                Err(e) => {
                    invalid += 1;
                    eprintln!("{file:?} is not valid: {e}");
                }
            }
        }

        if invalid > 0 {
            bail!("{invalid} config files are invalid");
        }
        Ok(())
    }
}
