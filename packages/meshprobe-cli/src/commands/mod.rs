pub mod run;
pub mod summarize;
pub mod validate;

use crate::exit_codes;
use meshprobe::ExperimentConfig;
use std::path::Path;

/// Load and validate a config file, reporting problems on stderr
pub(crate) fn load_config(path: &str) -> Result<ExperimentConfig, i32> {
    let path = Path::new(path);
    if !path.is_file() {
        eprintln!("Error: Config file not found: {}", path.display());
        return Err(exit_codes::INPUT_ERROR);
    }

    let config = ExperimentConfig::from_file(path).map_err(|e| {
        eprintln!("Error: {}", e);
        exit_codes::for_error(&e)
    })?;
    config.validate().map_err(|e| {
        eprintln!("Error: {}", e);
        exit_codes::for_error(&e)
    })?;
    Ok(config)
}
