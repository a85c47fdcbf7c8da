//! Command-line arguments of a module process.

use clap::Parser;
use std::path::PathBuf;

/// Arguments the manager passes to every module process.
#[derive(Parser, Debug, Clone)]
#[command(name = "everest-module", version, about = "Run an everest module")]
pub struct ModuleArgs {
    /// Installation prefix.
    #[arg(long, default_value = "")]
    pub prefix: PathBuf,

    /// Configuration file the module runs with.
    #[arg(long, default_value = "")]
    pub conf: PathBuf,

    /// Id of this module in the configuration.
    #[arg(long)]
    pub module: String,
}
