#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::{Path, PathBuf};

/// portwatch: console for a local network protection service
///
/// Talks to the service's database API to read records, follow queries and
/// show live connections grouped by the application that made them.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_parser = validate_file)]
    pub conffile: Option<PathBuf>,

    /// Address of the service API, overrides the configuration.
    #[arg(short, long)]
    pub endpoint: Option<String>,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch a single record.
    Get { key: String },

    /// Print every record matching a key prefix.
    Query { query: String },

    /// Follow a key prefix and print the full result after every change.
    Watch { query: String },

    /// Show live connections grouped by application profile.
    Profiles {
        /// Also show the connections of this profile, grouped by scope.
        #[arg(short, long)]
        inspect: Option<String>,

        /// Only list profiles with blocked connections.
        #[arg(short, long)]
        blocked: bool,
    },

    /// Print the effective configuration.
    Config,
}

impl Command {
    /// Whether the command needs a connection to the service.
    pub fn needs_connection(&self) -> bool {
        !matches!(self, Self::Config)
    }
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}
