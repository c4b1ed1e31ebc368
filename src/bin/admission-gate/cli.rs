//! Command-line interface definition.

use admission_gate::config::{GateConfig, RosterSourceKind};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Offline tools for the admission gate: label checks and roster probes.
#[derive(Parser, Debug)]
#[command(name = "admission-gate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Root directory for gate data.
    #[arg(long, global = true, env = "ADMISSION_GATE_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// Application id prefix.
    #[arg(long, global = true, env = "ADMISSION_GATE_PREFIX")]
    pub prefix: Option<String>,

    /// Accept the prefix in any letter case.
    #[arg(long, global = true)]
    pub case_insensitive: bool,

    /// Roster source.
    #[arg(long, value_enum, global = true, env = "ADMISSION_GATE_ROSTER_SOURCE")]
    pub roster_source: Option<CliRosterSource>,

    /// Spreadsheet holding the roster.
    #[arg(long, global = true, env = "ADMISSION_GATE_SPREADSHEET_ID")]
    pub spreadsheet_id: Option<String>,

    /// Worksheet name.
    #[arg(long, global = true, env = "ADMISSION_GATE_WORKSHEET")]
    pub worksheet: Option<String>,

    /// Column letter holding application ids.
    #[arg(long, global = true, env = "ADMISSION_GATE_COLUMN")]
    pub column: Option<String>,

    /// Newline-delimited roster file.
    #[arg(long, global = true, env = "ADMISSION_GATE_ROSTER_FILE")]
    pub roster_file: Option<PathBuf>,

    /// Log level.
    #[arg(long, default_value = "info", global = true, env = "RUST_LOG")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a label against the format only.
    Validate {
        /// Label to check, e.g. `RA_42_janedoe`.
        label: String,
    },
    /// Check a label against the format and the roster.
    Check {
        /// Label to check.
        label: String,
    },
    /// Fetch the roster and print how many entries it holds.
    Roster,
}

/// Roster source CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliRosterSource {
    /// Google Sheets column.
    Sheets,
    /// Local file.
    File,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable.
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Build the effective configuration: file values overridden by
    /// command-line and environment values.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded,
    /// or the result does not validate.
    pub fn to_config(&self) -> color_eyre::Result<GateConfig> {
        let mut config = if let Some(ref path) = self.config {
            GateConfig::from_file(path)?
        } else {
            GateConfig::default()
        };

        if let Some(ref root_dir) = self.root_dir {
            config.root_dir.clone_from(root_dir);
        }
        if let Some(ref prefix) = self.prefix {
            config.format.prefix.clone_from(prefix);
        }
        if self.case_insensitive {
            config.format.case_sensitive = false;
        }

        if let Some(source) = self.roster_source {
            config.roster.source = source.into();
        }
        if let Some(ref id) = self.spreadsheet_id {
            config.roster.spreadsheet_id.clone_from(id);
        }
        if let Some(ref worksheet) = self.worksheet {
            config.roster.worksheet.clone_from(worksheet);
        }
        if let Some(ref column) = self.column {
            config.roster.column.clone_from(column);
        }
        if let Some(ref path) = self.roster_file {
            config.roster.file_path = Some(path.clone());
            if self.roster_source.is_none() {
                config.roster.source = RosterSourceKind::File;
            }
        }
        config.log_level.clone_from(&self.log_level);

        config.validate()?;
        Ok(config)
    }
}

impl From<CliRosterSource> for RosterSourceKind {
    fn from(s: CliRosterSource) -> Self {
        match s {
            CliRosterSource::Sheets => Self::Sheets,
            CliRosterSource::File => Self::File,
        }
    }
}
