//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Volume store command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "volstore", about = "Replay volume edit scripts")]
pub struct CliArgs {
    /// Edit script (RON) to replay.
    pub script: Option<PathBuf>,

    /// Edge length of the initial root cube.
    #[arg(long)]
    pub size: Option<f32>,

    /// Maximum number of root doublings per edit.
    #[arg(long)]
    pub max_expansions: Option<u32>,

    /// LOD threshold multiplier of the spanners attribute.
    #[arg(long)]
    pub spanner_lod: Option<f32>,

    /// Check the coalescing invariant after every edit.
    #[arg(long)]
    pub check_invariants: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref script) = args.script {
            self.replay.script = Some(script.clone());
        }
        if let Some(size) = args.size {
            self.tree.size = size;
        }
        if let Some(max) = args.max_expansions {
            self.tree.max_expansions = max;
        }
        if let Some(lod) = args.spanner_lod {
            self.attributes.spanner_lod_threshold = lod;
        }
        if args.check_invariants {
            self.debug.check_invariants = true;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
