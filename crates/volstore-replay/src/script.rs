//! Edit scripts: RON lists of edits replayed through the edit log.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use volstore::{
    AttributeId, AttributeRegistry, Edit, EditLog, EditMessage, LodMultipliers, MessageError, Region,
    RegistryError, VolumeTree,
};
use volstore_config::{AttributeConfig, Config};

/// Errors that abort a replay.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Neither the command line nor the config names a script.
    #[error("no edit script given")]
    NoScript,
    /// The script file could not be read.
    #[error("failed to read script {}: {source}", path.display())]
    Read {
        /// Script path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The script is not valid RON for an [`EditScript`].
    #[error("failed to parse script: {0}")]
    Parse(#[from] ron::error::SpannedError),
    /// The attribute configuration is unusable.
    #[error("invalid attribute configuration: {0}")]
    Registry(#[from] RegistryError),
    /// The configured root cube is empty or not finite.
    #[error("invalid initial tree size {0}")]
    InvalidTree(f32),
    /// An edit failed to round-trip through the wire format.
    #[error("edit {index} rejected: {source}")]
    Message {
        /// Position in the script.
        index: usize,
        /// Encoding or validation failure.
        #[source]
        source: MessageError,
    },
    /// The edit log stopped accepting messages.
    #[error("edit log channel closed")]
    ChannelClosed,
}

/// A replayable list of edits.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditScript {
    /// Edits in application order.
    pub edits: Vec<Edit>,
}

impl EditScript {
    /// Parse a script from RON text.
    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        Ok(ron::from_str(text)?)
    }

    /// Read and parse a script file.
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }
}

/// Tree statistics printed after a replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// Edits applied.
    pub applied: u64,
    /// Final root cube.
    pub bounds: Region,
    /// Total nodes.
    pub nodes: usize,
    /// Leaves.
    pub leaves: usize,
    /// Tree height.
    pub depth: u32,
    /// Spanners in the `spanners` attribute.
    pub spanners: usize,
}

impl Summary {
    fn of(tree: &VolumeTree, applied: u64) -> Self {
        Self {
            applied,
            bounds: tree.bounds(),
            nodes: tree.node_count(),
            leaves: tree.leaf_count(),
            depth: tree.depth(),
            spanners: tree.spanners(AttributeId::SPANNERS).len(),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min = self.bounds.minimum;
        writeln!(f, "Volume replay")?;
        writeln!(f, "  edits:    {}", self.applied)?;
        writeln!(f, "  bounds:   ({}, {}, {}) size {}", min.x, min.y, min.z, self.bounds.longest_side())?;
        writeln!(f, "  nodes:    {} ({} leaves, depth {})", self.nodes, self.leaves, self.depth)?;
        write!(f, "  spanners: {}", self.spanners)
    }
}

/// Registry of the built-in attributes tuned by the config.
pub fn build_registry(config: &AttributeConfig) -> Result<AttributeRegistry, RegistryError> {
    AttributeRegistry::try_with_builtins(LodMultipliers {
        spanners: config.spanner_lod_threshold,
        color: config.color_lod_threshold,
        material: config.material_lod_threshold,
        density: config.density_lod_threshold,
    })
}

/// Empty tree over the configured root cube.
pub fn build_tree(config: &Config, registry: Arc<AttributeRegistry>) -> Result<VolumeTree, ScriptError> {
    let size = config.tree.size;
    let minimum = Vec3::from_array(config.tree.minimum);
    if !(size.is_finite() && size > 0.0) || !minimum.is_finite() {
        return Err(ScriptError::InvalidTree(size));
    }
    Ok(VolumeTree::new(registry, Region::cube(minimum, size)).with_max_expansions(config.tree.max_expansions))
}

/// Replay `script` on a fresh tree built from `config`.
///
/// Every edit is framed and decoded as a replica would receive it, then
/// queued on the edit log and applied in order.
pub fn replay(config: &Config, script: &EditScript) -> Result<Summary, ScriptError> {
    let registry = Arc::new(build_registry(&config.attributes)?);
    let tree = build_tree(config, Arc::clone(&registry))?;
    let mut log = EditLog::new(tree).with_invariant_checks(config.debug.check_invariants);
    let sender = log.sender();

    for (index, edit) in script.edits.iter().enumerate() {
        let message = EditMessage::new(index as u64, edit.clone());
        let received = message
            .encode()
            .and_then(|bytes| EditMessage::decode(&bytes, &registry))
            .map_err(|source| ScriptError::Message { index, source })?;
        sender.send(received).map_err(|_| ScriptError::ChannelClosed)?;

        if config.replay.summary_per_edit {
            log.drain();
            let summary = Summary::of(log.tree(), log.applied());
            tracing::info!(
                index,
                kind = edit.kind_name(),
                nodes = summary.nodes,
                depth = summary.depth,
                "applied edit"
            );
        }
    }
    let drained = log.drain();
    tracing::debug!(drained, "edit queue drained");

    Ok(Summary::of(&log.snapshot(), log.applied()))
}

/// Resolve the script from the config and replay it.
pub fn run(config: &Config) -> Result<Summary, ScriptError> {
    let path = config.replay.script.as_deref().ok_or(ScriptError::NoScript)?;
    tracing::info!(script = %path.display(), "replaying edit script");
    let script = EditScript::load(path)?;
    replay(config, &script)
}
