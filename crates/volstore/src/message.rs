//! Replication envelope: an edit plus its sequence number, framed for the wire.
//!
//! Wire format: one protocol version byte followed by the postcard encoding
//! of [`EditMessage`]. Decoding validates the edit against the receiver's
//! registry so a bad id from a remote peer is rejected here rather than
//! reaching a lookup that would panic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attribute::AttributeRegistry;
use crate::edit::{Edit, EditError};
use crate::objects::ObjectRefTable;
use crate::tree::VolumeTree;

/// Bumped whenever the encoding of [`EditMessage`] changes.
pub const EDIT_PROTOCOL_VERSION: u8 = 1;

/// Errors while encoding or decoding an [`EditMessage`].
#[derive(Debug, Error)]
pub enum MessageError {
    /// No bytes at all.
    #[error("empty edit message")]
    Empty,
    /// Sender speaks another protocol version.
    #[error("edit protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch {
        /// Version this build understands.
        expected: u8,
        /// Version found in the payload.
        found: u8,
    },
    /// Postcard failed to encode or decode.
    #[error("edit message codec error: {0}")]
    Codec(#[from] postcard::Error),
    /// The decoded edit does not fit the local registry.
    #[error("invalid edit: {0}")]
    Invalid(#[from] EditError),
}

/// One replicated edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditMessage {
    /// Sender-assigned, increasing position in the edit stream.
    pub sequence: u64,
    /// The edit itself.
    pub edit: Edit,
}

impl EditMessage {
    /// Wrap an edit.
    pub fn new(sequence: u64, edit: Edit) -> Self {
        Self { sequence, edit }
    }

    /// Apply the carried edit.
    pub fn apply(&self, tree: &mut VolumeTree, objects: &ObjectRefTable) {
        self.edit.apply(tree, objects);
    }

    /// Frame for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = vec![EDIT_PROTOCOL_VERSION];
        bytes.extend_from_slice(&postcard::to_allocvec(self)?);
        Ok(bytes)
    }

    /// Parse a framed message and validate its edit against `registry`.
    pub fn decode(bytes: &[u8], registry: &AttributeRegistry) -> Result<Self, MessageError> {
        let (&version, body) = bytes.split_first().ok_or(MessageError::Empty)?;
        if version != EDIT_PROTOCOL_VERSION {
            return Err(MessageError::VersionMismatch {
                expected: EDIT_PROTOCOL_VERSION,
                found: version,
            });
        }
        let message: Self = postcard::from_bytes(body)?;
        message.edit.validate(registry)?;
        Ok(message)
    }
}
