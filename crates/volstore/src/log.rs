//! Single-writer edit log publishing immutable tree snapshots.
//!
//! Producers on any thread push [`EditMessage`]s into a channel. The owner of
//! the log drains it, applies each edit to its working tree in received order
//! and publishes a snapshot after every completed apply. Readers clone the
//! published snapshot under a short read lock; because nodes are shared and
//! never mutated, a clone is isolated from every later edit.

use std::sync::{Arc, PoisonError, RwLock};

use crossbeam_channel::{Receiver, Sender};

use crate::message::EditMessage;
use crate::objects::ObjectRefTable;
use crate::tree::VolumeTree;

/// Cheap handle for reading the latest published tree.
#[derive(Clone, Debug)]
pub struct SnapshotReader {
    published: Arc<RwLock<VolumeTree>>,
}

impl SnapshotReader {
    /// Clone of the latest published tree.
    pub fn snapshot(&self) -> VolumeTree {
        self.published.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Applies queued edits and publishes the results.
pub struct EditLog {
    tree: VolumeTree,
    objects: ObjectRefTable,
    published: Arc<RwLock<VolumeTree>>,
    sender: Sender<EditMessage>,
    receiver: Receiver<EditMessage>,
    last_sequence: Option<u64>,
    applied: u64,
    check_invariants: bool,
}

impl EditLog {
    /// Log starting from `tree`, which is published immediately.
    pub fn new(tree: VolumeTree) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut objects = ObjectRefTable::new();
        objects.refresh_from(&tree);
        Self {
            published: Arc::new(RwLock::new(tree.clone())),
            tree,
            objects,
            sender,
            receiver,
            last_sequence: None,
            applied: 0,
            check_invariants: false,
        }
    }

    /// Builder-style toggle for checking the coalescing invariant after
    /// every apply.
    pub fn with_invariant_checks(mut self, enabled: bool) -> Self {
        self.check_invariants = enabled;
        self
    }

    /// Producer handle; clone freely across threads.
    pub fn sender(&self) -> Sender<EditMessage> {
        self.sender.clone()
    }

    /// Reader handle for other threads.
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            published: Arc::clone(&self.published),
        }
    }

    /// Apply every queued message in received order. Returns how many were applied.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(message) = self.receiver.try_recv() {
            self.apply(message);
            count += 1;
        }
        count
    }

    /// Apply one message and publish the result.
    pub fn apply(&mut self, message: EditMessage) {
        if let Some(last) = self.last_sequence
            && message.sequence <= last
        {
            tracing::warn!(
                sequence = message.sequence,
                last,
                kind = message.edit.kind_name(),
                "edit received out of order; applying in received order"
            );
        }
        self.last_sequence = Some(message.sequence);

        message.apply(&mut self.tree, &self.objects);
        self.objects.refresh_from(&self.tree);
        self.applied += 1;

        if self.check_invariants && !self.tree.is_coalesced() {
            tracing::warn!(sequence = message.sequence, "tree not coalesced after edit");
        }
        tracing::debug!(
            sequence = message.sequence,
            kind = message.edit.kind_name(),
            nodes = self.tree.node_count(),
            "edit applied"
        );
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = self.tree.clone();
    }

    /// Clone of the latest published tree.
    pub fn snapshot(&self) -> VolumeTree {
        self.published.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Working tree (equal to the latest snapshot between applies).
    pub fn tree(&self) -> &VolumeTree {
        &self.tree
    }

    /// Object table used to resolve spanner ids.
    pub fn objects(&self) -> &ObjectRefTable {
        &self.objects
    }

    /// Number of messages applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Sequence number of the last applied message.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }
}
