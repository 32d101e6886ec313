//! Partition list implementation.

use crate::partition::SharedPartition;
use crate::{Result, TsdbeError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const NODE_LINKED: u8 = 0;
const NODE_REPLACED: u8 = 1;
const NODE_REMOVED: u8 = 2;

/// A linked list of partitions ordered from newest to oldest.
///
/// Structural changes (`insert`, `swap`, `remove`) are serialized by a
/// list-wide mutation lock and only ever rewrite a single `next` pointer, so a
/// reader walking the list sees each position exactly once. Readers never take
/// the mutation lock; `get_head` only takes the head read lock.
pub struct PartitionList {
    head: RwLock<Option<Arc<PartitionNode>>>,
    mutation_lock: Mutex<()>,
    num_partitions: AtomicUsize,
}

impl PartitionList {
    /// Creates a new empty partition list.
    pub fn new() -> Self {
        Self {
            head: RwLock::new(None),
            mutation_lock: Mutex::new(()),
            num_partitions: AtomicUsize::new(0),
        }
    }

    /// Inserts a new partition at the head of the list.
    pub fn insert(&self, partition: SharedPartition) {
        let _mutation_guard = self.mutation_lock.lock();
        let mut head = self.head.write();
        let new_node = PartitionNode::new(partition, head.take());
        *head = Some(new_node);
        self.num_partitions.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes a partition from the list and cleans it up.
    ///
    /// Fails with [`TsdbeError::PartitionNotFound`] if the partition is no
    /// longer linked, e.g. because a concurrent caller removed it first.
    pub fn remove(&self, target: &SharedPartition) -> Result<()> {
        let removed = self.unlink(target, None)?;
        removed.state.store(NODE_REMOVED, Ordering::SeqCst);
        self.num_partitions.fetch_sub(1, Ordering::SeqCst);

        // Outside of the mutation lock: cleaning a disk partition is I/O.
        removed.partition.clean()
    }

    /// Replaces `old` with `new` at the same position.
    pub fn swap(&self, old: &SharedPartition, new: SharedPartition) -> Result<()> {
        let replaced = self.unlink(old, Some(new))?;
        replaced.state.store(NODE_REPLACED, Ordering::SeqCst);
        Ok(())
    }

    /// Gets the head partition.
    pub fn get_head(&self) -> Option<SharedPartition> {
        self.head.read().as_ref().map(|node| node.partition.clone())
    }

    /// Returns the number of partitions.
    pub fn size(&self) -> usize {
        self.num_partitions.load(Ordering::SeqCst)
    }

    /// Creates an iterator over the partitions, starting at the current head.
    ///
    /// Partitions inserted after the iterator was created are not visited.
    pub fn iter(&self) -> PartitionIterator {
        PartitionIterator {
            current: self.head.read().clone(),
        }
    }

    /// Detaches the node holding `target`, linking either its successor or a
    /// fresh node for `replacement` in its place. Returns the detached node.
    fn unlink(
        &self,
        target: &SharedPartition,
        mut replacement: Option<SharedPartition>,
    ) -> Result<Arc<PartitionNode>> {
        let _mutation_guard = self.mutation_lock.lock();

        {
            let mut head = self.head.write();
            if let Some(head_node) = head.clone()
                && Self::same_partitions(&head_node.partition, target)
            {
                *head = head_node.successor(replacement.take());
                return Ok(head_node);
            }
        }

        // Only mutators rewrite `next` pointers and we hold the mutation lock,
        // so read-then-write on a node cannot race.
        let mut current = self.head.read().clone();
        while let Some(node) = current {
            let next_opt = node.next.read().clone();

            if let Some(ref next_node) = next_opt
                && Self::same_partitions(&next_node.partition, target)
            {
                *node.next.write() = next_node.successor(replacement.take());
                return Ok(next_node.clone());
            }

            current = next_opt;
        }

        Err(TsdbeError::PartitionNotFound {
            min_timestamp: target.min_timestamp(),
            max_timestamp: target.max_timestamp(),
        })
    }

    /// Checks if two partition references point to the same underlying partition.
    fn same_partitions(a: &SharedPartition, b: &SharedPartition) -> bool {
        Arc::ptr_eq(a, b)
    }
}

impl Default for PartitionList {
    fn default() -> Self {
        Self::new()
    }
}

/// A node in the partition list.
struct PartitionNode {
    partition: SharedPartition,
    next: RwLock<Option<Arc<PartitionNode>>>,
    state: AtomicU8,
}

impl PartitionNode {
    fn new(partition: SharedPartition, next: Option<Arc<PartitionNode>>) -> Arc<Self> {
        Arc::new(Self {
            partition,
            next: RwLock::new(next),
            state: AtomicU8::new(NODE_LINKED),
        })
    }

    /// What the predecessor should point at once this node is detached.
    fn successor(&self, replacement: Option<SharedPartition>) -> Option<Arc<PartitionNode>> {
        let next = self.next.read().clone();
        match replacement {
            Some(partition) => Some(PartitionNode::new(partition, next)),
            None => next,
        }
    }
}

impl Drop for PartitionNode {
    fn drop(&mut self) {
        // Unlink the tail iteratively; a recursive drop overflows the stack on long lists.
        let mut next = self.next.get_mut().take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.get_mut().take(),
                // Still referenced by an iterator or another node, which drops it later.
                Err(_) => break,
            }
        }
    }
}

/// Forward iterator over the partitions in the list.
///
/// A node replaced by `swap` after the iterator reached it still yields the
/// partition it held; a node removed after the iterator reached it yields
/// [`TsdbeError::PartitionDetached`].
pub struct PartitionIterator {
    current: Option<Arc<PartitionNode>>,
}

impl Iterator for PartitionIterator {
    type Item = Result<SharedPartition>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current.take()?;
        self.current = node.next.read().clone();
        if node.state.load(Ordering::SeqCst) == NODE_REMOVED {
            return Some(Err(TsdbeError::PartitionDetached));
        }
        Some(Ok(node.partition.clone()))
    }
}
