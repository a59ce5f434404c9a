//! Block program counters that remember where pending `finally` handlers return to.
//!
//! A `leave` out of a protected region runs every `finally` it exits before reaching its
//! target. The block graph only has the edge to the target; [`successors`] threads the
//! handlers into the path, so that a walk over [`BlockPc`]s visits each `finally` with the
//! continuation it will return to.

use std::{fmt, sync::Arc};

use crate::{
    assembly::HandlerKind,
    cdfg::{
        graph::{BlockId, ControlAndDataFlowGraph},
        handlers::protecting_clauses,
    },
};

#[derive(PartialEq, Eq, Hash)]
struct Frame {
    offset: u32,
    next: Option<BlockPc>,
}

/// A stack of block offsets: the block being executed, then the blocks that pending
/// `endfinally`s continue at, innermost first.
///
/// Tails are shared, so extending a counter is O(1). Equality and hashing are structural.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlockPc(Arc<Frame>);

impl BlockPc {
    /// A counter at the block starting at `offset` with nothing pending
    #[must_use]
    pub fn new(offset: u32) -> Self {
        BlockPc(Arc::new(Frame { offset, next: None }))
    }

    fn with_next(offset: u32, next: Option<BlockPc>) -> Self {
        BlockPc(Arc::new(Frame { offset, next }))
    }

    /// Offset of the block being executed
    #[must_use]
    pub fn current(&self) -> u32 {
        self.0.offset
    }

    /// The pending continuations, `None` if nothing is pending
    #[must_use]
    pub fn tail(&self) -> Option<&BlockPc> {
        self.0.next.as_ref()
    }

    /// Every offset, current first
    #[must_use]
    pub fn offsets(&self) -> Vec<u32> {
        let mut offsets = vec![self.current()];
        let mut next = self.tail();
        while let Some(pc) = next {
            offsets.push(pc.current());
            next = pc.tail();
        }
        offsets
    }

    /// Number of offsets
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.tail().map_or(0, BlockPc::depth)
    }
}

impl fmt::Debug for BlockPc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (position, offset) in self.offsets().iter().enumerate() {
            if position > 0 {
                f.write_str(" ")?;
            }
            write!(f, "0x{offset:04X}")?;
        }
        f.write_str("]")
    }
}

/// The counters that follow `pc`.
///
/// Each edge out of the current block replaces the current offset with the target; the
/// `finally` handlers of regions the edge leaves are pushed on top, innermost ending up first.
/// A block without successors (`endfinally`) returns to the pending continuation.
#[must_use]
pub fn successors(graph: &ControlAndDataFlowGraph, pc: &BlockPc) -> Vec<BlockPc> {
    let Some(from) = graph.block_at(pc.current()) else {
        return Vec::new();
    };
    let targets = graph.successors_of(from);
    if targets.is_empty() {
        return pc.tail().cloned().into_iter().collect();
    }

    targets
        .iter()
        .map(|to| {
            let mut next = BlockPc::with_next(graph.all_blocks[to.0].offset, pc.tail().cloned());
            for handler in exited_finallies(graph, from, *to).into_iter().rev() {
                next = BlockPc::with_next(handler, Some(next));
            }
            next
        })
        .collect()
}

/// Handler offsets of the `finally` clauses whose protected region `from` is in and `to` is
/// not, innermost first. The nesting comes from the clauses, so it does not depend on
/// [`crate::cdfg::GraphOptions::infer_handlers`].
fn exited_finallies(graph: &ControlAndDataFlowGraph, from: BlockId, to: BlockId) -> Vec<u32> {
    let clauses = &graph.body.exception_handlers;
    let from = protecting_clauses(clauses, graph.all_blocks[from.0].offset);
    let to = protecting_clauses(clauses, graph.all_blocks[to.0].offset);
    let shared = from
        .iter()
        .rev()
        .zip(to.iter().rev())
        .take_while(|(left, right)| left == right)
        .count();

    from[..from.len() - shared]
        .iter()
        .filter_map(|index| graph.body.exception_handlers.get(*index))
        .filter(|clause| clause.kind == HandlerKind::Finally)
        .map(|clause| clause.handler_offset)
        .collect()
}
