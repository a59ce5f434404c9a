//! Orders, predecessors and dominance over the blocks of a graph.
//!
//! Results are computed on first use and cached, so a [`ControlFlowQueries`] can be shared
//! between threads and asked repeatedly.
//!
//! Graphs with exception handlers have several roots. Each root dominates only itself and the
//! blocks reached through it alone; a block reached from more than one root has no dominator
//! but itself. Blocks no root reaches are treated as roots of their own.

use std::{
    collections::{BTreeSet, HashSet},
    sync::OnceLock,
};

use crate::cdfg::graph::{BlockId, ControlAndDataFlowGraph};

/// Lazily computed control flow facts of one graph.
#[derive(Debug)]
pub struct ControlFlowQueries<'g> {
    graph: &'g ControlAndDataFlowGraph,
    orders: OnceLock<(Vec<BlockId>, Vec<BlockId>)>,
    predecessors: OnceLock<Vec<Vec<BlockId>>>,
    dominators: OnceLock<Vec<BlockId>>,
    frontiers: OnceLock<Vec<BTreeSet<BlockId>>>,
}

impl<'g> ControlFlowQueries<'g> {
    /// Queries over `graph`
    #[must_use]
    pub fn new(graph: &'g ControlAndDataFlowGraph) -> Self {
        ControlFlowQueries {
            graph,
            orders: OnceLock::new(),
            predecessors: OnceLock::new(),
            dominators: OnceLock::new(),
            frontiers: OnceLock::new(),
        }
    }

    /// The graph the queries run over
    #[must_use]
    pub fn graph(&self) -> &'g ControlAndDataFlowGraph {
        self.graph
    }

    /// Depth first pre-order from the roots, then from the blocks not yet visited by offset.
    /// Successors are visited in edge order.
    #[must_use]
    pub fn pre_order(&self) -> &[BlockId] {
        &self.orders().0
    }

    /// Depth first post-order matching [`ControlFlowQueries::pre_order`]
    #[must_use]
    pub fn post_order(&self) -> &[BlockId] {
        &self.orders().1
    }

    /// Distinct predecessors of `block`, by block id
    #[must_use]
    pub fn predecessors_of(&self, block: BlockId) -> &[BlockId] {
        self.predecessors()
            .get(block.0)
            .map_or(&[], Vec::as_slice)
    }

    /// The immediate dominator of `block`; the block itself for roots and for blocks entered
    /// from more than one root
    #[must_use]
    pub fn immediate_dominator_of(&self, block: BlockId) -> BlockId {
        self.dominators().get(block.0).copied().unwrap_or(block)
    }

    /// True if every path from a root to `block` passes through `dominator`. A block
    /// dominates itself.
    #[must_use]
    pub fn dominates(&self, dominator: BlockId, block: BlockId) -> bool {
        let mut current = block;
        loop {
            if current == dominator {
                return true;
            }
            let idom = self.immediate_dominator_of(current);
            if idom == current {
                return false;
            }
            current = idom;
        }
    }

    /// Blocks where the dominance of `block` ends: successors of dominated blocks that
    /// `block` does not strictly dominate
    #[must_use]
    pub fn dominance_frontier_of(&self, block: BlockId) -> Vec<BlockId> {
        self.frontiers()
            .get(block.0)
            .map(|frontier| frontier.iter().copied().collect())
            .unwrap_or_default()
    }

    fn orders(&self) -> &(Vec<BlockId>, Vec<BlockId>) {
        self.orders.get_or_init(|| {
            let count = self.graph.all_blocks.len();
            let mut pre = Vec::with_capacity(count);
            let mut post = Vec::with_capacity(count);
            let mut visited = vec![false; count];

            for start in self.starts() {
                if visited[start.0] {
                    continue;
                }
                visited[start.0] = true;
                pre.push(start);
                let mut stack = vec![(start, 0usize)];
                while let Some((block, next)) = stack.last_mut() {
                    let successors = self.graph.successors_of(*block);
                    if let Some(successor) = successors.get(*next) {
                        *next += 1;
                        if !visited[successor.0] {
                            visited[successor.0] = true;
                            pre.push(*successor);
                            stack.push((*successor, 0));
                        }
                    } else {
                        post.push(*block);
                        stack.pop();
                    }
                }
            }
            (pre, post)
        })
    }

    /// The roots followed by every block in offset order
    fn starts(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.graph
            .root_blocks
            .iter()
            .copied()
            .chain((0..self.graph.all_blocks.len()).map(BlockId))
    }

    fn predecessors(&self) -> &Vec<Vec<BlockId>> {
        self.predecessors.get_or_init(|| {
            let mut predecessors = vec![Vec::new(); self.graph.all_blocks.len()];
            for (id, _) in self.graph.blocks() {
                for successor in self.graph.successors_of(id) {
                    let list: &mut Vec<BlockId> = &mut predecessors[successor.0];
                    if !list.contains(&id) {
                        list.push(id);
                    }
                }
            }
            for list in &mut predecessors {
                list.sort_unstable();
            }
            predecessors
        })
    }

    /// Cooper, Harvey and Kennedy's iterative algorithm over reverse post-order, generalized
    /// to several roots
    fn dominators(&self) -> &Vec<BlockId> {
        self.dominators.get_or_init(|| {
            let count = self.graph.all_blocks.len();
            let post = self.post_order();
            let mut rank = vec![0usize; count];
            for (position, block) in post.iter().enumerate() {
                rank[block.0] = position;
            }

            let mut roots: HashSet<BlockId> = self.graph.root_blocks.iter().copied().collect();
            let mut seen = vec![false; count];
            for root in &self.graph.root_blocks {
                Self::mark_reachable(self.graph, *root, &mut seen);
            }
            for block in (0..count).map(BlockId) {
                if !seen[block.0] {
                    roots.insert(block);
                    Self::mark_reachable(self.graph, block, &mut seen);
                }
            }

            let mut idom: Vec<Option<BlockId>> = vec![None; count];
            for root in &roots {
                idom[root.0] = Some(*root);
            }

            let mut changed = true;
            while changed {
                changed = false;
                for block in post.iter().rev() {
                    if roots.contains(block) {
                        continue;
                    }
                    let mut candidate: Option<BlockId> = None;
                    for predecessor in self.predecessors_of(*block) {
                        if idom[predecessor.0].is_none() {
                            continue;
                        }
                        candidate = Some(match candidate {
                            None => *predecessor,
                            Some(current) => {
                                intersect(&idom, &rank, *predecessor, current).unwrap_or(*block)
                            }
                        });
                        if candidate == Some(*block) {
                            break;
                        }
                    }
                    if candidate.is_some() && idom[block.0] != candidate {
                        idom[block.0] = candidate;
                        changed = true;
                    }
                }
            }

            idom.iter()
                .enumerate()
                .map(|(index, dominator)| dominator.unwrap_or(BlockId(index)))
                .collect()
        })
    }

    /// Mark everything reachable from `block`, `block` included
    fn mark_reachable(graph: &ControlAndDataFlowGraph, block: BlockId, seen: &mut [bool]) {
        if seen[block.0] {
            return;
        }
        let mut stack = vec![block];
        seen[block.0] = true;
        while let Some(current) = stack.pop() {
            for successor in graph.successors_of(current) {
                if !seen[successor.0] {
                    seen[successor.0] = true;
                    stack.push(*successor);
                }
            }
        }
    }

    fn frontiers(&self) -> &Vec<BTreeSet<BlockId>> {
        self.frontiers.get_or_init(|| {
            let mut frontiers = vec![BTreeSet::new(); self.graph.all_blocks.len()];
            for (block, _) in self.graph.blocks() {
                let predecessors = self.predecessors_of(block);
                let idom = self.immediate_dominator_of(block);
                // A root is also entered from outside the method
                let joins = predecessors.len() >= 2 || (idom == block && !predecessors.is_empty());
                if !joins {
                    continue;
                }
                for predecessor in predecessors {
                    let mut runner = *predecessor;
                    while runner != idom || idom == block {
                        frontiers[runner.0].insert(block);
                        let next = self.immediate_dominator_of(runner);
                        if next == runner {
                            break;
                        }
                        runner = next;
                    }
                }
            }
            frontiers
        })
    }
}

/// Nearest common dominator of two blocks, `None` if their dominator chains end at
/// different roots
fn intersect(
    idom: &[Option<BlockId>],
    rank: &[usize],
    mut left: BlockId,
    mut right: BlockId,
) -> Option<BlockId> {
    while left != right {
        while rank[left.0] < rank[right.0] {
            let next = idom[left.0]?;
            if next == left {
                return None;
            }
            left = next;
        }
        while rank[right.0] < rank[left.0] {
            let next = idom[right.0]?;
            if next == right {
                return None;
            }
            right = next;
        }
    }
    Some(left)
}
