//! Arena representation of a control and data flow graph.
//!
//! Blocks live in one vector and are addressed by [`BlockId`]. Instructions live inside their
//! block, in one of three lists, and are addressed by [`InstrId`]. Operand references are ids,
//! so the graph has no interior pointers and can be cloned, compared and sent between threads.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fmt,
};

use crate::{
    assembly::{MethodBody, Operation},
    host::TypeRef,
};

/// Index of a block in [`ControlAndDataFlowGraph::all_blocks`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    /// Wrap a raw block index
    #[must_use]
    pub const fn new(index: usize) -> Self {
        BlockId(index)
    }

    /// The raw block index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Which list of a block an instruction lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstrIndex {
    /// The block's operand stack at entry ([`BasicBlock::operand_stack`])
    Stack(usize),
    /// A real instruction ([`BasicBlock::instructions`])
    Body(usize),
    /// A synthetic local or parameter definition ([`BasicBlock::definitions`])
    Local(usize),
    /// The incoming value of a parameter ([`ControlAndDataFlowGraph::parameters`])
    Parameter(usize),
}

/// Address of an instruction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrId {
    /// The owning block; the entry block for parameters
    pub block: BlockId,
    /// Position within the block
    pub index: InstrIndex,
}

impl InstrId {
    /// Id of the `index`th real instruction of `block`
    #[must_use]
    pub const fn body(block: BlockId, index: usize) -> Self {
        InstrId {
            block,
            index: InstrIndex::Body(index),
        }
    }

    /// Id of the `index`th operand stack entry of `block`
    #[must_use]
    pub const fn stack(block: BlockId, index: usize) -> Self {
        InstrId {
            block,
            index: InstrIndex::Stack(index),
        }
    }

    /// Id of the `index`th synthetic definition of `block`
    #[must_use]
    pub const fn local(block: BlockId, index: usize) -> Self {
        InstrId {
            block,
            index: InstrIndex::Local(index),
        }
    }
}

impl fmt::Debug for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            InstrIndex::Stack(i) => write!(f, "{:?}.s{i}", self.block),
            InstrIndex::Body(i) => write!(f, "{:?}.{i}", self.block),
            InstrIndex::Local(i) => write!(f, "{:?}.l{i}", self.block),
            InstrIndex::Parameter(i) => write!(f, "p{i}"),
        }
    }
}

/// Second operand slot: absent, one value, or the remaining values of a variadic operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Operand2 {
    /// No second operand
    #[default]
    None,
    /// Exactly one
    One(InstrId),
    /// Two or more, in stack order
    Many(Vec<InstrId>),
}

impl Operand2 {
    /// Build from the operands after the first
    #[must_use]
    pub fn from_slice(rest: &[InstrId]) -> Self {
        match rest {
            [] => Operand2::None,
            [one] => Operand2::One(*one),
            many => Operand2::Many(many.to_vec()),
        }
    }

    /// The operands as a slice
    #[must_use]
    pub fn as_slice(&self) -> &[InstrId] {
        match self {
            Operand2::None => &[],
            Operand2::One(one) => std::slice::from_ref(one),
            Operand2::Many(many) => many,
        }
    }

    pub(crate) fn push(&mut self, id: InstrId) {
        *self = match std::mem::take(self) {
            Operand2::None => Operand2::One(id),
            Operand2::One(one) => Operand2::Many(vec![one, id]),
            Operand2::Many(mut many) => {
                many.push(id);
                Operand2::Many(many)
            }
        };
    }
}

/// A node of the data flow graph.
///
/// Real instructions carry their [`Operation`]. Synthetic ones (operand stack entries, local
/// and parameter definitions) have none: their operands are the incoming values, and they are
/// merges when more than one distinct value flows in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Instruction {
    /// The decoded operation, `None` for synthetic instructions
    pub operation: Option<Operation>,
    /// First popped value, or the first incoming value of a synthetic instruction
    pub operand1: Option<InstrId>,
    /// The other popped or incoming values
    pub operand2: Operand2,
    /// Static type of the produced value, [`TypeRef::Void`] if nothing is produced
    pub ty: TypeRef,
    /// True if distinct values flow in from different predecessors
    pub is_merge: bool,
    /// For variable reads: the definition read; for by-ref call results: the call
    pub aux: Option<InstrId>,
}

impl Instruction {
    pub(crate) fn real(operation: Operation) -> Self {
        Instruction {
            operation: Some(operation),
            ..Instruction::default()
        }
    }

    pub(crate) fn incoming(value: InstrId) -> Self {
        Instruction {
            operand1: Some(value),
            ..Instruction::default()
        }
    }

    /// Offset of the operation, `None` for synthetic instructions
    #[must_use]
    pub fn offset(&self) -> Option<u32> {
        self.operation.as_ref().map(|operation| operation.offset)
    }

    /// Every operand in order
    pub fn operands(&self) -> impl Iterator<Item = InstrId> + '_ {
        self.operand1
            .into_iter()
            .chain(self.operand2.as_slice().iter().copied())
    }

    /// Add an incoming value unless it is already an operand, updating `is_merge`
    pub(crate) fn add_incoming(&mut self, value: InstrId) {
        match self.operand1 {
            None => self.operand1 = Some(value),
            Some(first) if first == value => {}
            Some(_) => {
                if !self.operand2.as_slice().contains(&value) {
                    self.operand2.push(value);
                    self.is_merge = true;
                }
            }
        }
    }
}

/// A single-entry run of instructions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BasicBlock {
    /// Offset of the first instruction
    pub offset: u32,
    /// Offset after the last instruction
    pub end: u32,
    /// The instructions, in code order
    pub instructions: Vec<Instruction>,
    /// Values on the evaluation stack at entry, bottom first
    pub operand_stack: Vec<Instruction>,
    /// Synthetic definitions: local and parameter merges at entry, by-ref call results
    pub definitions: Vec<Instruction>,
    /// Start of the block's range in [`ControlAndDataFlowGraph::successor_edges`]
    pub first_successor: usize,
    /// Length of the block's range in [`ControlAndDataFlowGraph::successor_edges`]
    pub successor_count: usize,
    /// Indices of the clauses whose protected region contains the block, innermost first
    pub handlers: Vec<usize>,
    /// Index of the innermost clause whose handler contains the block
    pub containing_handler: Option<usize>,
    /// Definition of each local at entry
    pub local_defs: BTreeMap<u16, InstrId>,
    /// Definition of each argument at entry
    pub param_defs: BTreeMap<u16, InstrId>,
}

impl BasicBlock {
    pub(crate) fn new(offset: u32) -> Self {
        BasicBlock {
            offset,
            end: offset,
            ..BasicBlock::default()
        }
    }

    /// The last instruction, if the block is not empty
    #[must_use]
    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }
}

/// Blocks, edges and the data flow of one method body.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlAndDataFlowGraph {
    /// The method body the graph was built from
    pub body: MethodBody,
    /// Every block, ordered by offset
    pub all_blocks: Vec<BasicBlock>,
    /// The entry block followed by the first block of every handler and filter
    pub root_blocks: Vec<BlockId>,
    /// Successor lists of all blocks, concatenated
    pub successor_edges: Vec<BlockId>,
    /// Block starting at each offset
    pub block_for: BTreeMap<u32, BlockId>,
    /// Incoming argument values, `this` first on instance methods
    pub parameters: Vec<Instruction>,
}

impl ControlAndDataFlowGraph {
    /// The block with id `id`
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.all_blocks.get(id.0)
    }

    /// Iterate blocks with their ids
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.all_blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (BlockId(index), block))
    }

    /// The direct successors of a block, branch targets before the fall through
    #[must_use]
    pub fn successors_of(&self, id: BlockId) -> &[BlockId] {
        self.block(id).map_or(&[], |block| {
            &self.successor_edges
                [block.first_successor..block.first_successor + block.successor_count]
        })
    }

    /// The block that starts at `offset`
    #[must_use]
    pub fn block_at(&self, offset: u32) -> Option<BlockId> {
        self.block_for.get(&offset).copied()
    }

    /// The block whose range contains `offset`
    #[must_use]
    pub fn block_containing(&self, offset: u32) -> Option<BlockId> {
        let (_, id) = self.block_for.range(..=offset).next_back()?;
        let block = self.block(*id)?;
        (offset < block.end || offset == block.offset).then_some(*id)
    }

    /// The instruction with id `id`
    #[must_use]
    pub fn instruction(&self, id: InstrId) -> Option<&Instruction> {
        if let InstrIndex::Parameter(index) = id.index {
            return self.parameters.get(index);
        }
        let block = self.block(id.block)?;
        match id.index {
            InstrIndex::Stack(index) => block.operand_stack.get(index),
            InstrIndex::Body(index) => block.instructions.get(index),
            InstrIndex::Local(index) => block.definitions.get(index),
            InstrIndex::Parameter(_) => None,
        }
    }

    pub(crate) fn instruction_mut(&mut self, id: InstrId) -> Option<&mut Instruction> {
        if let InstrIndex::Parameter(index) = id.index {
            return self.parameters.get_mut(index);
        }
        let block = self.all_blocks.get_mut(id.block.0)?;
        match id.index {
            InstrIndex::Stack(index) => block.operand_stack.get_mut(index),
            InstrIndex::Body(index) => block.instructions.get_mut(index),
            InstrIndex::Local(index) => block.definitions.get_mut(index),
            InstrIndex::Parameter(_) => None,
        }
    }

    /// The real instruction at `offset`
    #[must_use]
    pub fn instruction_at(&self, offset: u32) -> Option<InstrId> {
        let block_id = self.block_containing(offset)?;
        let block = self.block(block_id)?;
        let index = block
            .instructions
            .iter()
            .position(|instruction| instruction.offset() == Some(offset))?;
        Some(InstrId::body(block_id, index))
    }

    /// Blocks in the order the data flow is propagated: breadth first from each root in turn,
    /// then the blocks no root reaches, by offset.
    #[must_use]
    pub fn flow_order(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.all_blocks.len());
        let mut seen = HashSet::with_capacity(self.all_blocks.len());
        let starts = self
            .root_blocks
            .iter()
            .copied()
            .chain((0..self.all_blocks.len()).map(BlockId));

        let mut queue = VecDeque::new();
        for start in starts {
            queue.push_back(start);
            while let Some(id) = queue.pop_front() {
                if !seen.insert(id) {
                    continue;
                }
                order.push(id);
                for successor in self.successors_of(id) {
                    if !seen.contains(successor) {
                        queue.push_back(*successor);
                    }
                }
            }
        }
        order
    }

    /// Total number of real instructions
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.all_blocks
            .iter()
            .map(|block| block.instructions.len())
            .sum()
    }
}
