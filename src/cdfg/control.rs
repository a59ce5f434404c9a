//! Partition a method body into basic blocks and connect them.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::{
    assembly::{FlowControl, HandlerKind, LocalScopeProvider, MethodBody, OpCode, Operation},
    cdfg::graph::{BasicBlock, BlockId, ControlAndDataFlowGraph, Instruction},
    Error, Result,
};

struct Starts<'a> {
    operations: &'a [Operation],
    code_len: u32,
    offsets: BTreeSet<u32>,
}

impl Starts<'_> {
    fn is_instruction(&self, offset: u32) -> bool {
        self.operations
            .binary_search_by_key(&offset, |operation| operation.offset)
            .is_ok()
    }

    /// A block boundary that must fall on an instruction, or the end of the code
    fn boundary(&mut self, offset: u32, what: &str) -> Result<()> {
        if offset >= self.code_len {
            return Ok(());
        }
        if !self.is_instruction(offset) {
            return Err(malformed_error!(
                "{} at 0x{:04X} is not an instruction boundary",
                what,
                offset
            ));
        }
        self.offsets.insert(offset);
        Ok(())
    }
}

/// Build the blocks, roots and successor edges of `body`. Data flow fields are left empty.
pub(crate) fn infer(
    body: &MethodBody,
    operations: &[Operation],
    scopes: Option<&dyn LocalScopeProvider>,
) -> Result<ControlAndDataFlowGraph> {
    if operations
        .windows(2)
        .any(|pair| pair[0].next_offset() != pair[1].offset)
    {
        return Err(Error::GraphError(
            "operations are not a contiguous instruction stream".to_string(),
        ));
    }

    let code_len = operations
        .last()
        .map_or(body.code.len() as u32, Operation::next_offset);
    let mut starts = Starts {
        operations,
        code_len,
        offsets: BTreeSet::from([0]),
    };

    if let Some(provider) = scopes {
        for scope in provider.local_scopes() {
            for bound in [scope.offset, scope.offset + scope.length] {
                if starts.is_instruction(bound) {
                    starts.offsets.insert(bound);
                } else {
                    trace!(bound, "scope bound inside an instruction");
                }
            }
        }
    }

    for operation in operations {
        for target in operation.targets() {
            if !starts.is_instruction(*target) {
                return Err(Error::InvalidBranchTarget(*target));
            }
            starts.offsets.insert(*target);
        }
        if ends_block(operation.opcode) {
            starts.boundary(operation.next_offset(), "instruction after a branch")?;
        }
    }

    for clause in &body.exception_handlers {
        starts.boundary(clause.try_offset, "try start")?;
        starts.boundary(clause.try_end(), "try end")?;
        starts.boundary(clause.handler_offset, "handler start")?;
        starts.boundary(clause.handler_end(), "handler end")?;
        if clause.kind == HandlerKind::Filter {
            starts.boundary(clause.filter_offset, "filter start")?;
        }
    }

    let mut all_blocks: Vec<BasicBlock> = starts
        .offsets
        .iter()
        .map(|offset| BasicBlock::new(*offset))
        .collect();
    let block_for: BTreeMap<u32, BlockId> = all_blocks
        .iter()
        .enumerate()
        .map(|(index, block)| (block.offset, BlockId(index)))
        .collect();

    let mut current = 0;
    for operation in operations {
        while current + 1 < all_blocks.len() && all_blocks[current + 1].offset <= operation.offset
        {
            current += 1;
        }
        let block = &mut all_blocks[current];
        block.end = operation.next_offset();
        block.instructions.push(Instruction::real(operation.clone()));
    }

    let mut successor_edges = Vec::with_capacity(all_blocks.len() * 2);
    let block_count = all_blocks.len();
    for (index, block) in all_blocks.iter_mut().enumerate() {
        let first = successor_edges.len();
        let mut falls_through = true;
        if let Some(operation) = block.last().and_then(|last| last.operation.as_ref()) {
            for target in operation.targets() {
                let id = block_for[target];
                if !successor_edges[first..].contains(&id) {
                    successor_edges.push(id);
                }
            }
            falls_through = !operation.opcode.is_unconditional_transfer();
        }
        if falls_through && !block.instructions.is_empty() && index + 1 < block_count {
            let next = BlockId(index + 1);
            if !successor_edges[first..].contains(&next) {
                successor_edges.push(next);
            }
        }
        block.first_successor = first;
        block.successor_count = successor_edges.len() - first;
    }

    let mut root_blocks = vec![BlockId(0)];
    for clause in &body.exception_handlers {
        let mut entries = vec![clause.handler_offset];
        if clause.kind == HandlerKind::Filter {
            entries.push(clause.filter_offset);
        }
        for offset in entries {
            if let Some(id) = block_for.get(&offset) {
                if !root_blocks.contains(id) {
                    root_blocks.push(*id);
                }
            }
        }
    }

    debug!(
        blocks = all_blocks.len(),
        edges = successor_edges.len(),
        roots = root_blocks.len(),
        "control flow inferred"
    );

    Ok(ControlAndDataFlowGraph {
        body: body.clone(),
        all_blocks,
        root_blocks,
        successor_edges,
        block_for,
        parameters: Vec::new(),
    })
}

/// True if the next instruction starts a new block
fn ends_block(opcode: OpCode) -> bool {
    matches!(
        opcode.flow(),
        FlowControl::Branch | FlowControl::CondBranch | FlowControl::Return | FlowControl::Throw
    ) || opcode == OpCode::Jmp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{decode_operations, ExceptionHandler},
        pdb::{PdbFunction, PdbScope},
        token::Token,
    };

    fn body(code: &[u8]) -> MethodBody {
        MethodBody {
            max_stack: 8,
            local_signature_token: Token(0),
            init_locals: false,
            code: code.to_vec(),
            exception_handlers: Vec::new(),
        }
    }

    fn graph(body: &MethodBody) -> Result<ControlAndDataFlowGraph> {
        infer(body, &decode_operations(&body.code)?, None)
    }

    #[test]
    fn conditional_branch() {
        // ldc.i4.1; brtrue.s L; ldc.i4.0; L: ret
        let body = body(&[0x17, 0x2D, 0x01, 0x16, 0x2A]);
        let graph = graph(&body).unwrap();

        assert_eq!(graph.all_blocks.len(), 3);
        assert_eq!(
            graph.all_blocks.iter().map(|b| b.offset).collect::<Vec<_>>(),
            vec![0, 3, 4]
        );
        assert_eq!(graph.successors_of(BlockId(0)), &[BlockId(2), BlockId(1)]);
        assert_eq!(graph.successors_of(BlockId(1)), &[BlockId(2)]);
        assert!(graph.successors_of(BlockId(2)).is_empty());
        assert_eq!(graph.root_blocks, vec![BlockId(0)]);
    }

    #[test]
    fn switch_targets_are_deduplicated() {
        // ldarg.0; switch (L, L, M); ret; L: ret; M: ret
        #[rustfmt::skip]
        let code = [
            0x02,
            0x45, 0x03, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00,
            0x02, 0x00, 0x00, 0x00,
            0x2A, 0x2A, 0x2A,
        ];
        let graph = graph(&body(&code)).unwrap();
        assert_eq!(graph.all_blocks.len(), 4);
        let offsets: Vec<u32> = graph
            .successors_of(BlockId(0))
            .iter()
            .map(|id| graph.all_blocks[id.0].offset)
            .collect();
        assert_eq!(offsets, vec![19, 20, 18]);
    }

    #[test]
    fn branch_into_an_instruction() {
        // br.s +1 lands inside ldc.i4.s
        let body = body(&[0x2B, 0x01, 0x1F, 0x05, 0x2A]);
        assert!(matches!(graph(&body), Err(Error::InvalidBranchTarget(3))));
    }

    #[test]
    fn exception_regions_split_blocks() {
        // try { nop; leave.s END } finally { nop; endfinally } END: ret
        let mut body = body(&[0x00, 0xDE, 0x02, 0x00, 0xDC, 0x2A]);
        body.exception_handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_offset: 0,
            try_length: 3,
            handler_offset: 3,
            handler_length: 2,
            class_token: Token(0),
            filter_offset: 0,
        });
        let graph = graph(&body).unwrap();

        assert_eq!(
            graph.all_blocks.iter().map(|b| b.offset).collect::<Vec<_>>(),
            vec![0, 3, 5]
        );
        assert_eq!(graph.root_blocks, vec![BlockId(0), BlockId(1)]);
        assert_eq!(graph.successors_of(BlockId(0)), &[BlockId(2)]);
        assert!(graph.successors_of(BlockId(1)).is_empty());
    }

    #[test]
    fn scope_bounds_start_blocks() {
        let body = body(&[0x00, 0x00, 0x00, 0x2A]);
        let mut function = PdbFunction::new(Token(0x0600_0001));
        let mut outer = PdbScope::new(0, 4);
        outer.scopes.push(PdbScope::new(1, 2));
        function.scopes.push(outer);

        let operations = decode_operations(&body.code).unwrap();
        let graph = infer(&body, &operations, Some(&function)).unwrap();
        assert_eq!(
            graph.all_blocks.iter().map(|b| b.offset).collect::<Vec<_>>(),
            vec![0, 1, 3]
        );
        assert_eq!(graph.successors_of(BlockId(0)), &[BlockId(1)]);
        assert_eq!(graph.successors_of(BlockId(1)), &[BlockId(2)]);
    }

    #[test]
    fn empty_body() {
        let graph = graph(&body(&[])).unwrap();
        assert_eq!(graph.all_blocks.len(), 1);
        assert!(graph.all_blocks[0].instructions.is_empty());
        assert!(graph.successor_edges.is_empty());
    }
}
