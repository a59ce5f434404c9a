//! Exception handler nesting and the flow of local and argument definitions.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, trace};

use crate::{
    assembly::{ExceptionHandler, HandlerKind, OpCode, OperationValue, VariableKind},
    cdfg::{
        blockpc::{self, BlockPc},
        graph::{BasicBlock, BlockId, ControlAndDataFlowGraph, InstrId, InstrIndex, Instruction},
        types::merge_types,
    },
    host::{MetadataHost, MethodContext, TypeRef},
    Error, Result,
};

/// Fill [`crate::cdfg::BasicBlock::handlers`] and
/// [`crate::cdfg::BasicBlock::containing_handler`].
///
/// Regions must nest: two protected regions that contain the same block must be equal or one
/// inside the other.
pub(crate) fn infer_handlers(graph: &mut ControlAndDataFlowGraph) -> Result<()> {
    let clauses = &graph.body.exception_handlers;
    for block in &mut graph.all_blocks {
        let offset = block.offset;

        let protecting = protecting_clauses(clauses, offset);

        for pair in protecting.windows(2) {
            let (inner, outer) = (&clauses[pair[0]], &clauses[pair[1]]);
            if inner.try_offset < outer.try_offset || inner.try_end() > outer.try_end() {
                return Err(Error::GraphError(format!(
                    "protected regions of clauses {} and {} overlap at 0x{offset:04X}",
                    pair[0], pair[1]
                )));
            }
        }

        block.containing_handler = clauses
            .iter()
            .enumerate()
            .filter_map(|(index, clause)| {
                let (start, end) = if clause.kind == HandlerKind::Filter
                    && clause.filter_offset <= offset
                    && offset < clause.handler_offset
                {
                    (clause.filter_offset, clause.handler_offset)
                } else {
                    (clause.handler_offset, clause.handler_end())
                };
                (start <= offset && offset < end).then_some((end - start, index))
            })
            .min()
            .map(|(_, index)| index);
        block.handlers = protecting;
    }
    Ok(())
}

/// Indices of the clauses whose protected region contains `offset`, innermost first
pub(crate) fn protecting_clauses(clauses: &[ExceptionHandler], offset: u32) -> Vec<usize> {
    let mut protecting: Vec<usize> = clauses
        .iter()
        .enumerate()
        .filter(|(_, clause)| clause.try_offset <= offset && offset < clause.try_end())
        .map(|(index, _)| index)
        .collect();
    protecting.sort_by_key(|index| (clauses[*index].try_length, *index));
    protecting
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Variable {
    Local(u16),
    Argument(u16),
}

type Definitions = BTreeMap<Variable, InstrId>;

struct LocalFlow<'a> {
    graph: &'a mut ControlAndDataFlowGraph,
    host: &'a dyn MetadataHost,
    /// Synthetic definitions made by by-ref call arguments, per call and parameter
    by_ref: HashMap<(InstrId, usize), InstrId>,
}

/// Connect every variable read to the definition it reads.
///
/// Stores define a variable as the stored value. Reads get the definition in
/// [`Instruction::aux`]. Where definitions from several predecessors meet, a synthetic
/// definition in [`crate::cdfg::BasicBlock::definitions`] collects them. Paths through
/// `finally` handlers are followed with their continuations.
pub(crate) fn infer_locals(
    graph: &mut ControlAndDataFlowGraph,
    context: &MethodContext,
    host: &dyn MetadataHost,
    infer_types: bool,
) {
    let Some(entry) = graph.root_blocks.first().copied() else {
        return;
    };

    let argument_count = context.signature.argument_count();
    graph.parameters = (0..argument_count)
        .map(|index| Instruction {
            ty: u16::try_from(index)
                .map_or(TypeRef::Unknown, |index| context.argument_type(index)),
            ..Instruction::default()
        })
        .collect();
    for index in 0..argument_count {
        let Ok(argument) = u16::try_from(index) else {
            break;
        };
        let parameter = InstrId {
            block: entry,
            index: InstrIndex::Parameter(index),
        };
        flow_definition(graph, entry, Variable::Argument(argument), parameter);
    }

    let mut flow = LocalFlow {
        graph,
        host,
        by_ref: HashMap::new(),
    };
    flow.run();

    if infer_types {
        type_definitions(flow.graph, host);
    }
}

impl LocalFlow<'_> {
    fn run(&mut self) {
        let depth_limit = self.graph.body.exception_handlers.len() + 1;
        let mut work: VecDeque<BlockPc> = self
            .graph
            .root_blocks
            .iter()
            .map(|id| BlockPc::new(self.graph.all_blocks[id.0].offset))
            .collect();
        let mut visited: HashMap<BlockPc, usize> = HashMap::new();
        let mut rounds = 0usize;

        while let Some(pc) = work.pop_front() {
            let Some(block_id) = self.graph.block_at(pc.current()) else {
                continue;
            };
            let known = entry_definitions(&self.graph.all_blocks[block_id.0]).len();
            if visited.get(&pc) == Some(&known) {
                continue;
            }
            visited.insert(pc.clone(), known);
            rounds += 1;

            let (exit, made) = self.simulate(block_id);

            for clause in self.graph.all_blocks[block_id.0].handlers.clone() {
                let Some(clause) = self.graph.body.exception_handlers.get(clause).cloned() else {
                    continue;
                };
                let mut entries = vec![clause.handler_offset];
                if clause.kind == HandlerKind::Filter {
                    entries.push(clause.filter_offset);
                }
                for offset in entries {
                    let Some(handler) = self.graph.block_at(offset) else {
                        continue;
                    };
                    let entry = entry_definitions(&self.graph.all_blocks[block_id.0]);
                    for (variable, definition) in entry.into_iter().chain(made.iter().copied()) {
                        flow_definition(self.graph, handler, variable, definition);
                    }
                    work.push_back(BlockPc::new(offset));
                }
            }

            for next in blockpc::successors(self.graph, &pc) {
                let Some(target) = self.graph.block_at(next.current()) else {
                    continue;
                };
                for (variable, definition) in &exit {
                    flow_definition(self.graph, target, *variable, *definition);
                }
                if next.depth() > depth_limit {
                    trace!(pc = ?next, "finally continuation too deep");
                    continue;
                }
                work.push_back(next);
            }
        }

        debug!(rounds, "local definitions inferred");
    }

    /// Walk a block from its entry definitions. Returns the definitions at exit and every
    /// definition the block makes, in order.
    fn simulate(&mut self, block_id: BlockId) -> (Definitions, Vec<(Variable, InstrId)>) {
        let mut current = entry_definitions(&self.graph.all_blocks[block_id.0]);
        let mut made = Vec::new();

        for index in 0..self.graph.all_blocks[block_id.0].instructions.len() {
            let id = InstrId::body(block_id, index);
            let instruction = &self.graph.all_blocks[block_id.0].instructions[index];
            let Some(operation) = instruction.operation.clone() else {
                continue;
            };
            let operand1 = instruction.operand1;
            let operand2 = instruction.operand2.as_slice().to_vec();

            if let Some(variable) = variable_of(operation.opcode, &operation.value) {
                if operation.opcode.is_store() {
                    if let Some(value) = operand1 {
                        current.insert(variable, value);
                        made.push((variable, value));
                    }
                } else {
                    self.set_aux(id, current.get(&variable).copied());
                }
                continue;
            }

            match operation.opcode {
                OpCode::LdindI1
                | OpCode::LdindU1
                | OpCode::LdindI2
                | OpCode::LdindU2
                | OpCode::LdindI4
                | OpCode::LdindU4
                | OpCode::LdindI8
                | OpCode::LdindI
                | OpCode::LdindR4
                | OpCode::LdindR8
                | OpCode::LdindRef
                | OpCode::Ldobj => {
                    if let Some(variable) = operand1.and_then(|address| self.address_of(address)) {
                        self.set_aux(id, current.get(&variable).copied());
                    }
                }
                OpCode::StindRef
                | OpCode::StindI1
                | OpCode::StindI2
                | OpCode::StindI4
                | OpCode::StindI8
                | OpCode::StindR4
                | OpCode::StindR8
                | OpCode::StindI
                | OpCode::Stobj => {
                    let variable = operand1.and_then(|address| self.address_of(address));
                    if let (Some(variable), Some(value)) = (variable, operand2.first()) {
                        current.insert(variable, *value);
                        made.push((variable, *value));
                    }
                }
                OpCode::Call | OpCode::Callvirt | OpCode::Newobj => {
                    let Some(signature) = operation
                        .token()
                        .and_then(|token| self.host.method_signature(token))
                    else {
                        continue;
                    };
                    let arguments: Vec<InstrId> = operand1.into_iter().chain(operand2).collect();
                    let first_parameter =
                        usize::from(signature.has_this && operation.opcode != OpCode::Newobj);

                    for (parameter, ty) in signature.parameters.iter().enumerate() {
                        let TypeRef::ManagedPointer(pointee) = ty else {
                            continue;
                        };
                        let Some(argument) = arguments.get(first_parameter + parameter) else {
                            continue;
                        };
                        let Some(variable) = self.address_of(*argument) else {
                            continue;
                        };
                        let definition = self.by_ref_definition(block_id, id, parameter, pointee);
                        current.insert(variable, definition);
                        made.push((variable, definition));
                    }
                }
                _ => {}
            }
        }
        (current, made)
    }

    fn set_aux(&mut self, id: InstrId, definition: Option<InstrId>) {
        if let Some(instruction) = self.graph.instruction_mut(id) {
            instruction.aux = definition;
        }
    }

    /// The variable an address value points at, looking through operand stack entries that
    /// carry a single value
    fn address_of(&self, mut id: InstrId) -> Option<Variable> {
        for _ in 0..=self.graph.all_blocks.len() {
            let instruction = self.graph.instruction(id)?;
            match &instruction.operation {
                Some(operation) => {
                    return match operation.opcode {
                        OpCode::Ldloca | OpCode::LdlocaS | OpCode::Ldarga | OpCode::LdargaS => {
                            variable_of(operation.opcode, &operation.value)
                        }
                        _ => None,
                    };
                }
                None if !instruction.is_merge && matches!(id.index, InstrIndex::Stack(_)) => {
                    id = instruction.operand1?;
                }
                None => return None,
            }
        }
        None
    }

    fn by_ref_definition(
        &mut self,
        block_id: BlockId,
        call: InstrId,
        parameter: usize,
        pointee: &TypeRef,
    ) -> InstrId {
        if let Some(existing) = self.by_ref.get(&(call, parameter)) {
            return *existing;
        }
        let block = &mut self.graph.all_blocks[block_id.0];
        block.definitions.push(Instruction {
            ty: pointee.clone(),
            aux: Some(call),
            ..Instruction::default()
        });
        let id = InstrId::local(block_id, block.definitions.len() - 1);
        self.by_ref.insert((call, parameter), id);
        id
    }
}

fn variable_of(opcode: OpCode, value: &OperationValue) -> Option<Variable> {
    let (kind, implied) = opcode.variable_access()?;
    let index = implied.or(match value {
        OperationValue::Local(index) | OperationValue::Argument(index) => Some(*index),
        _ => None,
    })?;
    Some(match kind {
        VariableKind::Local => Variable::Local(index),
        VariableKind::Argument => Variable::Argument(index),
    })
}

fn entry_definitions(block: &BasicBlock) -> Definitions {
    block
        .local_defs
        .iter()
        .map(|(index, id)| (Variable::Local(*index), *id))
        .chain(
            block
                .param_defs
                .iter()
                .map(|(index, id)| (Variable::Argument(*index), *id)),
        )
        .collect()
}

/// Record `definition` as reaching the entry of `target`
fn flow_definition(
    graph: &mut ControlAndDataFlowGraph,
    target: BlockId,
    variable: Variable,
    definition: InstrId,
) {
    let block = &mut graph.all_blocks[target.0];
    let existing = match variable {
        Variable::Local(index) => block.local_defs.get(&index),
        Variable::Argument(index) => block.param_defs.get(&index),
    };

    match existing.copied() {
        Some(id) if id == definition => {}
        Some(InstrId {
            index: InstrIndex::Local(slot),
            ..
        }) => block.definitions[slot].add_incoming(definition),
        Some(_) => {}
        None => {
            block.definitions.push(Instruction::incoming(definition));
            let id = InstrId::local(target, block.definitions.len() - 1);
            match variable {
                Variable::Local(index) => block.local_defs.insert(index, id),
                Variable::Argument(index) => block.param_defs.insert(index, id),
            };
        }
    }
}

/// Type the synthetic definitions from the values flowing into them
fn type_definitions(graph: &mut ControlAndDataFlowGraph, host: &dyn MetadataHost) {
    let limit = graph.all_blocks.len() + 2;
    for _ in 0..limit {
        let mut updates = Vec::new();
        for (block_id, block) in graph.blocks() {
            for (index, definition) in block.definitions.iter().enumerate() {
                if definition.operand1.is_none() {
                    continue;
                }
                let ty = merge_types(
                    definition
                        .operands()
                        .filter_map(|id| graph.instruction(id))
                        .map(|incoming| &incoming.ty),
                    host,
                );
                if ty != definition.ty {
                    updates.push((InstrId::local(block_id, index), ty));
                }
            }
        }
        if updates.is_empty() {
            return;
        }
        for (id, ty) in updates {
            if let Some(definition) = graph.instruction_mut(id) {
                definition.ty = ty;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{decode_operations, ExceptionHandler, MethodBody},
        cdfg::{control, dataflow, types},
        host::{MethodSignature, SimpleHost},
        token::Token,
    };

    fn graph(
        body: &MethodBody,
        context: &MethodContext,
        host: &SimpleHost,
    ) -> ControlAndDataFlowGraph {
        let operations = decode_operations(&body.code).unwrap();
        let mut graph = control::infer(body, &operations, None).unwrap();
        dataflow::infer(&mut graph, context, host).unwrap();
        types::infer(&mut graph, context, host);
        infer_handlers(&mut graph).unwrap();
        infer_locals(&mut graph, context, host, true);
        graph
    }

    fn body(code: &[u8]) -> MethodBody {
        MethodBody {
            max_stack: 8,
            local_signature_token: Token(0x1100_0001),
            init_locals: true,
            code: code.to_vec(),
            exception_handlers: Vec::new(),
        }
    }

    fn finally(
        try_offset: u32,
        try_length: u32,
        handler_offset: u32,
        handler_length: u32,
    ) -> ExceptionHandler {
        ExceptionHandler {
            kind: HandlerKind::Finally,
            try_offset,
            try_length,
            handler_offset,
            handler_length,
            class_token: Token(0),
            filter_offset: 0,
        }
    }

    #[test]
    fn nested_handler_lists() {
        // try { try { nop; leave.s A } finally { endfinally } A: leave.s B } finally { endfinally } B: ret
        let mut body = body(&[0x00, 0xDE, 0x01, 0xDC, 0xDE, 0x01, 0xDC, 0x2A]);
        body.exception_handlers.push(finally(0, 3, 3, 1));
        body.exception_handlers.push(finally(0, 6, 6, 1));
        let context = MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(TypeRef::Void, Vec::new()),
            Vec::new(),
        );
        let graph = graph(&body, &context, &SimpleHost::new());

        let at = |offset| &graph.all_blocks[graph.block_at(offset).unwrap().0];
        assert_eq!(at(0).handlers, vec![0, 1]);
        assert_eq!(at(3).handlers, vec![1]);
        assert_eq!(at(3).containing_handler, Some(0));
        assert_eq!(at(4).handlers, vec![1]);
        assert_eq!(at(6).containing_handler, Some(1));
        assert!(at(7).handlers.is_empty());
        assert_eq!(at(7).containing_handler, None);
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut body = body(&[0x00, 0x00, 0x00, 0x00, 0x2A]);
        body.exception_handlers.push(finally(0, 2, 4, 1));
        body.exception_handlers.push(finally(1, 2, 4, 1));
        let operations = decode_operations(&body.code).unwrap();
        let mut graph = control::infer(&body, &operations, None).unwrap();
        assert!(matches!(
            infer_handlers(&mut graph),
            Err(Error::GraphError(_))
        ));
    }

    #[test]
    fn reads_see_their_definitions() {
        // ldarg.0; brtrue.s T; ldc.i4.0; stloc.0; br.s J; T: ldc.i4.1; stloc.0; J: ldloc.0; ret
        #[rustfmt::skip]
        let code = [0x02, 0x2D, 0x04, 0x16, 0x0A, 0x2B, 0x02, 0x17, 0x0A, 0x06, 0x2A];
        let context = MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(TypeRef::I32, vec![TypeRef::Boolean]),
            vec![TypeRef::I32],
        );
        let graph = graph(&body(&code), &context, &SimpleHost::new());

        let ldarg = graph.instruction_at(0).unwrap();
        let parameter_def = graph.instruction(ldarg).unwrap().aux.unwrap();
        assert_eq!(
            graph.instruction(parameter_def).unwrap().operand1,
            Some(InstrId {
                block: BlockId(0),
                index: InstrIndex::Parameter(0)
            })
        );
        assert_eq!(graph.parameters[0].ty, TypeRef::Boolean);

        let ldloc = graph.instruction_at(9).unwrap();
        let merge = graph.instruction(ldloc).unwrap().aux.unwrap();
        let merge = graph.instruction(merge).unwrap();
        assert!(merge.is_merge);
        let stored: Vec<u32> = merge
            .operands()
            .map(|id| graph.instruction(id).unwrap().offset().unwrap())
            .collect();
        assert_eq!(stored.len(), 2);
        assert!(stored.contains(&3) && stored.contains(&7));
        assert_eq!(merge.ty, TypeRef::I32);
    }

    #[test]
    fn by_ref_arguments_define_locals() {
        // ldloca.s 0; call M; ldloc.0; ret
        let method = Token(0x0A00_0003);
        let host = SimpleHost::new().with_method(
            method,
            MethodSignature::new(TypeRef::Void, vec![TypeRef::by_ref(TypeRef::I64)]),
        );
        #[rustfmt::skip]
        let code = [0x12, 0x00, 0x28, 0x03, 0x00, 0x00, 0x0A, 0x06, 0x2A];
        let context = MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(TypeRef::I64, Vec::new()),
            vec![TypeRef::I64],
        );
        let graph = graph(&body(&code), &context, &host);

        let ldloc = graph.instruction_at(7).unwrap();
        let definition = graph.instruction(ldloc).unwrap().aux.unwrap();
        assert_eq!(definition.index, InstrIndex::Local(0));
        let definition = graph.instruction(definition).unwrap();
        assert_eq!(definition.aux, graph.instruction_at(2));
        assert_eq!(definition.ty, TypeRef::I64);
    }

    #[test]
    fn stores_through_addresses() {
        // ldloca.s 0; ldc.i4.7; stind.i4; ldloc.0; ret
        let code = [0x12, 0x00, 0x1D, 0x54, 0x06, 0x2A];
        let context = MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(TypeRef::I32, Vec::new()),
            vec![TypeRef::I32],
        );
        let graph = graph(&body(&code), &context, &SimpleHost::new());
        let ldloc = graph.instruction_at(4).unwrap();
        assert_eq!(
            graph.instruction(ldloc).unwrap().aux,
            graph.instruction_at(2)
        );
    }

    #[test]
    fn definitions_reach_finally_handlers() {
        // try { ldc.i4.1; stloc.0; leave.s E } finally { ldloc.0; pop; endfinally } E: ret
        let mut body = body(&[0x17, 0x0A, 0xDE, 0x03, 0x06, 0x26, 0xDC, 0x2A]);
        body.exception_handlers.push(finally(0, 4, 4, 3));
        let context = MethodContext::new(
            Token(0x0600_0001),
            MethodSignature::new(TypeRef::Void, Vec::new()),
            vec![TypeRef::I32],
        );
        let graph = graph(&body, &context, &SimpleHost::new());

        let ldloc = graph.instruction_at(4).unwrap();
        let definition = graph.instruction(ldloc).unwrap().aux.unwrap();
        let operands: Vec<InstrId> = graph.instruction(definition).unwrap().operands().collect();
        assert_eq!(operands, vec![graph.instruction_at(0).unwrap()]);
    }
}
