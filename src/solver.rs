//! Pluggable satisfiability backend for pruning infeasible branch edges.
//!
//! The crate does not ship a solver. A backend implements [`SatSolver`] to build expressions
//! from graph instructions and [`SatContext`] to check conjunctions of them.
//! [`ConstraintTranslator`] turns the data flow of a [`ControlAndDataFlowGraph`] into such
//! expressions and asks the backend which edges of a conditional branch can be taken. A backend
//! that answers [`Satisfiability::Unknown`] to everything, like [`UnknownSolver`], prunes
//! nothing.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::{
    assembly::{OpCode, Operation, OperationValue},
    cdfg::{BlockId, ControlAndDataFlowGraph, InstrId},
    host::TypeRef,
};

/// Answer of [`SatContext::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfiability {
    /// Some assignment satisfies every constraint
    Satisfiable,
    /// No assignment does
    Unsatisfiable,
    /// The backend could not decide
    Unknown,
}

impl From<Option<bool>> for Satisfiability {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Satisfiability::Satisfiable,
            Some(false) => Satisfiability::Unsatisfiable,
            None => Satisfiability::Unknown,
        }
    }
}

/// Expression factory of a backend.
///
/// The `make_*` functions may return `None` for operations the backend does not model; the
/// translator then falls back to an unconstrained variable.
pub trait SatSolver {
    /// Backend expression handle
    type Expr: Clone;
    /// Backend assertion context
    type Context: SatContext<Expr = Self::Expr>;

    /// An expression for an operation without operands, typically a constant load
    fn make_constant(&self, operation: &Operation, ty: &TypeRef) -> Option<Self::Expr>;

    /// An unconstrained value of type `ty`, named by the instruction that produces it
    fn make_variable(&self, id: InstrId, ty: &TypeRef) -> Self::Expr;

    /// An expression applying a one operand operation
    fn make_unary(
        &self,
        operation: &Operation,
        ty: &TypeRef,
        operand: &Self::Expr,
    ) -> Option<Self::Expr>;

    /// An expression applying a two operand operation
    fn make_binary(
        &self,
        operation: &Operation,
        ty: &TypeRef,
        left: &Self::Expr,
        right: &Self::Expr,
    ) -> Option<Self::Expr>;

    /// `premise` implies `conclusion`
    fn make_implication(&self, premise: &Self::Expr, conclusion: &Self::Expr) -> Self::Expr;

    /// A fresh context without assertions
    fn new_context(&self) -> Self::Context;
}

/// A set of asserted constraints with checkpoints.
pub trait SatContext {
    /// Backend expression handle
    type Expr;

    /// Assert `expression`
    fn add(&mut self, expression: &Self::Expr);

    /// Assert the negation of `expression`
    fn add_inverse(&mut self, expression: &Self::Expr);

    /// Whether the assertions can hold together
    fn check(&mut self) -> Satisfiability;

    /// Remember the current assertions
    fn push_checkpoint(&mut self);

    /// Drop the assertions made since the last checkpoint. Without a checkpoint this does
    /// nothing.
    fn pop_checkpoint(&mut self);

    /// Number of checkpoints not yet popped
    fn checkpoint_count(&self) -> usize;
}

/// A backend that never decides anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownSolver;

/// Context of [`UnknownSolver`].
#[derive(Debug, Clone, Default)]
pub struct UnknownContext {
    checkpoints: usize,
}

impl SatSolver for UnknownSolver {
    type Expr = ();
    type Context = UnknownContext;

    fn make_constant(&self, _operation: &Operation, _ty: &TypeRef) -> Option<()> {
        Some(())
    }

    fn make_variable(&self, _id: InstrId, _ty: &TypeRef) {}

    fn make_unary(&self, _operation: &Operation, _ty: &TypeRef, _operand: &()) -> Option<()> {
        Some(())
    }

    fn make_binary(
        &self,
        _operation: &Operation,
        _ty: &TypeRef,
        _left: &(),
        _right: &(),
    ) -> Option<()> {
        Some(())
    }

    fn make_implication(&self, _premise: &(), _conclusion: &()) {}

    fn new_context(&self) -> UnknownContext {
        UnknownContext::default()
    }
}

impl SatContext for UnknownContext {
    type Expr = ();

    fn add(&mut self, _expression: &()) {}

    fn add_inverse(&mut self, _expression: &()) {}

    fn check(&mut self) -> Satisfiability {
        Satisfiability::Unknown
    }

    fn push_checkpoint(&mut self) {
        self.checkpoints += 1;
    }

    fn pop_checkpoint(&mut self) {
        self.checkpoints = self.checkpoints.saturating_sub(1);
    }

    fn checkpoint_count(&self) -> usize {
        self.checkpoints
    }
}

/// Translates graph instructions into backend expressions, one expression per instruction.
pub struct ConstraintTranslator<'s, S: SatSolver> {
    solver: &'s S,
    cache: HashMap<InstrId, S::Expr>,
}

impl<'s, S: SatSolver> ConstraintTranslator<'s, S> {
    /// A translator with an empty cache
    #[must_use]
    pub fn new(solver: &'s S) -> Self {
        ConstraintTranslator {
            solver,
            cache: HashMap::new(),
        }
    }

    /// Number of cached expressions
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// The expression for the value `id` produces.
    ///
    /// Operand stack entries and definitions with a single incoming value translate to that
    /// value; merges and values without a model become variables.
    pub fn expression_for(&mut self, graph: &ControlAndDataFlowGraph, id: InstrId) -> S::Expr {
        let mut visiting = HashSet::new();
        self.translate(graph, id, &mut visiting)
    }

    fn translate(
        &mut self,
        graph: &ControlAndDataFlowGraph,
        id: InstrId,
        visiting: &mut HashSet<InstrId>,
    ) -> S::Expr {
        if let Some(expression) = self.cache.get(&id) {
            return expression.clone();
        }
        let Some(instruction) = graph.instruction(id) else {
            return self.solver.make_variable(id, &TypeRef::Unknown);
        };
        if !visiting.insert(id) {
            return self.solver.make_variable(id, &instruction.ty);
        }

        let operands: Vec<InstrId> = instruction.operands().collect();
        let expression = match (&instruction.operation, operands.as_slice()) {
            (None, [single]) if !instruction.is_merge => self.translate(graph, *single, visiting),
            (None, _) => self.solver.make_variable(id, &instruction.ty),
            (Some(operation), []) => self
                .solver
                .make_constant(operation, &instruction.ty)
                .unwrap_or_else(|| self.solver.make_variable(id, &instruction.ty)),
            (Some(operation), [operand]) => {
                let operand = self.translate(graph, *operand, visiting);
                self.solver
                    .make_unary(operation, &instruction.ty, &operand)
                    .unwrap_or_else(|| self.solver.make_variable(id, &instruction.ty))
            }
            (Some(operation), [left, right]) => {
                let left = self.translate(graph, *left, visiting);
                let right = self.translate(graph, *right, visiting);
                self.solver
                    .make_binary(operation, &instruction.ty, &left, &right)
                    .unwrap_or_else(|| self.solver.make_variable(id, &instruction.ty))
            }
            (Some(_), _) => self.solver.make_variable(id, &instruction.ty),
        };

        visiting.remove(&id);
        self.cache.insert(id, expression.clone());
        expression
    }

    /// The successors of `block` that the backend can not rule out, in edge order.
    ///
    /// Only two-way conditional branches are pruned. The branch condition is asserted, or its
    /// negation for the fall through, on top of what `context` already holds; an edge is
    /// dropped only if that is [`Satisfiability::Unsatisfiable`]. `context` is left as it was
    /// found.
    pub fn feasible_successors(
        &mut self,
        graph: &ControlAndDataFlowGraph,
        block: BlockId,
        context: &mut S::Context,
    ) -> Vec<BlockId> {
        let successors = graph.successors_of(block).to_vec();
        let Some(condition) = self.branch_condition(graph, block) else {
            return successors;
        };
        let Some(branch) = graph.block(block).and_then(|block| block.last()) else {
            return successors;
        };
        let Some(target) = branch
            .operation
            .as_ref()
            .and_then(|operation| operation.targets().first())
            .and_then(|target| graph.block_at(*target))
        else {
            return successors;
        };
        if successors.len() != 2 {
            return successors;
        }

        successors
            .into_iter()
            .filter(|successor| {
                context.push_checkpoint();
                if *successor == target {
                    context.add(&condition);
                } else {
                    context.add_inverse(&condition);
                }
                let answer = context.check();
                context.pop_checkpoint();
                if answer == Satisfiability::Unsatisfiable {
                    trace!(from = ?block, to = ?successor, "infeasible edge");
                }
                answer != Satisfiability::Unsatisfiable
            })
            .collect()
    }

    /// The condition under which the conditional branch ending `block` is taken
    fn branch_condition(
        &mut self,
        graph: &ControlAndDataFlowGraph,
        block: BlockId,
    ) -> Option<S::Expr> {
        let branch = graph.block(block)?.last()?;
        let operation = branch.operation.as_ref()?;
        let index = graph.block(block)?.instructions.len() - 1;
        let id = InstrId::body(block, index);

        let (compare, negate) = match operation.opcode {
            OpCode::Brtrue | OpCode::BrtrueS => {
                return Some(self.expression_for(graph, branch.operand1?));
            }
            OpCode::Brfalse | OpCode::BrfalseS => {
                let value = self.expression_for(graph, branch.operand1?);
                let not = Operation::new(operation.offset, OpCode::Not, OperationValue::None);
                return self.solver.make_unary(&not, &TypeRef::Boolean, &value);
            }
            OpCode::Beq | OpCode::BeqS => (OpCode::Ceq, false),
            OpCode::BneUn | OpCode::BneUnS => (OpCode::Ceq, true),
            OpCode::Bgt | OpCode::BgtS => (OpCode::Cgt, false),
            OpCode::BgtUn | OpCode::BgtUnS => (OpCode::CgtUn, false),
            OpCode::Blt | OpCode::BltS => (OpCode::Clt, false),
            OpCode::BltUn | OpCode::BltUnS => (OpCode::CltUn, false),
            OpCode::Ble | OpCode::BleS => (OpCode::Cgt, true),
            OpCode::BleUn | OpCode::BleUnS => (OpCode::CgtUn, true),
            OpCode::Bge | OpCode::BgeS => (OpCode::Clt, true),
            OpCode::BgeUn | OpCode::BgeUnS => (OpCode::CltUn, true),
            _ => return None,
        };

        let right = *branch.operand2.as_slice().first()?;
        let left = self.expression_for(graph, branch.operand1?);
        let right = self.expression_for(graph, right);
        let comparison = Operation::new(operation.offset, compare, OperationValue::None);
        let condition = self
            .solver
            .make_binary(&comparison, &TypeRef::Boolean, &left, &right)
            .unwrap_or_else(|| self.solver.make_variable(id, &TypeRef::Boolean));
        if !negate {
            return Some(condition);
        }
        let not = Operation::new(operation.offset, OpCode::Not, OperationValue::None);
        self.solver.make_unary(&not, &TypeRef::Boolean, &condition)
    }
}
