//! CIL code generation with label resolution.
//!
//! [`IlGenerator`] accumulates operations whose branch targets are [`Label`]s, tracks the
//! evaluation stack depth, exception handling regions, lexical scopes, sequence points and async
//! synchronization points, and finally resolves everything into a [`GeneratedBody`].
//!
//! A generator serves one method body:
//!
//! ```text
//! new → (emit_* | mark_label | begin_*/end_* | add_*)* → [adjust_branch_sizes_to_best_fit] → finish
//! ```
//!
//! # Examples
//!
//! ```rust
//! use dotsym::{assembly::{IlGenerator, OpCode}, token::Token};
//!
//! let mut generator = IlGenerator::new(Token(0x0600_0001));
//! let done = generator.define_label();
//!
//! generator.emit(OpCode::LdcI41)?;
//! generator.emit_label(OpCode::Brtrue, done)?;
//! generator.emit(OpCode::LdcI40)?;
//! generator.emit(OpCode::Pop)?;
//! generator.mark_label(done)?;
//! generator.emit(OpCode::Ret)?;
//!
//! let body = generator.finish()?;
//! assert_eq!(body.code, vec![0x17, 0x3A, 0x02, 0x00, 0x00, 0x00, 0x16, 0x26, 0x2A]);
//! assert_eq!(body.max_stack, 1);
//! # Ok::<(), dotsym::Error>(())
//! ```

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::{
    assembly::{
        label::LabelSlot, opcodes::VariableKind, ExceptionHandler, HandlerKind, Label, MethodBody,
        OpCode, OperandKind, Operation, OperationValue, StackPop, StackPush,
    },
    pdb::{
        IteratorScope, PdbAsyncInfo, PdbConstant, PdbFunction, PdbLines, PdbScope, PdbSlot,
        SourceLocation,
    },
    token::Token,
    writer::BinaryWriter,
    Error, Result,
};

/// Operand of an operation that has not been resolved yet
#[derive(Debug, Clone, PartialEq)]
enum PendingOperand {
    None,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Token(Token),
    Local(u16),
    Argument(u16),
    Label(Label),
    Labels(Vec<Label>),
}

#[derive(Debug, Clone)]
struct PendingOperation {
    offset: u32,
    opcode: OpCode,
    operand: PendingOperand,
    location: Option<SourceLocation>,
}

impl PendingOperation {
    fn size(&self) -> u32 {
        let table = match &self.operand {
            PendingOperand::Labels(labels) => 4 * labels.len(),
            _ => 0,
        };
        (self.opcode.encoded_size() + table) as u32
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Mark { label: Label, offset: u32 },
    Op(PendingOperation),
}

#[derive(Debug, Clone)]
struct TryBody {
    start: Label,
    end: Option<Label>,
}

#[derive(Debug, Clone)]
enum TryRegion {
    Labels { start: Label, end: Label },
    Body(usize),
}

#[derive(Debug, Clone)]
struct HandlerRegion {
    kind: HandlerKind,
    class_token: Token,
    try_region: TryRegion,
    handler_start: Label,
    handler_end: Option<Label>,
    filter_start: Option<Label>,
}

#[derive(Debug, Clone)]
struct ScopeBuilder {
    start: Label,
    end: Option<Label>,
    parent: Option<usize>,
    children: Vec<usize>,
    slots: Vec<PdbSlot>,
    constants: Vec<PdbConstant>,
    used_namespaces: Vec<String>,
}

#[derive(Debug, Clone)]
struct SyncPointBuilder {
    synchronize: Label,
    continuation_method: Option<Token>,
    continuation: Label,
}

/// A sequence point of a generated body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePoint {
    /// Offset of the first operation of the span
    pub offset: u32,
    /// Source span
    pub location: SourceLocation,
}

/// An await site of an async state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynchronizationPoint {
    /// Offset where the await starts
    pub synchronize_offset: u32,
    /// Method that resumes, `None` if it is the generated method itself
    pub continuation_method: Option<Token>,
    /// Offset where execution resumes
    pub continuation_offset: u32,
}

/// Async stepping information of a generated `MoveNext` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronizationInfo {
    /// The user-visible async method
    pub kickoff_method: Token,
    /// The generated method
    pub move_next_method: Token,
    /// Start of the first handler when the async method returns void, `u32::MAX` otherwise
    pub catch_handler_offset: u32,
    /// Await sites in emission order
    pub points: Vec<SynchronizationPoint>,
}

impl SynchronizationInfo {
    /// The debug symbol form of this information
    #[must_use]
    pub fn to_async_info(&self) -> PdbAsyncInfo {
        PdbAsyncInfo {
            kickoff_method: self.kickoff_method,
            catch_handler_offset: (self.catch_handler_offset != u32::MAX)
                .then_some(self.catch_handler_offset),
            yield_offsets: self.points.iter().map(|p| p.synchronize_offset).collect(),
            resume_offsets: self.points.iter().map(|p| p.continuation_offset).collect(),
            move_next_method: self
                .points
                .iter()
                .find_map(|p| p.continuation_method)
                .unwrap_or(self.move_next_method),
        }
    }
}

/// Everything an [`IlGenerator`] produced for one method body.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedBody {
    /// Encoded code
    pub code: Vec<u8>,
    /// The operations of `code` at their final offsets
    pub operations: Vec<Operation>,
    /// Maximum tracked stack depth
    pub max_stack: u16,
    /// Exception handling clauses
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Top-level lexical scopes with their nested scopes
    pub scopes: Vec<PdbScope>,
    /// One scope per hoisted iterator local
    pub iterator_scopes: Vec<IteratorScope>,
    /// Sequence points in offset order
    pub sequence_points: Vec<SequencePoint>,
    /// Async stepping information, if [`IlGenerator::set_async_info`] was called
    pub sync_info: Option<SynchronizationInfo>,
}

impl GeneratedBody {
    /// Wrap the code and handlers in a method body
    #[must_use]
    pub fn to_method_body(&self, local_signature_token: Token, init_locals: bool) -> MethodBody {
        MethodBody {
            max_stack: self.max_stack,
            local_signature_token,
            init_locals,
            code: self.code.clone(),
            exception_handlers: self.exception_handlers.clone(),
        }
    }

    /// The async stepping information, if any
    #[must_use]
    pub fn synchronization_info(&self) -> Option<&SynchronizationInfo> {
        self.sync_info.as_ref()
    }

    /// The debug symbol form of the body: scopes, sequence points grouped by document in order
    /// of first appearance, iterator scopes and async information.
    #[must_use]
    pub fn to_pdb_function(&self, token: Token) -> PdbFunction {
        let mut lines: Vec<PdbLines> = Vec::new();
        for point in &self.sequence_points {
            let line = point.location.at(point.offset);
            match lines.iter_mut().find(|l| l.source == point.location.source) {
                Some(group) => group.lines.push(line),
                None => lines.push(PdbLines {
                    source: point.location.source,
                    lines: vec![line],
                }),
            }
        }

        PdbFunction {
            token,
            length: self.code.len() as u32,
            scopes: self.scopes.clone(),
            lines,
            async_info: self.sync_info.as_ref().map(SynchronizationInfo::to_async_info),
            iterator_class: None,
            iterator_scopes: self.iterator_scopes.clone(),
            custom_metadata: Vec::new(),
        }
    }
}

/// Generator of one CIL method body.
///
/// Offsets are assigned as operations are emitted. Branches always reference [`Label`]s; the
/// displacement is computed in [`IlGenerator::finish`], after an optional
/// [`IlGenerator::adjust_branch_sizes_to_best_fit`] pass.
///
/// The stack depth is exact as long as every call is emitted with [`IlGenerator::emit_call`].
/// Calls emitted through [`IlGenerator::emit_token`] count as neither popping nor pushing, and
/// the tracker then clamps at zero instead of reporting an underflow.
pub struct IlGenerator {
    method: Token,
    entries: Vec<Entry>,
    offset: u32,
    labels: Vec<LabelSlot>,
    labels_by_offset: HashMap<u32, Label>,
    handlers: Vec<HandlerRegion>,
    try_bodies: Vec<TryBody>,
    try_stack: Vec<usize>,
    scopes: Vec<ScopeBuilder>,
    scope_stack: Vec<usize>,
    iterator_scopes: Vec<usize>,
    pending_location: Option<SourceLocation>,
    sync_points: Vec<SyncPointBuilder>,
    async_method: Option<(Token, bool)>,
    current_stack_depth: i32,
    max_stack_depth: u16,
    unreachable: bool,
    exact_stack: bool,
}

impl IlGenerator {
    /// A generator for the body of `method`
    #[must_use]
    pub fn new(method: Token) -> Self {
        IlGenerator {
            method,
            entries: Vec::new(),
            offset: 0,
            labels: Vec::new(),
            labels_by_offset: HashMap::new(),
            handlers: Vec::new(),
            try_bodies: Vec::new(),
            try_stack: Vec::new(),
            scopes: Vec::new(),
            scope_stack: Vec::new(),
            iterator_scopes: Vec::new(),
            pending_location: None,
            sync_points: Vec::new(),
            async_method: None,
            current_stack_depth: 0,
            max_stack_depth: 0,
            unreachable: false,
            exact_stack: true,
        }
    }

    /// The method this body belongs to
    #[must_use]
    pub fn method(&self) -> Token {
        self.method
    }

    /// Offset at which the next operation will be emitted
    #[must_use]
    pub fn current_offset(&self) -> u32 {
        self.offset
    }

    /// Maximum stack depth seen so far
    #[must_use]
    pub fn max_stack(&self) -> u16 {
        self.max_stack_depth
    }

    /// Current tracked stack depth
    #[must_use]
    pub fn current_stack_depth(&self) -> i32 {
        self.current_stack_depth
    }

    /// True while a structured try body is open
    #[must_use]
    pub fn in_try_body(&self) -> bool {
        !self.try_stack.is_empty()
    }

    /// Create an unbound label
    pub fn define_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelSlot::default());
        label
    }

    /// The label standing for `offset` of the original code, created on first request
    pub fn label_for(&mut self, offset: u32) -> Label {
        if let Some(label) = self.labels_by_offset.get(&offset) {
            return *label;
        }
        let label = self.define_label();
        self.labels_by_offset.insert(offset, label);
        label
    }

    /// A label bound to `offset` outside of the emitted stream, for continuations that resume in
    /// another method
    pub(crate) fn define_bound_label(&mut self, offset: u32) -> Label {
        let label = self.define_label();
        self.labels[label.index()].offset = Some(offset);
        label
    }

    /// Number of lexical scopes currently open
    #[must_use]
    pub fn open_scope_count(&self) -> usize {
        self.scope_stack.len()
    }

    /// Offset a label is bound to, `None` while unbound
    #[must_use]
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels.get(label.index()).and_then(|slot| slot.offset)
    }

    /// Bind `label` to the current offset.
    ///
    /// # Errors
    /// Returns [`Error::LabelAlreadyMarked`] if the label is already bound and
    /// [`Error::UnmarkedLabel`] if it was not created by this generator.
    pub fn mark_label(&mut self, label: Label) -> Result<()> {
        let offset = self.offset;
        let slot = self
            .labels
            .get_mut(label.index())
            .ok_or(Error::UnmarkedLabel(label.id()))?;
        if slot.offset.is_some() {
            return Err(Error::LabelAlreadyMarked(label.id()));
        }
        slot.offset = Some(offset);

        match slot.stack_depth {
            Some(expected) if self.unreachable => {
                self.current_stack_depth = i32::from(expected);
            }
            Some(expected) => {
                if self.current_stack_depth != i32::from(expected) {
                    debug!(
                        "stack depth {} at {:?} differs from {} recorded by a branch",
                        self.current_stack_depth, label, expected
                    );
                    self.current_stack_depth = self.current_stack_depth.max(i32::from(expected));
                }
            }
            None if self.unreachable => {
                self.current_stack_depth = 0;
                slot.stack_depth = Some(0);
            }
            None => {
                slot.stack_depth = Some(self.current_stack_depth.max(0) as u16);
            }
        }
        self.unreachable = false;

        self.entries.push(Entry::Mark { label, offset });
        Ok(())
    }

    /// Set the stack depth code reaching `label` starts with
    fn set_label_stack_depth(&mut self, label: Label, depth: u16) {
        if let Some(slot) = self.labels.get_mut(label.index()) {
            slot.stack_depth = Some(depth);
        }
    }

    /// Check that `label` was created by this generator
    fn reference(&self, label: Label) -> Result<()> {
        if label.index() < self.labels.len() {
            Ok(())
        } else {
            Err(Error::UnmarkedLabel(label.id()))
        }
    }

    /// Attach a source span to the next emitted operation
    pub fn mark_sequence_point(&mut self, location: SourceLocation) {
        self.pending_location = Some(location);
    }

    fn push(&mut self, opcode: OpCode, operand: PendingOperand) {
        let operation = PendingOperation {
            offset: self.offset,
            opcode,
            operand,
            location: self.pending_location.take(),
        };
        self.offset += operation.size();
        self.entries.push(Entry::Op(operation));
    }

    fn apply_stack(&mut self, opcode: OpCode, pops: Option<u8>, pushes: Option<u8>) -> Result<()> {
        let (pop, push) = opcode.stack_behaviour();
        let pops = match (pop, pops) {
            (StackPop::Fixed(n), _) | (StackPop::Variable, Some(n)) => n,
            (StackPop::Variable, None) => {
                if opcode != OpCode::Ret {
                    self.exact_stack = false;
                }
                0
            }
        };
        let pushes = match (push, pushes) {
            (StackPush::Fixed(n), _) | (StackPush::Variable, Some(n)) => n,
            (StackPush::Variable, None) => {
                self.exact_stack = false;
                0
            }
        };

        self.current_stack_depth -= i32::from(pops);
        if self.current_stack_depth < 0 {
            if !self.unreachable && self.exact_stack {
                return Err(Error::StackUnderflow(self.offset));
            }
            self.current_stack_depth = 0;
        }
        self.current_stack_depth += i32::from(pushes);

        let depth = u16::try_from(self.current_stack_depth)
            .map_err(|_| malformed_error!("Stack depth exceeds u16 range"))?;
        self.max_stack_depth = self.max_stack_depth.max(depth);
        Ok(())
    }

    fn record_branch_depth(&mut self, opcode: OpCode, label: Label) {
        if self.unreachable {
            return;
        }
        let depth = if opcode.is_leave() {
            0
        } else {
            self.current_stack_depth.max(0) as u16
        };
        if let Some(slot) = self.labels.get_mut(label.index()) {
            match slot.stack_depth {
                None => slot.stack_depth = Some(depth),
                Some(expected) if expected != depth => {
                    debug!(
                        "branch to {:?} with stack depth {}, expected {}",
                        label, depth, expected
                    );
                    slot.stack_depth = Some(expected.max(depth));
                }
                Some(_) => {}
            }
        }
    }

    fn after_transfer(&mut self, opcode: OpCode) {
        if opcode.is_leave() {
            self.current_stack_depth = 0;
        }
        if opcode.is_unconditional_transfer() {
            self.unreachable = true;
        }
    }

    /// Emit an operation without an inline operand. The abbreviated variable and constant
    /// opcodes (`ldloc.0`, `ldc.i4.3`, ...) are accepted here.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the opcode requires an operand, and
    /// [`Error::StackUnderflow`] if the tracked stack underflows.
    pub fn emit(&mut self, opcode: OpCode) -> Result<()> {
        self.expect_operand(opcode, &[OperandKind::None])?;
        self.apply_stack(opcode, None, None)?;
        let operand = match opcode.variable_access() {
            Some((VariableKind::Local, Some(index))) => PendingOperand::Local(index),
            Some((VariableKind::Argument, Some(index))) => PendingOperand::Argument(index),
            _ => PendingOperand::None,
        };
        self.push(opcode, operand);
        self.after_transfer(opcode);
        Ok(())
    }

    /// Emit an operation with an integer operand (`ldc.i4`, `ldc.i4.s`, `unaligned.`, `no.`).
    /// `ldc.i4.s` with a value outside the `i8` range is emitted as `ldc.i4`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the opcode does not take an integer operand.
    pub fn emit_i32(&mut self, opcode: OpCode, value: i32) -> Result<()> {
        if opcode.implicit_i4().is_some() {
            return self.emit(opcode);
        }
        let opcode = if opcode == OpCode::LdcI4S && i8::try_from(value).is_err() {
            OpCode::LdcI4
        } else {
            opcode
        };
        self.expect_operand(
            opcode,
            &[
                OperandKind::Int8,
                OperandKind::UInt8,
                OperandKind::Int16,
                OperandKind::Int32,
            ],
        )?;
        self.apply_stack(opcode, None, None)?;
        self.push(opcode, PendingOperand::I32(value));
        Ok(())
    }

    /// Emit `ldc.i8`
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the opcode does not take an `i64` operand.
    pub fn emit_i64(&mut self, opcode: OpCode, value: i64) -> Result<()> {
        self.expect_operand(opcode, &[OperandKind::Int64])?;
        self.apply_stack(opcode, None, None)?;
        self.push(opcode, PendingOperand::I64(value));
        Ok(())
    }

    /// Emit `ldc.r4`
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the opcode does not take an `f32` operand.
    pub fn emit_f32(&mut self, opcode: OpCode, value: f32) -> Result<()> {
        self.expect_operand(opcode, &[OperandKind::Float32])?;
        self.apply_stack(opcode, None, None)?;
        self.push(opcode, PendingOperand::F32(value));
        Ok(())
    }

    /// Emit `ldc.r8`
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the opcode does not take an `f64` operand.
    pub fn emit_f64(&mut self, opcode: OpCode, value: f64) -> Result<()> {
        self.expect_operand(opcode, &[OperandKind::Float64])?;
        self.apply_stack(opcode, None, None)?;
        self.push(opcode, PendingOperand::F64(value));
        Ok(())
    }

    /// Emit an operation with a metadata token operand. Calls emitted this way make the stack
    /// depth approximate; use [`IlGenerator::emit_call`] when the signature is known.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the opcode does not take a token.
    pub fn emit_token(&mut self, opcode: OpCode, token: Token) -> Result<()> {
        self.expect_operand(opcode, &[OperandKind::Token])?;
        self.apply_stack(opcode, None, None)?;
        self.push(opcode, PendingOperand::Token(token));
        self.after_transfer(opcode);
        Ok(())
    }

    /// Emit a call with a known stack effect. `arg_count` includes `this` for instance calls
    /// and excludes it for `newobj`, which always pushes the new object.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for opcodes other than `call`, `callvirt`, `calli`, `newobj`
    /// and `jmp`, and [`Error::StackUnderflow`] if fewer than `arg_count` values are tracked.
    pub fn emit_call(
        &mut self,
        opcode: OpCode,
        token: Token,
        arg_count: u8,
        returns_value: bool,
    ) -> Result<()> {
        if !matches!(
            opcode,
            OpCode::Call | OpCode::Callvirt | OpCode::Calli | OpCode::Newobj | OpCode::Jmp
        ) {
            return Err(malformed_error!("{} is not a call", opcode));
        }
        let pushes = u8::from(returns_value || opcode == OpCode::Newobj);
        self.apply_stack(opcode, Some(arg_count), Some(pushes))?;
        self.push(opcode, PendingOperand::Token(token));
        self.after_transfer(opcode);
        Ok(())
    }

    /// Emit a local variable access. Abbreviated forms are accepted when `index` matches the
    /// form (`ldloc.2` with 2, `ldloc.s` with an index below 256).
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the opcode does not access a local or the index does not
    /// fit its encoding.
    pub fn emit_local(&mut self, opcode: OpCode, index: u16) -> Result<()> {
        self.emit_variable(opcode, VariableKind::Local, index)
    }

    /// Emit an argument access. See [`IlGenerator::emit_local`].
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the opcode does not access an argument or the index does
    /// not fit its encoding.
    pub fn emit_argument(&mut self, opcode: OpCode, index: u16) -> Result<()> {
        self.emit_variable(opcode, VariableKind::Argument, index)
    }

    fn emit_variable(
        &mut self,
        opcode: OpCode,
        kind: VariableKind,
        index: u16,
    ) -> Result<()> {
        match opcode.variable_access() {
            Some((actual, implied)) if actual == kind => {
                let fits = match implied {
                    Some(implied) => implied == index,
                    None => opcode.operand_kind() == OperandKind::UInt16 || index <= 0xFF,
                };
                if !fits {
                    return Err(malformed_error!(
                        "{} can not address variable {}",
                        opcode,
                        index
                    ));
                }
            }
            _ => {
                return Err(malformed_error!(
                    "{} does not access a {:?}",
                    opcode,
                    kind
                ))
            }
        }

        self.apply_stack(opcode, None, None)?;
        let operand = match kind {
            VariableKind::Local => PendingOperand::Local(index),
            VariableKind::Argument => PendingOperand::Argument(index),
        };
        self.push(opcode, operand);
        Ok(())
    }

    /// Emit a branch to `label`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the opcode is not a branch.
    pub fn emit_label(&mut self, opcode: OpCode, label: Label) -> Result<()> {
        self.expect_operand(opcode, &[OperandKind::ShortBranch, OperandKind::Branch])?;
        self.reference(label)?;
        self.apply_stack(opcode, None, None)?;
        self.record_branch_depth(opcode, label);
        self.push(opcode, PendingOperand::Label(label));
        self.after_transfer(opcode);
        Ok(())
    }

    /// Emit a `switch` over `labels`
    ///
    /// # Errors
    /// Returns [`Error::StackUnderflow`] if there is no selector on the stack.
    pub fn emit_switch(&mut self, labels: &[Label]) -> Result<()> {
        for label in labels {
            self.reference(*label)?;
        }
        self.apply_stack(OpCode::Switch, None, None)?;
        for label in labels {
            self.record_branch_depth(OpCode::Switch, *label);
        }
        self.push(OpCode::Switch, PendingOperand::Labels(labels.to_vec()));
        Ok(())
    }

    fn expect_operand(&self, opcode: OpCode, kinds: &[OperandKind]) -> Result<()> {
        if kinds.contains(&opcode.operand_kind()) {
            Ok(())
        } else {
            Err(malformed_error!(
                "{} takes a {:?} operand",
                opcode,
                opcode.operand_kind()
            ))
        }
    }

    /// Register an exception handling clause with explicit region labels. Intended for
    /// rewriting; do not mix with the structured `begin_*` helpers in one body.
    ///
    /// # Errors
    /// Returns [`Error::UnmarkedLabel`] if a label does not belong to this generator.
    #[allow(clippy::too_many_arguments)]
    pub fn add_exception_handler(
        &mut self,
        kind: HandlerKind,
        class_token: Token,
        try_start: Label,
        try_end: Label,
        handler_start: Label,
        handler_end: Label,
        filter_start: Option<Label>,
    ) -> Result<()> {
        for label in [try_start, try_end, handler_start, handler_end]
            .into_iter()
            .chain(filter_start)
        {
            self.reference(label)?;
        }

        match kind {
            HandlerKind::Catch => self.set_label_stack_depth(handler_start, 1),
            HandlerKind::Filter => {
                self.set_label_stack_depth(handler_start, 1);
                if let Some(filter) = filter_start {
                    self.set_label_stack_depth(filter, 1);
                }
            }
            HandlerKind::Finally | HandlerKind::Fault => {
                self.set_label_stack_depth(handler_start, 0);
            }
        }

        self.handlers.push(HandlerRegion {
            kind,
            class_token,
            try_region: TryRegion::Labels {
                start: try_start,
                end: try_end,
            },
            handler_start,
            handler_end: Some(handler_end),
            filter_start,
        });
        Ok(())
    }

    /// Open a try body at the current offset
    ///
    /// # Errors
    /// Propagates label errors.
    pub fn begin_try_body(&mut self) -> Result<()> {
        let start = self.define_label();
        self.mark_label(start)?;
        self.try_bodies.push(TryBody { start, end: None });
        self.try_stack.push(self.try_bodies.len() - 1);
        Ok(())
    }

    fn begin_handler(&mut self, kind: HandlerKind) -> Result<usize> {
        let Some(&body) = self.try_stack.last() else {
            return Err(Error::ScopeMismatch(format!(
                "{kind:?} handler outside of a try body"
            )));
        };

        let handler_start = self.define_label();
        let depth = u16::from(matches!(kind, HandlerKind::Catch | HandlerKind::Filter));
        self.set_label_stack_depth(handler_start, depth);
        self.unreachable = true;
        self.mark_label(handler_start)?;
        self.reference(handler_start)?;

        if self.try_bodies[body].end.is_none() {
            self.try_bodies[body].end = Some(handler_start);
        } else if let Some(open) = self.handlers.iter_mut().rev().find(|h| h.handler_end.is_none())
        {
            open.handler_end = Some(handler_start);
        }

        self.handlers.push(HandlerRegion {
            kind,
            class_token: Token(0),
            try_region: TryRegion::Body(body),
            handler_start,
            handler_end: None,
            filter_start: None,
        });
        Ok(self.handlers.len() - 1)
    }

    /// Start a catch handler for `class_token` in the innermost try body
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a try body.
    pub fn begin_catch_block(&mut self, class_token: Token) -> Result<()> {
        let index = self.begin_handler(HandlerKind::Catch)?;
        self.handlers[index].class_token = class_token;
        Ok(())
    }

    /// Start the filter decision code of a filter handler
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a try body.
    pub fn begin_filter_block(&mut self) -> Result<()> {
        let index = self.begin_handler(HandlerKind::Filter)?;
        self.handlers[index].filter_start = Some(self.handlers[index].handler_start);
        Ok(())
    }

    /// End the filter decision code with `endfilter` and start the filter's handler
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if the last handler is not a filter.
    pub fn begin_filter_body(&mut self) -> Result<()> {
        if !self
            .handlers
            .last()
            .is_some_and(|h| h.kind == HandlerKind::Filter)
        {
            return Err(Error::ScopeMismatch(
                "filter body without a filter block".to_string(),
            ));
        }

        self.emit(OpCode::Endfilter)?;
        let handler_start = self.define_label();
        self.set_label_stack_depth(handler_start, 1);
        self.mark_label(handler_start)?;
        self.reference(handler_start)?;
        if let Some(handler) = self.handlers.last_mut() {
            handler.handler_start = handler_start;
        }
        Ok(())
    }

    /// Start a fault handler in the innermost try body
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a try body.
    pub fn begin_fault_block(&mut self) -> Result<()> {
        self.begin_handler(HandlerKind::Fault).map(|_| ())
    }

    /// Start a finally handler in the innermost try body
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a try body.
    pub fn begin_finally_block(&mut self) -> Result<()> {
        self.begin_handler(HandlerKind::Finally).map(|_| ())
    }

    /// Close the innermost try body and its last handler at the current offset
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if no try body is open.
    pub fn end_try_body(&mut self) -> Result<()> {
        if self.try_stack.pop().is_none() {
            return Err(Error::ScopeMismatch("no open try body".to_string()));
        }
        if self.handlers.is_empty() {
            return Ok(());
        }

        let handler_end = self.define_label();
        self.mark_label(handler_end)?;
        self.reference(handler_end)?;
        if let Some(index) = self.handlers.iter().rposition(|h| h.handler_end.is_none()) {
            let mut handler = self.handlers.remove(index);
            handler.handler_end = Some(handler_end);
            self.handlers.push(handler);
        }
        Ok(())
    }

    /// Open a lexical scope at the current offset
    ///
    /// # Errors
    /// Propagates label errors.
    pub fn begin_scope(&mut self) -> Result<()> {
        let start = self.define_label();
        self.mark_label(start)?;
        self.reference(start)?;
        let parent = self.scope_stack.last().copied();
        self.scopes.push(ScopeBuilder {
            start,
            end: None,
            parent,
            children: Vec::new(),
            slots: Vec::new(),
            constants: Vec::new(),
            used_namespaces: Vec::new(),
        });
        let index = self.scopes.len() - 1;
        if let Some(parent) = parent {
            self.scopes[parent].children.push(index);
        }
        self.scope_stack.push(index);
        Ok(())
    }

    /// Close the innermost lexical scope at the current offset
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if no scope is open.
    pub fn end_scope(&mut self) -> Result<()> {
        let index = self
            .scope_stack
            .pop()
            .ok_or_else(|| Error::ScopeMismatch("no open scope".to_string()))?;
        let end = self.define_label();
        self.mark_label(end)?;
        self.reference(end)?;
        self.scopes[index].end = Some(end);
        Ok(())
    }

    /// Open a scope that holds `hoisted_locals` iterator locals; the scope is recorded once per
    /// local as an iterator scope.
    ///
    /// # Errors
    /// Propagates label errors.
    pub fn begin_iterator_scope(&mut self, hoisted_locals: u32) -> Result<()> {
        self.begin_scope()?;
        let index = self.scopes.len() - 1;
        for _ in 0..hoisted_locals {
            self.iterator_scopes.push(index);
        }
        Ok(())
    }

    /// Close an iterator scope
    ///
    /// # Errors
    /// Propagates label errors.
    pub fn end_iterator_scope(&mut self) -> Result<()> {
        self.end_scope()
    }

    fn top_scope(&mut self) -> Result<&mut ScopeBuilder> {
        if self.scope_stack.is_empty() {
            self.begin_scope()?;
        }
        let index = *self
            .scope_stack
            .last()
            .ok_or_else(|| Error::ScopeMismatch("no open scope".to_string()))?;
        Ok(&mut self.scopes[index])
    }

    /// Add a local to the innermost scope, opening one if none is open
    ///
    /// # Errors
    /// Propagates label errors.
    pub fn add_variable(&mut self, slot: PdbSlot) -> Result<()> {
        self.top_scope()?.slots.push(slot);
        Ok(())
    }

    /// Add a constant to the innermost scope, opening one if none is open
    ///
    /// # Errors
    /// Propagates label errors.
    pub fn add_constant(&mut self, constant: PdbConstant) -> Result<()> {
        self.top_scope()?.constants.push(constant);
        Ok(())
    }

    /// Record a `using` directive in the innermost scope, opening one if none is open
    ///
    /// # Errors
    /// Propagates label errors.
    pub fn use_namespace(&mut self, namespace: &str) -> Result<()> {
        self.top_scope()?.used_namespaces.push(namespace.to_string());
        Ok(())
    }

    /// Declare the body an async state machine `MoveNext` for `kickoff_method`
    pub fn set_async_info(&mut self, kickoff_method: Token, returns_void: bool) {
        self.async_method = Some((kickoff_method, returns_void));
    }

    /// Mark the current offset as the start of an await that resumes at `continuation_label`,
    /// in `continuation_method` or this method when `None`
    ///
    /// # Errors
    /// Propagates label errors.
    pub fn mark_synchronization_point(
        &mut self,
        continuation_method: Option<Token>,
        continuation_label: Label,
    ) -> Result<()> {
        let synchronize = self.define_label();
        let depth = self.current_stack_depth;
        let unreachable = self.unreachable;
        self.mark_label(synchronize)?;
        self.current_stack_depth = depth;
        self.unreachable = unreachable;
        self.reference(synchronize)?;
        self.reference(continuation_label)?;
        self.sync_points.push(SyncPointBuilder {
            synchronize,
            continuation_method: continuation_method.filter(|m| *m != self.method),
            continuation: continuation_label,
        });
        Ok(())
    }

    /// Convert long branches to short ones where the target is in range, repeating until no
    /// branch changes. Decisions use the offsets at the start of each pass, so a branch that is
    /// shortened never has to grow again.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if a short branch was emitted whose target is out of range.
    pub fn adjust_branch_sizes_to_best_fit(&mut self) -> Result<()> {
        loop {
            let mut adjustment: i64 = 0;
            let mut adjusted = 0u32;

            for entry in &mut self.entries {
                match entry {
                    Entry::Mark { label, offset } => {
                        *offset = (i64::from(*offset) + adjustment) as u32;
                        self.labels[label.index()].offset = Some(*offset);
                    }
                    Entry::Op(operation) => {
                        let old_offset = operation.offset;
                        let new_offset = (i64::from(old_offset) + adjustment) as u32;
                        operation.offset = new_offset;

                        let PendingOperand::Label(label) = operation.operand else {
                            continue;
                        };
                        let Some(target) = self.labels[label.index()].offset else {
                            continue;
                        };

                        let forward = target >= old_offset;
                        let short_ok = if forward {
                            target - old_offset <= 129
                        } else {
                            new_offset.saturating_sub(target) <= 126
                        };

                        if short_ok {
                            if let Some(short) = operation.opcode.short_form() {
                                operation.opcode = short;
                                adjusted += 1;
                                adjustment -= 3;
                            }
                        } else if operation.opcode.long_form() != operation.opcode {
                            return Err(malformed_error!(
                                "{} at 0x{:04X} can not reach 0x{:04X}",
                                operation.opcode,
                                old_offset,
                                target
                            ));
                        }
                    }
                }
            }

            self.offset = (i64::from(self.offset) + adjustment) as u32;
            if adjusted == 0 {
                return Ok(());
            }
            debug!("shortened {} branches, code shrank by {}", adjusted, -adjustment);
        }
    }

    fn resolve(&self, label: Label) -> Result<u32> {
        self.label_offset(label)
            .ok_or(Error::UnmarkedLabel(label.id()))
    }

    /// Resolve all labels and encode the body.
    ///
    /// # Errors
    /// Returns [`Error::UnmarkedLabel`] if a label was never bound,
    /// [`Error::ScopeMismatch`] if a scope or try body is still open, and
    /// [`Error::Malformed`] if a short branch can not reach its target.
    pub fn finish(self) -> Result<GeneratedBody> {
        if !self.scope_stack.is_empty() {
            return Err(Error::ScopeMismatch(format!(
                "{} scopes still open",
                self.scope_stack.len()
            )));
        }
        if !self.try_stack.is_empty() {
            return Err(Error::ScopeMismatch(format!(
                "{} try bodies still open",
                self.try_stack.len()
            )));
        }
        for (index, slot) in self.labels.iter().enumerate() {
            if slot.offset.is_none() {
                return Err(Error::UnmarkedLabel(index as u32));
            }
        }

        let mut writer = BinaryWriter::new();
        let mut operations = Vec::new();
        let mut sequence_points = Vec::new();
        for entry in &self.entries {
            let Entry::Op(pending) = entry else {
                continue;
            };

            let value = match &pending.operand {
                PendingOperand::None => match pending.opcode.implicit_i4() {
                    Some(constant) => OperationValue::I32(constant),
                    None => OperationValue::None,
                },
                PendingOperand::I32(v) => OperationValue::I32(*v),
                PendingOperand::I64(v) => OperationValue::I64(*v),
                PendingOperand::F32(v) => OperationValue::F32(*v),
                PendingOperand::F64(v) => OperationValue::F64(*v),
                PendingOperand::Token(token) => OperationValue::Token(*token),
                PendingOperand::Local(index) => OperationValue::Local(*index),
                PendingOperand::Argument(index) => OperationValue::Argument(*index),
                PendingOperand::Label(label) => OperationValue::Target(self.resolve(*label)?),
                PendingOperand::Labels(labels) => OperationValue::Switch(
                    labels
                        .iter()
                        .map(|label| self.resolve(*label))
                        .collect::<Result<Vec<u32>>>()?,
                ),
            };

            let operation = Operation::new(pending.offset, pending.opcode, value);
            operation.write_to(&mut writer)?;
            if let Some(location) = pending.location {
                sequence_points.push(SequencePoint {
                    offset: pending.offset,
                    location,
                });
            }
            operations.push(operation);
        }

        let mut exception_handlers = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            let (try_start, try_end) = match &handler.try_region {
                TryRegion::Labels { start, end } => (*start, Some(*end)),
                TryRegion::Body(index) => {
                    (self.try_bodies[*index].start, self.try_bodies[*index].end)
                }
            };
            let try_offset = self.resolve(try_start)?;
            let try_end = try_end.ok_or_else(|| {
                Error::ScopeMismatch("try body without a handler".to_string())
            })?;
            let handler_offset = self.resolve(handler.handler_start)?;
            let handler_end = handler
                .handler_end
                .ok_or_else(|| Error::ScopeMismatch("handler without an end".to_string()))?;

            exception_handlers.push(ExceptionHandler {
                kind: handler.kind,
                try_offset,
                try_length: self.resolve(try_end)?.saturating_sub(try_offset),
                handler_offset,
                handler_length: self.resolve(handler_end)?.saturating_sub(handler_offset),
                class_token: handler.class_token,
                filter_offset: match handler.filter_start {
                    Some(filter) => self.resolve(filter)?,
                    None => 0,
                },
            });
        }

        let scopes = self
            .scopes
            .iter()
            .enumerate()
            .filter(|(_, scope)| scope.parent.is_none())
            .map(|(index, _)| self.build_scope(index))
            .collect::<Result<Vec<PdbScope>>>()?;

        let iterator_scopes = self
            .iterator_scopes
            .iter()
            .map(|index| {
                let scope = self.build_scope_bounds(*index)?;
                Ok(IteratorScope {
                    offset: scope.0,
                    length: scope.1,
                })
            })
            .collect::<Result<Vec<IteratorScope>>>()?;

        let sync_info = match self.async_method {
            Some((kickoff_method, returns_void)) => {
                let catch_handler_offset = match exception_handlers.first() {
                    Some(handler) if returns_void => handler.handler_offset,
                    _ => u32::MAX,
                };
                let points = self
                    .sync_points
                    .iter()
                    .map(|point| {
                        Ok(SynchronizationPoint {
                            synchronize_offset: self.resolve(point.synchronize)?,
                            continuation_method: point.continuation_method,
                            continuation_offset: self.resolve(point.continuation)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(SynchronizationInfo {
                    kickoff_method,
                    move_next_method: self.method,
                    catch_handler_offset,
                    points,
                })
            }
            None => None,
        };

        trace!(
            "generated {} bytes, {} operations, max stack {} for {}",
            writer.len(),
            operations.len(),
            self.max_stack_depth,
            self.method
        );

        Ok(GeneratedBody {
            code: writer.into_vec(),
            operations,
            max_stack: self.max_stack_depth,
            exception_handlers,
            scopes,
            iterator_scopes,
            sequence_points,
            sync_info,
        })
    }

    fn build_scope_bounds(&self, index: usize) -> Result<(u32, u32)> {
        let scope = &self.scopes[index];
        let start = self.resolve(scope.start)?;
        let end = match scope.end {
            Some(end) => self.resolve(end)?,
            None => self.offset,
        };
        Ok((start, end.saturating_sub(start)))
    }

    fn build_scope(&self, index: usize) -> Result<PdbScope> {
        let (offset, length) = self.build_scope_bounds(index)?;
        let scope = &self.scopes[index];
        Ok(PdbScope {
            offset,
            length,
            slots: scope.slots.clone(),
            constants: scope.constants.clone(),
            used_namespaces: scope.used_namespaces.clone(),
            scopes: scope
                .children
                .iter()
                .map(|child| self.build_scope(*child))
                .collect::<Result<Vec<PdbScope>>>()?,
        })
    }
}
