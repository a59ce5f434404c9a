//! Re-emission of an existing method body through [`IlGenerator`].
//!
//! The rewriter replays decoded [`Operation`]s into a fresh generator, so branch displacements,
//! exception regions, lexical scopes and async synchronization points are recomputed from labels
//! rather than copied. Short branches are widened and abbreviated variable opcodes are replaced
//! by their canonical long forms, which keeps the result valid when callers later insert code or
//! renumber locals.
//!
//! # Examples
//!
//! ```rust
//! use dotsym::{
//!     assembly::{decode_operations, IlRewriter, MethodBody, RewriterOptions},
//!     token::Token,
//! };
//!
//! // ldloc.0; brtrue.s +0; ret
//! let body = MethodBody::parse(&[0x12, 0x06, 0x2D, 0x00, 0x2A])?;
//! let operations = decode_operations(&body.code)?;
//!
//! let rewritten = IlRewriter::new(Token(0x0600_0001), RewriterOptions::default())
//!     .rewrite(&body, &operations, None)?;
//!
//! // ldloc 0; brtrue +0; ret
//! assert_eq!(
//!     rewritten.body.code,
//!     vec![0xFE, 0x0C, 0x00, 0x00, 0x3A, 0x00, 0x00, 0x00, 0x00, 0x2A]
//! );
//! assert_eq!(rewritten.locals, vec![0]);
//! # Ok::<(), dotsym::Error>(())
//! ```

use std::collections::HashSet;

use tracing::debug;

use crate::{
    assembly::{
        GeneratedBody, HandlerKind, IlGenerator, Label, MethodBody, OpCode, Operation,
        OperationValue,
    },
    pdb::{
        IteratorScope, PdbAsyncInfo, PdbConstant, PdbFunction, PdbScope, PdbSlot, SourceLocation,
    },
    token::Token,
    Result,
};

/// Source of the lexical scope information replayed by [`IlRewriter`].
///
/// Scopes are returned in pre-order, so an enclosing scope precedes the scopes it contains.
pub trait LocalScopeProvider {
    /// All lexical scopes of the method, pre-order
    fn local_scopes(&self) -> Vec<&PdbScope>;

    /// Namespaces imported by the method
    fn namespace_scopes(&self) -> Vec<&str>;

    /// Constants declared directly in `scope`
    fn constants_in<'a>(&'a self, scope: &'a PdbScope) -> &'a [PdbConstant] {
        &scope.constants
    }

    /// Locals declared directly in `scope`
    fn variables_in<'a>(&'a self, scope: &'a PdbScope) -> &'a [PdbSlot] {
        &scope.slots
    }

    /// Async stepping information, if the method is an async `MoveNext`
    fn sync_info(&self) -> Option<&PdbAsyncInfo>;

    /// Scopes of hoisted iterator locals, in offset order
    fn iterator_scopes(&self) -> &[IteratorScope];

    /// The source span starting at `offset`
    fn location_at(&self, _offset: u32) -> Option<SourceLocation> {
        None
    }
}

impl LocalScopeProvider for PdbFunction {
    fn local_scopes(&self) -> Vec<&PdbScope> {
        self.all_scopes()
    }

    fn namespace_scopes(&self) -> Vec<&str> {
        self.all_scopes()
            .into_iter()
            .flat_map(|scope| scope.used_namespaces.iter().map(String::as_str))
            .collect()
    }

    fn sync_info(&self) -> Option<&PdbAsyncInfo> {
        self.async_info.as_ref()
    }

    fn iterator_scopes(&self) -> &[IteratorScope] {
        &self.iterator_scopes
    }

    fn location_at(&self, offset: u32) -> Option<SourceLocation> {
        self.lines.iter().find_map(|lines| {
            lines
                .lines
                .iter()
                .find(|line| line.offset == offset)
                .map(|line| SourceLocation {
                    source: lines.source,
                    start_line: line.line_begin,
                    start_column: line.col_begin,
                    end_line: line.line_end,
                    end_column: line.col_end,
                })
        })
    }
}

/// Controls what the rewriter replays besides the code itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriterOptions {
    /// Replay lexical scopes, locals, constants and namespaces
    pub emit_scopes: bool,
    /// Replay async synchronization points
    pub emit_sync_points: bool,
    /// Replace abbreviated variable opcodes with `ldloc`, `stloc`, `ldarg`, ... forms
    pub canonicalize_locals: bool,
}

impl RewriterOptions {
    /// Options that replay everything
    #[must_use]
    pub fn new() -> Self {
        RewriterOptions {
            emit_scopes: true,
            emit_sync_points: true,
            canonicalize_locals: true,
        }
    }

    /// Options that only re-encode the code, keeping variable opcodes as they are
    #[must_use]
    pub fn code_only() -> Self {
        RewriterOptions {
            emit_scopes: false,
            emit_sync_points: false,
            canonicalize_locals: false,
        }
    }
}

impl Default for RewriterOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [`IlRewriter::rewrite`]
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenBody {
    /// The new method body; `max_stack` is the larger of the original and the computed value
    pub body: MethodBody,
    /// Local indices in order of first appearance
    pub locals: Vec<u16>,
    /// Everything the generator produced, including scopes and sequence points
    pub generated: GeneratedBody,
}

/// Re-emits one method body through an [`IlGenerator`].
pub struct IlRewriter {
    generator: IlGenerator,
    options: RewriterOptions,
    locals: Vec<u16>,
    seen_locals: HashSet<u16>,
    scope_stack: Vec<u32>,
}

impl IlRewriter {
    /// A rewriter for the body of `method`
    #[must_use]
    pub fn new(method: Token, options: RewriterOptions) -> Self {
        IlRewriter {
            generator: IlGenerator::new(method),
            options,
            locals: Vec::new(),
            seen_locals: HashSet::new(),
            scope_stack: Vec::new(),
        }
    }

    /// Rewrite `body`, whose code decodes to `operations`.
    ///
    /// # Arguments
    /// * `body` - The original body, for handlers, local signature and flags
    /// * `operations` - The decoded code of `body`
    /// * `scope_provider` - Debug information to replay, if any
    ///
    /// # Errors
    /// Returns [`crate::Error::UnmarkedLabel`] if a branch or handler offset does not fall on an
    /// instruction boundary, and propagates generator errors.
    pub fn rewrite(
        mut self,
        body: &MethodBody,
        operations: &[Operation],
        scope_provider: Option<&dyn LocalScopeProvider>,
    ) -> Result<RewrittenBody> {
        let provider = if self.options.emit_scopes {
            scope_provider
        } else {
            None
        };

        for handler in &body.exception_handlers {
            let try_start = self.generator.label_for(handler.try_offset);
            let try_end = self.generator.label_for(handler.try_end());
            let handler_start = self.generator.label_for(handler.handler_offset);
            let handler_end = self.generator.label_for(handler.handler_end());
            let filter_start = (handler.kind == HandlerKind::Filter)
                .then(|| self.generator.label_for(handler.filter_offset));
            self.generator.add_exception_handler(
                handler.kind,
                handler.class_token,
                try_start,
                try_end,
                handler_start,
                handler_end,
                filter_start,
            )?;
        }

        for operation in operations {
            for target in operation.targets() {
                self.generator.label_for(*target);
            }
        }

        let mut scopes: Vec<&PdbScope> = Vec::new();
        let mut iterator_scopes: &[IteratorScope] = &[];
        let mut namespaces: Vec<&str> = Vec::new();
        let mut sync_points: Vec<(u32, u32)> = Vec::new();
        let mut continuation_method = None;

        match provider {
            Some(provider) => {
                scopes = provider.local_scopes();
                iterator_scopes = provider.iterator_scopes();
                namespaces = provider.namespace_scopes();
            }
            None if self.options.emit_scopes => self.generator.begin_scope()?,
            None => {}
        }

        if self.options.emit_sync_points {
            if let Some(info) = scope_provider.and_then(|provider| provider.sync_info()) {
                self.generator
                    .set_async_info(info.kickoff_method, info.catch_handler_offset.is_some());
                sync_points = info
                    .yield_offsets
                    .iter()
                    .copied()
                    .zip(info.resume_offsets.iter().copied())
                    .collect();
                continuation_method = Some(info.move_next_method)
                    .filter(|method| *method != self.generator.method());
            }
        }

        let mut scopes = scopes.into_iter().peekable();
        let mut iterator_scopes = iterator_scopes.iter().peekable();
        let mut sync_points = sync_points.into_iter().peekable();

        for operation in operations {
            let label = self.generator.label_for(operation.offset);
            self.generator.mark_label(label)?;

            if let Some(provider) = provider {
                while let Some(&end) = self.scope_stack.last() {
                    if operation.offset < end {
                        break;
                    }
                    self.scope_stack.pop();
                    self.generator.end_scope()?;
                }

                while let Some(scope) = scopes.next_if(|scope| {
                    scope.offset <= operation.offset && operation.offset < scope.end()
                }) {
                    let mut hoisted = 0;
                    while iterator_scopes
                        .next_if(|iterator| {
                            iterator.offset >= scope.offset
                                && iterator.offset + iterator.length <= scope.end()
                        })
                        .is_some()
                    {
                        hoisted += 1;
                    }
                    self.generator.begin_iterator_scope(hoisted)?;
                    self.scope_stack.push(scope.end());

                    if !namespaces.is_empty() && scope.offset == 0 {
                        for namespace in namespaces.drain(..) {
                            self.generator.use_namespace(namespace)?;
                        }
                    }
                    for slot in provider.variables_in(scope) {
                        if let Ok(index) = u16::try_from(slot.index) {
                            self.track_local(index);
                        }
                        self.generator.add_variable(slot.clone())?;
                    }
                    for constant in provider.constants_in(scope) {
                        self.generator.add_constant(constant.clone())?;
                    }
                }

                for namespace in namespaces.drain(..) {
                    self.generator.use_namespace(namespace)?;
                }

                if let Some(location) = provider.location_at(operation.offset) {
                    self.generator.mark_sequence_point(location);
                }
            }

            if let Some((_, resume)) = sync_points.next_if(|(sync, _)| *sync == operation.offset)
            {
                let continuation = match continuation_method {
                    Some(_) => self.generator.define_bound_label(resume),
                    None => self.generator.label_for(resume),
                };
                self.generator
                    .mark_synchronization_point(continuation_method, continuation)?;
            }

            self.emit_operation(operation)?;
        }

        // Regions may end at the end of the code
        let end_offset = body.code.len() as u32;
        if operations.last().map_or(0, Operation::next_offset) == end_offset {
            let end = self.generator.label_for(end_offset);
            if self.generator.label_offset(end).is_none() {
                self.generator.mark_label(end)?;
            }
        }

        if provider.is_none() && self.options.emit_scopes {
            for index in self.locals.clone() {
                self.generator.add_variable(PdbSlot {
                    index: u32::from(index),
                    name: format!("V_{index}"),
                    compiler_generated: false,
                    signature_token: body.local_signature_token,
                })?;
            }
        }
        while self.generator.open_scope_count() > 0 {
            self.generator.end_scope()?;
        }

        let generated = self.generator.finish()?;
        let mut new_body = generated.to_method_body(body.local_signature_token, body.init_locals);
        new_body.max_stack = new_body.max_stack.max(body.max_stack);

        debug!(
            "rewrote {} bytes into {} bytes, {} locals",
            body.code.len(),
            new_body.code.len(),
            self.locals.len()
        );

        Ok(RewrittenBody {
            body: new_body,
            locals: self.locals,
            generated,
        })
    }

    fn track_local(&mut self, index: u16) {
        if self.seen_locals.insert(index) {
            self.locals.push(index);
        }
    }

    fn emit_operation(&mut self, operation: &Operation) -> Result<()> {
        let opcode = operation.opcode;
        match &operation.value {
            OperationValue::Target(target) => {
                let label = self.generator.label_for(*target);
                self.generator.emit_label(opcode.long_form(), label)
            }
            OperationValue::Switch(targets) => {
                let labels: Vec<Label> = targets
                    .iter()
                    .map(|target| self.generator.label_for(*target))
                    .collect();
                self.generator.emit_switch(&labels)
            }
            OperationValue::Local(index) => {
                self.track_local(*index);
                let opcode = self.variable_opcode(opcode);
                self.generator.emit_local(opcode, *index)
            }
            OperationValue::Argument(index) => {
                let opcode = self.variable_opcode(opcode);
                self.generator.emit_argument(opcode, *index)
            }
            OperationValue::I32(_) if opcode.implicit_i4().is_some() => self.generator.emit(opcode),
            OperationValue::I32(value) => self.generator.emit_i32(opcode, *value),
            OperationValue::I64(value) => self.generator.emit_i64(opcode, *value),
            OperationValue::F32(value) => self.generator.emit_f32(opcode, *value),
            OperationValue::F64(value) => self.generator.emit_f64(opcode, *value),
            OperationValue::Token(token) => self.generator.emit_token(opcode, *token),
            OperationValue::None => self.generator.emit(opcode),
        }
    }

    fn variable_opcode(&self, opcode: OpCode) -> OpCode {
        if self.options.canonicalize_locals {
            opcode.canonical_variable_form()
        } else {
            opcode
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{decode_operations, ExceptionHandler},
        pdb::{PdbLine, PdbLines},
    };

    const METHOD: Token = Token(0x0600_0001);

    fn rewrite(
        body: &MethodBody,
        provider: Option<&dyn LocalScopeProvider>,
        options: RewriterOptions,
    ) -> RewrittenBody {
        let operations = decode_operations(&body.code).unwrap();
        IlRewriter::new(METHOD, options)
            .rewrite(body, &operations, provider)
            .unwrap()
    }

    fn body(code: Vec<u8>) -> MethodBody {
        MethodBody {
            max_stack: 8,
            local_signature_token: Token(0x1100_0001),
            init_locals: true,
            code,
            exception_handlers: Vec::new(),
        }
    }

    #[test]
    fn widens_branches_and_canonicalizes() {
        // ldarg.0; brfalse.s L; ldc.i4.1; stloc.1; L: ldloc.1; ret
        let original = body(vec![0x02, 0x2C, 0x02, 0x17, 0x0B, 0x07, 0x2A]);
        let rewritten = rewrite(&original, None, RewriterOptions::default());
        let operations = decode_operations(&rewritten.body.code).unwrap();

        let opcodes: Vec<OpCode> = operations.iter().map(|op| op.opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                OpCode::Ldarg,
                OpCode::Brfalse,
                OpCode::LdcI41,
                OpCode::Stloc,
                OpCode::Ldloc,
                OpCode::Ret
            ]
        );
        assert_eq!(operations[1].value, OperationValue::Target(operations[4].offset));
        assert_eq!(rewritten.locals, vec![1]);
        assert_eq!(rewritten.body.max_stack, 8);
        assert!(rewritten.body.init_locals);

        let scope = &rewritten.generated.scopes[0];
        assert_eq!((scope.offset, scope.length), (0, rewritten.body.code.len() as u32));
        assert_eq!(scope.slots[0].name, "V_1");
    }

    #[test]
    fn code_only_keeps_variable_forms() {
        let original = body(vec![0x02, 0x2C, 0x02, 0x17, 0x0B, 0x07, 0x2A]);
        let rewritten = rewrite(&original, None, RewriterOptions::code_only());
        assert_eq!(
            rewritten.body.code,
            vec![0x02, 0x39, 0x02, 0x00, 0x00, 0x00, 0x17, 0x0B, 0x07, 0x2A]
        );
        assert!(rewritten.generated.scopes.is_empty());
    }

    #[test]
    fn handler_regions_follow_code() {
        // try { nop; leave.s END } catch { pop; leave.s END } END: ret
        let mut original = body(vec![0x00, 0xDE, 0x03, 0x26, 0xDE, 0x00, 0x2A]);
        original.exception_handlers.push(ExceptionHandler {
            kind: HandlerKind::Catch,
            try_offset: 0,
            try_length: 3,
            handler_offset: 3,
            handler_length: 3,
            class_token: Token(0x0100_0001),
            filter_offset: 0,
        });

        let rewritten = rewrite(&original, None, RewriterOptions::code_only());
        // nop; leave(5); pop; leave(5); ret
        let handler = &rewritten.body.exception_handlers[0];
        assert_eq!((handler.try_offset, handler.try_length), (0, 6));
        assert_eq!((handler.handler_offset, handler.handler_length), (6, 6));
        assert_eq!(handler.class_token, Token(0x0100_0001));
    }

    #[test]
    fn handler_ending_at_code_end() {
        // try { nop; leave.s +1 } finally { endfinally }
        let mut original = body(vec![0x00, 0xDE, 0x01, 0xDC]);
        original.exception_handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_offset: 0,
            try_length: 3,
            handler_offset: 3,
            handler_length: 1,
            class_token: Token(0),
            filter_offset: 0,
        });

        let rewritten = rewrite(&original, None, RewriterOptions::code_only());
        let handler = &rewritten.body.exception_handlers[0];
        assert_eq!(handler.handler_end(), rewritten.body.code.len() as u32);
    }

    #[test]
    fn replays_scopes_and_lines() {
        // nop x 4; ret
        let original = body(vec![0x00, 0x00, 0x00, 0x00, 0x2A]);
        let mut function = PdbFunction::new(METHOD);
        let mut outer = PdbScope::new(0, 5);
        outer.used_namespaces.push("System".to_string());
        let mut inner = PdbScope::new(1, 2);
        inner.slots.push(PdbSlot {
            index: 2,
            name: "x".to_string(),
            compiler_generated: false,
            signature_token: Token(0x1100_0001),
        });
        outer.scopes.push(inner);
        function.scopes.push(outer);
        function.lines.push(PdbLines {
            source: 0,
            lines: vec![PdbLine {
                offset: 1,
                line_begin: 10,
                col_begin: 5,
                line_end: 10,
                col_end: 12,
            }],
        });

        let rewritten = rewrite(&original, Some(&function), RewriterOptions::default());
        assert_eq!(rewritten.generated.scopes, function.scopes);
        assert_eq!(rewritten.locals, vec![2]);

        let replayed = rewritten.generated.to_pdb_function(METHOD);
        assert_eq!(replayed.lines, function.lines);
    }

    #[test]
    fn replays_synchronization_points() {
        // nop; nop; nop; ret
        let original = body(vec![0x00, 0x00, 0x00, 0x2A]);
        let mut function = PdbFunction::new(METHOD);
        function.async_info = Some(PdbAsyncInfo {
            kickoff_method: Token(0x0600_0009),
            catch_handler_offset: None,
            yield_offsets: vec![1],
            resume_offsets: vec![3],
            move_next_method: METHOD,
        });

        let rewritten = rewrite(&original, Some(&function), RewriterOptions::default());
        let info = rewritten.generated.synchronization_info().unwrap();
        assert_eq!(info.kickoff_method, Token(0x0600_0009));
        assert_eq!(info.catch_handler_offset, u32::MAX);
        assert_eq!(info.points[0].synchronize_offset, 1);
        assert_eq!(info.points[0].continuation_offset, 3);
        assert_eq!(info.to_async_info(), function.async_info.unwrap());
    }

    #[test]
    fn branch_into_instruction_is_rejected() {
        // br.s into the middle of ldc.i4
        let original = body(vec![0x2B, 0x01, 0x20, 0x00, 0x00, 0x00, 0x00, 0x2A]);
        let operations = decode_operations(&original.code).unwrap();
        assert!(IlRewriter::new(METHOD, RewriterOptions::code_only())
            .rewrite(&original, &operations, None)
            .is_err());
    }
}
