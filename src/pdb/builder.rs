//! Push-style construction of a [`PdbInfo`].
//!
//! Every decoder and the legacy writer feed their input through a [`PdbBuilder`], which enforces
//! the nesting rules of the model:
//!
//! ```text
//! define_document* → (open_method → (define_sequence_points | open_scope | define_* |
//!                     close_scope | set_*)* → close_method)* → finish
//! ```
//!
//! Token source locations, the entry point and the source server script may be set at any
//! time.

use tracing::trace;

use crate::{
    pdb::{
        IteratorScope, PdbAsyncInfo, PdbConstant, PdbFormat, PdbFunction, PdbInfo, PdbLine,
        PdbLines, PdbScope, PdbSlot, PdbSource, PdbTokenLine, SourceLocation,
    },
    token::Token,
    Error, Result,
};

struct OpenMethod {
    function: PdbFunction,
    scopes: Vec<PdbScope>,
}

/// Accumulates decoded debug information into a [`PdbInfo`].
pub struct PdbBuilder {
    info: PdbInfo,
    method: Option<OpenMethod>,
}

impl PdbBuilder {
    /// A builder for a module with the given identity
    #[must_use]
    pub fn new(guid: uguid::Guid, age: u32, format: PdbFormat) -> Self {
        PdbBuilder {
            info: PdbInfo::new(guid, age, format),
            method: None,
        }
    }

    /// Documents defined so far
    #[must_use]
    pub fn sources(&self) -> &[PdbSource] {
        &self.info.sources
    }

    /// Add a document and return its index. Documents are never merged, defining the same
    /// document twice yields two indices.
    pub fn define_document(&mut self, source: PdbSource) -> usize {
        self.info.sources.push(source);
        self.info.sources.len() - 1
    }

    /// Start the debug information of `token`.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if another method is open.
    pub fn open_method(&mut self, token: Token) -> Result<()> {
        if let Some(open) = &self.method {
            return Err(Error::ScopeMismatch(format!(
                "method {} opened while {} is open",
                token, open.function.token
            )));
        }
        self.method = Some(OpenMethod {
            function: PdbFunction::new(token),
            scopes: Vec::new(),
        });
        Ok(())
    }

    fn current(&mut self, operation: &str) -> Result<&mut OpenMethod> {
        self.method
            .as_mut()
            .ok_or_else(|| Error::ScopeMismatch(format!("{operation} outside of a method")))
    }

    fn current_scope(&mut self, operation: &str) -> Result<&mut PdbScope> {
        self.current(operation)?
            .scopes
            .last_mut()
            .ok_or_else(|| Error::ScopeMismatch(format!("{operation} outside of a scope")))
    }

    /// Add the sequence points of the open method in document `source`. Each point is also
    /// appended to the source location list of the method token.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method and [`Error::OutOfBounds`] for an
    /// undefined document.
    pub fn define_sequence_points(&mut self, source: usize, lines: Vec<PdbLine>) -> Result<()> {
        if source >= self.info.sources.len() {
            return Err(Error::OutOfBounds);
        }

        let method = self
            .method
            .as_mut()
            .ok_or_else(|| Error::ScopeMismatch("sequence points outside of a method".into()))?;
        let token = method.function.token;

        let nodes = lines
            .iter()
            .map(|line| {
                let location = SourceLocation {
                    source,
                    start_line: line.line_begin,
                    start_column: line.col_begin,
                    end_line: line.line_end,
                    end_column: line.col_end,
                };
                PdbTokenLine::new(token, &location)
            })
            .collect();
        self.info.append_token_lines(token, nodes);

        method.function.lines.push(PdbLines { source, lines });
        Ok(())
    }

    /// Open a lexical scope starting at `offset`
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method.
    pub fn open_scope(&mut self, offset: u32) -> Result<()> {
        self.current("open_scope")?
            .scopes
            .push(PdbScope::new(offset, 0));
        Ok(())
    }

    /// Close the innermost scope at `offset`, attaching it to its parent or, at the outermost
    /// level, to the method.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if no scope is open or `offset` precedes the start.
    pub fn close_scope(&mut self, offset: u32) -> Result<()> {
        let method = self.current("close_scope")?;
        let Some(mut scope) = method.scopes.pop() else {
            return Err(Error::ScopeMismatch("close_scope without open scope".into()));
        };
        scope.length = offset.checked_sub(scope.offset).ok_or_else(|| {
            Error::ScopeMismatch(format!(
                "scope starting at {} closed at {}",
                scope.offset, offset
            ))
        })?;

        match method.scopes.last_mut() {
            Some(parent) => parent.scopes.push(scope),
            None => method.function.scopes.push(scope),
        }
        Ok(())
    }

    /// Add a local to the innermost scope
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if no scope is open.
    pub fn define_local_variable(&mut self, slot: PdbSlot) -> Result<()> {
        self.current_scope("define_local_variable")?.slots.push(slot);
        Ok(())
    }

    /// Add a constant to the innermost scope
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if no scope is open.
    pub fn define_local_constant(&mut self, constant: PdbConstant) -> Result<()> {
        self.current_scope("define_local_constant")?
            .constants
            .push(constant);
        Ok(())
    }

    /// Record a namespace import in the innermost scope
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if no scope is open.
    pub fn using_namespace(&mut self, namespace: impl Into<String>) -> Result<()> {
        self.current_scope("using_namespace")?
            .used_namespaces
            .push(namespace.into());
        Ok(())
    }

    /// Attach async stepping information to the open method
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method.
    pub fn set_async_info(&mut self, info: PdbAsyncInfo) -> Result<()> {
        self.current("set_async_info")?.function.async_info = Some(info);
        Ok(())
    }

    /// Attach iterator information to the open method. An empty class name leaves the iterator
    /// class unset.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method.
    pub fn set_iterator_info(
        &mut self,
        iterator_class: Option<String>,
        scopes: Vec<IteratorScope>,
    ) -> Result<()> {
        let function = &mut self.current("set_iterator_info")?.function;
        if let Some(class) = iterator_class.filter(|class| !class.is_empty()) {
            function.iterator_class = Some(class);
        }
        function.iterator_scopes.extend(scopes);
        Ok(())
    }

    /// Attach an opaque named blob to the open method
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] outside of a method.
    pub fn add_custom_metadata(&mut self, name: impl Into<String>, data: Vec<u8>) -> Result<()> {
        self.current("add_custom_metadata")?
            .function
            .custom_metadata
            .push((name.into(), data));
        Ok(())
    }

    /// Append a source location to the list of `token`
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] for an undefined document.
    pub fn define_token_source_location(
        &mut self,
        token: Token,
        location: &SourceLocation,
    ) -> Result<()> {
        if location.source >= self.info.sources.len() {
            return Err(Error::OutOfBounds);
        }

        self.info
            .append_token_lines(token, vec![PdbTokenLine::new(token, location)]);
        Ok(())
    }

    /// Set the entry point method
    pub fn set_entry_point(&mut self, token: Token) {
        self.info.entry_point = Some(token);
    }

    /// Set the source server script
    pub fn set_source_server_data(&mut self, data: String) {
        self.info.source_server_data = Some(data);
    }

    /// Finish the open method; `length` is the IL length it covers.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if no method is open or a scope is still open.
    pub fn close_method(&mut self, length: u32) -> Result<()> {
        let Some(mut method) = self.method.take() else {
            return Err(Error::ScopeMismatch("close_method without open method".into()));
        };
        if !method.scopes.is_empty() {
            let token = method.function.token;
            let open = method.scopes.len();
            self.method = Some(method);
            return Err(Error::ScopeMismatch(format!(
                "method {token} closed with {open} open scopes"
            )));
        }

        method.function.length = length;
        trace!(
            token = %method.function.token,
            scopes = method.function.scopes.len(),
            lines = method.function.line_count(),
            "closed method"
        );
        self.info.functions.push(method.function);
        Ok(())
    }

    /// The finished model, functions sorted by token.
    ///
    /// # Errors
    /// Returns [`Error::ScopeMismatch`] if a method is still open.
    pub fn finish(mut self) -> Result<PdbInfo> {
        if let Some(open) = &self.method {
            return Err(Error::ScopeMismatch(format!(
                "method {} still open",
                open.function.token
            )));
        }
        self.info.functions.sort_by_key(|function| function.token);
        Ok(self.info)
    }
}
