//! Forward references into an instruction stream under construction.

use std::fmt;

/// An opaque reference to a position in the code emitted by an
/// [`crate::assembly::IlGenerator`].
///
/// Labels are created unbound and bound exactly once with
/// [`crate::assembly::IlGenerator::mark_label`]. Branches may reference a label before it is
/// bound; the displacement is patched when the body is finished.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub(crate) u32);

impl Label {
    /// The generator-local id of this label
    #[must_use]
    pub fn id(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Binding state of one label
#[derive(Debug, Clone, Default)]
pub(crate) struct LabelSlot {
    /// Bound offset, updated when branch sizing moves code
    pub offset: Option<u32>,
    /// Stack depth expected on entry, from the first branch or fallthrough seen
    pub stack_depth: Option<u16>,
}
