//! In-memory representation of RELAX NG schema documents in the XML syntax.
//!
//! The schema is held as an arena of elements ([`tree::Tree`]) so that the
//! simplification rewrites can splice subtrees loaded from several files
//! without copying between allocations. [`parse`] turns schema text into
//! tree nodes and enforces that only RELAX NG elements appear.

pub mod parse;
pub mod tree;

pub use parse::{depends_on_external_file, parse_into, SyntaxError};
pub use tree::{Child, NodeId, NsBindings, Tree, RELAXNG_NS};
