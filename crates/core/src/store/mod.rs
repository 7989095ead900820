//! The node store: the substrate contract, lazy node reads, paginated child
//! cursors and the head revision.

pub mod cursor;
pub mod memory;
pub mod node_store;
pub mod reader;
pub mod substrate;

pub use cursor::ChildCursor;
pub use memory::MemorySubstrate;
pub use node_store::{Head, HeadRef, NodeStore};
pub use reader::NodeReader;
pub use substrate::{
    child_range, id_from_path, path_from_id, Collection, Document, DocumentUpdate, NodeRecord,
    Substrate,
};
