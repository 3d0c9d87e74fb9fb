mod schema;
mod models;

pub use schema::{Database, NewNode};
pub use models::{Citation, CitationSource, Folder, Node, NodeView, Reference, ReferenceType};
