//! Scene markup and the shared document store

pub mod markup;
pub mod store;

pub use markup::{is_valid_name, parse_document, parse_fragment, Element, MarkupError, Node};
pub use store::{DocumentStore, SharedDocument};
