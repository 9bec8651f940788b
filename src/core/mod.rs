pub mod document;
pub mod ejson;
pub mod ids;
pub mod ordered_map;

pub use document::{Document, DocumentError, ID_FIELD, LAST_UPDATED_FIELD, WAS_OFFLINE_FIELD};
pub use ejson::{EjsonBinary, EjsonDate};
pub use ids::{IdAllocator, random_document_id};
pub use ordered_map::OrderedMap;
