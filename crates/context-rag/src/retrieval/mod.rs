//! Retrieval: query reformulation and similarity search

mod reformulate;
mod search;

pub use reformulate::reformulate;
pub use search::RetrievalEngine;
