pub mod model;
pub mod serve;

pub use model::{EmbeddingModel, ModelError};
pub use serve::{Embedder, serve, serve_with};
