pub mod blob_store;
pub mod error;
pub mod extract;
pub mod image;
pub mod layer;
pub mod layer_archive;
pub mod lock;
pub mod notifier;
pub mod pointer;
pub mod session;
pub mod tar_extractor;

// Re-exports for easy access
pub use blob_store::BlobStore;
pub use error::{Error, ErrorKind, Result};
pub use extract::{extract_layers, ExtractReport};
pub use image::Image;
pub use layer::mark_dirty;
pub use notifier::Notifier;
pub use pointer::{Pointer, PointerLayout};
pub use session::{BuildMode, BuildSession, SessionConfig};
