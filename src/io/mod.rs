//! File persistence: duplicate filtering, name sanitization and the buffered writer.

pub mod filter;
pub mod sanitize;
pub mod writer;

pub use filter::{DuplicateFilter, MemoryFilter, NoDuplicates};
pub use sanitize::{RENAMED_PREFIX, needs_rename, sanitize_file_name, sanitize_path};
pub use writer::{BufferedWriter, WriteRequest, WriterError, WriterResult, WriterStats};
