//! Storage driver interface shared by every object-store backend.
//!
//! A [`Driver`] stores opaque objects under `bucket/path` keys, supports
//! ranged reads and atomic moves, and exposes a multipart upload protocol
//! used to assemble large objects from independently uploaded parts.

mod driver;
mod error;

pub use driver::check_part_number;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::OwnedReader;
pub use driver::Reader;
pub use driver::UploadId;
pub use driver::Writer;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
