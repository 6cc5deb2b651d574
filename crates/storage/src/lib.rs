pub mod error;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::{FieldError, StorageError};
pub use sqlite::{SqliteStorage, StoredRecord};
pub use traits::*;
