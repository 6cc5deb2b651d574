mod importer;
mod shared;

pub use importer::{TestImporter, expect_completed, fields};
pub use shared::SharedDatabase;
