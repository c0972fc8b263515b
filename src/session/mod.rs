pub mod manager;
pub mod metadata;
pub mod persistence;
pub mod recovery;
pub mod transfer;


pub use manager::*;
pub use metadata::*;
pub use persistence::*;
pub use recovery::*;
pub use transfer::{ExportMode, ImportOptions, SessionDocument};
