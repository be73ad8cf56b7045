mod error;
mod traits;
mod types;

pub use error::{RepositoryError, Result};
pub use traits::{BackingStore, WriteObserver};
pub use types::{
    ColumnImpact, EntityBatchStream, KeyedEntityStream, ModifiedEntity, Transaction,
    WriteOperation,
};
