mod error;
mod key;
mod types;
mod value;

pub use error::{KeyError, Result};
pub use key::{Key, KeyId, PathElement};
pub use types::{diff_columns, Entity};
pub use value::Value;
