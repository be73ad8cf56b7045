mod buckets;
mod error;
mod fingerprint;
mod keys;
mod scripts;
mod serialization;
mod traits;

pub use buckets::{modification_buckets, query_buckets, query_columns};
pub use error::{CacheError, Result};
pub use fingerprint::Fingerprint;
pub use keys::{
    cached_in_key, entity_key, epoch_key, index_all_key, index_column_key, query_cache_key,
    query_data_key, query_refcount_key, query_writer_key, QueryKeys, WRITER_INVALIDATED,
};
pub use scripts::{int_arg, str_arg, CacheScript, ScriptReply};
pub use serialization::{
    deserialize_entities, deserialize_entity, serialize_entities, serialize_entity,
};
pub use traits::CoordinationStore;
