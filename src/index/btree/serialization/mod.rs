mod decoding;
mod encoding;
mod order;

pub use decoding::deserialize_node;
pub use encoding::serialize_node;
pub use order::{calculate_internal_max_size, calculate_leaf_max_size};
