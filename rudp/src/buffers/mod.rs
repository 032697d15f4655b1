pub mod fingerprint_map;
pub mod list;
pub mod slab;
