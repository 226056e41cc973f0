//! Flattened device tree support: header probing, an owned tree that can be
//! edited and re-encoded, and overlay application.

pub mod header;
pub mod overlay;
pub mod tree;

pub use header::{FdtHeader, FDT_HEADER_SIZE, FDT_MAGIC};
pub use overlay::apply as apply_overlay;
pub use tree::{cells, str_value, DeviceTree, Node, Property};
