//! Shared point-cloud data structures: attribute schemas, columnar point
//! buffers, bounding boxes with octant addressing, Morton indices and the
//! BIN node payload codec.

pub mod aabb;
pub mod attributes;
pub mod buffer;
pub mod morton;
pub mod payload;

pub use aabb::Aabb;
pub use attributes::{AttributeSchema, PointAttribute};
pub use buffer::PointBuffer;
pub use morton::{MortonIndex, MORTON_LEVELS};
