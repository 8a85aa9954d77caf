//! UBI on-flash format support: header and volume-table codecs.

pub mod headers;

pub use headers::VolType;
