//! Tools for imaging NAND flash with the UBI on-flash format.
//!
//! The [writer] module erases a window of physical eraseblocks and streams a payload
//! into it, either verbatim or wrapped in a freshly-built single-volume UBI layout.
//! The [extract] module performs the reverse operation on UBI image files, locating a
//! volume by name or table index and reassembling its data in logical-block order.

pub mod extract;
pub mod nand;
pub mod source;
pub mod ubi;
pub mod util;
pub mod writer;
