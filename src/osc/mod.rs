// ABOUTME: osmChange diff decoding
// ABOUTME: Change record model plus the streaming XML decoder

pub mod decoder;
pub mod model;

pub use decoder::{decode_diff, is_gzip, OscReader};
pub use model::{Action, ChangeRecord, Element, ElementType, Member};
