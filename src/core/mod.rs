//! # Core Message Components
//!
//! Schema descriptors, tagged message values and the field-driven codec.
//!
//! ## Components
//! - **Schema**: immutable per-message field layouts
//! - **Message**: id plus ordered field values
//! - **Codec**: little-endian encode/decode and incremental frame measurement
//!
//! ## Wire Format
//! ```text
//! [MessageId u16 LE] [Field 0] [Field 1] ... [Field N]
//! ```
//!
//! ## Security
//! - Variable counts are bounds-checked before any payload length is trusted
//! - Frames with trailing or missing bytes are rejected

pub mod codec;
pub mod message;
pub mod schema;
