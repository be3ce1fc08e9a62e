//! Type/length/value record codec
//!
//! Every record on the wire is laid out as:
//!
//! ```text
//! [TYPE:2][LENGTH:2][VALUE:LENGTH]
//! ```
//!
//! with both header fields big-endian. Records are concatenated without any
//! framing; a packet is simply a sequence of records. Readers consume records
//! front to back and may peek at the next record's type to handle optional
//! and repeated fields.

mod errors;
mod reader;
mod writer;

pub use errors::{CodecError, CodecResult};
pub use reader::{TlvReader, TlvRecord};
pub use writer::TlvWriter;

/// Size of a record header in bytes
pub const HEADER_LEN: usize = 4;

/// Largest value a single record can carry
pub const MAX_VALUE_LEN: usize = u16::MAX as usize;
