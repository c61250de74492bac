//! Beacon substrate record codec.
//!
//! Defines the key/value field layout of presence, message-slot, ack, and
//! reconciliation records and their typed encode/decode helpers.

pub mod error;
pub mod fields;
pub mod record;

pub use error::CodecError;
pub use fields::RecordFields;
pub use record::{
    AckRecord, InboundRecord, MessageRecord, PresenceRecord, RecordHeader, RecordKind, SyncRecord,
};
