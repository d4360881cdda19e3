//! vdcproto - Wire protocol types for the vDC API device side.
//!
//! This crate defines everything that crosses the TCP session between a vDC
//! host and its controller: the 2-byte length-prefixed framing, the typed
//! message catalog with its envelope, the recursive property trees carried by
//! property operations, and the deterministic dSUID identifiers entities are
//! addressed by.
//!
//! The crate is policy-free: it knows how bytes and types map onto each
//! other, not when to send them. Session lifecycle, dispatch and throttling
//! live in the daemon.

pub mod dsuid;
pub mod frame;
pub mod message;
pub mod property;

pub use dsuid::{DsUid, DsUidError, Namespace};
pub use frame::{FrameDecoder, FrameError, MAX_FRAME_SIZE};
pub use message::{
    decode_envelope, encode_envelope, CodecError, DimMode, Envelope, Message, CODE_ERROR,
    CODE_NOT_FOUND, CODE_OK,
};
pub use property::{filter_by_query, PropertyMap, PropertyValue};
