//! Optional bincode payload helpers.
//!
//! This module provides convenience wrappers for using [bincode
//! 2.0](https://docs.rs/bincode) to encode message payloads. The core of
//! peerlink only needs [`Decode`](crate::Decode) and
//! [`Encode`](crate::Encode) implementations, which can be hand-written with
//! [`MessageReader`] and [`MessageWriter`]. This module is available when the
//! `bincode` feature is enabled (enabled by default).

use super::codec::{MessageReader, MessageWriter};
use crate::error::Error;

// ============================================================================
// Macros
// ============================================================================

/// Implements [`Message`](crate::Message), [`Decode`](crate::Decode) and
/// [`Encode`](crate::Encode) for a type using bincode for the payload.
///
/// # Example
///
/// ```no_run
/// use peerlink::{impl_bincode_message, MessageRegistry};
/// use bincode::{Encode, Decode};
///
/// #[derive(Encode, Decode, Debug)]
/// struct MyMessage { data: String }
/// impl_bincode_message!(MyMessage);
///
/// let mut registry = MessageRegistry::new();
/// registry.register_duplex::<MyMessage>(1).unwrap();
/// ```
#[macro_export]
macro_rules! impl_bincode_message {
    ($type:ty) => {
        $crate::impl_message!($type);

        impl $crate::Decode for $type {
            fn decode(reader: &mut $crate::MessageReader<'_>) -> Result<Self, $crate::Error> {
                $crate::bincode::decode_payload::<$type>(reader)
            }
        }

        impl $crate::Encode for $type {
            fn encode(&self, writer: &mut $crate::MessageWriter) -> Result<(), $crate::Error> {
                $crate::bincode::encode_payload(self, writer)
            }
        }
    };
}

// ============================================================================
// Serialization
// ============================================================================

/// Appends the bincode encoding of `value` to the writer.
pub fn encode_payload<T>(value: &T, writer: &mut MessageWriter) -> Result<(), Error>
where
    T: bincode::Encode,
{
    bincode::encode_into_std_write(value, writer, bincode::config::standard())
        .map(|_len| ())
        .map_err(|e| Error::MalformedData(format!("bincode: {}", e)))
}

// ============================================================================
// Deserialization
// ============================================================================

/// Decodes a `T` from the unread part of the payload and advances the
/// reader past the consumed bytes.
pub fn decode_payload<T>(reader: &mut MessageReader<'_>) -> Result<T, Error>
where
    T: bincode::Decode<()>,
{
    let (value, len) =
        bincode::decode_from_slice::<T, _>(reader.remaining_slice(), bincode::config::standard())
            .map_err(|e| Error::MalformedData(format!("bincode: {}", e)))?;
    reader.advance(len)?;
    Ok(value)
}
