use super::codec::{MessageReader, MessageWriter};
use crate::error::Error;
use downcast_rs::{impl_downcast, Downcast};
use std::fmt::Debug;

// ============================================================================
// Message Traits
// ============================================================================

/// Trait for message types that can travel over a connection.
///
/// All messages must be Send + Debug + Downcast so they can be queued from
/// any thread and handed to typed listeners. Whether a type can be received,
/// sent, or both is expressed by also implementing [`Decode`] and/or
/// [`Encode`].
pub trait Message: Send + Debug + Downcast {
    /// Returns a human readable name of the concrete message type.
    fn message_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl_downcast!(Message);

/// A message that can be received.
///
/// The reads performed here must match the writes of the sender's
/// [`Encode::encode`] exactly, field by field:
///
/// ```text
/// encode: write_i32, write_i32, write_u16, write_u8
/// decode: read_i32,  read_i32,  read_u16,  read_u8
/// ```
pub trait Decode: Message + Sized {
    /// Builds a message from the payload of a frame.
    fn decode(reader: &mut MessageReader<'_>) -> Result<Self, Error>;
}

/// A message that can be sent.
pub trait Encode: Message {
    /// Writes the payload of this message.
    fn encode(&self, writer: &mut MessageWriter) -> Result<(), Error>;
}

// ============================================================================
// impl_message! Macro
// ============================================================================

/// Implements the [`Message`] trait for a message type.
///
/// # Example
///
/// ```no_run
/// use peerlink::impl_message;
///
/// #[derive(Debug)]
/// struct ChatMessage { text: String }
/// impl_message!(ChatMessage);
/// ```
#[macro_export]
macro_rules! impl_message {
    ($type:ty) => {
        impl $crate::Message for $type {
            fn message_name(&self) -> &'static str {
                stringify!($type)
            }
        }
    };
}

// ============================================================================
// EmptyMessage
// ============================================================================

/// An empty message containing no data.
///
/// It reserves message id `0` and is used as a no-op frame and as the
/// connection liveness probe. On the wire it is always `[0, 0, 0, 0, 0, 0]`.
/// Listen for it on a [`MessageBus`](crate::MessageBus) to observe probes
/// sent by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmptyMessage;

impl_message!(EmptyMessage);

impl Decode for EmptyMessage {
    fn decode(_reader: &mut MessageReader<'_>) -> Result<Self, Error> {
        Ok(EmptyMessage)
    }
}

impl Encode for EmptyMessage {
    fn encode(&self, _writer: &mut MessageWriter) -> Result<(), Error> {
        Ok(())
    }
}
