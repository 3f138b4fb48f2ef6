//! Message types, payload codecs and the message registry.
//!
//! A message is any type implementing [`Message`] plus [`Decode`] (it can be
//! received), [`Encode`] (it can be sent), or both. The [`MessageRegistry`]
//! binds each type to the 16-bit id used on the wire.

#[cfg(feature = "bincode")]
pub mod bincode;
mod codec;
#[allow(clippy::module_inception)]
mod message;
mod registry;

pub use codec::{MessageReader, MessageWriter};
pub use message::{Decode, EmptyMessage, Encode, Message};
pub(crate) use registry::RegisteredOutgoing;
pub use registry::{
    decode_message, encode_message, MessageCodec, MessageDecoder, MessageEncoder,
    MessageRegistry, HEARTBEAT_ID,
};
