use super::codec::{MessageReader, MessageWriter};
use super::message::{Decode, EmptyMessage, Encode, Message};
use crate::error::{Direction, Error};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use tracing::debug;

/// Message id reserved for [`EmptyMessage`].
pub const HEARTBEAT_ID: u16 = 0;

/// Type alias for message decoding functions.
///
/// A `MessageDecoder` builds a new message instance from the payload of a
/// frame. The reader is guaranteed to cover exactly one complete payload.
///
/// # Function Signature
///
/// ```text
/// fn(&mut MessageReader<'_>) -> Result<Box<dyn Message>, Error>
/// ```
pub type MessageDecoder = fn(&mut MessageReader<'_>) -> Result<Box<dyn Message>, Error>;

/// Type alias for message encoding functions.
///
/// A `MessageEncoder` writes the payload of a message. It is only ever
/// called with messages of the type it was registered for.
///
/// # Function Signature
///
/// ```text
/// fn(&dyn Message, &mut MessageWriter) -> Result<(), Error>
/// ```
pub type MessageEncoder = fn(&dyn Message, &mut MessageWriter) -> Result<(), Error>;

/// Decodes a `T` and boxes it. Used as the [`MessageDecoder`] of types
/// implementing [`Decode`].
pub fn decode_message<T: Decode>(reader: &mut MessageReader<'_>) -> Result<Box<dyn Message>, Error> {
    T::decode(reader).map(|msg| Box::new(msg) as Box<dyn Message>)
}

/// Encodes a `T` behind a `&dyn Message`. Used as the [`MessageEncoder`] of
/// types implementing [`Encode`].
pub fn encode_message<T: Encode>(msg: &dyn Message, writer: &mut MessageWriter) -> Result<(), Error> {
    match msg.downcast_ref::<T>() {
        Some(concrete) => concrete.encode(writer),
        None => Err(Error::UnregisteredMessage {
            type_name: msg.message_name(),
        }),
    }
}

// ============================================================================
// MessageCodec
// ============================================================================

/// Describes how one message type is decoded and/or encoded.
///
/// A codec with only a decoder registers the type as incoming, one with only
/// an encoder as outgoing, and one with both in both directions.
#[derive(Clone, Copy)]
pub struct MessageCodec {
    type_id: TypeId,
    type_name: &'static str,
    decoder: Option<MessageDecoder>,
    encoder: Option<MessageEncoder>,
}

impl MessageCodec {
    /// A codec for `T` with no capabilities yet.
    pub fn of<T: Message>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            decoder: None,
            encoder: None,
        }
    }

    /// Receive-only codec.
    pub fn incoming<T: Decode>() -> Self {
        Self::of::<T>().with_decoder(decode_message::<T>)
    }

    /// Send-only codec.
    pub fn outgoing<T: Encode>() -> Self {
        Self::of::<T>().with_encoder(encode_message::<T>)
    }

    /// Codec for types that are both sent and received.
    pub fn duplex<T: Decode + Encode>() -> Self {
        Self::of::<T>()
            .with_decoder(decode_message::<T>)
            .with_encoder(encode_message::<T>)
    }

    /// Sets a hand-written decoder.
    pub fn with_decoder(mut self, decoder: MessageDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Sets a hand-written encoder.
    pub fn with_encoder(mut self, encoder: MessageEncoder) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

// Outgoing registration entry
#[derive(Clone, Copy)]
pub(crate) struct RegisteredOutgoing {
    pub(crate) id: u16,
    pub(crate) encoder: MessageEncoder,
}

// ============================================================================
// MessageRegistry
// ============================================================================

/// Maps message ids to decoders and message types to ids and encoders.
///
/// Id `0` is pre-registered in both directions for [`EmptyMessage`].
///
/// # Usage
///
/// ```no_run
/// use peerlink::{impl_message, Decode, Encode, Error, MessageReader, MessageRegistry, MessageWriter};
///
/// #[derive(Debug)]
/// struct Ping { seq: u32 }
/// impl_message!(Ping);
///
/// impl Decode for Ping {
///     fn decode(reader: &mut MessageReader<'_>) -> Result<Self, Error> {
///         Ok(Ping { seq: reader.read_u32()? })
///     }
/// }
///
/// impl Encode for Ping {
///     fn encode(&self, writer: &mut MessageWriter) -> Result<(), Error> {
///         writer.write_u32(self.seq);
///         Ok(())
///     }
/// }
///
/// let mut registry = MessageRegistry::new();
/// registry.register_duplex::<Ping>(1).unwrap();
/// ```
#[derive(Clone)]
pub struct MessageRegistry {
    incoming: HashMap<u16, MessageDecoder>,
    outgoing: HashMap<TypeId, RegisteredOutgoing>,
    outgoing_ids: HashMap<u16, TypeId>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    /// Creates a registry that only knows the heartbeat message.
    pub fn new() -> Self {
        let mut registry = Self {
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            outgoing_ids: HashMap::new(),
        };
        registry
            .incoming
            .insert(HEARTBEAT_ID, decode_message::<EmptyMessage>);
        registry.outgoing.insert(
            TypeId::of::<EmptyMessage>(),
            RegisteredOutgoing {
                id: HEARTBEAT_ID,
                encoder: encode_message::<EmptyMessage>,
            },
        );
        registry
            .outgoing_ids
            .insert(HEARTBEAT_ID, TypeId::of::<EmptyMessage>());
        registry
    }

    /// Registers a codec under `id`.
    ///
    /// Either all directions the codec supports are registered, or, on
    /// error, none of them.
    pub fn register(&mut self, id: u16, codec: MessageCodec) -> Result<&mut Self, Error> {
        if id == HEARTBEAT_ID {
            return Err(Error::InvalidId(id));
        }
        if codec.decoder.is_none() && codec.encoder.is_none() {
            return Err(Error::UnsupportedType {
                type_name: codec.type_name,
            });
        }

        if codec.decoder.is_some() && self.incoming.contains_key(&id) {
            return Err(Error::DuplicateId {
                id,
                direction: Direction::Incoming,
            });
        }
        if codec.encoder.is_some() {
            if self.outgoing_ids.contains_key(&id) {
                return Err(Error::DuplicateId {
                    id,
                    direction: Direction::Outgoing,
                });
            }
            if self.outgoing.contains_key(&codec.type_id) {
                return Err(Error::DuplicateType {
                    type_name: codec.type_name,
                });
            }
        }

        debug!(id, type_name = codec.type_name, "Registering message codec");
        if let Some(decoder) = codec.decoder {
            self.incoming.insert(id, decoder);
        }
        if let Some(encoder) = codec.encoder {
            self.outgoing
                .insert(codec.type_id, RegisteredOutgoing { id, encoder });
            self.outgoing_ids.insert(id, codec.type_id);
        }
        Ok(self)
    }

    /// Registers `T` as a receive-only message.
    pub fn register_incoming<T: Decode>(&mut self, id: u16) -> Result<&mut Self, Error> {
        self.register(id, MessageCodec::incoming::<T>())
    }

    /// Registers `T` as a send-only message.
    pub fn register_outgoing<T: Encode>(&mut self, id: u16) -> Result<&mut Self, Error> {
        self.register(id, MessageCodec::outgoing::<T>())
    }

    /// Registers `T` in both directions under the same id.
    pub fn register_duplex<T: Decode + Encode>(&mut self, id: u16) -> Result<&mut Self, Error> {
        self.register(id, MessageCodec::duplex::<T>())
    }

    /// Gets the decoder for an incoming message id, if registered.
    pub fn resolve_incoming(&self, id: u16) -> Option<MessageDecoder> {
        self.incoming.get(&id).copied()
    }

    /// Gets the id of an outgoing message type, if registered.
    pub fn resolve_outgoing(&self, type_id: TypeId) -> Option<u16> {
        self.outgoing.get(&type_id).map(|registered| registered.id)
    }

    // Gets the full outgoing registration for a message instance.
    pub(crate) fn outgoing_for(&self, msg: &dyn Message) -> Option<RegisteredOutgoing> {
        self.outgoing.get(&Any::type_id(msg.as_any())).copied()
    }
}
