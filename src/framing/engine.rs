use super::buffer::ByteRegion;
use super::processor::MessageProcessor;
use super::{FrameHeader, HEADER_SIZE};
use crate::bus::MessageBus;
use crate::error::Error;
use crate::message::{MessageReader, MessageWriter};
use std::io::{Read, Write};
use tracing::{debug, error, trace, warn};

/// Read and write buffers owned by the thread driving a connection.
///
/// Sizes requested on the [`MessageProcessor`] are applied at the start of
/// the next pass, when the buffers hold no partial frame. A buffer grown to
/// fit an oversized frame keeps its size until the next requested resize.
#[derive(Debug)]
pub struct FrameBuffers {
    read: ByteRegion,
    write: ByteRegion,
    scratch: MessageWriter,
    read_size: usize,
    write_size: usize,
}

impl FrameBuffers {
    pub fn new(read_size: usize, write_size: usize) -> Self {
        let read_size = read_size.max(HEADER_SIZE);
        let write_size = write_size.max(HEADER_SIZE);
        Self {
            read: ByteRegion::with_capacity(read_size),
            write: ByteRegion::with_capacity(write_size),
            scratch: MessageWriter::new(),
            read_size,
            write_size,
        }
    }

    /// Buffers sized for `processor`.
    pub fn for_processor(processor: &MessageProcessor) -> Self {
        Self::new(processor.read_buffer_size(), processor.write_buffer_size())
    }

    pub fn read_capacity(&self) -> usize {
        self.read.capacity()
    }

    pub fn write_capacity(&self) -> usize {
        self.write.capacity()
    }

    fn apply_read_size(&mut self, processor: &MessageProcessor) {
        let requested = processor.read_buffer_size();
        if requested != self.read_size {
            debug!(from = self.read.capacity(), to = requested, "Resizing read buffer");
            self.read.replace(requested);
            self.read_size = requested;
        }
    }

    fn apply_write_size(&mut self, processor: &MessageProcessor) {
        let requested = processor.write_buffer_size();
        if requested != self.write_size {
            debug!(from = self.write.capacity(), to = requested, "Resizing write buffer");
            self.write.replace(requested);
            self.write_size = requested;
        }
    }
}

// ============================================================================
// Write Path
// ============================================================================

/// Serializes every queued message into frames and writes them to `dst`.
///
/// Frames are batched in the write buffer, which is flushed whenever the
/// next frame does not fit, and once more at the end. A frame larger than
/// the whole buffer grows the buffer to the frame's size. Writes that would
/// block are retried until the bytes are accepted.
///
/// A message whose encoder fails is dropped and the error is returned; the
/// connection is expected to terminate. Returns the number of frames written.
pub fn write_frames<W: Write>(
    dst: &mut W,
    processor: &MessageProcessor,
    buffers: &mut FrameBuffers,
) -> Result<usize, Error> {
    buffers.apply_write_size(processor);

    let mut frames = 0;
    while let Some(msg) = processor.pop_pending() {
        let Some(registered) = processor.outgoing_for(msg.as_ref()) else {
            error!(msg = msg.message_name(), "Dropping message without outgoing registration");
            return Err(Error::UnregisteredMessage {
                type_name: msg.message_name(),
            });
        };

        buffers.scratch.clear();
        if let Err(err) = (registered.encoder)(msg.as_ref(), &mut buffers.scratch) {
            error!(msg = msg.message_name(), %err, "Failed to encode message");
            return Err(err);
        }
        let payload = buffers.scratch.as_slice();
        let length = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge {
            len: payload.len() + HEADER_SIZE,
        })?;
        let header = FrameHeader {
            id: registered.id,
            length,
        };
        let frame_len = header.frame_len();

        if buffers.write.remaining() < frame_len {
            if !buffers.write.is_empty() {
                buffers.write.flush_all(dst)?;
            }
            if buffers.write.capacity() < frame_len {
                debug!(
                    from = buffers.write.capacity(),
                    to = frame_len,
                    "Growing write buffer for oversized frame"
                );
                buffers.write.grow_to(frame_len);
            }
        }

        buffers.write.put(&header.to_bytes());
        buffers.write.put(payload);
        trace!(id = header.id, len = frame_len, msg = msg.message_name(), "Framed message");
        frames += 1;
    }

    if !buffers.write.is_empty() {
        buffers.write.flush_all(dst)?;
    }
    if frames > 0 {
        debug!(frames, "Wrote frames");
    }
    Ok(frames)
}

// ============================================================================
// Read Path
// ============================================================================

/// Reads all currently available frames from `src` and posts the decoded
/// messages to `bus`.
///
/// Starts with a single non-blocking read; if nothing is available it
/// returns `Ok(0)` at once. Once a frame has started arriving, the rest of
/// it is waited for. Frames larger than the read buffer get a buffer of
/// their exact size. Reading continues until a read would block with no
/// partial frame left.
///
/// Frames with an unknown id are skipped. A failing decoder ends the pass
/// with the decoder's error. Returns the number of frames consumed.
pub fn read_frames<R: Read>(
    src: &mut R,
    processor: &MessageProcessor,
    bus: &MessageBus,
    buffers: &mut FrameBuffers,
) -> Result<usize, Error> {
    buffers.apply_read_size(processor);

    let region = &mut buffers.read;
    region.clear();
    if region.read_available(src)? == 0 {
        return Ok(0);
    }

    let mut start = 0;
    let mut frames = 0;
    loop {
        // Header
        if region.capacity() - start < HEADER_SIZE {
            region.compact_from(start);
            start = 0;
        }
        if region.filled() - start < HEADER_SIZE {
            region.fill_at_least(src, start + HEADER_SIZE)?;
        }
        let header = FrameHeader::parse(&region.filled_slice()[start..]);
        let frame_len = header.frame_len();

        // Body
        if region.capacity() - start < frame_len {
            if frame_len <= region.capacity() {
                region.compact_from(start);
            } else {
                debug!(
                    id = header.id,
                    from = region.capacity(),
                    to = frame_len,
                    "Growing read buffer for oversized frame"
                );
                region.grow_from(start, frame_len);
            }
            start = 0;
            region.fill_at_least(src, frame_len)?;
        } else if region.filled() - start < frame_len {
            region.fill_at_least(src, start + frame_len)?;
        }

        let payload = &region.filled_slice()[start + HEADER_SIZE..start + frame_len];
        dispatch_frame(header, payload, processor, bus)?;
        frames += 1;
        start += frame_len;

        if start >= region.filled() {
            region.clear();
            start = 0;
            if region.read_available(src)? == 0 {
                break;
            }
        }
    }

    trace!(frames, "Read frames");
    Ok(frames)
}

fn dispatch_frame(
    header: FrameHeader,
    payload: &[u8],
    processor: &MessageProcessor,
    bus: &MessageBus,
) -> Result<(), Error> {
    // The registry lock is released before any listener runs
    let decoder = processor.registry().resolve_incoming(header.id);
    let Some(decode) = decoder else {
        trace!(id = header.id, len = header.length, "Skipping frame with unknown id");
        return Ok(());
    };

    let mut reader = MessageReader::new(payload);
    let msg = decode(&mut reader).map_err(|err| {
        warn!(id = header.id, len = header.length, %err, "Failed to decode frame");
        err
    })?;
    if reader.remaining() > 0 {
        trace!(
            id = header.id,
            unread = reader.remaining(),
            "Decoder left payload bytes unread"
        );
    }

    trace!(id = header.id, msg = msg.message_name(), "Dispatching message");
    bus.post(msg.as_ref());
    Ok(())
}
