//! Length-prefixed envelope framing over an unreliable byte stream.
//!
//! One frame = unsigned varint length prefix, followed by exactly that many
//! bytes of bincode-encoded [`Envelope`]. The decoder consumes bytes in
//! chunks of arbitrary size and boundary, keeping partial-varint and
//! partial-payload state across calls, and queues completed envelopes in
//! arrival order.
//!
//! Error discipline:
//! - a declared length beyond the maximum is a fatal framing error; the
//!   stream cannot be trusted to realign, the connection must close;
//! - an undecodable payload is recoverable: the frame is dropped and
//!   decoding continues at the next length prefix;
//! - a version mismatch is recoverable: the envelope is dropped and
//!   counted.

use crate::envelope::Envelope;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::warn;

/// Default ceiling for a single frame, bounding memory a malicious sender
/// can make us allocate.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Fatal framing errors. After any of these the stream is unusable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Declared frame length {declared} exceeds maximum {max}")]
    FrameTooLarge { declared: u64, max: usize },
    #[error("Malformed length prefix")]
    MalformedLength,
    #[error("Envelope of {size} bytes exceeds maximum frame size {max}")]
    EnvelopeTooLarge { size: usize, max: usize },
}

/// Incremental unsigned-varint (LEB128) parser.
///
/// Keeps its own partial state so a prefix split across reads resumes
/// where it left off.
#[derive(Debug, Default)]
struct VarintDecoder {
    value: u64,
    shift: u32,
}

impl VarintDecoder {
    fn push(&mut self, byte: u8) -> Result<Option<u64>, FramingError> {
        if self.shift >= 64 {
            return Err(FramingError::MalformedLength);
        }
        let part = (byte & 0x7f) as u64;
        if self.shift == 63 && part > 1 {
            // Would overflow u64
            return Err(FramingError::MalformedLength);
        }
        self.value |= part << self.shift;
        if byte & 0x80 == 0 {
            Ok(Some(self.value))
        } else {
            self.shift += 7;
            Ok(None)
        }
    }
}

/// Append an unsigned varint to a buffer.
fn put_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Serialize one envelope into a wire frame.
pub fn encode_frame(envelope: &Envelope, max_frame: usize) -> Result<Vec<u8>, FramingError> {
    let payload =
        bincode::serialize(envelope).expect("Envelope serialization should not fail");
    if payload.len() > max_frame {
        return Err(FramingError::EnvelopeTooLarge {
            size: payload.len(),
            max: max_frame,
        });
    }
    let mut frame = Vec::with_capacity(payload.len() + 5);
    put_varint(payload.len() as u64, &mut frame);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

#[derive(Debug)]
enum DecodeState {
    /// Accumulating the varint length prefix.
    Length(VarintDecoder),
    /// Copying payload bytes until `expected` are buffered.
    Payload { expected: usize, buffer: Vec<u8> },
}

enum Transition {
    None,
    ToPayload(u64),
    Complete(Vec<u8>),
}

/// Restartable decoder turning a byte stream into a FIFO of envelopes.
pub struct EnvelopeCodec {
    state: DecodeState,
    completed: VecDeque<Envelope>,
    max_frame: usize,
    dropped_decode: u64,
    dropped_version: u64,
}

impl EnvelopeCodec {
    pub fn new(max_frame: usize) -> Self {
        Self {
            state: DecodeState::Length(VarintDecoder::default()),
            completed: VecDeque::new(),
            max_frame,
            dropped_decode: 0,
            dropped_version: 0,
        }
    }

    /// Consume a chunk of stream bytes.
    ///
    /// Never blocks waiting for a full message: whatever cannot complete a
    /// frame stays buffered for the next call. An error is fatal to the
    /// stream.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<(), FramingError> {
        while !input.is_empty() {
            let transition = match &mut self.state {
                DecodeState::Length(decoder) => {
                    let mut next = Transition::None;
                    while let Some((&byte, rest)) = input.split_first() {
                        input = rest;
                        if let Some(length) = decoder.push(byte)? {
                            next = Transition::ToPayload(length);
                            break;
                        }
                    }
                    next
                }
                DecodeState::Payload { expected, buffer } => {
                    let missing = *expected - buffer.len();
                    let take = missing.min(input.len());
                    buffer.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if buffer.len() == *expected {
                        Transition::Complete(std::mem::take(buffer))
                    } else {
                        Transition::None
                    }
                }
            };

            match transition {
                Transition::None => {}
                Transition::ToPayload(length) => {
                    // Bound check before any allocation of the declared size
                    if length > self.max_frame as u64 {
                        return Err(FramingError::FrameTooLarge {
                            declared: length,
                            max: self.max_frame,
                        });
                    }
                    self.state = DecodeState::Payload {
                        expected: length as usize,
                        buffer: Vec::with_capacity(length as usize),
                    };
                }
                Transition::Complete(payload) => {
                    self.state = DecodeState::Length(VarintDecoder::default());
                    self.decode_payload(&payload);
                }
            }
        }
        Ok(())
    }

    fn decode_payload(&mut self, payload: &[u8]) {
        match bincode::deserialize::<Envelope>(payload) {
            Ok(envelope) => {
                if envelope.is_version_supported() {
                    self.completed.push_back(envelope);
                } else {
                    self.dropped_version += 1;
                    warn!(
                        "Dropping envelope with unsupported version {}",
                        envelope.version
                    );
                }
            }
            Err(e) => {
                // Well-framed but undecodable: drop the frame, keep the stream
                self.dropped_decode += 1;
                warn!("Dropping undecodable frame of {} bytes: {}", payload.len(), e);
            }
        }
    }

    /// Pop the next completed envelope, in arrival order.
    pub fn next_envelope(&mut self) -> Option<Envelope> {
        self.completed.pop_front()
    }

    /// Frames dropped because their payload failed to decode.
    pub fn dropped_decode(&self) -> u64 {
        self.dropped_decode
    }

    /// Envelopes dropped because of a version mismatch.
    pub fn dropped_version(&self) -> u64 {
        self.dropped_version
    }
}
