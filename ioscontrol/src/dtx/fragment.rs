// Reassembly of fragmented messages

use byteorder::{ByteOrder, LittleEndian};
use indexmap::IndexMap;
use tracing::warn;

use super::message::{HEADER_LEN, MAX_MESSAGE_LENGTH, MessageHeader};
use crate::IdeviceError;

/// Fragmented messages a [`Reassembler`] keeps open at once
pub const MAX_IN_FLIGHT: usize = 16;

/// Collects the fragments of one message
///
/// Created from the first fragment, which is a bare 32 byte header. Every
/// later fragment contributes its body.
#[derive(Debug)]
pub struct FragmentDecoder {
    first: MessageHeader,
    header_bytes: Vec<u8>,
    bodies: Vec<Vec<u8>>,
    received: usize,
    finished: bool,
}

impl FragmentDecoder {
    pub fn new(header: MessageHeader, bytes: Vec<u8>) -> Result<Self, IdeviceError> {
        if bytes.len() < HEADER_LEN || !header.is_first_fragment() {
            return Err(IdeviceError::UnexpectedFragment(header.identifier));
        }
        Ok(Self {
            first: header,
            header_bytes: bytes[..HEADER_LEN].to_vec(),
            bodies: Vec::with_capacity(header.fragment_count as usize - 1),
            received: 0,
            finished: false,
        })
    }

    pub fn identifier(&self) -> u32 {
        self.first.identifier
    }

    /// Adds a fragment, returns true once the last one arrived
    pub fn add(&mut self, header: MessageHeader, bytes: Vec<u8>) -> Result<bool, IdeviceError> {
        if header.identifier != self.first.identifier
            || header.fragment_count != self.first.fragment_count
            || header.fragment_index == 0
            || self.finished
        {
            return Err(IdeviceError::UnexpectedFragment(header.identifier));
        }
        let received = self.received + bytes.len();
        if received > MAX_MESSAGE_LENGTH as usize {
            return Err(IdeviceError::DtxMessageTooLarge(
                u32::try_from(received).unwrap_or(u32::MAX),
            ));
        }
        self.received = received;
        self.bodies.push(bytes);
        if header.is_last_fragment() {
            self.finished = true;
        }
        Ok(self.finished)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The reassembled message as a single non-fragmented frame
    pub fn extract(&self) -> Vec<u8> {
        let body_len: usize = self.bodies.iter().map(|b| b.len()).sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.extend_from_slice(&self.header_bytes);
        LittleEndian::write_u16(&mut out[8..], 0);
        LittleEndian::write_u16(&mut out[10..], 1);
        LittleEndian::write_u32(&mut out[12..], body_len as u32);
        for b in &self.bodies {
            out.extend_from_slice(b);
        }
        out
    }
}

/// Reassembles the fragmented messages of one stream
///
/// At most [`MAX_IN_FLIGHT`] messages are collected at once. Starting one
/// more drops the oldest unfinished message, and a first fragment reusing an
/// identifier restarts that message.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: IndexMap<u32, FragmentDecoder>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unfinished messages
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Takes one fragment, returns the whole message once its last fragment arrived
    pub fn accept(
        &mut self,
        header: MessageHeader,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, IdeviceError> {
        let identifier = header.identifier;
        if header.is_first_fragment() {
            let decoder = FragmentDecoder::new(header, bytes)?;
            if self.pending.shift_remove(&identifier).is_some() {
                warn!("Message {identifier} restarted before its last fragment");
            } else if self.pending.len() >= MAX_IN_FLIGHT
                && let Some((stale, _)) = self.pending.shift_remove_index(0)
            {
                warn!("Too many fragmented messages, dropping {stale}");
            }
            self.pending.insert(identifier, decoder);
            return Ok(None);
        }

        let decoder = self
            .pending
            .get_mut(&identifier)
            .ok_or(IdeviceError::UnexpectedFragment(identifier))?;
        match decoder.add(header, bytes) {
            Ok(false) => Ok(None),
            Ok(true) => Ok(self
                .pending
                .shift_remove(&identifier)
                .map(|d| d.extract())),
            Err(e) => {
                self.pending.shift_remove(&identifier);
                Err(e)
            }
        }
    }
}
