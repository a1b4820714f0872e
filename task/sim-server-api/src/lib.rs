// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the simulation request service.
//!
//! The runtime drives the simulated accelerator through the procedures in
//! [`SimRequest`]; every request gets exactly one [`SimResponse`]. On the
//! wire each message is a little-endian `u32` length prefix followed by a
//! CBOR body, so a client in any language with a CBOR library can speak
//! the protocol.
//!
//! This crate also carries [`SimClient`], a small blocking client used by
//! the integration tests (and handy for poking a live simulation from a
//! shell).

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use byteorder::{ByteOrder, LittleEndian};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Frames larger than this are a protocol error, not a memory test.
pub const MAX_FRAME: usize = 1 << 24;

/// Payload variants for `write_platform`: the register file is accessed in
/// 32-bit words, 64-bit values are split little-endian by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlatformData {
    U32(Vec<u32>),
    U64(Vec<u64>),
}

/// One procedure call on the simulation bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SimRequest {
    /// Store bytes into device memory.
    WriteMemory { addr: u64, data: Vec<u8> },
    /// Fetch bytes from device memory.
    ReadMemory { addr: u64, length: u64 },
    /// Read `num_bytes` from the platform register space, returned as
    /// 32-bit words (`num_bytes / 4`, rounded up).
    ReadPlatform { addr: u64, num_bytes: u32 },
    /// Write words into the platform register space.
    WritePlatform { addr: u64, data: PlatformData },
    /// Start counting rising edges of processing element
    /// `interrupt_id`'s interrupt line on behalf of client descriptor
    /// `fd`. Re-registering a descriptor replaces its watcher.
    RegisterInterrupt { fd: i32, interrupt_id: u32 },
    /// Stop counting for `fd`. Unknown descriptors are removed silently.
    DeregisterInterrupt { fd: i32 },
    /// Fetch the device's status structure (opaque bytes). Blocks until
    /// the simulation has prefetched it.
    GetStatus,
    /// Edges counted for `fd` since the previous call; the counter is
    /// cleared on read.
    GetInterruptStatus { fd: i32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponsePayload {
    Void,
    Bytes(Vec<u8>),
    Words(Vec<u32>),
    InterruptCount(u64),
    Status(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SimResponse {
    Ok(ResponsePayload),
    Error { reason: String },
}

impl SimResponse {
    pub fn ok_void() -> Self {
        SimResponse::Ok(ResponsePayload::Void)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        SimResponse::Error { reason: reason.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SimResponse::Ok(_))
    }
}

/// Errors crossing the framed transport.
#[derive(Debug)]
pub enum FrameError {
    Io(std::io::Error),
    /// The peer sent a length prefix beyond [`MAX_FRAME`].
    TooLarge(usize),
    /// The body did not decode as the expected message.
    Codec(String),
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "transport error: {e}"),
            FrameError::TooLarge(n) => write!(f, "oversized frame: {n} bytes"),
            FrameError::Codec(e) => write!(f, "malformed frame: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Writes one length-prefixed CBOR frame.
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<(), FrameError> {
    let body = minicbor_serde::to_vec(message)
        .map_err(|e| FrameError::Codec(e.to_string()))?;
    let mut prefix = [0u8; 4];
    LittleEndian::write_u32(&mut prefix, body.len() as u32);
    writer.write_all(&prefix)?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. `Ok(None)` is a clean end of stream (the peer closed
/// between messages); EOF inside a frame is an error.
pub fn read_frame<R: Read, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, FrameError> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix) {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }
    let len = LittleEndian::read_u32(&prefix) as usize;
    if len > MAX_FRAME {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let message = minicbor_serde::from_slice(&body)
        .map_err(|e| FrameError::Codec(e.to_string()))?;
    Ok(Some(message))
}

/// Blocking request/response client.
pub struct SimClient {
    stream: TcpStream,
}

impl SimClient {
    pub fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// One call, one response.
    pub fn call(
        &mut self,
        request: &SimRequest,
    ) -> Result<SimResponse, FrameError> {
        write_frame(&mut self.stream, request)?;
        match read_frame(&mut self.stream)? {
            Some(response) => Ok(response),
            None => Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed mid-call",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layer_survives_a_stream_of_requests() {
        let mut wire = Vec::new();
        let reqs = vec![
            SimRequest::WriteMemory { addr: 0x100, data: vec![1, 2, 3, 4] },
            SimRequest::GetStatus,
            SimRequest::WritePlatform {
                addr: 0x1000_0040,
                data: PlatformData::U64(vec![0xDEAD_BEEF_0000_0001]),
            },
        ];
        for r in &reqs {
            write_frame(&mut wire, r).unwrap();
        }
        let mut reader = &wire[..];
        let mut seen = Vec::new();
        while let Some(r) = read_frame::<_, SimRequest>(&mut reader).unwrap()
        {
            seen.push(r);
        }
        assert_eq!(seen, reqs);
    }

    #[test]
    fn truncated_frame_is_an_error_not_eof() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &SimRequest::GetStatus).unwrap();
        wire.truncate(wire.len() - 1);
        let mut reader = &wire[..];
        let err = read_frame::<_, SimRequest>(&mut reader).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let wire = [0xFF, 0xFF, 0xFF, 0x7F];
        let mut reader = &wire[..];
        let err = read_frame::<_, SimRequest>(&mut reader).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }
}
