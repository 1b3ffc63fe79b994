//! The framing shared by [`crate::sender`] and [`crate::receiver`]: the
//! handshake line and the 12-byte per-chunk record header.

use std::io::{Read, Write};

use crate::endian::{from_network_u32, from_network_u64, to_network_u32, to_network_u64};
use crate::error::{Error, ProtocolError};

/// The literal handshake both sides must agree on before any chunk data
/// flows. The wire form carries a trailing `\n`; the snapback-file form does
/// not (see the Design Notes on why apply mode tolerates both).
pub const PROTOCOL_VERSION: &str = "lvmsync PROTO[2]";

const HEADER_LEN: usize = 12;

/// Writes the handshake line, followed by `\n`, to `out`.
pub fn write_handshake<W: Write>(out: &mut W) -> Result<(), Error> {
    out.write_all(PROTOCOL_VERSION.as_bytes())?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Writes the handshake line verbatim, with no trailing newline. Used only
/// for the snapback file, whose reader strips whitespace before comparing.
pub fn write_handshake_no_newline<W: Write>(out: &mut W) -> Result<(), Error> {
    out.write_all(PROTOCOL_VERSION.as_bytes())?;
    Ok(())
}

/// Reads one line from `input` and checks it against [`PROTOCOL_VERSION`]
/// after stripping trailing whitespace (tolerating both the newline- and
/// no-newline forms of the handshake).
pub fn read_and_check_handshake<R: std::io::BufRead>(input: &mut R) -> Result<(), Error> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    let actual = line.trim_end();
    if actual != PROTOCOL_VERSION {
        return Err(ProtocolError::HandshakeMismatch {
            expected: PROTOCOL_VERSION.to_string(),
            actual: actual.to_string(),
        }
        .into());
    }
    Ok(())
}

/// The 12-byte header preceding every chunk's payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub origin_offset: u64,
    pub chunksize: u32,
}

impl RecordHeader {
    /// Encodes this header as its 12-byte wire form: `origin_offset` then
    /// `chunksize`, both network byte order.
    pub fn to_bytes(self) -> Result<[u8; HEADER_LEN], Error> {
        let mut buf = [0u8; HEADER_LEN];
        let offset_net = to_network_u64(self.origin_offset)?;
        let chunksize_net = to_network_u32(self.chunksize)?;
        buf[0..8].copy_from_slice(&offset_net.to_ne_bytes());
        buf[8..12].copy_from_slice(&chunksize_net.to_ne_bytes());
        Ok(buf)
    }

    /// Writes this header's wire form to `out`.
    pub fn write_to<W: Write>(self, out: &mut W) -> Result<(), Error> {
        out.write_all(&self.to_bytes()?)?;
        Ok(())
    }

    /// Reads one header from `input`. Returns `Ok(None)` on a clean
    /// (0-byte) end-of-stream, which signals the normal end of a record
    /// stream; any other short read is a [`ProtocolError::TruncatedHeader`].
    pub fn read_from<R: Read>(input: &mut R) -> Result<Option<Self>, Error> {
        let mut buf = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = input.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < HEADER_LEN {
            return Err(ProtocolError::TruncatedHeader(filled).into());
        }

        let offset_net = u64::from_ne_bytes(buf[0..8].try_into().unwrap());
        let chunksize_net = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
        Ok(Some(RecordHeader {
            origin_offset: from_network_u64(offset_net)?,
            chunksize: from_network_u32(chunksize_net)?,
        }))
    }
}
