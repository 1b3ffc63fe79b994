//! Reads an exception store's changed chunks off the origin device and
//! writes them, framed per [`crate::protocol`], to wherever the sync target
//! points.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, ProtocolError};
use crate::exception_store::{self, ExceptionStoreReader};
use crate::protocol::{write_handshake, RecordHeader};

/// Summary of a completed transfer, used for the final human-readable line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferSummary {
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    /// Total number of chunks the origin device holds, used to compute the
    /// percentage of a whole-device transfer this sync avoided.
    pub total_origin_chunks: u64,
}

impl TransferSummary {
    /// Percentage of the origin's chunks that did *not* need to be sent,
    /// i.e. how much a whole-device replication would have cost over this
    /// incremental one. `0.0` when the origin has no chunks.
    pub fn percent_saved(&self) -> f64 {
        if self.total_origin_chunks == 0 {
            return 0.0;
        }
        let sent = self.chunks_sent.min(self.total_origin_chunks) as f64;
        (1.0 - sent / self.total_origin_chunks as f64) * 100.0
    }
}

/// Drains `exceptions` against `origin`, writing a framed record for every
/// changed chunk to `out`. Writes the handshake first. Returns a summary of
/// what was sent.
pub fn send<R, O, W>(
    mut exceptions: ExceptionStoreReader<R>,
    origin: &mut O,
    out: &mut W,
) -> Result<TransferSummary, Error>
where
    R: Read + Seek,
    O: Read + Seek,
    W: Write,
{
    write_handshake(out)?;

    let chunksize = exceptions.chunksize();
    let origin_len = origin.seek(SeekFrom::End(0)).map_err(Error::UnpathedIo)?;
    let total_origin_chunks = origin_len.div_ceil(chunksize as u64);

    let mut buf = vec![0u8; chunksize as usize];
    let mut summary = TransferSummary { total_origin_chunks, ..TransferSummary::default() };

    while let Some(chunk_index) = exceptions.next() {
        let chunk_index = chunk_index?;
        let origin_offset = chunk_index * chunksize as u64;

        origin.seek(SeekFrom::Start(origin_offset)).map_err(Error::UnpathedIo)?;
        read_exact_or_short(origin, &mut buf)?;

        let header = RecordHeader { origin_offset, chunksize };
        header.write_to(out)?;
        out.write_all(&buf)?;

        tracing::debug!(chunk_index, origin_offset, chunksize, "sent chunk");
        summary.chunks_sent += 1;
        summary.bytes_sent += chunksize as u64;
    }

    Ok(summary)
}

fn read_exact_or_short<O: Read>(origin: &mut O, buf: &mut [u8]) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = origin.read(&mut buf[filled..]).map_err(Error::UnpathedIo)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < buf.len() {
        return Err(ProtocolError::OriginReadShort { expected: buf.len(), actual: filled }.into());
    }
    Ok(())
}

/// Opens the exception-store device at `exception_store_path` and the origin
/// device at `origin_path`, then runs [`send`] against them, writing the
/// framed stream to `out`.
pub fn send_from_paths<W: Write>(
    exception_store_path: &Path,
    origin_path: &Path,
    out: &mut W,
) -> Result<TransferSummary, Error> {
    let reader = exception_store::open(exception_store_path)?;
    let mut origin = File::open(origin_path).map_err(|source| Error::io(origin_path, source))?;
    send(reader, &mut origin, out)
}

/// Renders a [`TransferSummary`] the way the CLI prints it when not running
/// in quiet mode.
pub fn format_summary(summary: &TransferSummary) -> String {
    format!(
        "Sent {} of {} chunk(s), {} byte(s) total ({:.1}% saved)",
        summary.chunks_sent,
        summary.total_origin_chunks,
        summary.bytes_sent,
        summary.percent_saved()
    )
}
