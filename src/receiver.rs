//! Applies a framed chunk stream (per [`crate::protocol`]) to a destination
//! device, optionally recording a snapback file that can later be replayed
//! through this same module to undo the apply.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, ProtocolError};
use crate::protocol::{read_and_check_handshake, write_handshake_no_newline, RecordHeader};

/// Summary of a completed apply, used for the final human-readable line.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplySummary {
    pub chunks_applied: u64,
    pub bytes_applied: u64,
}

/// Reads the handshake and then the framed chunk stream from `input`,
/// writing each chunk to `destination` at its recorded offset. When
/// `snapback` is given, the pre-image of every overwritten chunk is captured
/// there first, as its own framed stream, so it can be replayed through
/// [`receive`] later to undo this apply.
pub fn receive<R, D, S>(
    input: &mut R,
    destination: &mut D,
    mut snapback: Option<&mut S>,
) -> Result<ApplySummary, Error>
where
    R: BufRead,
    D: Read + Write + Seek,
    S: Write,
{
    read_and_check_handshake(input)?;

    if let Some(snapback) = snapback.as_deref_mut() {
        write_handshake_no_newline(snapback)?;
    }

    let mut summary = ApplySummary::default();

    while let Some(header) = RecordHeader::read_from(input)? {
        let mut payload = vec![0u8; header.chunksize as usize];
        read_exact_or_short(input, &mut payload)?;

        if let Some(snapback) = snapback.as_deref_mut() {
            capture_preimage(destination, header, snapback)?;
        }

        destination
            .seek(SeekFrom::Start(header.origin_offset))
            .map_err(Error::UnpathedIo)?;
        destination.write_all(&payload).map_err(Error::UnpathedIo)?;

        tracing::debug!(
            origin_offset = header.origin_offset,
            chunksize = header.chunksize,
            "applied chunk"
        );
        summary.chunks_applied += 1;
        summary.bytes_applied += header.chunksize as u64;
    }

    Ok(summary)
}

fn capture_preimage<D: Read + Seek, S: Write>(
    destination: &mut D,
    header: RecordHeader,
    snapback: &mut S,
) -> Result<(), Error> {
    let mut preimage = vec![0u8; header.chunksize as usize];
    destination
        .seek(SeekFrom::Start(header.origin_offset))
        .map_err(Error::UnpathedIo)?;

    let mut filled = 0;
    while filled < preimage.len() {
        let n = destination.read(&mut preimage[filled..]).map_err(Error::UnpathedIo)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    // A destination shorter than the chunk it's about to receive (e.g. a
    // freshly created, sparse test fixture) has an all-zero pre-image past
    // its current end; that's a legitimate state to roll back to.

    header.write_to(snapback)?;
    snapback.write_all(&preimage)?;
    Ok(())
}

fn read_exact_or_short<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).map_err(Error::UnpathedIo)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < buf.len() {
        return Err(ProtocolError::ShortPayload { expected: buf.len(), actual: filled }.into());
    }
    Ok(())
}

/// Opens `destination_path` read-write (without truncating or creating) and
/// runs [`receive`] against it, reading the framed stream from `input` and,
/// if `snapback_path` is given, recording a rollback file there.
pub fn receive_to_path<R: BufRead>(
    input: &mut R,
    destination_path: &Path,
    snapback_path: Option<&Path>,
) -> Result<ApplySummary, Error> {
    let mut destination = OpenOptions::new()
        .read(true)
        .write(true)
        .open(destination_path)
        .map_err(|source| Error::io(destination_path, source))?;

    match snapback_path {
        Some(path) => {
            let mut snapback_file =
                File::create(path).map_err(|source| Error::io(path, source))?;
            receive(input, &mut destination, Some(&mut snapback_file))
        }
        None => receive(input, &mut destination, None::<&mut File>),
    }
}

/// Wraps a plain [`Read`] in a [`BufReader`] so it satisfies [`receive`]'s
/// `BufRead` bound; used when reading framed chunk streams from stdin or a
/// patch file.
pub fn buffered<R: Read>(input: R) -> BufReader<R> {
    BufReader::new(input)
}

/// Renders an [`ApplySummary`] the way the CLI prints it when not running in
/// quiet mode.
pub fn format_summary(summary: &ApplySummary) -> String {
    format!(
        "Applied {} chunk(s), {} byte(s) total",
        summary.chunks_applied, summary.bytes_applied
    )
}
