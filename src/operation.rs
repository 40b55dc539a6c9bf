//! C4 — executes a single `InstallOperation` against an output file,
//! pulling compressed source bytes from the shared payload source and
//! dispatching to the codec its type names.

use std::io::{BufWriter, Seek, Write};

use crate::chromeos_update_engine::{install_operation::Type as OpType, InstallOperation};
use crate::error::{Error, Result};
use crate::extent::{Fragment, FragmentFile, SectionFile};
use crate::source::Source;

/// Decoded output is never buffered in full; writes to `sink` pass through a
/// `BufWriter` capped at this size so even a multi-GB decompressed partition
/// streams through bounded memory.
const WRITE_CHUNK: usize = 8 * 1024;

/// Executes `op` against `output`, writing decompressed (or zeroed, or raw
/// copied) bytes into the destination extents. `data_base_offset` is the
/// absolute offset `op.data_offset` is relative to.
pub fn execute<W: Write + Seek>(
    op: &InstallOperation,
    op_index: usize,
    partition_name: &str,
    source: &std::sync::Mutex<Source>,
    data_base_offset: u64,
    block_size: u64,
    output: &mut W,
) -> Result<()> {
    let op_type = op.r#type();

    match op_type {
        OpType::Zero => {
            write_zeros(op, block_size, output)?;
        }
        OpType::Replace | OpType::ReplaceBz | OpType::ReplaceXz | OpType::Zstd => {
            let compressed = read_operation_data(op, source, data_base_offset)?;
            write_single_extent(op, block_size, op_type, &compressed, output)?;
        }
        other => {
            return Err(Error::UnsupportedOperation {
                partition: partition_name.to_string(),
                index: op_index,
                op_type: other as i32,
            });
        }
    }

    Ok(())
}

fn read_operation_data(
    op: &InstallOperation,
    source: &std::sync::Mutex<Source>,
    data_base_offset: u64,
) -> Result<Vec<u8>> {
    let offset = data_base_offset + op.data_offset();
    let len = op.data_length() as usize;
    let guard = source.lock().expect("payload source mutex poisoned");
    guard.read_vec_at(offset, len)
}

/// Decodes `compressed` per `op_type` straight into `sink`, never
/// materializing the decompressed stream in memory. `sink` is the
/// `BufWriter`-wrapped destination extent, so every codec's internal write
/// calls reach the output file in ≤`WRITE_CHUNK`-byte pieces.
fn decompress_into<W: Write>(op_type: OpType, compressed: &[u8], sink: &mut W) -> Result<()> {
    match op_type {
        OpType::Replace => std::io::copy(&mut std::io::Cursor::new(compressed), sink)
            .map(|_| ())
            .map_err(Error::WriteFailed),
        OpType::ReplaceBz => {
            let mut reader = std::io::BufReader::new(compressed);
            libribzip2::stream::decode_stream(&mut reader, sink)
                .map_err(|()| Error::DecompressionFailed("bz2 stream decode failed".to_string()))
        }
        OpType::ReplaceXz => {
            let mut cursor = std::io::Cursor::new(compressed);
            lzma_rs::xz_decompress(&mut cursor, sink).map_err(|e| Error::DecompressionFailed(format!("xz: {e}")))
        }
        OpType::Zstd => zstd::stream::copy_decode(compressed, sink)
            .map_err(|e| Error::DecompressionFailed(format!("zstd: {e}"))),
        _ => unreachable!("decompress_into called with non-replace operation type"),
    }
}

/// Writes zero bytes across every destination extent, using `FragmentFile`
/// so extent boundaries (and any zero-padding of a final partial block)
/// are handled the same way a multi-extent data write would be.
fn write_zeros<W: Write + Seek>(op: &InstallOperation, block_size: u64, output: &mut W) -> Result<()> {
    const ZERO_CHUNK: [u8; 64 * 1024] = [0u8; 64 * 1024];

    let mut dst = FragmentFile::new_from_extents(output, &op.dst_extents, block_size).map_err(Error::WriteFailed)?;
    let mut remaining = dst.size();
    while remaining > 0 {
        let n = remaining.min(ZERO_CHUNK.len() as u64) as usize;
        dst.write_all(&ZERO_CHUNK[..n]).map_err(Error::WriteFailed)?;
        remaining -= n as u64;
    }
    Ok(())
}

/// REPLACE-family operations always target the first (and only) destination
/// extent, streaming the decoded bytes into it through a bounded buffer
/// rather than building the whole decompressed image in memory first.
fn write_single_extent<W: Write + Seek>(
    op: &InstallOperation,
    block_size: u64,
    op_type: OpType,
    compressed: &[u8],
    output: &mut W,
) -> Result<()> {
    let extent = op
        .dst_extents
        .first()
        .ok_or_else(|| Error::DecompressionFailed("operation has no destination extent".to_string()))?;
    let fragment = Fragment::from_extent(extent, block_size);

    let dst = SectionFile::new(output, fragment.offset, fragment.size).map_err(Error::WriteFailed)?;
    let mut sink = BufWriter::with_capacity(WRITE_CHUNK, dst);
    decompress_into(op_type, compressed, &mut sink)?;
    sink.flush().map_err(Error::WriteFailed)?;
    Ok(())
}
