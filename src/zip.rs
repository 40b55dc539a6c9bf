//! C2 — locates the `payload.bin` entry inside a ZIP/ZIP64 container
//! without needing a general-purpose ZIP reader, so the same logic works
//! over both local files and HTTP ranged sources.

use crate::error::{Error, Result};
use crate::source::Source;

const EOCD_SIG: u32 = 0x0605_4B50;
const ZIP64_EOCD_LOCATOR_SIG: u32 = 0x0706_4B50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4B50;
const CENTRAL_DIR_HEADER_SIG: u32 = 0x0201_4B50;
const LOCAL_FILE_HEADER_SIG: u32 = 0x0403_4B50;

const EOCD_MIN_SIZE: u64 = 22;
const MAX_COMMENT_SIZE: u64 = 65535;
const SCAN_CHUNK: u64 = 8192;

#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub name: String,
    pub compression_method: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub local_header_offset: u64,
    pub data_offset: u64,
}

fn u16le(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn u32le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn u64le(b: &[u8]) -> u64 {
    u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ])
}

/// Scans backwards from end-of-file in 8 KiB chunks (overlapping by 3 bytes
/// so a signature straddling a chunk boundary is still found) looking for
/// the EOCD signature.
fn find_eocd(source: &Source) -> Result<(u64, u16)> {
    let file_size = source.size();
    let max_search = (MAX_COMMENT_SIZE + EOCD_MIN_SIZE).min(file_size);
    let search_limit = file_size.saturating_sub(max_search);

    let mut current_pos = file_size;
    while current_pos > search_limit {
        let available = current_pos - search_limit;
        let read_size = SCAN_CHUNK.min(available);
        let read_pos = current_pos - read_size;

        let buf = source.read_vec_at(read_pos, read_size as usize)?;

        let mut i = buf.len();
        while i >= 4 {
            if u32le(&buf[i - 4..i]) == EOCD_SIG {
                let eocd_offset = read_pos + (i as u64 - 4);
                // Total entries in the central directory sits at offset +10
                // from the signature; read it directly rather than trusting
                // it to still be inside this scan chunk.
                let mut tmp = [0u8; 2];
                source.read_exact_at(eocd_offset + 10, &mut tmp)?;
                let num_entries = u16le(&tmp);
                return Ok((eocd_offset, num_entries));
            }
            i -= 1;
        }

        current_pos = read_pos;
        if current_pos < 3 {
            break;
        }
        current_pos -= 3;
    }

    Err(Error::ZipMalformed("EOCD signature not found".to_string()))
}

/// Reads the 20 bytes preceding the EOCD to find the ZIP64 locator, then
/// follows it to the ZIP64 EOCD record for the true central-directory
/// offset and entry count.
fn read_zip64_eocd(source: &Source, eocd_offset: u64) -> Result<(u64, u64)> {
    if eocd_offset < 20 {
        return Err(Error::ZipMalformed(
            "not enough space before EOCD for a ZIP64 locator".to_string(),
        ));
    }
    let search_start = eocd_offset - 20;
    let buf = source.read_vec_at(search_start, 20)?;

    let mut locator_offset = None;
    let mut i = buf.len();
    while i >= 4 {
        if u32le(&buf[i - 4..i]) == ZIP64_EOCD_LOCATOR_SIG && i + 12 <= buf.len() {
            locator_offset = Some(u64le(&buf[i + 4..i + 12]));
            break;
        }
        i -= 1;
    }
    let zip64_eocd_offset =
        locator_offset.ok_or_else(|| Error::ZipMalformed("ZIP64 EOCD locator not found".to_string()))?;

    let rec = source.read_vec_at(zip64_eocd_offset, 56)?;
    if u32le(&rec[0..4]) != ZIP64_EOCD_SIG {
        return Err(Error::ZipMalformed("bad ZIP64 EOCD signature".to_string()));
    }
    let num_entries = u64le(&rec[32..40]);
    let cd_offset = u64le(&rec[48..56]);
    Ok((cd_offset, num_entries))
}

fn central_directory_info(source: &Source) -> Result<(u64, u64)> {
    let (eocd_offset, num_entries_16) = find_eocd(source)?;

    let mut cd_buf = [0u8; 4];
    source.read_exact_at(eocd_offset + 16, &mut cd_buf)?;
    let cd_offset_32 = u32le(&cd_buf);

    if cd_offset_32 == 0xFFFF_FFFF {
        read_zip64_eocd(source, eocd_offset)
    } else {
        Ok((cd_offset_32 as u64, num_entries_16 as u64))
    }
}

/// Reads one 46-byte central-directory record at `offset`, returning the
/// entry and the offset immediately following it (name + extra + comment).
fn read_central_directory_entry(source: &Source, offset: u64) -> Result<(ZipEntry, u64)> {
    let header = source.read_vec_at(offset, 46)?;
    if u32le(&header[0..4]) != CENTRAL_DIR_HEADER_SIG {
        return Err(Error::ZipMalformed(format!(
            "bad central directory signature at offset {offset}"
        )));
    }

    let compression_method = u16le(&header[10..12]);
    let mut compressed_size = u32le(&header[20..24]) as u64;
    let mut uncompressed_size = u32le(&header[24..28]) as u64;
    let filename_len = u16le(&header[28..30]) as u64;
    let extra_len = u16le(&header[30..32]) as u64;
    let comment_len = u16le(&header[32..34]) as u64;
    let mut local_header_offset = u32le(&header[42..46]) as u64;

    let name_bytes = source.read_vec_at(offset + 46, filename_len as usize)?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    if extra_len > 0
        && (local_header_offset == 0xFFFF_FFFF
            || compressed_size == 0xFFFF_FFFF
            || uncompressed_size == 0xFFFF_FFFF)
    {
        let extra = source.read_vec_at(offset + 46 + filename_len, extra_len as usize)?;
        let mut pos = 0usize;
        while pos + 4 <= extra.len() {
            let header_id = u16le(&extra[pos..pos + 2]);
            let data_size = u16le(&extra[pos + 2..pos + 4]) as usize;
            let section_end = pos + 4 + data_size;
            if header_id == 0x0001 && section_end <= extra.len() {
                let mut field = pos + 4;
                if uncompressed_size == 0xFFFF_FFFF && field + 8 <= section_end {
                    uncompressed_size = u64le(&extra[field..field + 8]);
                    field += 8;
                }
                if compressed_size == 0xFFFF_FFFF && field + 8 <= section_end {
                    compressed_size = u64le(&extra[field..field + 8]);
                    field += 8;
                }
                if local_header_offset == 0xFFFF_FFFF && field + 8 <= section_end {
                    local_header_offset = u64le(&extra[field..field + 8]);
                }
                break;
            }
            pos += 4 + data_size;
        }
    }

    let entry = ZipEntry {
        name,
        compression_method,
        compressed_size,
        uncompressed_size,
        local_header_offset,
        data_offset: 0,
    };
    let next = offset + 46 + filename_len + extra_len + comment_len;
    Ok((entry, next))
}

/// Walks the central directory looking for a STORED entry named
/// `payload.bin` or ending in `/payload.bin`.
pub fn find_payload_entry(source: &Source) -> Result<ZipEntry> {
    let (cd_offset, num_entries) = central_directory_info(source)?;

    let mut offset = cd_offset;
    for _ in 0..num_entries {
        let (entry, next) = read_central_directory_entry(source, offset)?;
        offset = next;

        if entry.compression_method != 0 {
            continue;
        }
        if entry.name == "payload.bin" || entry.name.ends_with("/payload.bin") {
            return Ok(entry);
        }
    }

    Err(Error::PayloadNotFoundInZip)
}

/// Resolves `data_offset` from the entry's own local file header, whose
/// name/extra lengths may disagree with the central directory's.
pub fn resolve_data_offset(source: &Source, entry: &mut ZipEntry) -> Result<()> {
    let header = source.read_vec_at(entry.local_header_offset, 30)?;
    if u32le(&header[0..4]) != LOCAL_FILE_HEADER_SIG {
        return Err(Error::ZipMalformed(format!(
            "bad local file header signature at offset {}",
            entry.local_header_offset
        )));
    }

    let local_compression = u16le(&header[8..10]);
    if local_compression != 0 {
        return Err(Error::ZipMalformed(
            "payload.bin entry's local header disagrees with central directory on compression"
                .to_string(),
        ));
    }

    let filename_len = u16le(&header[26..28]) as u64;
    let extra_len = u16le(&header[28..30]) as u64;
    entry.data_offset = entry.local_header_offset + 30 + filename_len + extra_len;
    Ok(())
}

/// Locates `payload.bin` inside a ZIP source and returns its data offset.
pub fn locate_payload(source: &Source) -> Result<ZipEntry> {
    let mut entry = find_payload_entry(source)?;
    resolve_data_offset(source, &mut entry)?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use std::io::Write;

    fn write_local_header(buf: &mut Vec<u8>, name: &str) {
        buf.extend_from_slice(&LOCAL_FILE_HEADER_SIG.to_le_bytes());
        buf.extend_from_slice(&20u16.to_le_bytes()); // version needed
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags
        buf.extend_from_slice(&0u16.to_le_bytes()); // compression = stored
        buf.extend_from_slice(&0u16.to_le_bytes()); // mod time
        buf.extend_from_slice(&0u16.to_le_bytes()); // mod date
        buf.extend_from_slice(&0u32.to_le_bytes()); // crc32
        buf.extend_from_slice(&0u32.to_le_bytes()); // compressed size
        buf.extend_from_slice(&0u32.to_le_bytes()); // uncompressed size
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // extra len
        buf.extend_from_slice(name.as_bytes());
    }

    fn write_central_entry(buf: &mut Vec<u8>, name: &str, local_offset: u32, comp_size: u32, uncomp_size: u32) {
        buf.extend_from_slice(&CENTRAL_DIR_HEADER_SIG.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // version made by
        buf.extend_from_slice(&20u16.to_le_bytes()); // version needed
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags
        buf.extend_from_slice(&0u16.to_le_bytes()); // compression
        buf.extend_from_slice(&0u16.to_le_bytes()); // mod time
        buf.extend_from_slice(&0u16.to_le_bytes()); // mod date
        buf.extend_from_slice(&0u32.to_le_bytes()); // crc32
        buf.extend_from_slice(&comp_size.to_le_bytes());
        buf.extend_from_slice(&uncomp_size.to_le_bytes());
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // extra len
        buf.extend_from_slice(&0u16.to_le_bytes()); // comment len
        buf.extend_from_slice(&0u16.to_le_bytes()); // disk number start
        buf.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        buf.extend_from_slice(&0u32.to_le_bytes()); // external attrs
        buf.extend_from_slice(&local_offset.to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
    }

    fn build_basic_zip(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let local_offset = 0u32;
        write_local_header(&mut buf, "payload.bin");
        buf.extend_from_slice(payload);

        let cd_offset = buf.len() as u32;
        write_central_entry(&mut buf, "payload.bin", local_offset, payload.len() as u32, payload.len() as u32);
        let cd_size = buf.len() as u32 - cd_offset;

        // EOCD
        buf.extend_from_slice(&EOCD_SIG.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // disk number
        buf.extend_from_slice(&0u16.to_le_bytes()); // disk with cd
        buf.extend_from_slice(&1u16.to_le_bytes()); // entries this disk
        buf.extend_from_slice(&1u16.to_le_bytes()); // total entries
        buf.extend_from_slice(&cd_size.to_le_bytes());
        buf.extend_from_slice(&cd_offset.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // comment len
        buf
    }

    fn source_from_bytes(bytes: Vec<u8>) -> (tempfile::NamedTempFile, Source) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();
        let source = Source::open_file(f.path()).unwrap();
        (f, source)
    }

    #[test]
    fn locates_payload_in_basic_zip() {
        let payload = b"CrAUhello world this is a fake payload";
        let zip_bytes = build_basic_zip(payload);
        let (_guard, source) = source_from_bytes(zip_bytes);

        let entry = locate_payload(&source).unwrap();
        let magic = source.read_vec_at(entry.data_offset, 4).unwrap();
        assert_eq!(&magic, b"CrAU");
    }

    #[test]
    fn locates_nested_payload_path() {
        let payload = b"CrAUnested payload bytes";
        let mut buf = Vec::new();
        let name = "META-INF/com/google/android/payload.bin";
        write_local_header(&mut buf, name);
        buf.extend_from_slice(payload);
        let cd_offset = buf.len() as u32;
        write_central_entry(&mut buf, name, 0, payload.len() as u32, payload.len() as u32);
        let cd_size = buf.len() as u32 - cd_offset;
        buf.extend_from_slice(&EOCD_SIG.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&cd_size.to_le_bytes());
        buf.extend_from_slice(&cd_offset.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());

        let (_guard, source) = source_from_bytes(buf);
        let entry = locate_payload(&source).unwrap();
        assert_eq!(entry.name, name);
        let magic = source.read_vec_at(entry.data_offset, 4).unwrap();
        assert_eq!(&magic, b"CrAU");
    }

    #[test]
    fn eocd_straddling_chunk_boundary_is_found() {
        // Pad the file so the EOCD signature straddles an 8 KiB scan boundary.
        let payload = b"CrAUpadded payload";
        let mut buf = build_basic_zip(payload);
        // Insert filler bytes as a ZIP comment on the EOCD so the EOCD
        // record's start lands across an 8192-byte read boundary.
        let eocd_pos = buf.len() - 22;
        let pad_len = (SCAN_CHUNK as usize) - (buf.len() % SCAN_CHUNK as usize) + 2;
        let comment = vec![b'x'; pad_len];
        let mut new_buf = buf[..eocd_pos].to_vec();
        // re-emit EOCD with a comment length field set
        new_buf.extend_from_slice(&buf[eocd_pos..eocd_pos + 20]);
        new_buf.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        new_buf.extend_from_slice(&comment);
        buf = new_buf;

        let (_guard, source) = source_from_bytes(buf);
        let entry = find_payload_entry(&source).unwrap();
        assert_eq!(entry.name, "payload.bin");
    }
}
