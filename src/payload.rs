//! C3 — locates and parses the CrAU header and `DeltaArchiveManifest`,
//! whether the source is a bare payload, a payload wrapped in a ZIP, or
//! either of those served over HTTP.

use std::path::Path;

use prost::Message;
use serde::Serialize;
use size::Size;

use crate::chromeos_update_engine::DeltaArchiveManifest;
use crate::error::{Error, Result};
use crate::source::Source;
use crate::zip;

const CRAU_MAGIC: &[u8; 4] = b"CrAU";
const SUPPORTED_MAJOR_VERSION: u64 = 2;
/// magic(4) + version(8) + manifest_len(8) + metadata_signature_len(4)
const HEADER_SIZE: u64 = 24;

/// A parsed payload: the manifest plus the base offset within `source`
/// where operation data (`data_offset` fields in the manifest) is
/// relative to.
pub struct Payload {
    pub source: Source,
    pub manifest: DeltaArchiveManifest,
    pub block_size: u64,
    /// Absolute offset of the first byte after the manifest and metadata
    /// signature; every `InstallOperation::data_offset` is relative to this.
    pub data_base_offset: u64,
}

impl Payload {
    /// Opens a payload from a local path, which may be a raw CrAU file or a
    /// ZIP archive containing `payload.bin`.
    pub fn open_file(path: &Path) -> Result<Self> {
        let source = Source::open_file(path)?;
        Self::from_source(source)
    }

    /// Opens a payload served over HTTP(S), which may itself be a raw CrAU
    /// resource or a ZIP archive (ranged reads locate `payload.bin` inside
    /// it without downloading the whole archive).
    pub fn open_http(url: &str, user_agent: Option<&str>) -> Result<Self> {
        let source = Source::open_http(url, user_agent)?;
        Self::from_source(source)
    }

    /// Dispatches on the source's leading bytes: `CrAU` for a raw payload,
    /// `PK\x03\x04` for a ZIP container whose `payload.bin` entry is then
    /// located and re-based.
    fn from_source(source: Source) -> Result<Self> {
        let mut head = [0u8; 4];
        source.read_exact_at(0, &mut head)?;

        if &head == CRAU_MAGIC {
            return Self::parse_crau(source, 0);
        }
        if &head == b"PK\x03\x04" {
            let entry = zip::locate_payload(&source)?;
            let mut inner_head = [0u8; 4];
            source.read_exact_at(entry.data_offset, &mut inner_head)?;
            if &inner_head != CRAU_MAGIC {
                return Err(Error::PayloadUnknownFormat(
                    "payload.bin inside ZIP does not start with CrAU magic".to_string(),
                ));
            }
            return Self::parse_crau(source, entry.data_offset);
        }

        Err(Error::PayloadUnknownFormat(format!(
            "unrecognized leading bytes {head:02x?}"
        )))
    }

    /// Parses the CrAU header, manifest, and metadata signature located at
    /// `base` within `source`, and returns a [`Payload`] whose
    /// `data_base_offset` is the absolute start of the operation data blob.
    fn parse_crau(source: Source, base: u64) -> Result<Self> {
        let header = source.read_vec_at(base, HEADER_SIZE as usize)?;

        let version = u64::from_be_bytes(header[4..12].try_into().unwrap());
        if version != SUPPORTED_MAJOR_VERSION {
            return Err(Error::PayloadUnknownFormat(format!(
                "unsupported payload version {version}, expected {SUPPORTED_MAJOR_VERSION}"
            )));
        }

        let manifest_len = u64::from_be_bytes(header[12..20].try_into().unwrap());
        let metadata_sig_len = u32::from_be_bytes(header[20..24].try_into().unwrap()) as u64;

        let manifest_offset = base + HEADER_SIZE;
        let manifest_bytes = source.read_vec_at(manifest_offset, manifest_len as usize)?;
        let manifest = DeltaArchiveManifest::decode(manifest_bytes.as_slice())
            .map_err(|e| Error::ManifestCorrupt(e.to_string()))?;

        let block_size = if manifest.block_size() == 0 {
            4096
        } else {
            manifest.block_size() as u64
        };

        let data_base_offset = manifest_offset + manifest_len + metadata_sig_len;

        Ok(Self {
            source,
            manifest,
            block_size,
            data_base_offset,
        })
    }

    /// Names of every partition present in the manifest, in manifest order.
    pub fn partition_names(&self) -> Vec<&str> {
        self.manifest
            .partitions
            .iter()
            .map(|p| p.partition_name.as_str())
            .collect()
    }

    /// Exact-name partition lookup. Not used by the `--images` selection
    /// path in `scheduler::extract` (that filter is a substring-of-joined-names
    /// match and never fails on an unmatched name); this remains a plain
    /// library-level accessor for callers that want a single named partition.
    pub fn partition(&self, name: &str) -> Result<&crate::chromeos_update_engine::PartitionUpdate> {
        self.manifest
            .partitions
            .iter()
            .find(|p| p.partition_name == name)
            .ok_or_else(|| Error::PartitionNotFound(name.to_string()))
    }

    /// Total decompressed size of a partition, computed from the extent
    /// with the highest `start_block + num_blocks` among its operations'
    /// destination extents.
    pub fn partition_size(&self, name: &str) -> Result<u64> {
        Ok(partition_size(self.partition(name)?, self.block_size))
    }

    /// Builds the list-mode summary: per-partition sizes/operation counts
    /// plus totals, in the schema printed as JSON by the CLI's `--list` mode.
    pub fn list_summary(&self) -> ListOutput {
        let partitions = self
            .manifest
            .partitions
            .iter()
            .map(|p| {
                let size_bytes = partition_size(p, self.block_size);
                PartitionSummary {
                    name: p.partition_name.clone(),
                    size_bytes,
                    size_readable: Size::from_bytes(size_bytes).to_string(),
                    operations: p.operations.len() as u64,
                }
            })
            .collect::<Vec<_>>();

        let total_size_bytes = partitions.iter().map(|p| p.size_bytes).sum();
        let total_operations = partitions.iter().map(|p| p.operations).sum();

        ListOutput {
            total_partitions: partitions.len() as u64,
            total_operations,
            total_size_bytes,
            total_size_readable: Size::from_bytes(total_size_bytes).to_string(),
            security_patch_level: self.manifest.security_patch_level.clone(),
            partitions,
        }
    }
}

/// Total decompressed size of `partition`, computed from its
/// `new_partition_info` when present, falling back to the highest
/// `start_block + num_blocks` among its operations' destination extents.
pub fn partition_size(partition: &crate::chromeos_update_engine::PartitionUpdate, block_size: u64) -> u64 {
    if let Some(info) = &partition.new_partition_info {
        if info.size() > 0 {
            return info.size();
        }
    }
    let max_block = partition
        .operations
        .iter()
        .flat_map(|op| op.dst_extents.iter())
        .map(|e| e.start_block() + e.num_blocks())
        .max()
        .unwrap_or(0);
    max_block * block_size
}

#[derive(Debug, Serialize)]
pub struct PartitionSummary {
    pub name: String,
    pub size_bytes: u64,
    pub size_readable: String,
    pub operations: u64,
}

#[derive(Debug, Serialize)]
pub struct ListOutput {
    pub partitions: Vec<PartitionSummary>,
    pub total_partitions: u64,
    pub total_operations: u64,
    pub total_size_bytes: u64,
    pub total_size_readable: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_patch_level: Option<String>,
}
