//! C5 — drives extraction of one or more partitions across a bounded pool
//! of worker threads that pull from a shared work queue and take turns
//! reading the underlying payload source through a single mutex.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::chromeos_update_engine::PartitionUpdate;
use crate::error::{Error, Result};
use crate::operation;
use crate::payload::{partition_size, Payload};
use crate::progress::ProgressReporter;
use crate::source::Source;

const MAX_THREADS: usize = 8;

/// Picks a worker count the way the original tool did: the number of CPUs,
/// clamped to `[1, 8]`, defaulting to 4 if the CPU count can't be
/// determined.
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, MAX_THREADS)
}

struct WorkQueue {
    partitions: Vec<PartitionUpdate>,
    cursor: Mutex<usize>,
}

impl WorkQueue {
    fn next(&self) -> Option<&PartitionUpdate> {
        let mut cursor = self.cursor.lock().expect("work queue cursor mutex poisoned");
        if *cursor >= self.partitions.len() {
            return None;
        }
        let index = *cursor;
        *cursor += 1;
        Some(&self.partitions[index])
    }
}

/// Extracts `partition_names` (or every partition in the manifest, if
/// empty) from `payload` into `.img` files under `out_dir`, using up to
/// `requested_threads` worker threads (clamped to `[1, 8]` and to the
/// number of partitions being extracted). Consumes `payload`: its source is
/// moved behind a shared mutex for the duration of the run.
#[allow(clippy::too_many_arguments)]
pub fn extract(
    payload: Payload,
    partition_names: &[String],
    out_dir: &Path,
    requested_threads: usize,
    progress: &ProgressReporter,
    cancel: &AtomicBool,
) -> Result<()> {
    std::fs::create_dir_all(out_dir).map_err(Error::WriteFailed)?;

    let selected: Vec<PartitionUpdate> = if partition_names.is_empty() {
        payload.manifest.partitions.clone()
    } else {
        // A partition is included if its name appears as a substring anywhere
        // in the joined filter, matching the original selection logic rather
        // than doing an exact-name lookup; a name with no match is simply
        // left out, never a fatal error.
        let filter = partition_names.join(",");
        payload
            .manifest
            .partitions
            .iter()
            .filter(|p| filter.contains(p.partition_name.as_str()))
            .cloned()
            .collect()
    };

    if selected.is_empty() {
        return Ok(());
    }

    let thread_count = requested_threads.clamp(1, MAX_THREADS).min(selected.len());

    let block_size = payload.block_size;
    let data_base_offset = payload.data_base_offset;
    let source = Mutex::new(payload.source);

    let queue = WorkQueue {
        partitions: selected,
        cursor: Mutex::new(0),
    };
    let errors: Mutex<Vec<Error>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(thread_count);

        for _ in 0..thread_count {
            let queue = &queue;
            let source = &source;
            let out_dir = out_dir;
            let progress = progress;
            let cancel = cancel;
            let errors = &errors;

            handles.push(scope.spawn(move || {
                worker_loop(
                    queue,
                    source,
                    block_size,
                    data_base_offset,
                    out_dir,
                    progress,
                    cancel,
                    errors,
                );
            }));
        }

        for handle in handles {
            let _ = handle.join();
        }
    });

    let mut errors = errors.into_inner().expect("error list mutex poisoned");
    if let Some(first) = errors.drain(..).next() {
        return Err(first);
    }
    if cancel.load(Ordering::SeqCst) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    queue: &WorkQueue,
    source: &Mutex<Source>,
    block_size: u64,
    data_base_offset: u64,
    out_dir: &Path,
    progress: &ProgressReporter,
    cancel: &AtomicBool,
    errors: &Mutex<Vec<Error>>,
) {
    while let Some(partition) = queue.next() {
        if cancel.load(Ordering::SeqCst) {
            return;
        }

        if let Err(e) = extract_partition(partition, source, block_size, data_base_offset, out_dir, progress, cancel)
        {
            errors.lock().expect("error list mutex poisoned").push(e);
            cancel.store(true, Ordering::SeqCst);
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn extract_partition(
    partition: &PartitionUpdate,
    source: &Mutex<Source>,
    block_size: u64,
    data_base_offset: u64,
    out_dir: &Path,
    progress: &ProgressReporter,
    cancel: &AtomicBool,
) -> Result<()> {
    let size = partition_size(partition, block_size);
    let mut row = progress.add_row(&partition.partition_name, size);
    row.start(partition.operations.len() as u64);

    let out_path = out_dir.join(format!("{}.img", partition.partition_name));
    let mut out_file = File::create(&out_path).map_err(Error::WriteFailed)?;
    if size > 0 {
        out_file.set_len(size).map_err(Error::WriteFailed)?;
    }

    for (index, op) in partition.operations.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            row.abandon("cancelled");
            return Err(Error::Cancelled);
        }

        row.set_operation(index as u64, op.r#type().as_str_name());

        if let Err(e) = operation::execute(
            op,
            index,
            &partition.partition_name,
            source,
            data_base_offset,
            block_size,
            &mut out_file,
        ) {
            row.abandon("error");
            return Err(e);
        }
    }

    row.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chromeos_update_engine::{
        install_operation::Type as OpType, DeltaArchiveManifest, Extent, InstallOperation, PartitionInfo,
    };
    use prost::Message;
    use std::io::Write;
    use std::sync::atomic::AtomicBool;

    fn build_zero_payload(partition_name: &str, blocks: u64) -> Vec<u8> {
        let operation = InstallOperation {
            r#type: OpType::Zero as i32,
            data_offset: None,
            data_length: None,
            src_extents: vec![],
            src_length: None,
            dst_extents: vec![Extent {
                start_block: Some(0),
                num_blocks: Some(blocks),
            }],
            dst_length: None,
            data_sha256_hash: None,
            src_sha256_hash: None,
        };
        let partition = crate::chromeos_update_engine::PartitionUpdate {
            partition_name: partition_name.to_string(),
            run_postinstall: None,
            postinstall_path: None,
            filesystem_type: None,
            new_partition_signature: vec![],
            old_partition_info: None,
            new_partition_info: Some(PartitionInfo {
                size: Some(blocks * 4096),
                hash: None,
            }),
            operations: vec![operation],
            postinstall_optional: None,
        };
        let manifest = DeltaArchiveManifest {
            install_operations: vec![],
            kernel_install_operations: vec![],
            block_size: Some(4096),
            signatures_offset: None,
            signatures_size: None,
            old_kernel_info: None,
            new_kernel_info: None,
            old_rootfs_info: None,
            new_rootfs_info: None,
            old_image_info: None,
            new_image_info: None,
            minor_version: Some(0),
            partitions: vec![partition],
            max_timestamp: None,
            dynamic_partition_metadata_groups: vec![],
            partial_update: None,
            security_patch_level: None,
        };
        let manifest_bytes = manifest.encode_to_vec();

        let mut buf = Vec::new();
        buf.extend_from_slice(b"CrAU");
        buf.extend_from_slice(&2u64.to_be_bytes());
        buf.extend_from_slice(&(manifest_bytes.len() as u64).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&manifest_bytes);
        buf
    }

    #[test]
    fn extracts_single_zero_partition_to_expected_size() {
        let bytes = build_zero_payload("boot", 4);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();

        let payload = Payload::open_file(f.path()).unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let progress = ProgressReporter::new();
        let cancel = AtomicBool::new(false);

        extract(payload, &[], out_dir.path(), 2, &progress, &cancel).unwrap();

        let out_path = out_dir.path().join("boot.img");
        let metadata = std::fs::metadata(&out_path).unwrap();
        assert_eq!(metadata.len(), 4 * 4096);
        let contents = std::fs::read(&out_path).unwrap();
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn unmatched_images_filter_silently_excludes_everything() {
        let bytes = build_zero_payload("boot", 1);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();

        let payload = Payload::open_file(f.path()).unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let progress = ProgressReporter::new();
        let cancel = AtomicBool::new(false);

        extract(
            payload,
            &["nonexistent".to_string()],
            out_dir.path(),
            1,
            &progress,
            &cancel,
        )
        .unwrap();

        assert!(!out_dir.path().join("boot.img").exists());
    }

    fn build_two_partition_zero_payload(first: &str, second: &str, blocks: u64) -> Vec<u8> {
        let make_partition = |name: &str| {
            let operation = InstallOperation {
                r#type: OpType::Zero as i32,
                data_offset: None,
                data_length: None,
                src_extents: vec![],
                src_length: None,
                dst_extents: vec![Extent {
                    start_block: Some(0),
                    num_blocks: Some(blocks),
                }],
                dst_length: None,
                data_sha256_hash: None,
                src_sha256_hash: None,
            };
            crate::chromeos_update_engine::PartitionUpdate {
                partition_name: name.to_string(),
                run_postinstall: None,
                postinstall_path: None,
                filesystem_type: None,
                new_partition_signature: vec![],
                old_partition_info: None,
                new_partition_info: Some(PartitionInfo {
                    size: Some(blocks * 4096),
                    hash: None,
                }),
                operations: vec![operation],
                postinstall_optional: None,
            }
        };
        let manifest = DeltaArchiveManifest {
            install_operations: vec![],
            kernel_install_operations: vec![],
            block_size: Some(4096),
            signatures_offset: None,
            signatures_size: None,
            old_kernel_info: None,
            new_kernel_info: None,
            old_rootfs_info: None,
            new_rootfs_info: None,
            old_image_info: None,
            new_image_info: None,
            minor_version: Some(0),
            partitions: vec![make_partition(first), make_partition(second)],
            max_timestamp: None,
            dynamic_partition_metadata_groups: vec![],
            partial_update: None,
            security_patch_level: None,
        };
        let manifest_bytes = manifest.encode_to_vec();

        let mut buf = Vec::new();
        buf.extend_from_slice(b"CrAU");
        buf.extend_from_slice(&2u64.to_be_bytes());
        buf.extend_from_slice(&(manifest_bytes.len() as u64).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&manifest_bytes);
        buf
    }

    #[test]
    fn images_filter_extracts_only_the_matching_partition() {
        let bytes = build_two_partition_zero_payload("boot", "system", 1);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();

        let payload = Payload::open_file(f.path()).unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let progress = ProgressReporter::new();
        let cancel = AtomicBool::new(false);

        extract(payload, &["boot".to_string()], out_dir.path(), 2, &progress, &cancel).unwrap();

        assert!(out_dir.path().join("boot.img").exists());
        assert!(!out_dir.path().join("system.img").exists());
    }

    #[test]
    fn cancellation_stops_remaining_partitions_and_reports_cancelled() {
        let bytes = build_two_partition_zero_payload("boot", "system", 1);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();

        let payload = Payload::open_file(f.path()).unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let progress = ProgressReporter::new();
        let cancel = AtomicBool::new(true);

        let err = extract(payload, &[], out_dir.path(), 1, &progress, &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
