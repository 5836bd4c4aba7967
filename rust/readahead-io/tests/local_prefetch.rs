// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::io::{Read, Write};
use std::sync::Arc;

use rand::RngCore;
use readahead_io::testing::TrackingFileHandle;
use readahead_io::{
    assert_io_eq, LocalFileHandle, MergePolicy, PrefetchConfig, SequentialReadCursor,
};

fn write_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file.flush().unwrap();
    file
}

fn open_tracked(file: &tempfile::NamedTempFile) -> Arc<TrackingFileHandle> {
    let local = LocalFileHandle::open(file.path(), None).unwrap();
    Arc::new(TrackingFileHandle::new(Arc::new(local)))
}

#[test_log::test(tokio::test)]
async fn test_register_prefetch_read_clear() {
    let mut data = vec![0; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut data);
    let file = write_file(&data);
    let handle = open_tracked(&file);
    let mut cursor = SequentialReadCursor::new(handle.clone());

    cursor.register_prefetch(100, 50);
    cursor.register_prefetch(150, 30);
    assert_eq!(cursor.registry().len(), 1);
    cursor.prefetch_registered().await.unwrap();
    assert_eq!(
        cursor
            .registry()
            .get_read_head(100)
            .unwrap()
            .buffer()
            .unwrap()
            .len(),
        80
    );
    assert_io_eq!(handle.incremental_stats(), read_iops, 1);

    cursor.set_location(110);
    let mut first = [0u8; 20];
    cursor.read(&mut first).unwrap();
    assert_eq!(&first[..], &data[110..130]);
    assert_eq!(cursor.location(), 130);
    assert_io_eq!(handle.incremental_stats(), read_iops, 0);

    cursor.clear_registered_prefetch();
    cursor.set_location(110);
    let mut second = [0u8; 10];
    cursor.read(&mut second).unwrap();
    assert_eq!(&second[..], &first[..10]);
    let stats = handle.incremental_stats();
    assert_io_eq!(stats, read_iops, 1);
    assert_eq!(stats.requests, vec![110..120]);
}

/// Lay out length-prefixed frames at scattered offsets, the way column chunks
/// sit in a columnar file, and decode them through the cursor.
#[test_log::test(tokio::test)]
async fn test_decode_scattered_frames() {
    let mut rng = rand::thread_rng();
    let mut data = vec![0u8; 256 * 1024];
    let mut frames = Vec::new();
    let mut offset = 0usize;
    while offset + 8 * 1024 < data.len() {
        let len = 64 + (rng.next_u32() as usize % 4096);
        data[offset..offset + 4].copy_from_slice(&(len as u32).to_le_bytes());
        rng.fill_bytes(&mut data[offset + 4..offset + 4 + len]);
        frames.push((offset as u64, len));
        // Leave a gap so consecutive frames are not adjacent
        offset += 4 + len + 512;
    }
    let file = write_file(&data);
    let handle = open_tracked(&file);
    let config = PrefetchConfig::default()
        .with_io_parallelism(4)
        .with_merge_policy(MergePolicy::Chained);
    let mut cursor = SequentialReadCursor::with_config(handle.clone(), config);

    for (offset, len) in &frames {
        // Header and payload are declared separately and merged back together
        cursor.register_prefetch(*offset, 4);
        cursor.register_prefetch(offset + 4, *len as u64);
    }
    assert_eq!(cursor.registry().len(), frames.len());
    cursor.prefetch_registered().await.unwrap();
    assert_io_eq!(handle.incremental_stats(), read_iops, frames.len() as u64);

    for (offset, len) in &frames {
        cursor.set_location(*offset);
        let mut header = [0u8; 4];
        Read::read_exact(&mut cursor, &mut header).unwrap();
        assert_eq!(u32::from_le_bytes(header) as usize, *len);

        let mut payload = vec![0u8; *len];
        Read::read_exact(&mut cursor, &mut payload).unwrap();
        let start = *offset as usize + 4;
        assert_eq!(&payload[..], &data[start..start + len]);
    }
    assert_io_eq!(handle.incremental_stats(), read_iops, 0, "every frame was cached");
    assert_eq!(cursor.stats().direct_reads, 0);
}
