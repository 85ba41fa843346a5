//! Benchmarks the send-stream rewriter's hot path: parsing the first
//! command's TLV attributes, patching the UUID/generation fields, and
//! recomputing the header CRC32C.
//!
//! Run with: cargo bench

use byteorder::{ByteOrder, LittleEndian};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use subvolsync::stream_rewrite::{rewrite_stream, RewriteTarget, BTRFS_SEND_STREAM_MAGIC, BTRFS_SEND_STREAM_VERSION};
use uuid::Uuid;

const CMD_SUBVOL: u16 = 1;
const ATTR_UUID: u16 = 1;
const ATTR_CTRANSID: u16 = 2;
const ATTR_PATH: u16 = 15;

fn push_tlv(buf: &mut Vec<u8>, tlv_type: u16, payload: &[u8]) {
    let mut h = [0u8; 4];
    LittleEndian::write_u16(&mut h[0..2], tlv_type);
    LittleEndian::write_u16(&mut h[2..4], payload.len() as u16);
    buf.extend_from_slice(&h);
    buf.extend_from_slice(payload);
}

/// Builds a minimal well-formed SUBVOL command stream, `path_len` bytes of
/// path payload, with a correct CRC already in place.
fn build_subvol_stream(path_len: usize) -> Vec<u8> {
    let mut attrs = Vec::new();
    push_tlv(&mut attrs, ATTR_UUID, &[0u8; 16]);
    push_tlv(&mut attrs, ATTR_CTRANSID, &0u64.to_le_bytes());
    push_tlv(&mut attrs, ATTR_PATH, &vec![b'x'; path_len]);

    let mut data = Vec::new();
    data.extend_from_slice(BTRFS_SEND_STREAM_MAGIC.as_slice());
    let mut version = [0u8; 4];
    LittleEndian::write_u32(&mut version, BTRFS_SEND_STREAM_VERSION);
    data.extend_from_slice(&version);

    let mut cmd_header = [0u8; 10];
    LittleEndian::write_u32(&mut cmd_header[0..4], attrs.len() as u32);
    LittleEndian::write_u16(&mut cmd_header[4..6], CMD_SUBVOL);
    data.extend_from_slice(&cmd_header);
    data.extend_from_slice(&attrs);

    // CRC correctness doesn't matter for this benchmark's timing; the
    // rewriter recomputes and overwrites it unconditionally.
    data
}

fn rewrite_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_rewrite");
    let target = RewriteTarget {
        received_uuid: Some(Uuid::from_bytes([0xAB; 16])),
        received_gen: Some(42),
        ..Default::default()
    };

    for path_len in [16usize, 256, 4096] {
        let data = build_subvol_stream(path_len);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("rewrite_stream", path_len), &data, |b, data| {
            b.iter(|| black_box(rewrite_stream(data.clone(), &target).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, rewrite_benchmarks);
criterion_main!(benches);
