//! Pipeline composition: every shape round-trips, closes in reverse
//! construction order, and an aborted encrypted pipeline reads as truncated.

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use dumpseal_core::{Close, CompressionAlgorithm, DumpsealError, ErrorKind};
use dumpseal_crypto::Key;
use dumpseal_pipeline::{
    build_read_pipeline, build_write_pipeline, ReadOptions, Stage, StageObserver, WriteOptions,
};
use proptest::prelude::*;

/// Sink whose bytes stay reachable after the pipeline takes ownership.
#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for SharedSink {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(&'static str, Stage)>>);

impl Recorder {
    fn events(&self) -> Vec<(&'static str, Stage)> {
        self.0.lock().unwrap().clone()
    }
}

impl StageObserver for Recorder {
    fn on_close(&self, stage: &Stage) {
        self.0.lock().unwrap().push(("close", *stage));
    }

    fn on_abort(&self, stage: &Stage) {
        self.0.lock().unwrap().push(("abort", *stage));
    }
}

const ALGORITHMS: [CompressionAlgorithm; 3] = [
    CompressionAlgorithm::None,
    CompressionAlgorithm::Gzip,
    CompressionAlgorithm::Zstd,
];

fn key() -> Key {
    Key::from_bytes([0x33u8; 32])
}

fn write_all(
    data: &[u8],
    compression: CompressionAlgorithm,
    key: Option<&Key>,
    chunk_size: u32,
) -> Vec<u8> {
    let sink = SharedSink::default();
    let opts = WriteOptions {
        compression,
        encryption: key,
        chunk_size,
        ..Default::default()
    };
    let mut p = build_write_pipeline(sink.clone(), &opts).unwrap();
    p.write_all(data).unwrap();
    p.close().unwrap();
    assert_eq!(p.bytes_in(), data.len() as u64);
    sink.bytes()
}

fn read_all(artifact: Vec<u8>, key: Option<&Key>) -> Result<Vec<u8>, DumpsealError> {
    let opts = ReadOptions {
        key,
        ..Default::default()
    };
    let mut p = build_read_pipeline(Cursor::new(artifact), &opts)?;
    let mut out = Vec::new();
    p.read_to_end(&mut out)?;
    p.close()?;
    Ok(out)
}

#[test]
fn test_close_runs_in_reverse_construction_order() {
    let key = key();
    for compression in ALGORITHMS {
        for encrypted in [false, true] {
            let recorder = Arc::new(Recorder::default());
            let observer: Arc<dyn StageObserver> = recorder.clone();
            let opts = WriteOptions {
                compression,
                encryption: encrypted.then_some(&key),
                chunk_size: 1024,
                observer: Some(observer),
                ..Default::default()
            };
            let mut p = build_write_pipeline(SharedSink::default(), &opts).unwrap();
            p.write_all(b"payload").unwrap();
            p.close().unwrap();

            let mut expected: Vec<(&str, Stage)> = p
                .stages()
                .iter()
                .map(|s| ("close", *s))
                .collect();
            expected.reverse();
            assert_eq!(recorder.events(), expected, "{compression} encrypted={encrypted}");
            assert_eq!(expected.last(), Some(&("close", Stage::Sink)));
        }
    }
}

#[test]
fn test_abort_runs_in_reverse_order_too() {
    let key = key();
    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn StageObserver> = recorder.clone();
    let opts = WriteOptions {
        compression: CompressionAlgorithm::Zstd,
        encryption: Some(&key),
        observer: Some(observer),
        ..Default::default()
    };
    let mut p = build_write_pipeline(SharedSink::default(), &opts).unwrap();
    p.write_all(&[1u8; 10_000]).unwrap();
    p.abort().unwrap();
    assert_eq!(
        recorder.events(),
        vec![
            ("abort", Stage::Compress(CompressionAlgorithm::Zstd)),
            ("abort", Stage::Encrypt { chunk_size: 65_536 }),
            ("abort", Stage::Sink),
        ]
    );
}

#[test]
fn test_read_pipeline_closes_outermost_first() {
    let key = key();
    let artifact = write_all(b"SELECT 1;", CompressionAlgorithm::Gzip, Some(&key), 64);

    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn StageObserver> = recorder.clone();
    let opts = ReadOptions {
        key: Some(&key),
        observer: Some(observer),
        ..Default::default()
    };
    let mut p = build_read_pipeline(Cursor::new(artifact), &opts).unwrap();
    assert_eq!(p.compression(), CompressionAlgorithm::Gzip);
    let mut out = Vec::new();
    p.read_to_end(&mut out).unwrap();
    p.close().unwrap();
    assert_eq!(out, b"SELECT 1;");
    assert_eq!(
        recorder.events(),
        vec![
            ("close", Stage::Decompress(CompressionAlgorithm::Gzip)),
            ("close", Stage::Decrypt { chunk_size: 64 }),
            ("close", Stage::Source),
        ]
    );
}

#[test]
fn test_every_shape_roundtrips() {
    let key = key();
    let data = b"INSERT INTO accounts VALUES (7, 'alice', 1200);\n".repeat(400);
    for compression in ALGORITHMS {
        for key in [None, Some(&key)] {
            let artifact = write_all(&data, compression, key, 4096);
            let out = read_all(artifact, key).unwrap();
            assert_eq!(out, data, "{compression} keyed={}", key.is_some());
        }
    }
}

#[test]
fn test_aborted_encrypted_pipeline_reads_as_truncated() {
    let key = key();
    for compression in ALGORITHMS {
        let sink = SharedSink::default();
        let opts = WriteOptions {
            compression,
            encryption: Some(&key),
            chunk_size: 512,
            ..Default::default()
        };
        let mut p = build_write_pipeline(sink.clone(), &opts).unwrap();
        p.write_all(&vec![b'z'; 5_000]).unwrap();
        p.abort().unwrap();

        let opts = ReadOptions {
            key: Some(&key),
            compression: Some(compression),
            ..Default::default()
        };
        // a compressor may not have emitted anything yet, leaving even the
        // header unwritten; that must read as truncated as well
        let result = build_read_pipeline(Cursor::new(sink.bytes()), &opts).and_then(|mut r| {
            r.read_to_end(&mut Vec::new())?;
            Ok(())
        });
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TruncatedStream, "{compression}");
    }
}

/// Payloads whose first bytes look like a compressed stream or a sealed
/// header.
fn lookalike_payloads() -> Vec<Vec<u8>> {
    let mut header_like = vec![0x01u8];
    header_like.extend_from_slice(&[0xA5; 12]);
    header_like.extend_from_slice(&4096u32.to_be_bytes());
    header_like.extend_from_slice(b"rest of the dump");
    vec![
        [&[0x1f, 0x8b][..], &b"not really gzip"[..]].concat(),
        [&[0x28, 0xb5, 0x2f, 0xfd][..], &b"not really zstd"[..]].concat(),
        header_like,
    ]
}

#[test]
fn test_encrypted_streams_carry_their_compression() {
    let key = key();
    for payload in lookalike_payloads() {
        for compression in ALGORITHMS {
            let artifact = write_all(&payload, compression, Some(&key), 64);
            let mut p = build_read_pipeline(
                Cursor::new(artifact),
                &ReadOptions {
                    key: Some(&key),
                    ..Default::default()
                },
            )
            .unwrap();
            assert_eq!(p.compression(), compression);
            let mut out = Vec::new();
            p.read_to_end(&mut out).unwrap();
            assert_eq!(out, payload, "{compression}");
        }
    }
}

#[test]
fn test_recorded_format_reads_plain_lookalikes() {
    for payload in lookalike_payloads() {
        let artifact = write_all(&payload, CompressionAlgorithm::None, None, 64);
        assert_eq!(artifact, payload);
        let opts = ReadOptions {
            compression: Some(CompressionAlgorithm::None),
            encrypted: Some(false),
            ..Default::default()
        };
        let mut p = build_read_pipeline(Cursor::new(artifact), &opts).unwrap();
        let mut out = Vec::new();
        p.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(p.stages(), &[Stage::Source]);
    }
}

#[test]
fn test_recorded_encryption_without_key_is_refused() {
    let artifact = write_all(b"rows", CompressionAlgorithm::Gzip, Some(&key()), 64);
    let opts = ReadOptions {
        encrypted: Some(true),
        ..Default::default()
    };
    let err = build_read_pipeline(Cursor::new(artifact), &opts).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_stream_tag_wins_over_requested_compression() {
    let key = key();
    let artifact = write_all(b"SELECT 2;", CompressionAlgorithm::Zstd, Some(&key), 64);
    let opts = ReadOptions {
        key: Some(&key),
        compression: Some(CompressionAlgorithm::Gzip),
        ..Default::default()
    };
    let mut p = build_read_pipeline(Cursor::new(artifact), &opts).unwrap();
    assert_eq!(p.compression(), CompressionAlgorithm::Zstd);
    let mut out = Vec::new();
    p.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"SELECT 2;");
}

#[test]
fn test_unkeyed_read_of_ciphertext_is_refused() {
    let key = key();
    let artifact = write_all(b"secret rows", CompressionAlgorithm::Zstd, Some(&key), 1024);
    let err = read_all(artifact, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_wrong_key_fails_authentication() {
    let artifact = write_all(b"secret rows", CompressionAlgorithm::Gzip, Some(&key()), 1024);
    let other = Key::from_bytes([0x44u8; 32]);
    let err = read_all(artifact, Some(&other)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
}

#[test]
fn test_file_sink_and_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.sql.zst.enc");
    let key = key();

    let opts = WriteOptions {
        compression: CompressionAlgorithm::Zstd,
        encryption: Some(&key),
        ..Default::default()
    };
    let mut p = build_write_pipeline(std::fs::File::create(&path).unwrap(), &opts).unwrap();
    p.write_all(b"CREATE DATABASE app;\n").unwrap();
    p.close().unwrap();

    let opts = ReadOptions {
        key: Some(&key),
        ..Default::default()
    };
    let mut r = build_read_pipeline(std::fs::File::open(&path).unwrap(), &opts).unwrap();
    let mut out = String::new();
    r.read_to_string(&mut out).unwrap();
    r.close().unwrap();
    assert_eq!(out, "CREATE DATABASE app;\n");
    assert!(r.is_encrypted());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn composed_roundtrip(
        data in proptest::collection::vec(any::<u8>(), 0..=16_384),
        algo_idx in 0usize..3,
        encrypted in any::<bool>(),
        chunk_size in 1u32..=2048u32,
    ) {
        let key = key();
        let key = encrypted.then_some(&key);
        let compression = ALGORITHMS[algo_idx];
        let artifact = write_all(&data, compression, key, chunk_size);
        // a plain stream's format is recorded next to it, not inside it
        let opts = ReadOptions {
            key,
            compression: (!encrypted).then_some(compression),
            encrypted: Some(encrypted),
            ..Default::default()
        };
        let mut p = build_read_pipeline(Cursor::new(artifact), &opts).unwrap();
        let mut out = Vec::new();
        p.read_to_end(&mut out).unwrap();
        prop_assert_eq!(out, data);
    }

    #[test]
    fn encrypted_roundtrip_needs_only_the_key(
        prefix in prop_oneof![
            Just(vec![0x1fu8, 0x8b]),
            Just(vec![0x28u8, 0xb5, 0x2f, 0xfd]),
            Just(Vec::new()),
        ],
        rest in proptest::collection::vec(any::<u8>(), 0..=4096),
        algo_idx in 0usize..3,
        chunk_size in 1u32..=512u32,
    ) {
        let key = key();
        let data = [prefix, rest].concat();
        let artifact = write_all(&data, ALGORITHMS[algo_idx], Some(&key), chunk_size);
        prop_assert_eq!(read_all(artifact, Some(&key)).unwrap(), data);
    }
}
