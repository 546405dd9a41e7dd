use showplay_io::fseq::{Compression, SequenceWriter};
use showplay_io::{ModelRange, SequenceError, SequenceHeader, SequenceReader};
use std::path::PathBuf;

const CHANNELS: usize = 12;

/// Frame `f` holds `f * 3 + channel` in every byte
fn pattern(frames: usize) -> Vec<Vec<u8>> {
    (0..frames)
        .map(|f| (0..CHANNELS).map(|c| (f * 3 + c) as u8).collect())
        .collect()
}

fn write(dir: &tempfile::TempDir, name: &str, writer: &SequenceWriter, frames: &[Vec<u8>]) -> PathBuf {
    let path = dir.path().join(name);
    writer.write(&path, frames).unwrap();
    path
}

#[test]
fn test_decode_two_zstd_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let frames = pattern(10);
    let writer = SequenceWriter::new(CHANNELS as u32, 50)
        .with_compression(Compression::Zstd)
        .with_frames_per_block(5)
        .with_variable_header("mf", "track.mp3");
    let path = write(&dir, "two_blocks.fseq", &writer, &frames);

    let mut reader = SequenceReader::open(&path).unwrap();
    assert_eq!(reader.header().blocks.len(), 2);
    assert_eq!(reader.index().len(), 2);
    assert_eq!(reader.header().media_file(), Some("track.mp3"));

    for n in [0u32, 4, 5, 9] {
        let frame = reader.read_frame(n).unwrap();
        assert_eq!(frame.len(), CHANNELS);
        assert_eq!(frame, frames[n as usize], "frame {}", n);
    }
    assert!(matches!(
        reader.read_frame(10),
        Err(SequenceError::FrameOutOfRange { frame: 10, frame_count: 10 })
    ));
}

#[test]
fn test_for_each_frame_visits_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let frames = pattern(7);
    let writer = SequenceWriter::new(CHANNELS as u32, 25)
        .with_compression(Compression::Zstd)
        .with_frames_per_block(3);
    let path = write(&dir, "visit.fseq", &writer, &frames);

    let mut reader = SequenceReader::open(&path).unwrap();
    let mut seen = Vec::new();
    reader
        .for_each_frame(|data, number, time, header| {
            assert_eq!(data, &frames[number as usize][..]);
            assert_eq!(time, number as u64 * 25);
            assert_eq!(header.frame_count, 7);
            seen.push(number);
        })
        .unwrap();
    assert_eq!(seen, (0..7).collect::<Vec<_>>());
}

#[test]
fn test_uncompressed_pseudo_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let frames = pattern(9);
    let path = write(&dir, "raw.fseq", &SequenceWriter::new(CHANNELS as u32, 50), &frames);

    let header = SequenceHeader::read_from(&path).unwrap();
    assert_eq!(header.compression, Compression::None);
    let index = showplay_io::BlockIndex::from_header(&header, CHANNELS * 4).unwrap();
    let bounds: Vec<(u32, u32)> = index
        .chunks()
        .iter()
        .map(|c| (c.start_frame, c.end_frame))
        .collect();
    assert_eq!(bounds, vec![(0, 4), (4, 8), (8, 9)]);

    let mut reader = SequenceReader::open(&path).unwrap();
    assert_eq!(reader.read_frame(8).unwrap(), frames[8]);
}

#[test]
fn test_model_slices_through_sparse_ranges() {
    let dir = tempfile::tempdir().unwrap();
    // Stored channels: absolute 100..106 then 0..6
    let writer = SequenceWriter::new(CHANNELS as u32, 50)
        .with_sparse_range(100, 6)
        .with_sparse_range(0, 6);
    let frames = pattern(2);
    let path = write(&dir, "sparse.fseq", &writer, &frames);

    let models = vec![
        ModelRange {
            name: "arch".into(),
            start_channel: 2,
            channel_count: 3,
        },
        ModelRange {
            name: "star".into(),
            start_channel: 104,
            channel_count: 4,
        },
    ];
    let mut reader = SequenceReader::open(&path).unwrap();
    let mut slices = Vec::new();
    reader
        .for_each_model_frame(&models, |model, data, frame, _| {
            slices.push((model.name.clone(), frame, data.to_vec()));
        })
        .unwrap();

    assert_eq!(slices.len(), 4);
    let f0 = &frames[0];
    assert_eq!(slices[0], ("arch".to_string(), 0, f0[8..11].to_vec()));
    // Channels 106 and 107 are not stored
    assert_eq!(slices[1], ("star".to_string(), 0, vec![f0[4], f0[5], 0, 0]));
}

#[test]
fn test_truncated_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let writer = SequenceWriter::new(CHANNELS as u32, 50)
        .with_compression(Compression::Zstd)
        .with_frames_per_block(2);
    let bytes = writer.to_bytes(&pattern(4)).unwrap();
    let path = dir.path().join("cut.fseq");
    std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

    assert!(matches!(
        SequenceReader::open(&path),
        Err(SequenceError::Truncated(_))
    ));
}

#[test]
fn test_zlib_is_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let writer = SequenceWriter::new(CHANNELS as u32, 50)
        .with_compression(Compression::Zstd)
        .with_frames_per_block(2);
    let mut bytes = writer.to_bytes(&pattern(4)).unwrap();
    // Relabel the blocks as zlib
    bytes[20] = (bytes[20] & 0xF0) | 2;
    let path = dir.path().join("zlib.fseq");
    std::fs::write(&path, &bytes).unwrap();

    let mut reader = SequenceReader::open(&path).unwrap();
    assert_eq!(reader.header().compression, Compression::Zlib);
    assert!(matches!(
        reader.read_frame(0),
        Err(SequenceError::NotImplemented(_))
    ));
}
