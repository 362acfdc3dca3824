use bytes::Bytes;
use jpeg_encoder::{ColorType, Encoder};

use super::{FrameDecoder, JpegProbe};

fn encode_jpeg(width: u16, height: u16, color: ColorType) -> Vec<u8> {
    let channels = match color {
        ColorType::Luma => 1,
        _ => 3,
    };
    let pixels = vec![128u8; width as usize * height as usize * channels];
    let mut out = Vec::new();
    Encoder::new(&mut out, 80)
        .encode(&pixels, width, height, color)
        .unwrap();
    out
}

#[test]
fn test_reads_header_of_rgb_jpeg() {
    let jpeg = encode_jpeg(64, 48, ColorType::Rgb);
    let image = JpegProbe.decode(Bytes::from(jpeg.clone())).unwrap();
    assert_eq!((image.width, image.height, image.components), (64, 48, 3));
    assert_eq!(image.data.as_ref(), jpeg.as_slice());
}

#[test]
fn test_reads_header_of_grayscale_jpeg() {
    let jpeg = encode_jpeg(16, 8, ColorType::Luma);
    let image = JpegProbe.decode(Bytes::from(jpeg)).unwrap();
    assert_eq!((image.width, image.height, image.components), (16, 8, 1));
}

#[test]
fn test_rejects_non_jpeg() {
    assert!(JpegProbe.decode(Bytes::from_static(b"")).is_err());
    assert!(JpegProbe.decode(Bytes::from_static(b"\x89PNG\r\n\x1a\n")).is_err());
    assert!(JpegProbe.decode(Bytes::from_static(b"hello world")).is_err());
}

#[test]
fn test_rejects_truncated_jpeg() {
    let jpeg = encode_jpeg(32, 32, ColorType::Rgb);
    let err = JpegProbe.decode(Bytes::copy_from_slice(&jpeg[..12])).unwrap_err();
    assert!(err.to_string().contains("JPEG"));
}

#[test]
fn test_rejects_scan_without_frame_header() {
    let bogus = [0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0xFF, 0xD9];
    assert!(JpegProbe.decode(Bytes::copy_from_slice(&bogus)).is_err());
}

#[test]
fn test_segment_ending_in_ff_is_not_a_marker() {
    // APP0 whose payload ends in 0xFF, followed by a bare SOF0 without its 0xFF prefix
    let bogus = [
        0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0xFF, 0xC0, 0x00, 0x08, 0x08, 0x00, 0x10, 0x00,
        0x10, 0x01,
    ];
    let err = JpegProbe.decode(Bytes::copy_from_slice(&bogus)).unwrap_err();
    assert!(err.to_string().contains("expected marker"));
}

#[test]
fn test_fill_bytes_before_marker_are_skipped() {
    let jpeg = encode_jpeg(8, 8, ColorType::Luma);
    let mut padded = vec![0xFF, 0xD8, 0xFF, 0xFF];
    padded.extend_from_slice(&jpeg[2..]);
    let image = JpegProbe.decode(Bytes::from(padded)).unwrap();
    assert_eq!((image.width, image.height), (8, 8));
}
