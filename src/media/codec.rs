use bytes::Bytes;

use crate::media::types::DecodedImage;

/// Turns an inbound binary payload into a [`DecodedImage`].
pub trait FrameDecoder: Send + Sync + 'static {
    fn decode(&self, payload: Bytes) -> anyhow::Result<DecodedImage>;
}

/// Validates JPEG framing and reads the frame header without decoding pixels.
#[derive(Clone, Copy, Debug, Default)]
pub struct JpegProbe;

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;

impl JpegProbe {
    fn is_sof(marker: u8) -> bool {
        // SOF0..SOF15 minus DHT (C4), JPG (C8) and DAC (CC)
        matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
    }

    fn is_standalone(marker: u8) -> bool {
        marker == TEM || (0xD0..=0xD7).contains(&marker)
    }
}

impl FrameDecoder for JpegProbe {
    fn decode(&self, payload: Bytes) -> anyhow::Result<DecodedImage> {
        let data = payload.as_ref();
        if data.len() < 4 || data[0] != 0xFF || data[1] != SOI {
            anyhow::bail!("not a JPEG: missing SOI marker");
        }

        let mut pos = 2;
        loop {
            if pos >= data.len() || data[pos] != 0xFF {
                anyhow::bail!("corrupt JPEG: expected marker at offset {}", pos);
            }
            // skip fill bytes before the marker
            while pos < data.len() && data[pos] == 0xFF {
                pos += 1;
            }
            if pos >= data.len() {
                anyhow::bail!("truncated JPEG: marker at end of data");
            }
            let marker = data[pos];
            pos += 1;

            if JpegProbe::is_standalone(marker) {
                continue;
            }
            if marker == EOI || marker == SOS {
                anyhow::bail!("corrupt JPEG: no frame header before {:#04x}", marker);
            }
            if pos + 2 > data.len() {
                anyhow::bail!("truncated JPEG: segment length at offset {}", pos);
            }
            let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            if len < 2 || pos + len > data.len() {
                anyhow::bail!("truncated JPEG: segment {:#04x} of {} bytes", marker, len);
            }

            if JpegProbe::is_sof(marker) {
                // precision(1) height(2) width(2) components(1)
                if len < 8 {
                    anyhow::bail!("corrupt JPEG: short frame header");
                }
                let seg = &data[pos + 2..pos + len];
                let height = u16::from_be_bytes([seg[1], seg[2]]);
                let width = u16::from_be_bytes([seg[3], seg[4]]);
                let components = seg[5];
                if width == 0 || height == 0 || components == 0 {
                    anyhow::bail!("corrupt JPEG: empty frame {}x{}x{}", width, height, components);
                }
                return Ok(DecodedImage {
                    width,
                    height,
                    components,
                    data: payload,
                });
            }
            pos += len;
        }
    }
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
