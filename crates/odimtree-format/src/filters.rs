//! Chunk filters: deflate, shuffle and fletcher32. SZIP has no codec here.

use std::io::{Read, Write};

use crate::error::FormatError;
use crate::filter_pipeline::{
    FilterPipeline, FILTER_DEFLATE, FILTER_FLETCHER32, FILTER_SHUFFLE,
};

/// Undo the pipeline on a stored chunk. Filters run in reverse order and
/// bit `i` of `filter_mask` skips filter `i`.
pub fn decompress_chunk(
    stored: &[u8],
    pipeline: &FilterPipeline,
    filter_mask: u32,
    element_size: usize,
) -> Result<Vec<u8>, FormatError> {
    let mut data = stored.to_vec();
    for (i, filter) in pipeline.filters.iter().enumerate().rev() {
        if i < 32 && filter_mask & (1 << i) != 0 {
            continue;
        }
        data = match filter.filter_id {
            FILTER_DEFLATE => inflate(&data)?,
            FILTER_SHUFFLE => unshuffle(&data, shuffle_width(filter, element_size))?,
            FILTER_FLETCHER32 => fletcher32_strip(&data)?,
            other => return Err(FormatError::UnsupportedFilter(other)),
        };
    }
    Ok(data)
}

/// Apply the pipeline to a chunk before it is stored.
pub fn compress_chunk(
    data: &[u8],
    pipeline: &FilterPipeline,
    element_size: usize,
) -> Result<Vec<u8>, FormatError> {
    let mut out = data.to_vec();
    for filter in &pipeline.filters {
        out = match filter.filter_id {
            FILTER_DEFLATE => {
                let level = filter.client_data.first().copied().unwrap_or(6);
                deflate(&out, level)?
            }
            FILTER_SHUFFLE => shuffle(&out, shuffle_width(filter, element_size))?,
            FILTER_FLETCHER32 => {
                let sum = fletcher32(&out);
                out.extend_from_slice(&sum.to_le_bytes());
                out
            }
            other => return Err(FormatError::UnsupportedFilter(other)),
        };
    }
    Ok(out)
}

fn shuffle_width(filter: &crate::filter_pipeline::FilterDescription, element_size: usize) -> usize {
    filter
        .client_data
        .first()
        .map(|&w| w as usize)
        .unwrap_or(element_size)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FormatError::DecompressionError(e.to_string()))?;
    Ok(out)
}

fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>, FormatError> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| FormatError::CompressionError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| FormatError::CompressionError(e.to_string()))
}

fn shuffle(data: &[u8], width: usize) -> Result<Vec<u8>, FormatError> {
    if width <= 1 {
        return Ok(data.to_vec());
    }
    let n = data.len() / width;
    let mut out = data.to_vec();
    for i in 0..n {
        for j in 0..width {
            out[j * n + i] = data[i * width + j];
        }
    }
    // a trailing partial element is stored as is
    Ok(out)
}

fn unshuffle(data: &[u8], width: usize) -> Result<Vec<u8>, FormatError> {
    if width <= 1 {
        return Ok(data.to_vec());
    }
    let n = data.len() / width;
    let mut out = data.to_vec();
    for i in 0..n {
        for j in 0..width {
            out[i * width + j] = data[j * n + i];
        }
    }
    Ok(out)
}

/// Fletcher-32 over big-endian 16-bit words, odd tail byte padded.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    for word in data.chunks(2) {
        let value = match word {
            [hi, lo] => (*hi as u32) << 8 | *lo as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        };
        sum1 = (sum1 + value) % 65535;
        sum2 = (sum2 + sum1) % 65535;
    }
    (sum2 << 16) | sum1
}

fn fletcher32_strip(data: &[u8]) -> Result<Vec<u8>, FormatError> {
    if data.len() < 4 {
        return Err(FormatError::Fletcher32Mismatch);
    }
    let (payload, tail) = data.split_at(data.len() - 4);
    let stored = [tail[0], tail[1], tail[2], tail[3]];
    let computed = fletcher32(payload);
    // older writers stored the sum byte-swapped
    if u32::from_le_bytes(stored) != computed && u32::from_be_bytes(stored) != computed {
        return Err(FormatError::Fletcher32Mismatch);
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter_pipeline::{FilterDescription, FILTER_SZIP};

    fn pipeline(filters: Vec<FilterDescription>) -> FilterPipeline {
        FilterPipeline { filters }
    }

    #[test]
    fn shuffle_deflate_roundtrip() {
        let data: Vec<u8> = (0..400u32).flat_map(|v| (v as f32).to_le_bytes()).collect();
        let p = pipeline(vec![FilterDescription::shuffle(4), FilterDescription::deflate(6)]);
        let stored = compress_chunk(&data, &p, 4).unwrap();
        assert!(stored.len() < data.len());
        assert_eq!(decompress_chunk(&stored, &p, 0, 4).unwrap(), data);
    }

    #[test]
    fn fletcher32_detects_corruption() {
        let p = pipeline(vec![FilterDescription {
            filter_id: FILTER_FLETCHER32,
            name: None,
            flags: 0,
            client_data: vec![],
        }]);
        let mut stored = compress_chunk(b"radar volume", &p, 1).unwrap();
        assert_eq!(decompress_chunk(&stored, &p, 0, 1).unwrap(), b"radar volume");
        stored[0] ^= 1;
        assert_eq!(
            decompress_chunk(&stored, &p, 0, 1),
            Err(FormatError::Fletcher32Mismatch)
        );
    }

    #[test]
    fn masked_filter_is_skipped() {
        let p = pipeline(vec![FilterDescription::deflate(6)]);
        assert_eq!(decompress_chunk(b"raw", &p, 0b1, 1).unwrap(), b"raw");
    }

    #[test]
    fn szip_is_unsupported() {
        let p = pipeline(vec![FilterDescription {
            filter_id: FILTER_SZIP,
            name: None,
            flags: 0,
            client_data: vec![4, 32],
        }]);
        assert_eq!(
            decompress_chunk(&[0; 8], &p, 0, 1),
            Err(FormatError::UnsupportedFilter(FILTER_SZIP))
        );
    }

    #[test]
    fn known_fletcher_value() {
        // "abcde" -> sum1 = 0x6162 + 0x6364 + 0x6500, sum2 accumulates those
        let sum = fletcher32(b"abcde");
        let s1 = (0x6162 + 0x6364 + 0x6500) % 65535;
        let s2 = (0x6162 + (0x6162 + 0x6364) + s1) % 65535;
        assert_eq!(sum, (s2 << 16) | s1);
    }
}
