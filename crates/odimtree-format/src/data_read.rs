//! Raw dataset bytes from any supported storage layout.

use crate::btree::collect_chunks;
use crate::codec::{ensure_len, Sizes};
use crate::data_layout::DataLayout;
use crate::error::FormatError;
use crate::filter_pipeline::FilterPipeline;
use crate::filters::decompress_chunk;

/// Read the full raw contents of a dataset in file byte order.
///
/// Unallocated storage reads as zeros, as does any chunk never written.
pub fn read_raw_data(
    data: &[u8],
    layout: &DataLayout,
    dims: &[u64],
    element_size: usize,
    pipeline: Option<&FilterPipeline>,
    sizes: Sizes,
) -> Result<Vec<u8>, FormatError> {
    let total = dims.iter().product::<u64>() as usize * element_size;
    match layout {
        DataLayout::Compact { data: inline } => {
            let mut out = inline.clone();
            out.resize(total, 0);
            Ok(out)
        }
        DataLayout::Contiguous { address: None, .. } => Ok(vec![0; total]),
        DataLayout::Contiguous {
            address: Some(addr), ..
        } => {
            let start = *addr as usize;
            ensure_len(data, start, total)?;
            Ok(data[start..start + total].to_vec())
        }
        DataLayout::Chunked {
            btree_address,
            dimensions,
        } => {
            let mut out = vec![0u8; total];
            let Some(root) = btree_address else {
                return Ok(out);
            };
            if dimensions.len() != dims.len() + 1 {
                return Err(FormatError::Unsupported(format!(
                    "chunk rank {} for dataspace rank {}",
                    dimensions.len().saturating_sub(1),
                    dims.len()
                )));
            }
            let chunk_dims: Vec<u64> = dimensions[..dims.len()].iter().map(|&d| d as u64).collect();
            let chunk_bytes = chunk_dims.iter().product::<u64>() as usize * element_size;
            for chunk in collect_chunks(data, *root, sizes, dimensions.len())? {
                let start = chunk.address as usize;
                ensure_len(data, start, chunk.size as usize)?;
                let stored = &data[start..start + chunk.size as usize];
                let plain = match pipeline {
                    Some(p) if !p.is_empty() => {
                        decompress_chunk(stored, p, chunk.filter_mask, element_size)?
                    }
                    _ => stored.to_vec(),
                };
                if plain.len() < chunk_bytes {
                    return Err(FormatError::DecompressionError(format!(
                        "chunk at {:#x} holds {} bytes, expected {chunk_bytes}",
                        chunk.address,
                        plain.len()
                    )));
                }
                place_chunk(&mut out, &plain, &chunk.offsets[..dims.len()], &chunk_dims, dims, element_size);
            }
            Ok(out)
        }
    }
}

/// Row-major strides (in elements) of an array of extent `dims`.
pub fn strides(dims: &[u64]) -> Vec<u64> {
    let mut s = vec![1u64; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        s[i] = s[i + 1] * dims[i + 1];
    }
    s
}

/// Visit each innermost row of a chunk that overlaps the dataset, calling
/// `f(chunk_element_index, dataset_element_index, row_len)`.
pub fn for_each_chunk_row(
    offsets: &[u64],
    chunk_dims: &[u64],
    dims: &[u64],
    mut f: impl FnMut(usize, usize, usize),
) {
    let rank = dims.len();
    if rank == 0 {
        f(0, 0, 1);
        return;
    }
    if offsets.iter().zip(dims).any(|(o, d)| o >= d) {
        return;
    }
    let last = rank - 1;
    let row_len = chunk_dims[last].min(dims[last] - offsets[last]) as usize;
    let ds_strides = strides(dims);
    let ch_strides = strides(chunk_dims);
    let extent: Vec<u64> = (0..rank)
        .map(|d| chunk_dims[d].min(dims[d] - offsets[d]))
        .collect();

    // odometer over every dimension except the last
    let mut idx = vec![0u64; last];
    loop {
        let mut src = 0u64;
        let mut dst = offsets[last];
        for d in 0..last {
            src += idx[d] * ch_strides[d];
            dst += (offsets[d] + idx[d]) * ds_strides[d];
        }
        f(src as usize, dst as usize, row_len);

        let mut d = last;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < extent[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

fn place_chunk(
    out: &mut [u8],
    chunk: &[u8],
    offsets: &[u64],
    chunk_dims: &[u64],
    dims: &[u64],
    element_size: usize,
) {
    for_each_chunk_row(offsets, chunk_dims, dims, |src, dst, len| {
        let (s, t, n) = (src * element_size, dst * element_size, len * element_size);
        out[t..t + n].copy_from_slice(&chunk[s..s + n]);
    });
}
