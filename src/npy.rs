// src/npy.rs - Minimal NumPy .npy support for 1-D float arrays
//
// Only what the statistics files need: little-endian f4/f8, C order, one axis.
use std::fs;
use std::path::Path;

use crate::error::NormalizationError;

const MAGIC: &[u8] = b"\x93NUMPY";

pub fn read_f32_vector(path: impl AsRef<Path>) -> Result<Vec<f32>, NormalizationError> {
    let bytes = fs::read(path.as_ref())?;
    parse_f32_vector(&bytes)
}

pub fn write_f32_vector(path: impl AsRef<Path>, values: &[f32]) -> Result<(), NormalizationError> {
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    // magic(6) + version(2) + header length(2) + header, padded to 64 bytes
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + values.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    fs::write(path.as_ref(), out)?;
    Ok(())
}

pub fn parse_f32_vector(bytes: &[u8]) -> Result<Vec<f32>, NormalizationError> {
    let err = |msg: &str| NormalizationError::Npy(msg.to_string());

    if bytes.len() < 10 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(err("missing NUMPY magic"));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(err("truncated header"));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(NormalizationError::Npy(format!("unsupported format version {}", v))),
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(err("truncated header"));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|_| err("header is not utf-8"))?;

    if header.contains("'fortran_order': True") {
        return Err(err("fortran order is not supported"));
    }
    let descr = dict_value(header, "descr").ok_or_else(|| err("missing descr"))?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    let width = match descr {
        "<f4" | "f4" => 4,
        "<f8" | "f8" => 8,
        other => return Err(NormalizationError::Npy(format!("unsupported dtype {}", other))),
    };

    let shape = dict_value(header, "shape").ok_or_else(|| err("missing shape"))?;
    let dims: Vec<usize> = shape
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|_| err("bad shape"))?;
    // (288,) and (1, 288) are both accepted
    let count = match dims.as_slice() {
        [n] => *n,
        [1, n] | [n, 1] => *n,
        _ => return Err(NormalizationError::Npy(format!("expected a vector, got shape {}", shape))),
    };

    let data = &bytes[data_start..];
    if data.len() < count * width {
        return Err(err("truncated data"));
    }

    let values = data
        .chunks_exact(width)
        .take(count)
        .map(|c| match width {
            4 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            _ => f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32,
        })
        .collect();
    Ok(values)
}

/// Pulls the raw text of `'key': value` out of the header dict.
fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let start = header.find(&format!("'{}':", key))? + key.len() + 3;
    let rest = header[start..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find(',').unwrap_or(rest.len())
    };
    Some(rest[..end].trim())
}
