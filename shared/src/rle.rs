//! Run-length codec for terrain payloads
//!
//! The encoded form is a sequence of `(run_length, value)` pairs. The run
//! length is an unsigned LEB128 varint, so runs longer than 127 bytes take
//! several count bytes and a run is never split just because it is long.
//! Every byte sequence, the empty one included, survives a round trip.

/// Largest run length a varint may carry
const MAX_RUN: u64 = u32::MAX as u64;

/// Decoding failures. Any of these makes the carrying chunk malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RleError {
    #[error("run length varint truncated at offset {0}")]
    TruncatedCount(usize),

    #[error("run at offset {0} is missing its value byte")]
    MissingValue(usize),

    #[error("zero-length run at offset {0}")]
    ZeroRun(usize),

    #[error("run length at offset {0} does not fit in 32 bits")]
    RunTooLong(usize),

    #[error("run length at offset {0} is padded with a zero continuation byte")]
    Overlong(usize),

    #[error("decoded output would exceed {limit} bytes")]
    LimitExceeded { limit: usize },
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(src: &[u8], pos: &mut usize) -> Result<u64, RleError> {
    let start = *pos;
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        let byte = *src.get(*pos).ok_or(RleError::TruncatedCount(start))?;
        *pos += 1;

        value |= u64::from(byte & 0x7f) << shift;
        if value > MAX_RUN {
            return Err(RleError::RunTooLong(start));
        }
        if byte & 0x80 == 0 {
            // a trailing zero group means a shorter encoding exists
            if byte == 0 && shift > 0 {
                return Err(RleError::Overlong(start));
            }
            return Ok(value);
        }

        shift += 7;
        if shift > 28 {
            return Err(RleError::RunTooLong(start));
        }
    }
}

/// Compresses `src` into `(run_length, value)` pairs
pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = src.iter().copied();

    let Some(mut current) = iter.next() else {
        return out;
    };
    let mut run: u64 = 1;

    for byte in iter {
        if byte == current && run < MAX_RUN {
            run += 1;
        } else {
            write_varint(&mut out, run);
            out.push(current);
            current = byte;
            run = 1;
        }
    }

    write_varint(&mut out, run);
    out.push(current);
    out
}

/// Expands an encoded stream with no bound on the output size
pub fn decode(src: &[u8]) -> Result<Vec<u8>, RleError> {
    decode_with_limit(src, usize::MAX)
}

/// Expands an encoded stream, failing as soon as the output would pass `limit`
pub fn decode_with_limit(src: &[u8], limit: usize) -> Result<Vec<u8>, RleError> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < src.len() {
        let run_start = pos;
        let run = read_varint(src, &mut pos)?;
        if run == 0 {
            return Err(RleError::ZeroRun(run_start));
        }

        let value = *src.get(pos).ok_or(RleError::MissingValue(run_start))?;
        pos += 1;

        let run = run as usize;
        if out.len().saturating_add(run) > limit {
            return Err(RleError::LimitExceeded { limit });
        }
        out.resize(out.len() + run, value);
    }

    Ok(out)
}
