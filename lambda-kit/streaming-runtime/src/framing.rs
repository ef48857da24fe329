//! HTTP/1.1 chunked transfer-encoding frames.

use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};

/// Zero-length chunk that ends the body.
pub const TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Frame overhead for a chunk of `len` bytes: hex length plus two CRLFs.
pub fn frame_overhead(len: usize) -> usize {
    hex_len(len) + 4
}

fn hex_len(len: usize) -> usize {
    let mut digits = 1;
    let mut rest = len >> 4;
    while rest > 0 {
        digits += 1;
        rest >>= 4;
    }
    digits
}

/// Encode `data` as `<HEX-LEN>\r\n<data>\r\n`.
///
/// The length is uppercase hex without leading zeros. Empty input would produce the terminator,
/// so callers must not frame empty chunks.
pub fn encode_chunk_frame(data: &[u8]) -> Bytes {
    debug_assert!(!data.is_empty(), "empty chunk would terminate the stream");

    let mut head = String::with_capacity(hex_len(data.len()) + 2);
    let _ = write!(head, "{:X}\r\n", data.len());

    let mut out = BytesMut::with_capacity(head.len() + data.len() + 2);
    out.put_slice(head.as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
    out.freeze()
}

#[cfg(test)]
pub(crate) fn decode_chunked_body(mut wire: &[u8]) -> Option<(Vec<Bytes>, bool)> {
    let mut chunks = Vec::new();
    loop {
        if wire.is_empty() {
            return Some((chunks, false));
        }
        let line_end = wire.windows(2).position(|w| w == b"\r\n")?;
        let len = usize::from_str_radix(std::str::from_utf8(&wire[..line_end]).ok()?, 16).ok()?;
        wire = &wire[line_end + 2..];
        if len == 0 {
            return (wire == b"\r\n").then_some((chunks, true));
        }
        if wire.len() < len + 2 || &wire[len..len + 2] != b"\r\n" {
            return None;
        }
        chunks.push(Bytes::copy_from_slice(&wire[..len]));
        wire = &wire[len + 2..];
    }
}
