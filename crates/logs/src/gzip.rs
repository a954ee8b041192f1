//! gzip sniffing and bounded decompression.

use std::io::{self, Read};

use flate2::read::MultiGzDecoder;

/// gzip magic bytes (RFC 1952).
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[inline]
pub fn is_gzip_magic(header: &[u8]) -> bool {
    header.len() >= 2 && header[0] == GZIP_MAGIC[0] && header[1] == GZIP_MAGIC[1]
}

/// Read at most `cap` bytes; the flag is set when more were available.
pub fn read_capped<R: Read>(r: R, cap: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    r.take(cap as u64 + 1).read_to_end(&mut out)?;
    let cut = out.len() > cap;
    out.truncate(cap);
    Ok((out, cut))
}

/// Decode at most `cap` bytes. A body that stops mid-stream keeps what was
/// decoded before the break and counts as cut.
pub fn gunzip_prefix<R: Read>(r: R, cap: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut decoder = MultiGzDecoder::new(r);
    let mut out = Vec::new();
    let mut chunk = [0u8; 8 * 1024];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => return Ok((out, false)),
            Ok(n) => {
                out.extend_from_slice(&chunk[..n]);
                if out.len() > cap {
                    out.truncate(cap);
                    return Ok((out, true));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok((out, true)),
            Err(e) => return Err(e),
        }
    }
}

/// Decompress when `data` carries the gzip magic, otherwise pass it through.
/// Either way at most `cap` bytes come back.
pub fn maybe_gunzip(data: &[u8], cap: usize) -> io::Result<(Vec<u8>, bool)> {
    if is_gzip_magic(data) {
        return gunzip_prefix(data, cap);
    }
    read_capped(data, cap)
}

#[cfg(test)]
pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    let _ = enc.write_all(data);
    enc.finish().unwrap_or_default()
}
