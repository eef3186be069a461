//! License fingerprint derived from the pair's host identifiers.
//!
//! The REGISTER reply carries the primary's host identifier as decimal text.
//! The secondary XORs it with its own identifier and persists the result to
//! `license.fo` (8 bytes, mode 0600). Downstream licensing code treats the
//! file as an opaque byte sequence; this module only guarantees the XOR and
//! the encoding round-trip bit-for-bit.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::Path;

/// Stable numeric identifier for a host, derived from its name.
///
/// The pair only needs identifiers that are stable per host and distinct
/// between the two hosts; CRC32 of the hostname widened to `u64` satisfies
/// both and survives the decimal wire encoding.
pub fn host_identifier(hostname: &str) -> u64 {
    u64::from(crc32fast::hash(hostname.as_bytes()))
}

/// XOR fingerprint of the two host identifiers.
pub fn fingerprint(own: u64, peer: u64) -> u64 {
    own ^ peer
}

/// Parse the REGISTER reply payload: the peer's identifier as decimal ASCII.
pub fn parse_peer_identifier(text: &str) -> Option<u64> {
    text.trim().parse::<u64>().ok()
}

/// Persist the fingerprint to `path`: create+truncate, 8 bytes LE, mode 0600.
///
/// Written exactly once per successful registration. Failure here is fatal
/// misconfiguration and the caller exits.
pub fn save_fingerprint(path: &Path, fp: u64) -> io::Result<()> {
    let mut opts = OpenOptions::new();
    opts.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(&fp.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Read a previously saved fingerprint.
pub fn load_fingerprint(path: &Path) -> io::Result<u64> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
