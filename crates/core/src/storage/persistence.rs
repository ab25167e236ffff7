//! Snapshot files for indexes and codecs.
//!
//! Every persistent component serializes a plain data struct with bincode,
//! wrapped in an envelope naming the component kind and format version. Writes
//! use atomic temp-file + rename. A CRC32 checksum is appended as a footer:
//! `[bincode envelope][magic "VCR1"][u32 CRC32 BE]`.

use crate::error::{Result, VdbError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Magic bytes appended before the CRC32 footer to distinguish checksummed snapshots.
const SNAPSHOT_CRC_MAGIC: &[u8; 4] = b"VCR1";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    kind: &'a str,
    version: u32,
    payload: &'a T,
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `payload` to `path` atomically, tagged with `kind`.
pub fn save_snapshot<T: Serialize>(path: impl AsRef<Path>, kind: &str, payload: &T) -> Result<()> {
    let path = path.as_ref();
    let bytes = bincode::serialize(&EnvelopeRef {
        kind,
        version: SNAPSHOT_VERSION,
        payload,
    })?;

    // Compute CRC32 over the bincode payload
    let crc = crc32fast::hash(&bytes);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = tmp_path_for(path);

    let mut output = Vec::with_capacity(bytes.len() + 8);
    output.extend_from_slice(&bytes);
    output.extend_from_slice(SNAPSHOT_CRC_MAGIC);
    output.extend_from_slice(&crc.to_be_bytes());

    // Atomic write: write to temp, then rename
    fs::write(&tmp_path, &output)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp_path, path)?;

    tracing::info!(
        "Saved {} snapshot {:?} ({} bytes, CRC32={:#010x})",
        kind,
        path,
        bytes.len(),
        crc
    );
    Ok(())
}

/// Load a snapshot written by [`save_snapshot`], verifying the CRC32 footer
/// and that the file holds a `kind` payload.
pub fn load_snapshot<T: DeserializeOwned>(path: impl AsRef<Path>, kind: &str) -> Result<T> {
    let path = path.as_ref();
    let raw = fs::read(path)?;

    // Check for CRC32 footer: last 8 bytes = [magic "VCR1"][CRC32 BE]
    let bytes = if raw.len() >= 8 && &raw[raw.len() - 8..raw.len() - 4] == SNAPSHOT_CRC_MAGIC {
        let payload = &raw[..raw.len() - 8];
        let stored_crc = u32::from_be_bytes([
            raw[raw.len() - 4],
            raw[raw.len() - 3],
            raw[raw.len() - 2],
            raw[raw.len() - 1],
        ]);
        let computed_crc = crc32fast::hash(payload);
        if computed_crc != stored_crc {
            return Err(VdbError::Corrupted(format!(
                "CRC32 mismatch in {:?}: expected {:#010x}, got {:#010x}",
                path, stored_crc, computed_crc
            )));
        }
        tracing::debug!("Snapshot CRC32 verified: {:#010x}", stored_crc);
        payload
    } else {
        // Unchecksummed snapshot: accept, bincode still validates the shape.
        tracing::warn!("Snapshot {:?} has no CRC32 checksum", path);
        &raw[..]
    };

    // The header decodes on its own; check it before touching the payload.
    let (stored_kind, version): (String, u32) = bincode::deserialize(bytes)?;
    if stored_kind != kind {
        return Err(VdbError::Corrupted(format!(
            "{:?} holds a {} snapshot, expected {}",
            path, stored_kind, kind
        )));
    }
    if version > SNAPSHOT_VERSION {
        return Err(VdbError::Corrupted(format!(
            "{:?} has snapshot version {}, newest supported is {}",
            path, version, SNAPSHOT_VERSION
        )));
    }

    let (_, _, payload): (String, u32, T) = bincode::deserialize(bytes)?;

    tracing::info!("Loaded {} snapshot {:?}", kind, path);
    Ok(payload)
}
