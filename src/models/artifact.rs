//! Naming of backup artifacts and of the intermediate files that lead to them.

use std::fmt;

use serde::Serialize;

/// Suffix of a raw block-image export.
pub const RAW_SUFFIX: &str = ".rbd";
/// Suffix appended by the compression stage.
pub const COMPRESSED_SUFFIX: &str = ".gz";
/// Suffix appended by the encryption stage.
pub const ENCRYPTED_SUFFIX: &str = ".gpg";
/// Full transform chain recorded at the end of every object name.
pub const CHAIN_SUFFIX: &str = ".rbd.gz.gpg";
/// Separator between claim, pool and image in an object name.
pub const NAME_DELIMITER: char = '-';

/// Content type stored with encrypted artifacts.
pub const CONTENT_TYPE_ENCRYPTED: &str = "application/pgp-encrypted";
/// Content type for anything else.
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Storage key of one backup: `<claim>-<pool>-<image>.rbd.gz.gpg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupObjectName {
    pub claim: String,
    pub pool: String,
    pub image: String,
    /// Set when the encoded key has more than two delimiters, so a reader of
    /// the key alone cannot tell where claim, pool and image were split.
    /// `new` and `decode` agree on it for any key they both describe.
    pub ambiguous: bool,
}

impl BackupObjectName {
    pub fn new(claim: impl Into<String>, pool: impl Into<String>, image: impl Into<String>) -> Self {
        let claim = claim.into();
        let pool = pool.into();
        let image = image.into();
        let ambiguous = [&claim, &pool, &image]
            .iter()
            .any(|field| field.contains(NAME_DELIMITER));
        Self {
            claim,
            pool,
            image,
            ambiguous,
        }
    }

    /// Whether `decode(encode())` returns different fields. Only a delimiter
    /// in claim or pool moves the split; the image absorbs the remainder.
    pub fn is_lossy(&self) -> bool {
        self.claim.contains(NAME_DELIMITER) || self.pool.contains(NAME_DELIMITER)
    }

    pub fn encode(&self) -> String {
        format!(
            "{claim}{d}{pool}{d}{image}{CHAIN_SUFFIX}",
            claim = self.claim,
            pool = self.pool,
            image = self.image,
            d = NAME_DELIMITER
        )
    }

    /// Split an object key back into claim, pool and image.
    ///
    /// The first two segments are taken as claim and pool and the rest is
    /// rejoined as the image. Returns `None` for keys with fewer than three
    /// segments.
    pub fn decode(key: &str) -> Option<Self> {
        let base = key.strip_suffix(CHAIN_SUFFIX).unwrap_or(key);
        let mut parts = base.splitn(3, NAME_DELIMITER);
        let claim = parts.next()?;
        let pool = parts.next()?;
        let image = parts.next()?;
        if claim.is_empty() || pool.is_empty() || image.is_empty() {
            return None;
        }
        Some(Self {
            claim: claim.to_string(),
            pool: pool.to_string(),
            image: image.to_string(),
            ambiguous: image.contains(NAME_DELIMITER),
        })
    }
}

impl fmt::Display for BackupObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Content type for an upload, chosen by the file's last transform suffix.
pub fn content_type_for(file_name: &str) -> &'static str {
    if file_name.ends_with(ENCRYPTED_SUFFIX) {
        CONTENT_TYPE_ENCRYPTED
    } else {
        CONTENT_TYPE_BINARY
    }
}
