//! API-key permission bitflags.
//!
//! Stored as a single integer column; checks are simple mask tests so the
//! HTTP layer can gate each route with one call.

pub const TEXT_SHARE: u32 = 1;
pub const FILE_SHARE: u32 = 2;
pub const TEXT_MANAGE: u32 = 4;
pub const FILE_MANAGE: u32 = 8;
pub const MOUNT_VIEW: u32 = 256;
pub const MOUNT_UPLOAD: u32 = 512;
pub const MOUNT_COPY: u32 = 1024;
pub const MOUNT_RENAME: u32 = 2048;
pub const MOUNT_DELETE: u32 = 4096;
pub const WEBDAV_READ: u32 = 65536;
pub const WEBDAV_MANAGE: u32 = 131072;

pub fn has(permissions: u32, required: u32) -> bool {
    permissions & required == required
}

pub fn has_any(permissions: u32, mask: u32) -> bool {
    permissions & mask != 0
}

#[cfg(test)]
mod tests {
    use super::{MOUNT_UPLOAD, MOUNT_VIEW, WEBDAV_READ, has, has_any};

    #[test]
    fn has_requires_all_bits() {
        let perms = MOUNT_VIEW | MOUNT_UPLOAD;
        assert!(has(perms, MOUNT_VIEW));
        assert!(has(perms, MOUNT_VIEW | MOUNT_UPLOAD));
        assert!(!has(perms, MOUNT_VIEW | WEBDAV_READ));
    }

    #[test]
    fn has_any_matches_one_bit() {
        assert!(has_any(MOUNT_VIEW, MOUNT_VIEW | WEBDAV_READ));
        assert!(!has_any(MOUNT_UPLOAD, MOUNT_VIEW | WEBDAV_READ));
    }
}
