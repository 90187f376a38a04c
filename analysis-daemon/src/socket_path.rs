use std::path::{Path, PathBuf};

/// Longest socket path accepted by `sockaddr_un` on every Unix we support
/// (macOS allows 104 bytes including the terminator).
pub const MAX_SOCKET_PATH_LEN: usize = 103;

/// Socket address of the driver that owns `storage_path`.
///
/// With no `socket_dir` the socket sits next to the storage file as
/// `<dir>/<stem>_driver.sock`. With a shared `socket_dir`, different storage
/// files may have the same stem, so the name also carries a short digest of
/// the absolute storage path: `<socket_dir>/<stem>_<digest>_driver.sock`.
///
/// Relative storage paths are resolved against the current directory first.
pub fn driver_socket_path(storage_path: &Path, socket_dir: Option<&Path>) -> PathBuf {
    let absolute = std::path::absolute(storage_path).unwrap_or_else(|_| storage_path.to_path_buf());
    let stem = crate::worker::storage_stem(&absolute);

    match socket_dir {
        None => {
            let dir = absolute
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            dir.join(format!("{stem}_driver.sock"))
        }
        Some(dir) => {
            let digest = format!("{:x}", md5::compute(absolute.to_string_lossy().as_bytes()));
            dir.join(format!("{stem}_{}_driver.sock", &digest[..8]))
        }
    }
}

/// Check if a socket path exists
pub fn socket_exists(path: &Path) -> bool {
    path.exists()
}

/// Remove a socket file, ignoring a missing one
pub fn remove_socket_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Reject socket paths the kernel won't bind.
pub fn validate_socket_path(path: &Path) -> std::io::Result<()> {
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "socket path {} is {} bytes, longer than the {} byte limit; configure a shorter socket_dir",
                path.display(),
                len,
                MAX_SOCKET_PATH_LEN
            ),
        ));
    }
    Ok(())
}
