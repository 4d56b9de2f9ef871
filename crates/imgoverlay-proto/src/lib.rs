//! imgoverlay control protocol
//!
//! Shared wire types for the control channel between an image producer
//! (the process rendering overlay contents) and the overlay server embedded
//! in the compositor.
//!
//! Every request is one fixed 128-byte frame and every reply one fixed
//! 16-byte frame. Buffer handles never travel inside a frame: they follow a
//! `CreateImage` request as `SCM_RIGHTS` ancillary data.

pub mod wire;

pub use wire::{
    CreateImage, Message, MessageKind, Reply, Status, UpdateImage, WireError, MAX_PLANES,
    MSG_FRAME_SIZE, REPLY_FRAME_SIZE,
};

/// Bytes per pixel of a shared-memory image (RGBA8888).
pub const BYTES_PER_PIXEL: u64 = 4;

/// Size in bytes of one half of a double-buffered shared-memory image.
pub fn half_size(width: u32, height: u32) -> u64 {
    width as u64 * height as u64 * BYTES_PER_PIXEL
}

/// Size in bytes a producer must allocate for a double-buffered image.
pub fn double_buffer_size(width: u32, height: u32) -> u64 {
    half_size(width, height) * 2
}

/// Default socket path for the control channel
pub fn default_socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    std::path::PathBuf::from(runtime_dir).join("imgoverlay.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sizes() {
        assert_eq!(half_size(64, 64), 64 * 64 * 4);
        assert_eq!(double_buffer_size(64, 64), 64 * 64 * 4 * 2);
        // No u32 overflow for large dimensions
        assert_eq!(double_buffer_size(u32::MAX, 2), u32::MAX as u64 * 16);
    }

    #[test]
    fn test_default_socket_path_name() {
        let path = default_socket_path();
        assert_eq!(path.file_name().unwrap(), "imgoverlay.sock");
    }
}
