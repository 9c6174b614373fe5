use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Create an anonymous, fd-backed memory region of `size` bytes.
///
/// The returned file can be mapped by this process and, once its descriptor
/// has been handed over, by another one.
pub fn memfd(name: &str, size: usize) -> io::Result<File> {
    let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(size as u64)?;
    Ok(file)
}

/// Round `len` up to the next page boundary.
pub fn page_align(len: usize) -> usize {
    let page = page_size::get();
    len.div_ceil(page) * page
}

/// Duplicate a descriptor received through an [`OverlayHandle`](crate::overlay::OverlayHandle).
pub fn dup_fd(fd: RawFd) -> io::Result<OwnedFd> {
    if fd < 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // The handle only carries descriptors that are open in this process.
    unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_align_rounds_up() {
        let page = page_size::get();
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
    }

    #[test]
    fn memfd_has_requested_length() {
        let file = memfd("test-region", 8192).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 8192);
    }

    #[test]
    fn dup_rejects_negative_descriptors() {
        assert!(dup_fd(-1).is_err());
    }
}
