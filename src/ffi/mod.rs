// C string and last-error helpers for the `w32_` surface.

use core::cell::Cell;
use core::ffi::{c_char, CStr};

use crate::error::{Error, Result};

thread_local! {
    static LAST_ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Borrow a NUL terminated argument as UTF-8, lossily.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL terminated string that stays valid
/// for the duration of the call.
pub unsafe fn cstr_arg(ptr: *const c_char) -> Result<String> {
    if ptr.is_null() {
        return Err(Error::BadAddress);
    }
    Ok(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

pub fn set_errno(value: i32) {
    LAST_ERRNO.with(|cell| cell.set(value));
}

pub fn errno() -> i32 {
    LAST_ERRNO.with(|cell| cell.get())
}

/// Record `err` as the calling thread's errno and hand back `sentinel`.
pub fn fail<T>(err: Error, sentinel: T) -> T {
    log::trace!("w32 call failed: {err}");
    set_errno(err.errno());
    sentinel
}

/// Copy `name` into `dst` with a terminating NUL; returns the bytes copied,
/// excluding the terminator. Names that do not fit are truncated on a
/// character boundary.
pub fn copy_name(dst: &mut [c_char], name: &str) -> usize {
    let Some(room) = dst.len().checked_sub(1) else {
        return 0;
    };
    let bytes = name.as_bytes();
    let mut len = bytes.len().min(room);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    for (slot, byte) in dst.iter_mut().zip(&bytes[..len]) {
        *slot = *byte as c_char;
    }
    dst[len] = 0;
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_name() {
        let mut buf = [1 as c_char; 6];
        assert_eq!(copy_name(&mut buf, "abc"), 3);
        assert_eq!(buf[3], 0);
        assert_eq!(copy_name(&mut buf, "abcdefgh"), 5);
        assert_eq!(buf[5], 0);
        assert_eq!(copy_name(&mut [], "x"), 0);
    }

    #[test]
    fn test_copy_name_keeps_whole_characters() {
        // three bytes per character; five bytes of room hold one
        let mut buf = [1 as c_char; 6];
        assert_eq!(copy_name(&mut buf, "日本"), 3);
        assert_eq!(buf[3], 0);
        let copied: Vec<u8> = buf[..3].iter().map(|&c| c as u8).collect();
        assert_eq!(std::str::from_utf8(&copied), Ok("日"));
        assert_eq!(copy_name(&mut [0; 3], "é"), 2);
        assert_eq!(copy_name(&mut [0; 2], "é"), 0);
    }

    #[test]
    fn test_errno_is_per_thread() {
        set_errno(libc::ENOENT);
        let other = std::thread::spawn(errno).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(fail(Error::BadDescriptor, -1), -1);
        assert_eq!(errno(), libc::EBADF);
    }

    #[test]
    fn test_null_argument() {
        assert_eq!(unsafe { cstr_arg(core::ptr::null()) }, Err(Error::BadAddress));
        let owned = std::ffi::CString::new("c:\\data").unwrap();
        assert_eq!(unsafe { cstr_arg(owned.as_ptr()) }.unwrap(), "c:\\data");
    }
}
