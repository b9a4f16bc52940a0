//! `getenv` over an explicitly supplied environment vector.
//!
//! The restorer cannot use `std::env::var` post-relocation (it allocates
//! and depends on a `Once`-guarded cache `std` fills in before `main`,
//! which may no longer be reachable). Instead it walks a raw
//! `*const *const c_char` array directly, the shape `char **environ` has
//! on every platform this targets.

use std::ffi::CStr;
use std::os::raw::c_char;

/// Look up `name` in a NUL-terminated array of `"NAME=value"` C strings,
/// terminated by a null pointer (the shape of `char **environ`).
///
/// # Safety
/// `environ` must point to a valid, null-terminated array of valid
/// NUL-terminated C strings.
pub unsafe fn getenv_raw(environ: *const *const c_char, name: &[u8]) -> Option<&'static [u8]> {
    let mut i = 0isize;
    loop {
        let entry = *environ.offset(i);
        if entry.is_null() {
            return None;
        }
        let entry_bytes = CStr::from_ptr(entry).to_bytes();
        if crate::strutil::starts_with(entry_bytes, name)
            && entry_bytes.get(name.len()) == Some(&b'=')
        {
            return Some(&entry_bytes[name.len() + 1..]);
        }
        i += 1;
    }
}

/// Convenience wrapper over `std::env::var` for the pre-relocation phase,
/// where the ordinary environment is still safe to consult.
pub fn getenv(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn getenv_raw_finds_match() {
        let a = CString::new("FOO=bar").unwrap();
        let b = CString::new("DMTCP_RESTART_PAUSE=3").unwrap();
        let ptrs: Vec<*const c_char> = vec![a.as_ptr(), b.as_ptr(), std::ptr::null()];
        unsafe {
            let v = getenv_raw(ptrs.as_ptr(), b"DMTCP_RESTART_PAUSE").unwrap();
            assert_eq!(v, b"3");
            assert!(getenv_raw(ptrs.as_ptr(), b"MISSING").is_none());
        }
    }
}
