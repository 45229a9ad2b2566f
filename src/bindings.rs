//! C Bindings for shmkv
//!
//! Provides a raw C API over [`KvStore`]. Keys and values cross the boundary
//! as NUL-terminated strings; strings handed out by the library must be
//! released with the matching `shmkv_free_*` function.

use crate::config::StoreConfig;
use crate::store::{self, KvStore};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;

// Opaque handle
pub struct ShmkvHandle(KvStore);

#[repr(C)]
pub struct ShmkvConfig {
    pub shards: u32,
    pub capacity: u32,
    pub key_size: u32,
    pub value_size: u32,
}

impl From<ShmkvConfig> for StoreConfig {
    fn from(config: ShmkvConfig) -> Self {
        StoreConfig {
            shards: config.shards,
            capacity: config.capacity,
            key_size: config.key_size,
            value_size: config.value_size,
        }
    }
}

unsafe fn str_arg<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

unsafe fn bytes_arg<'a>(s: *const c_char) -> Option<&'a [u8]> {
    if s.is_null() {
        return None;
    }
    Some(CStr::from_ptr(s).to_bytes())
}

fn log_failure(op: &'static str, err: &crate::KvError) {
    tracing::error!(op = op, error = %err, "shmkv call failed");
}

/// Default store geometry
#[no_mangle]
pub extern "C" fn shmkv_default_config() -> ShmkvConfig {
    let config = StoreConfig::default();
    ShmkvConfig {
        shards: config.shards,
        capacity: config.capacity,
        key_size: config.key_size,
        value_size: config.value_size,
    }
}

/// Attach to a store, creating it if absent
///
/// Returns null on failure.
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn shmkv_attach(
    name: *const c_char,
    config: ShmkvConfig,
) -> *mut ShmkvHandle {
    let Some(name) = str_arg(name) else {
        return ptr::null_mut();
    };

    match KvStore::attach(name, config.into()) {
        Ok(store) => Box::into_raw(Box::new(ShmkvHandle(store))),
        Err(e) => {
            log_failure("attach", &e);
            ptr::null_mut()
        }
    }
}

/// Detach, leaving the store in place for other processes
///
/// # Safety
/// handle must come from shmkv_attach and not be used afterwards
#[no_mangle]
pub unsafe extern "C" fn shmkv_detach(handle: *mut ShmkvHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Write an entry. Returns 0 on success, -1 on failure.
///
/// # Safety
/// handle must be live; key and value must be null-terminated strings
#[no_mangle]
pub unsafe extern "C" fn shmkv_put(
    handle: *mut ShmkvHandle,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    if handle.is_null() {
        return -1;
    }
    let (Some(key), Some(value)) = (bytes_arg(key), bytes_arg(value)) else {
        return -1;
    };

    match (*handle).0.put(key, value) {
        Ok(()) => 0,
        Err(e) => {
            log_failure("put", &e);
            -1
        }
    }
}

/// Read the first matching value
///
/// Returns null on a miss or failure. Free the result with shmkv_free_value.
///
/// # Safety
/// handle must be live; key must be a null-terminated string
#[no_mangle]
pub unsafe extern "C" fn shmkv_get(handle: *mut ShmkvHandle, key: *const c_char) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let Some(key) = bytes_arg(key) else {
        return ptr::null_mut();
    };

    match (*handle).0.get(key) {
        Ok(Some(value)) => CString::new(value)
            .map(CString::into_raw)
            .unwrap_or(ptr::null_mut()),
        Ok(None) => ptr::null_mut(),
        Err(e) => {
            log_failure("get", &e);
            ptr::null_mut()
        }
    }
}

/// Read every matching value
///
/// Writes the number of values into out_count and returns an array of that
/// many strings, or null when there are none. Free the result with
/// shmkv_free_values.
///
/// # Safety
/// handle must be live; key must be a null-terminated string; out_count
/// must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn shmkv_get_all(
    handle: *mut ShmkvHandle,
    key: *const c_char,
    out_count: *mut usize,
) -> *mut *mut c_char {
    if out_count.is_null() {
        return ptr::null_mut();
    }
    *out_count = 0;

    if handle.is_null() {
        return ptr::null_mut();
    }
    let Some(key) = bytes_arg(key) else {
        return ptr::null_mut();
    };

    let values = match (*handle).0.get_all(key) {
        Ok(values) => values,
        Err(e) => {
            log_failure("get_all", &e);
            return ptr::null_mut();
        }
    };
    if values.is_empty() {
        return ptr::null_mut();
    }

    let strings: Box<[*mut c_char]> = values
        .into_iter()
        .filter_map(|value| CString::new(value).ok())
        .map(CString::into_raw)
        .collect();
    *out_count = strings.len();
    Box::into_raw(strings) as *mut *mut c_char
}

/// Free a string returned by shmkv_get
///
/// # Safety
/// value must come from shmkv_get and not be freed twice
#[no_mangle]
pub unsafe extern "C" fn shmkv_free_value(value: *mut c_char) {
    if !value.is_null() {
        drop(CString::from_raw(value));
    }
}

/// Free an array returned by shmkv_get_all
///
/// # Safety
/// values and count must come from one shmkv_get_all call
#[no_mangle]
pub unsafe extern "C" fn shmkv_free_values(values: *mut *mut c_char, count: usize) {
    if values.is_null() {
        return;
    }
    let strings = Box::from_raw(ptr::slice_from_raw_parts_mut(values, count));
    for &value in strings.iter() {
        shmkv_free_value(value);
    }
}

/// Remove the store from the system namespace and release the handle
///
/// Returns 0 on success, -1 if anything was already gone.
///
/// # Safety
/// handle must come from shmkv_attach and not be used afterwards
#[no_mangle]
pub unsafe extern "C" fn shmkv_destroy(handle: *mut ShmkvHandle) -> c_int {
    if handle.is_null() {
        return -1;
    }
    let ShmkvHandle(store) = *Box::from_raw(handle);
    match store.destroy() {
        Ok(()) => 0,
        Err(e) => {
            log_failure("destroy", &e);
            -1
        }
    }
}

/// Remove a store by name without attaching
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn shmkv_destroy_name(name: *const c_char) -> c_int {
    let Some(name) = str_arg(name) else {
        return -1;
    };
    match store::destroy(name) {
        Ok(()) => 0,
        Err(e) => {
            log_failure("destroy", &e);
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn test_c_api_round_trip() {
        let name = c(&format!("test_ffi_{}", std::process::id()));
        unsafe {
            shmkv_destroy_name(name.as_ptr());

            let config = ShmkvConfig {
                shards: 4,
                capacity: 4,
                key_size: 8,
                value_size: 8,
            };
            let handle = shmkv_attach(name.as_ptr(), config);
            assert!(!handle.is_null());

            let key = c("fruit");
            assert_eq!(shmkv_put(handle, key.as_ptr(), c("apple").as_ptr()), 0);
            assert_eq!(shmkv_put(handle, key.as_ptr(), c("pear").as_ptr()), 0);

            let value = shmkv_get(handle, key.as_ptr());
            assert_eq!(CStr::from_ptr(value).to_str().unwrap(), "apple");
            shmkv_free_value(value);

            let mut count = 0usize;
            let values = shmkv_get_all(handle, key.as_ptr(), &mut count);
            assert_eq!(count, 2);
            let mut found: Vec<String> = (0..count)
                .map(|i| CStr::from_ptr(*values.add(i)).to_string_lossy().into_owned())
                .collect();
            found.sort();
            assert_eq!(found, vec!["apple".to_string(), "pear".to_string()]);
            shmkv_free_values(values, count);

            let missing = shmkv_get_all(handle, c("none").as_ptr(), &mut count);
            assert!(missing.is_null());
            assert_eq!(count, 0);
            assert!(shmkv_get(handle, c("none").as_ptr()).is_null());

            assert_eq!(shmkv_destroy(handle), 0);
            assert_eq!(shmkv_destroy_name(name.as_ptr()), -1);
        }
    }

    #[test]
    fn test_null_arguments_rejected() {
        unsafe {
            assert!(shmkv_attach(ptr::null(), shmkv_default_config()).is_null());
            assert_eq!(shmkv_put(ptr::null_mut(), ptr::null(), ptr::null()), -1);
            assert!(shmkv_get(ptr::null_mut(), ptr::null()).is_null());
            assert_eq!(shmkv_destroy(ptr::null_mut()), -1);
        }
    }
}
