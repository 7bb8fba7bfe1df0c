//! Windows per-user Internet Settings, read and written through the registry API.
//!
//! Values live under `HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings`:
//! `ProxyEnable` (DWORD), `ProxyServer`, `ProxyOverride` and `AutoConfigURL`.
//! A missing value reads as 0 or empty; writing an empty string deletes the
//! value. String values are exchanged as UTF-16, so bypass entries in any
//! script survive a snapshot and restore unchanged. After writing, WinINet is
//! told to reload its settings so running applications pick up the change.

use super::store::{ProxySettings, ProxySettingsStore};
use crate::error::{CoreMeshError, Result};
use registry::{Access, Key};
use tracing::debug;

const INTERNET_SETTINGS_SUBKEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";

const VALUE_PROXY_ENABLE: &str = "ProxyEnable";
const VALUE_PROXY_SERVER: &str = "ProxyServer";
const VALUE_PROXY_OVERRIDE: &str = "ProxyOverride";
const VALUE_AUTOCONFIG_URL: &str = "AutoConfigURL";

const REG_SZ: u32 = 1;
const REG_EXPAND_SZ: u32 = 2;
const REG_DWORD: u32 = 4;
const REG_QWORD: u32 = 11;

/// A raw registry value: its type tag and data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RegValue {
    kind: u32,
    data: Vec<u8>,
}

/// Store backed by the current user's registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsRegistryStore;

impl ProxySettingsStore for WindowsRegistryStore {
    fn name(&self) -> &'static str {
        "windows-registry"
    }

    fn is_supported(&self) -> bool {
        cfg!(windows)
    }

    fn snapshot(&self) -> Result<ProxySettings> {
        let key = Key::open(INTERNET_SETTINGS_SUBKEY, Access::Read)
            .map_err(|e| CoreMeshError::SystemProxy(format!("open proxy registry: {}", e)))?;

        Ok(ProxySettings {
            enabled: read_integer(&key, VALUE_PROXY_ENABLE)? != 0,
            server: read_string(&key, VALUE_PROXY_SERVER)?,
            bypass: read_string(&key, VALUE_PROXY_OVERRIDE)?,
            autoconfig_url: read_string(&key, VALUE_AUTOCONFIG_URL)?,
        })
    }

    fn apply(&self, settings: &ProxySettings) -> Result<()> {
        let key = Key::open(INTERNET_SETTINGS_SUBKEY, Access::Write).map_err(|e| {
            CoreMeshError::SystemProxy(format!("open proxy registry for write: {}", e))
        })?;

        key.set(
            VALUE_PROXY_ENABLE,
            REG_DWORD,
            &u32::from(settings.enabled).to_le_bytes(),
        )
        .map_err(|e| write_err(VALUE_PROXY_ENABLE, e))?;
        write_string(&key, VALUE_PROXY_SERVER, &settings.server)?;
        write_string(&key, VALUE_PROXY_OVERRIDE, &settings.bypass)?;
        write_string(&key, VALUE_AUTOCONFIG_URL, &settings.autoconfig_url)?;
        drop(key);

        refresh_wininet()
    }
}

fn read_err(name: &str, e: impl std::fmt::Display) -> CoreMeshError {
    CoreMeshError::SystemProxy(format!("read {}: {}", name, e))
}

fn write_err(name: &str, e: impl std::fmt::Display) -> CoreMeshError {
    CoreMeshError::SystemProxy(format!("set {}: {}", name, e))
}

fn read_integer(key: &Key, name: &str) -> Result<u64> {
    match key.query(name).map_err(|e| read_err(name, e))? {
        None => Ok(0),
        Some(value) => decode_integer(&value)
            .ok_or_else(|| read_err(name, format!("unexpected value type {}", value.kind))),
    }
}

fn read_string(key: &Key, name: &str) -> Result<String> {
    match key.query(name).map_err(|e| read_err(name, e))? {
        None => Ok(String::new()),
        Some(value) => {
            let text = decode_string(&value).map_err(|reason| read_err(name, reason))?;
            Ok(text.trim().to_string())
        }
    }
}

/// Write a string value, or delete it when `value` is blank.
fn write_string(key: &Key, name: &str, value: &str) -> Result<()> {
    let value = value.trim();
    if value.is_empty() {
        debug!("Deleting registry value {}", name);
        return key.delete(name).map_err(|e| write_err(name, e));
    }
    let existing = key
        .query(name)
        .map_err(|e| read_err(name, e))?
        .map(|v| v.kind);
    key.set(name, string_kind_for(existing), &encode_string(value))
        .map_err(|e| write_err(name, e))
}

/// REG_EXPAND_SZ values stay expandable when rewritten.
fn string_kind_for(existing: Option<u32>) -> u32 {
    match existing {
        Some(REG_EXPAND_SZ) => REG_EXPAND_SZ,
        _ => REG_SZ,
    }
}

/// Decode REG_SZ or REG_EXPAND_SZ data (UTF-16LE, NUL-terminated or not).
fn decode_string(value: &RegValue) -> std::result::Result<String, String> {
    if value.kind != REG_SZ && value.kind != REG_EXPAND_SZ {
        return Err(format!("unexpected value type {}", value.kind));
    }
    let units: Vec<u16> = value
        .data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16(&units).map_err(|e| format!("value is not valid UTF-16: {}", e))
}

fn encode_string(value: &str) -> Vec<u8> {
    value
        .encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

fn decode_integer(value: &RegValue) -> Option<u64> {
    match (value.kind, value.data.as_slice()) {
        (REG_DWORD, &[a, b, c, d]) => Some(u64::from(u32::from_le_bytes([a, b, c, d]))),
        (REG_QWORD, data) if data.len() == 8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(data);
            Some(u64::from_le_bytes(bytes))
        }
        _ => None,
    }
}

#[cfg(windows)]
mod registry {
    use super::RegValue;
    use std::ffi::c_void;
    use std::io;
    use std::ptr;

    type Hkey = *mut c_void;

    const HKEY_CURRENT_USER: isize = 0x8000_0001_u32 as i32 as isize;
    const KEY_QUERY_VALUE: u32 = 0x0001;
    const KEY_SET_VALUE: u32 = 0x0002;

    const ERROR_SUCCESS: i32 = 0;
    const ERROR_FILE_NOT_FOUND: i32 = 2;
    const ERROR_MORE_DATA: i32 = 234;

    #[link(name = "advapi32")]
    extern "system" {
        fn RegOpenKeyExW(
            key: Hkey,
            sub_key: *const u16,
            options: u32,
            desired: u32,
            result: *mut Hkey,
        ) -> i32;
        fn RegQueryValueExW(
            key: Hkey,
            name: *const u16,
            reserved: *mut u32,
            kind: *mut u32,
            data: *mut u8,
            data_len: *mut u32,
        ) -> i32;
        fn RegSetValueExW(
            key: Hkey,
            name: *const u16,
            reserved: u32,
            kind: u32,
            data: *const u8,
            data_len: u32,
        ) -> i32;
        fn RegDeleteValueW(key: Hkey, name: *const u16) -> i32;
        fn RegCloseKey(key: Hkey) -> i32;
    }

    pub(super) enum Access {
        Read,
        Write,
    }

    /// An open HKCU subkey, closed on drop.
    pub(super) struct Key(Hkey);

    impl Key {
        pub(super) fn open(sub_key: &str, access: Access) -> io::Result<Key> {
            let desired = match access {
                Access::Read => KEY_QUERY_VALUE,
                Access::Write => KEY_QUERY_VALUE | KEY_SET_VALUE,
            };
            let sub_key = to_wide(sub_key);
            let mut handle: Hkey = ptr::null_mut();
            // SAFETY: `sub_key` is NUL-terminated and outlives the call;
            // `handle` is a valid out pointer.
            let status = unsafe {
                RegOpenKeyExW(
                    HKEY_CURRENT_USER as Hkey,
                    sub_key.as_ptr(),
                    0,
                    desired,
                    &mut handle,
                )
            };
            check(status)?;
            Ok(Key(handle))
        }

        /// Read a value, `None` when it does not exist.
        pub(super) fn query(&self, name: &str) -> io::Result<Option<RegValue>> {
            let name = to_wide(name);
            let mut data: Vec<u8> = Vec::new();
            loop {
                let mut kind = 0u32;
                let mut len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                let data_ptr = if data.is_empty() {
                    ptr::null_mut()
                } else {
                    data.as_mut_ptr()
                };
                // SAFETY: `data_ptr` is null (size query) or points to `len`
                // writable bytes; `name` is NUL-terminated.
                let status = unsafe {
                    RegQueryValueExW(
                        self.0,
                        name.as_ptr(),
                        ptr::null_mut(),
                        &mut kind,
                        data_ptr,
                        &mut len,
                    )
                };
                match status {
                    ERROR_FILE_NOT_FOUND => return Ok(None),
                    ERROR_MORE_DATA => data.resize(len as usize, 0),
                    ERROR_SUCCESS if data_ptr.is_null() && len > 0 => {
                        data.resize(len as usize, 0)
                    }
                    ERROR_SUCCESS => {
                        data.truncate(len as usize);
                        return Ok(Some(RegValue { kind, data }));
                    }
                    other => return Err(io::Error::from_raw_os_error(other)),
                }
            }
        }

        pub(super) fn set(&self, name: &str, kind: u32, data: &[u8]) -> io::Result<()> {
            let name = to_wide(name);
            let len = u32::try_from(data.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "value too large"))?;
            // SAFETY: `data` is valid for `len` bytes; `name` is NUL-terminated.
            check(unsafe { RegSetValueExW(self.0, name.as_ptr(), 0, kind, data.as_ptr(), len) })
        }

        /// Delete a value; a value that does not exist is not an error.
        pub(super) fn delete(&self, name: &str) -> io::Result<()> {
            let name = to_wide(name);
            // SAFETY: `name` is NUL-terminated and outlives the call.
            match unsafe { RegDeleteValueW(self.0, name.as_ptr()) } {
                ERROR_FILE_NOT_FOUND => Ok(()),
                status => check(status),
            }
        }
    }

    impl Drop for Key {
        fn drop(&mut self) {
            // SAFETY: the handle came from RegOpenKeyExW and is closed only here.
            unsafe {
                RegCloseKey(self.0);
            }
        }
    }

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn check(status: i32) -> io::Result<()> {
        if status == ERROR_SUCCESS {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(status))
        }
    }
}

#[cfg(not(windows))]
mod registry {
    use super::RegValue;
    use std::io;

    pub(super) enum Access {
        Read,
        Write,
    }

    /// Placeholder handle; every value operation fails off Windows.
    pub(super) struct Key;

    impl Key {
        pub(super) fn open(_sub_key: &str, _access: Access) -> io::Result<Key> {
            Ok(Key)
        }

        pub(super) fn query(&self, _name: &str) -> io::Result<Option<RegValue>> {
            Err(unsupported())
        }

        pub(super) fn set(&self, _name: &str, _kind: u32, _data: &[u8]) -> io::Result<()> {
            Err(unsupported())
        }

        pub(super) fn delete(&self, _name: &str) -> io::Result<()> {
            Err(unsupported())
        }
    }

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "the registry exists only on Windows",
        )
    }
}

#[cfg(windows)]
fn refresh_wininet() -> Result<()> {
    use std::ffi::c_void;

    const INTERNET_OPTION_REFRESH: u32 = 37;
    const INTERNET_OPTION_SETTINGS_CHANGED: u32 = 39;

    #[link(name = "wininet")]
    extern "system" {
        fn InternetSetOptionW(
            internet: *mut c_void,
            option: u32,
            buffer: *mut c_void,
            buffer_length: u32,
        ) -> i32;
    }

    for option in [INTERNET_OPTION_SETTINGS_CHANGED, INTERNET_OPTION_REFRESH] {
        // SAFETY: both options take no buffer; a null handle targets the
        // global WinINet settings.
        let ok = unsafe {
            InternetSetOptionW(std::ptr::null_mut(), option, std::ptr::null_mut(), 0)
        };
        if ok == 0 {
            return Err(CoreMeshError::SystemProxy(format!(
                "refresh proxy settings (option {}): {}",
                option,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[cfg(not(windows))]
fn refresh_wininet() -> Result<()> {
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn utf16le(text: &str, terminated: bool) -> Vec<u8> {
        let mut units: Vec<u16> = text.encode_utf16().collect();
        if terminated {
            units.push(0);
        }
        units.into_iter().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn test_non_ascii_bypass_decodes_verbatim() {
        let bypass = "内网.example;localhost;*.dévelop.test;<local>";
        let value = RegValue {
            kind: REG_SZ,
            data: utf16le(bypass, true),
        };
        let decoded = decode_string(&value).unwrap();
        assert_eq!(decoded, bypass);
        assert!(!decoded.contains('\u{FFFD}'));
    }

    #[test]
    fn test_decode_string_without_terminator() {
        let value = RegValue {
            kind: REG_EXPAND_SZ,
            data: utf16le("%USERPROFILE%\\proxy.pac", false),
        };
        assert_eq!(decode_string(&value).unwrap(), "%USERPROFILE%\\proxy.pac");
    }

    #[test]
    fn test_decode_string_rejects_bad_data() {
        let dword = RegValue {
            kind: REG_DWORD,
            data: vec![1, 0, 0, 0],
        };
        assert!(decode_string(&dword).is_err());

        let lone_surrogate = RegValue {
            kind: REG_SZ,
            data: vec![0x00, 0xD8, 0x41, 0x00],
        };
        assert!(decode_string(&lone_surrogate).is_err());
    }

    #[test]
    fn test_encode_string_is_terminated_utf16le() {
        let encoded = encode_string("代理:7890");
        assert_eq!(&encoded[encoded.len() - 2..], &[0, 0]);
        let value = RegValue {
            kind: REG_SZ,
            data: encoded,
        };
        assert_eq!(decode_string(&value).unwrap(), "代理:7890");
    }

    #[test]
    fn test_decode_integer() {
        let dword = RegValue {
            kind: REG_DWORD,
            data: vec![1, 0, 0, 0],
        };
        assert_eq!(decode_integer(&dword), Some(1));

        let qword = RegValue {
            kind: REG_QWORD,
            data: 5u64.to_le_bytes().to_vec(),
        };
        assert_eq!(decode_integer(&qword), Some(5));

        let short = RegValue {
            kind: REG_DWORD,
            data: vec![1, 0],
        };
        assert_eq!(decode_integer(&short), None);

        let text = RegValue {
            kind: REG_SZ,
            data: utf16le("1", true),
        };
        assert_eq!(decode_integer(&text), None);
    }

    #[test]
    fn test_rewrite_keeps_expandable_strings() {
        assert_eq!(string_kind_for(Some(REG_EXPAND_SZ)), REG_EXPAND_SZ);
        assert_eq!(string_kind_for(Some(REG_SZ)), REG_SZ);
        assert_eq!(string_kind_for(None), REG_SZ);
    }

    #[test]
    fn test_supported_only_on_windows() {
        assert_eq!(WindowsRegistryStore.is_supported(), cfg!(windows));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_registry_unavailable_elsewhere() {
        let err = WindowsRegistryStore.snapshot().unwrap_err();
        assert!(matches!(err, CoreMeshError::SystemProxy(_)));
        assert!(err.to_string().contains("only on Windows"));

        let err = WindowsRegistryStore
            .apply(&ProxySettings::default())
            .unwrap_err();
        assert!(err.to_string().contains("set ProxyEnable"));
    }

    #[cfg(windows)]
    #[test]
    fn test_snapshot_reads_current_user_settings() {
        assert!(WindowsRegistryStore.snapshot().is_ok());
    }
}
