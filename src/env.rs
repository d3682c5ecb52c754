//! Live host configuration lookup.
//!
//! The broadcasting application publishes its session (ingest servers,
//! preview URLs, title) as environment values that change while the agent
//! runs, so every read goes back to the source instead of a cached copy.

use std::collections::HashMap;
use std::sync::RwLock;

pub trait EnvSource: Send + Sync {
    /// Current value of `name`, `None` when unset or empty.
    fn get(&self, name: &str) -> Option<String>;

    fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }
}

/// Reads the agent process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// In-memory values, settable at runtime.
#[derive(Debug, Default)]
pub struct StaticEnv {
    values: RwLock<HashMap<String, String>>,
}

impl StaticEnv {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: RwLock::new(values.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    pub fn set(&self, name: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(name);
        }
    }
}

impl EnvSource for StaticEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.values
            .read()
            .ok()
            .and_then(|values| values.get(name).cloned())
            .filter(|v| !v.is_empty())
    }
}

/// Environment source for the running platform.
pub fn platform_env() -> Box<dyn EnvSource> {
    #[cfg(windows)]
    {
        Box::new(RegistryEnv)
    }
    #[cfg(not(windows))]
    {
        Box::new(ProcessEnv)
    }
}

/// Reads persisted environment values straight from the registry.
///
/// Values set by another process after the agent started never reach our
/// process block, and when running as LocalSystem `HKCU` belongs to the
/// service account, so logged-in user hives are searched as well.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryEnv;

#[cfg(windows)]
impl EnvSource for RegistryEnv {
    fn get(&self, name: &str) -> Option<String> {
        use windows_sys::Win32::System::Registry::{
            HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS,
        };

        if let Some(v) = registry::read_string(HKEY_CURRENT_USER, "Environment", name) {
            return Some(v);
        }
        for sid in registry::user_sids() {
            let subkey = format!("{sid}\\Environment");
            if let Some(v) = registry::read_string(HKEY_USERS, &subkey, name) {
                return Some(v);
            }
        }
        if let Some(v) = registry::read_string(
            HKEY_LOCAL_MACHINE,
            r"SYSTEM\CurrentControlSet\Control\Session Manager\Environment",
            name,
        ) {
            return Some(v);
        }
        ProcessEnv.get(name)
    }
}

#[cfg(windows)]
mod registry {
    use std::ptr;
    use windows_sys::Win32::Foundation::{ERROR_SUCCESS, FILETIME};
    use windows_sys::Win32::System::Registry::{
        RegEnumKeyExW, RegGetValueW, HKEY, HKEY_USERS, RRF_RT_REG_SZ,
    };

    pub(super) fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub(super) fn read_string(root: HKEY, subkey: &str, name: &str) -> Option<String> {
        let subkey = wide(subkey);
        let name = wide(name);
        // REG_EXPAND_SZ values match too and come back expanded.
        let flags = RRF_RT_REG_SZ;

        let mut size: u32 = 0;
        let status = unsafe {
            RegGetValueW(
                root,
                subkey.as_ptr(),
                name.as_ptr(),
                flags,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut size,
            )
        };
        if status != ERROR_SUCCESS || size == 0 {
            return None;
        }

        let mut buf = vec![0u16; (size as usize).div_ceil(2)];
        let status = unsafe {
            RegGetValueW(
                root,
                subkey.as_ptr(),
                name.as_ptr(),
                flags,
                ptr::null_mut(),
                buf.as_mut_ptr().cast(),
                &mut size,
            )
        };
        if status != ERROR_SUCCESS {
            return None;
        }
        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        let value = String::from_utf16_lossy(&buf[..len]);
        (!value.is_empty()).then_some(value)
    }

    /// Interactive user SIDs loaded under `HKEY_USERS`.
    pub(super) fn user_sids() -> Vec<String> {
        let mut sids = Vec::new();
        let mut index = 0;
        loop {
            let mut name = [0u16; 256];
            let mut len = name.len() as u32;
            let mut written: FILETIME = unsafe { std::mem::zeroed() };
            let status = unsafe {
                RegEnumKeyExW(
                    HKEY_USERS,
                    index,
                    name.as_mut_ptr(),
                    &mut len,
                    ptr::null(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    &mut written,
                )
            };
            if status != ERROR_SUCCESS {
                break;
            }
            let sid = String::from_utf16_lossy(&name[..len as usize]);
            if sid.starts_with("S-1-5-21-") && !sid.ends_with("_Classes") {
                sids.push(sid);
            }
            index += 1;
        }
        sids
    }
}
