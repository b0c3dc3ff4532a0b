//! Process-wide device registry: a single global table of mounted
//! devices, keyed by handle, with explicit register/unregister
//! lifecycle calls. This is the only mutable global state the crate
//! keeps; everything else lives on `Device` itself.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;

pub type DeviceHandle = u32;

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

#[derive(Default)]
struct Registry {
    next_handle: DeviceHandle,
    mounted: HashMap<DeviceHandle, String>,
}

/// Registers a mounted device under a fresh handle, recording only the
/// label a diagnostic tool would want (the device's own state lives in
/// the `Device` the caller owns; the registry's job is bookkeeping of
/// *which* devices are mounted, not holding them).
pub fn register(label: &str) -> DeviceHandle {
    let mut reg = REGISTRY.lock().unwrap();
    reg.next_handle += 1;
    let handle = reg.next_handle;
    reg.mounted.insert(handle, label.to_string());
    handle
}

pub fn unregister(handle: DeviceHandle) {
    let mut reg = REGISTRY.lock().unwrap();
    reg.mounted.remove(&handle);
}

pub fn mounted_labels() -> Vec<(DeviceHandle, String)> {
    let reg = REGISTRY.lock().unwrap();
    let mut v: Vec<_> = reg.mounted.iter().map(|(h, l)| (*h, l.clone())).collect();
    v.sort_by_key(|(h, _)| *h);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_unregister_round_trips() {
        let h = register("test-device-a");
        assert!(mounted_labels().iter().any(|(handle, _)| *handle == h));
        unregister(h);
        assert!(!mounted_labels().iter().any(|(handle, _)| *handle == h));
    }
}
