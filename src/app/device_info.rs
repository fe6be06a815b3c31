//! Device information cache
//!
//! What this stack knows about each remote device: how large an APDU it
//! accepts, whether it can segment, how many segments it takes. Records live
//! in an arena and are addressed by a [`DeviceHandle`]; transactions hold a
//! handle, never a copy, so an update made through one path (an I-Am, a
//! server transaction learning the peer accepts segmented responses) is seen
//! by every holder.
//!
//! # Keys
//!
//! A record is indexed under an instance-only key and an address-only key, as
//! far as those are known. A key with both fields set is a slot of its own;
//! the cache never coalesces keys on lookup. Only [`DeviceInfoCache::update_device_info`]
//! and [`DeviceInfoCache::i_am_device_info`] move a record between keys.
//!
//! # Reference counting
//!
//! [`DeviceInfoCache::acquire`] increments a record's count and
//! [`DeviceInfoCache::release`] decrements it; a record with a non-zero count
//! must not be evicted. Records are never removed by this cache.

use std::collections::HashMap;

use log::{debug, trace};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{ApplicationError, Result, Segmentation};
use crate::network::Address;
use crate::service::IAmRequest;

/// Stable handle to a record in the cache arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(usize);

/// Lookup key: device instance, station address, or both
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfoKey {
    pub instance: Option<u32>,
    pub address: Option<Address>,
}

impl DeviceInfoKey {
    pub fn new(instance: Option<u32>, address: Option<Address>) -> Self {
        Self { instance, address }
    }

    /// Key naming a device by instance number only
    pub fn instance(instance: u32) -> Self {
        Self::new(Some(instance), None)
    }

    /// Key naming a device by address only
    pub fn address(address: Address) -> Self {
        Self::new(None, Some(address))
    }
}

impl From<u32> for DeviceInfoKey {
    fn from(instance: u32) -> Self {
        Self::instance(instance)
    }
}

impl From<Address> for DeviceInfoKey {
    fn from(address: Address) -> Self {
        Self::address(address)
    }
}

impl From<&Address> for DeviceInfoKey {
    fn from(address: &Address) -> Self {
        Self::address(address.clone())
    }
}

/// Capabilities of one remote device
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Device object instance number
    pub device_instance: Option<u32>,
    /// Station address
    pub address: Option<Address>,
    /// Maximum APDU length accepted
    pub max_apdu_length_accepted: Option<u16>,
    /// Segmentation supported
    pub segmentation_supported: Segmentation,
    /// Maximum segments accepted, `None` when unknown or more than 64
    pub max_segments_accepted: Option<u8>,
    /// Vendor identifier
    pub vendor_id: Option<u16>,
    /// Largest NPDU that can be delivered to the device
    pub max_npdu_length: Option<u16>,
    #[cfg_attr(feature = "serde", serde(skip))]
    ref_count: usize,
    #[cfg_attr(feature = "serde", serde(skip))]
    cache_keys: (Option<u32>, Option<Address>),
}

impl DeviceInfo {
    /// A record with nothing known beyond its identity
    pub fn new(device_instance: Option<u32>, address: Option<Address>) -> Self {
        Self {
            device_instance,
            address,
            max_apdu_length_accepted: Some(1024),
            segmentation_supported: Segmentation::NoSegmentation,
            max_segments_accepted: None,
            vendor_id: None,
            max_npdu_length: None,
            ref_count: 0,
            cache_keys: (None, None),
        }
    }

    /// Number of outstanding acquisitions
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }
}

/// Keyed store of [`DeviceInfo`] records
#[derive(Debug, Default)]
pub struct DeviceInfoCache {
    records: Vec<DeviceInfo>,
    index: HashMap<DeviceInfoKey, DeviceHandle>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the arena
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True if a record is indexed under `key`
    pub fn has_device_info(&self, key: &DeviceInfoKey) -> bool {
        self.index.contains_key(key)
    }

    /// Handle of the record indexed under `key`
    pub fn lookup(&self, key: &DeviceInfoKey) -> Option<DeviceHandle> {
        self.index.get(key).copied()
    }

    /// Record indexed under `key`
    pub fn get_device_info(&self, key: &DeviceInfoKey) -> Option<&DeviceInfo> {
        self.lookup(key).and_then(|handle| self.device_info(handle))
    }

    /// Record behind a handle
    pub fn device_info(&self, handle: DeviceHandle) -> Option<&DeviceInfo> {
        self.records.get(handle.0)
    }

    /// Mutable record behind a handle. Call
    /// [`DeviceInfoCache::update_device_info`] afterwards if the instance or
    /// address changed.
    pub fn device_info_mut(&mut self, handle: DeviceHandle) -> Option<&mut DeviceInfo> {
        self.records.get_mut(handle.0)
    }

    /// Add a new record and index it under its identifying keys
    pub fn insert(&mut self, info: DeviceInfo) -> DeviceHandle {
        let handle = DeviceHandle(self.records.len());
        self.records.push(info);
        self.reindex(handle);
        debug!("new device info {:?}", handle);
        handle
    }

    /// Merge an I-Am announcement into the cache. An existing record found by
    /// instance is preferred, then one found by address; otherwise a new
    /// record is created.
    pub fn i_am_device_info(&mut self, i_am: &IAmRequest, source: Address) -> DeviceHandle {
        let existing = self
            .lookup(&DeviceInfoKey::instance(i_am.device_instance))
            .or_else(|| self.lookup(&DeviceInfoKey::address(source.clone())));

        let handle = match existing {
            Some(handle) => handle,
            None => self.insert(DeviceInfo::new(
                Some(i_am.device_instance),
                Some(source.clone()),
            )),
        };

        let info = &mut self.records[handle.0];
        info.device_instance = Some(i_am.device_instance);
        info.address = Some(source);
        info.max_apdu_length_accepted = Some(i_am.max_apdu_length_accepted);
        info.segmentation_supported = i_am.segmentation_supported;
        info.vendor_id = Some(i_am.vendor_identifier);

        self.reindex(handle);
        handle
    }

    /// Re-index a record under its current keys, dropping stale entries left
    /// from a previous instance or address
    pub fn update_device_info(&mut self, handle: DeviceHandle) -> Result<()> {
        if handle.0 >= self.records.len() {
            return Err(ApplicationError::UnknownDevice);
        }
        self.reindex(handle);
        Ok(())
    }

    fn reindex(&mut self, handle: DeviceHandle) {
        let info = &self.records[handle.0];
        let (old_instance, old_address) = info.cache_keys.clone();
        let instance = info.device_instance;
        let address = info.address.clone();

        if old_instance.is_some() && old_instance != instance {
            self.remove_index(DeviceInfoKey::new(old_instance, None), handle);
        }
        if old_address.is_some() && old_address != address {
            self.remove_index(DeviceInfoKey::new(None, old_address), handle);
        }

        if let Some(instance) = instance {
            self.index.insert(DeviceInfoKey::instance(instance), handle);
        }
        if let Some(address) = &address {
            self.index
                .insert(DeviceInfoKey::address(address.clone()), handle);
        }

        trace!(
            "device info {:?} indexed as {:?} / {:?}",
            handle,
            instance,
            address
        );
        self.records[handle.0].cache_keys = (instance, address);
    }

    fn remove_index(&mut self, key: DeviceInfoKey, handle: DeviceHandle) {
        if self.index.get(&key) == Some(&handle) {
            self.index.remove(&key);
        }
    }

    /// Take a reference to the record under `key`
    pub fn acquire(&mut self, key: &DeviceInfoKey) -> Option<DeviceHandle> {
        let handle = self.lookup(key)?;
        self.records[handle.0].ref_count += 1;
        Some(handle)
    }

    /// Give back a reference taken with [`DeviceInfoCache::acquire`]
    pub fn release(&mut self, handle: DeviceHandle) -> Result<()> {
        let info = self
            .records
            .get_mut(handle.0)
            .ok_or(ApplicationError::UnknownDevice)?;
        if info.ref_count == 0 {
            return Err(ApplicationError::ReferenceCount);
        }
        info.ref_count -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(last: u8) -> Address {
        Address::local_station(vec![10, 0, 0, last, 0xBA, 0xC0])
    }

    fn i_am(instance: u32) -> IAmRequest {
        IAmRequest::new(instance, 480, Segmentation::Both, 15)
    }

    #[test]
    fn test_i_am_creates_record() {
        let mut cache = DeviceInfoCache::new();
        let handle = cache.i_am_device_info(&i_am(1001), addr(1));

        assert!(cache.has_device_info(&DeviceInfoKey::instance(1001)));
        assert!(cache.has_device_info(&DeviceInfoKey::address(addr(1))));
        // both-field key is its own slot
        assert!(!cache.has_device_info(&DeviceInfoKey::new(Some(1001), Some(addr(1)))));

        let info = cache.device_info(handle).unwrap();
        assert_eq!(info.max_apdu_length_accepted, Some(480));
        assert_eq!(info.segmentation_supported, Segmentation::Both);
        assert_eq!(info.vendor_id, Some(15));
    }

    #[test]
    fn test_i_am_fills_in_address_only_record() {
        let mut cache = DeviceInfoCache::new();
        let handle = cache.insert(DeviceInfo::new(None, Some(addr(2))));
        assert!(!cache.has_device_info(&DeviceInfoKey::instance(77)));

        let merged = cache.i_am_device_info(&i_am(77), addr(2));
        assert_eq!(merged, handle);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&DeviceInfoKey::instance(77)), Some(handle));
    }

    #[test]
    fn test_moved_device_drops_stale_address() {
        let mut cache = DeviceInfoCache::new();
        let handle = cache.i_am_device_info(&i_am(5), addr(1));
        let moved = cache.i_am_device_info(&i_am(5), addr(9));

        assert_eq!(moved, handle);
        assert!(!cache.has_device_info(&DeviceInfoKey::address(addr(1))));
        assert_eq!(cache.lookup(&DeviceInfoKey::address(addr(9))), Some(handle));
    }

    #[test]
    fn test_update_reindexes_instance() {
        let mut cache = DeviceInfoCache::new();
        let handle = cache.insert(DeviceInfo::new(Some(1), Some(addr(3))));
        cache.device_info_mut(handle).unwrap().device_instance = Some(2);
        cache.update_device_info(handle).unwrap();

        assert!(!cache.has_device_info(&DeviceInfoKey::instance(1)));
        assert_eq!(cache.lookup(&DeviceInfoKey::instance(2)), Some(handle));
        assert_eq!(
            cache.update_device_info(DeviceHandle(42)),
            Err(ApplicationError::UnknownDevice)
        );
    }

    #[test]
    fn test_release_without_acquire_fails() {
        let mut cache = DeviceInfoCache::new();
        let handle = cache.insert(DeviceInfo::new(Some(3), None));
        assert_eq!(cache.release(handle), Err(ApplicationError::ReferenceCount));

        let acquired = cache.acquire(&DeviceInfoKey::instance(3)).unwrap();
        assert_eq!(cache.device_info(acquired).unwrap().ref_count(), 1);
        cache.release(acquired).unwrap();
        assert_eq!(cache.release(acquired), Err(ApplicationError::ReferenceCount));
    }

    #[test]
    fn test_acquire_unknown_key() {
        let mut cache = DeviceInfoCache::new();
        assert_eq!(cache.acquire(&DeviceInfoKey::address(addr(4))), None);
    }

    proptest! {
        #[test]
        fn acquire_then_release_is_neutral(held in 0usize..5, instance in 0u32..4_194_303) {
            let mut cache = DeviceInfoCache::new();
            let handle = cache.insert(DeviceInfo::new(Some(instance), None));
            let key = DeviceInfoKey::instance(instance);
            for _ in 0..held {
                cache.acquire(&key);
            }
            let before = cache.device_info(handle).unwrap().ref_count();

            let acquired = cache.acquire(&key).unwrap();
            cache.release(acquired).unwrap();

            prop_assert_eq!(cache.device_info(handle).unwrap().ref_count(), before);
        }
    }
}
