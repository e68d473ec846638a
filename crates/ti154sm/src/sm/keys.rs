//! Key management for the commissioning Security Manager
//!
//! This module holds the per-device seed table that backs key refresh, the
//! record persisted by devices across reboots, and the seams through which
//! derived device keys reach the MAC key table.

use super::constants::*;
use super::ecc::PublicKeyBytes;
use super::error::{SmError, SmResult};
use super::types::ExtAddr;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key-id-mode-3 lookup data: 7 bytes of extended address + rolling key index
pub type LookupData = [u8; SM_KEY_SOURCE_LEN];

/// Index value of the sentinel head entry
pub const SEED_SENTINEL_INDEX: u8 = 0xFF;

/// Lookup data for a freshly commissioned device
pub fn new_lookup_data(ext_addr: &ExtAddr) -> LookupData {
    let mut lookup = ext_addr.bytes;
    lookup[SM_KEY_SOURCE_LEN - 1] = 1;
    lookup
}

/// Advance the rolling key index. Index 0 is never valid and is refused;
/// 0xFF wraps back to 1.
pub fn roll_lookup_data(lookup: &mut LookupData) -> bool {
    let key_id = &mut lookup[SM_KEY_SOURCE_LEN - 1];
    match *key_id {
        0 => false,
        0xFF => {
            *key_id = 1;
            true
        }
        _ => {
            *key_id += 1;
            true
        }
    }
}

/// Outcome of adding a device to the seed table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// First time this extended address was seen
    New,
    /// An entry existed and was updated in place
    Existing,
}

/// Per-device seed record
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SeedKeyEntry {
    /// Key lookup data
    pub lookup_data: LookupData,
    /// Device extended address
    #[zeroize(skip)]
    pub ext_addr: ExtAddr,
    /// Device short address
    pub short_addr: u16,
    /// ECDH shared secret retained for key refresh
    pub seed_key: PublicKeyBytes,
    /// MAC key table slot
    pub index: u8,
}

impl std::fmt::Debug for SeedKeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedKeyEntry")
            .field("lookup_data", &hex::encode(self.lookup_data))
            .field("ext_addr", &self.ext_addr)
            .field("short_addr", &format_args!("0x{:04x}", self.short_addr))
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl SeedKeyEntry {
    fn sentinel() -> Self {
        Self {
            lookup_data: [0xFF; SM_KEY_SOURCE_LEN],
            ext_addr: ExtAddr::new([0xFF; SM_EXT_ADDR_LEN]),
            short_addr: 0xFFFF,
            seed_key: [0xFF; SM_ECC_PUBLIC_KEY_LEN],
            index: SEED_SENTINEL_INDEX,
        }
    }

    /// Current rolling key index
    pub fn key_id(&self) -> u8 {
        self.lookup_data[SM_KEY_SOURCE_LEN - 1]
    }
}

/// Ordered seed table. The head entry is a fixed all-0xFF sentinel and is
/// never returned by lookups.
#[derive(Debug, Clone)]
pub struct SeedKeyStore {
    entries: Vec<SeedKeyEntry>,
}

impl Default for SeedKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedKeyStore {
    /// Create a table holding only the sentinel
    pub fn new() -> Self {
        Self {
            entries: vec![SeedKeyEntry::sentinel()],
        }
    }

    /// The default "no key" marker at the head of the table
    pub fn sentinel(&self) -> &SeedKeyEntry {
        &self.entries[0]
    }

    fn devices(&self) -> &[SeedKeyEntry] {
        &self.entries[1..]
    }

    fn position(&self, ext_addr: &ExtAddr) -> Option<usize> {
        self.devices()
            .iter()
            .position(|entry| entry.ext_addr == *ext_addr)
            .map(|pos| pos + 1)
    }

    fn free_index(&self) -> SmResult<u8> {
        (1..SEED_SENTINEL_INDEX)
            .find(|candidate| self.devices().iter().all(|entry| entry.index != *candidate))
            .ok_or_else(|| SmError::KeyTable("no free key table slot".into()))
    }

    fn insert(&mut self, ext_addr: &ExtAddr, short_addr: u16, seed: &PublicKeyBytes) -> SmResult<()> {
        let index = self.free_index()?;
        self.entries.push(SeedKeyEntry {
            lookup_data: new_lookup_data(ext_addr),
            ext_addr: *ext_addr,
            short_addr,
            seed_key: *seed,
            index,
        });
        debug!(ext = %ext_addr, index, "seed entry created");
        Ok(())
    }

    /// Add or refresh a device. A repeat advances the rolling key index.
    pub fn add(
        &mut self,
        ext_addr: &ExtAddr,
        short_addr: u16,
        seed: &PublicKeyBytes,
    ) -> SmResult<AddResult> {
        match self.position(ext_addr) {
            Some(pos) => {
                let entry = &mut self.entries[pos];
                if !roll_lookup_data(&mut entry.lookup_data) {
                    return Err(SmError::KeyTable(format!(
                        "lookup data of {} has an invalid key index",
                        ext_addr
                    )));
                }
                entry.short_addr = short_addr;
                entry.seed_key = *seed;
                debug!(ext = %ext_addr, key_id = entry.key_id(), "seed entry refreshed");
                Ok(AddResult::Existing)
            }
            None => {
                self.insert(ext_addr, short_addr, seed)?;
                Ok(AddResult::New)
            }
        }
    }

    /// Add or recommission a device. A repeat restarts the lookup data.
    pub fn replace(
        &mut self,
        ext_addr: &ExtAddr,
        short_addr: u16,
        seed: &PublicKeyBytes,
    ) -> SmResult<AddResult> {
        match self.position(ext_addr) {
            Some(pos) => {
                let entry = &mut self.entries[pos];
                entry.lookup_data = new_lookup_data(ext_addr);
                entry.short_addr = short_addr;
                entry.seed_key = *seed;
                debug!(ext = %ext_addr, "seed entry recommissioned");
                Ok(AddResult::Existing)
            }
            None => {
                self.insert(ext_addr, short_addr, seed)?;
                Ok(AddResult::New)
            }
        }
    }

    /// Rebuild an entry from a persisted record
    pub fn restore(
        &mut self,
        ext_addr: &ExtAddr,
        short_addr: u16,
        info: &DeviceKeyInfo,
    ) -> AddResult {
        let entry = SeedKeyEntry {
            lookup_data: info.lookup_data,
            ext_addr: *ext_addr,
            short_addr,
            seed_key: info.seed_key,
            index: info.index,
        };
        match self.position(ext_addr) {
            Some(pos) => {
                self.entries[pos] = entry;
                AddResult::Existing
            }
            None => {
                self.entries.push(entry);
                AddResult::New
            }
        }
    }

    /// Find the entry matching both addresses
    pub fn get(&self, ext_addr: &ExtAddr, short_addr: u16) -> Option<&SeedKeyEntry> {
        self.devices()
            .iter()
            .find(|entry| entry.ext_addr == *ext_addr && entry.short_addr == short_addr)
    }

    /// Find the entry for an extended address
    pub fn get_by_ext(&self, ext_addr: &ExtAddr) -> Option<&SeedKeyEntry> {
        self.position(ext_addr).map(|pos| &self.entries[pos])
    }

    /// Remove a device; returns whether an entry was found
    pub fn remove(&mut self, ext_addr: &ExtAddr) -> bool {
        match self.position(ext_addr) {
            Some(pos) => {
                self.entries.remove(pos);
                debug!(ext = %ext_addr, "seed entry removed");
                true
            }
            None => false,
        }
    }

    /// Device entries, sentinel excluded
    pub fn iter(&self) -> impl Iterator<Item = &SeedKeyEntry> {
        self.devices().iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key information a device persists so it survives a reboot
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DeviceKeyInfo {
    /// Lookup data of the installed key
    pub lookup_data: LookupData,
    /// Device key
    pub device_key: [u8; SM_KEY_LEN],
    /// Seed secret
    pub seed_key: PublicKeyBytes,
    /// Key table slot
    pub index: u8,
}

impl std::fmt::Debug for DeviceKeyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyInfo")
            .field("lookup_data", &hex::encode(self.lookup_data))
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// A device key handed to the MAC key table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKeyEntry {
    /// Key value
    pub key: [u8; SM_KEY_LEN],
    /// Initial frame counter
    pub frame_counter: u32,
    /// Slot to overwrite
    pub replace_index: u8,
    /// Whether the slot is new
    pub new_key: bool,
    /// Lookup data followed by the low byte of the short address
    pub lookup_data: [u8; SM_KEY_LOOKUP_LONG_LEN],
    /// Extended address of the key's peer
    pub peer_ext_addr: ExtAddr,
}

impl DeviceKeyEntry {
    /// Build the MAC entry for `seed`'s slot
    pub fn new(
        seed: &SeedKeyEntry,
        key: &[u8; SM_KEY_LEN],
        new_key: bool,
        peer_ext_addr: ExtAddr,
    ) -> Self {
        let mut lookup_data = [0u8; SM_KEY_LOOKUP_LONG_LEN];
        lookup_data[..SM_KEY_SOURCE_LEN].copy_from_slice(&seed.lookup_data);
        lookup_data[SM_KEY_LOOKUP_LONG_LEN - 1] = seed.short_addr as u8;

        Self {
            key: *key,
            frame_counter: 0,
            replace_index: seed.index,
            new_key,
            lookup_data,
            peer_ext_addr,
        }
    }
}

/// Sink for device keys (the MAC security key table)
pub trait KeyTable {
    fn add_device_key(&mut self, entry: &DeviceKeyEntry) -> SmResult<()>;
}

/// Non-volatile storage for the device's own key information
pub trait DeviceKeyStorage {
    fn save_device_key_info(&mut self, info: &DeviceKeyInfo) -> SmResult<()>;

    fn load_device_key_info(&self) -> SmResult<Option<DeviceKeyInfo>>;
}

impl<T: KeyTable + ?Sized> KeyTable for Rc<RefCell<T>> {
    fn add_device_key(&mut self, entry: &DeviceKeyEntry) -> SmResult<()> {
        self.borrow_mut().add_device_key(entry)
    }
}

impl<T: DeviceKeyStorage + ?Sized> DeviceKeyStorage for Rc<RefCell<T>> {
    fn save_device_key_info(&mut self, info: &DeviceKeyInfo) -> SmResult<()> {
        self.borrow_mut().save_device_key_info(info)
    }

    fn load_device_key_info(&self) -> SmResult<Option<DeviceKeyInfo>> {
        self.borrow().load_device_key_info()
    }
}

/// In-memory key table keyed by slot
#[derive(Debug, Default)]
pub struct MemoryKeyTable {
    slots: BTreeMap<u8, DeviceKeyEntry>,
}

impl MemoryKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: u8) -> Option<&DeviceKeyEntry> {
        self.slots.get(&index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl KeyTable for MemoryKeyTable {
    fn add_device_key(&mut self, entry: &DeviceKeyEntry) -> SmResult<()> {
        self.slots.insert(entry.replace_index, entry.clone());
        Ok(())
    }
}

/// In-memory stand-in for non-volatile storage
#[derive(Debug, Default)]
pub struct MemoryKeyStorage {
    info: Option<DeviceKeyInfo>,
    /// Refuse every save, as a full or worn-out flash would
    pub fail_saves: bool,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record persisted before this run
    pub fn stored(&self) -> Option<&DeviceKeyInfo> {
        self.info.as_ref()
    }
}

impl DeviceKeyStorage for MemoryKeyStorage {
    fn save_device_key_info(&mut self, info: &DeviceKeyInfo) -> SmResult<()> {
        if self.fail_saves {
            return Err(SmError::Storage("device key info not written".into()));
        }
        self.info = Some(info.clone());
        Ok(())
    }

    fn load_device_key_info(&self) -> SmResult<Option<DeviceKeyInfo>> {
        Ok(self.info.clone())
    }
}
