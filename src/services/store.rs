use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static UNSAFE_KEY_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("Invalid key sanitizing regex"));

/// Stable identity of the loaded ROM, the join key between slot selection and storage
///
/// Derived once per session from the ROM file name, or from the last path segment of
/// its source URL when no file name is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RomIdentity(String);

impl RomIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Derive the identity from the ROM's file name or source URL
    pub fn from_source(file_name: Option<&str>, url: &str) -> Self {
        if let Some(name) = file_name.map(str::trim).filter(|n| !n.is_empty()) {
            return Self(name.to_string());
        }

        let without_suffix = url.split(['?', '#']).next().unwrap_or(url);
        let segment = without_suffix
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(without_suffix);

        Self(segment.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form of the identity
    ///
    /// Identities that are already safe are used as-is. Anything that had to be rewritten
    /// gets a hash of the raw identity appended, so two identities never share a key.
    pub fn storage_key(&self) -> String {
        let sanitized = UNSAFE_KEY_CHARS.replace_all(&self.0, "_");
        let trimmed = sanitized.trim_matches('.');
        let key = if trimmed.is_empty() { "unnamed" } else { trimmed };

        if key == self.0 {
            key.to_string()
        } else {
            format!("{}-{:08x}", key, fnv1a(self.0.as_bytes()))
        }
    }
}

/// 32-bit FNV-1a; stable across builds, unlike `DefaultHasher`
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

impl std::fmt::Display for RomIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the slot modal shows for an occupied slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMetadata {
    pub slot: u32,

    /// Seconds since the Unix epoch when the slot was written
    pub timestamp: u64,

    pub size_bytes: usize,

    #[serde(default)]
    pub has_screenshot: bool,
}

/// Errors from a slot store backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid slot metadata at {path}: {source}")]
    Metadata {
        path: Utf8PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("Slot store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence collaborator for save slots, keyed by `(rom, slot)`
///
/// Implementations serialize their own writes per key; callers issue at most one
/// write per slot action.
pub trait SlotStore: Send + Sync + 'static {
    fn save_slot(
        &self,
        rom: &RomIdentity,
        slot: u32,
        state: Vec<u8>,
        screenshot: Option<Vec<u8>>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `Ok(None)` for an empty slot
    fn load_slot(
        &self,
        rom: &RomIdentity,
        slot: u32,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Occupied slots for `rom`, ordered by slot index
    fn list_slots(
        &self,
        rom: &RomIdentity,
    ) -> impl Future<Output = Result<Vec<SlotMetadata>, StoreError>> + Send;

    fn delete_slot(
        &self,
        rom: &RomIdentity,
        slot: u32,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct StoredSlot {
    state: Vec<u8>,
    screenshot: Option<Vec<u8>>,
    timestamp: u64,
}

/// Slot store held entirely in memory
///
/// Used when the host has no persistence of its own, and by tests, which can inject
/// write failures.
#[derive(Debug, Default)]
pub struct MemorySlotStore {
    slots: Mutex<HashMap<RomIdentity, IndexMap<u32, StoredSlot>>>,
    fail_next_write: AtomicBool,
    writes: AtomicU64,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `save_slot` call fail with [`StoreError::Unavailable`]
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, rom: &RomIdentity, slot: u32) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(rom)
            .is_some_and(|slots| slots.contains_key(&slot))
    }

    pub fn screenshot(&self, rom: &RomIdentity, slot: u32) -> Option<Vec<u8>> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(rom)
            .and_then(|slots| slots.get(&slot))
            .and_then(|stored| stored.screenshot.clone())
    }
}

impl SlotStore for MemorySlotStore {
    async fn save_slot(
        &self,
        rom: &RomIdentity,
        slot: u32,
        state: Vec<u8>,
        screenshot: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated write failure".to_string()));
        }

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let rom_slots = slots.entry(rom.clone()).or_default();
        rom_slots.insert(
            slot,
            StoredSlot {
                state,
                screenshot,
                timestamp: unix_now(),
            },
        );
        rom_slots.sort_keys();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_slot(&self, rom: &RomIdentity, slot: u32) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(rom)
            .and_then(|slots| slots.get(&slot))
            .map(|stored| stored.state.clone()))
    }

    async fn list_slots(&self, rom: &RomIdentity) -> Result<Vec<SlotMetadata>, StoreError> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slots
            .get(rom)
            .map(|rom_slots| {
                rom_slots
                    .iter()
                    .map(|(slot, stored)| SlotMetadata {
                        slot: *slot,
                        timestamp: stored.timestamp,
                        size_bytes: stored.state.len(),
                        has_screenshot: stored.screenshot.is_some(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_slot(&self, rom: &RomIdentity, slot: u32) -> Result<(), StoreError> {
        if let Some(rom_slots) = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(rom)
        {
            rom_slots.shift_remove(&slot);
        }
        Ok(())
    }
}

/// Slot store backed by a directory tree
///
/// Layout: `<root>/<rom storage key>/slot_<n>.state`, `slot_<n>.png` and
/// `slot_<n>.yaml` (metadata). State files are written to a temporary name and renamed
/// so a crash mid-write never leaves a truncated slot.
#[derive(Debug, Clone)]
pub struct FileSlotStore {
    root: Utf8PathBuf,
}

impl FileSlotStore {
    pub fn new<P: AsRef<Utf8Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn rom_dir(&self, rom: &RomIdentity) -> Utf8PathBuf {
        self.root.join(rom.storage_key())
    }

    fn slot_path(&self, rom: &RomIdentity, slot: u32, extension: &str) -> Utf8PathBuf {
        self.rom_dir(rom).join(format!("slot_{slot}.{extension}"))
    }

    async fn write_atomic(path: &Utf8Path, contents: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().unwrap_or_default()
        ));

        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;

        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn remove_if_exists(path: &Utf8Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl SlotStore for FileSlotStore {
    async fn save_slot(
        &self,
        rom: &RomIdentity,
        slot: u32,
        state: Vec<u8>,
        screenshot: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let dir = self.rom_dir(rom);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;

        let state_path = self.slot_path(rom, slot, "state");
        Self::write_atomic(&state_path, &state).await?;

        let screenshot_path = self.slot_path(rom, slot, "png");
        match &screenshot {
            Some(image) => Self::write_atomic(&screenshot_path, image).await?,
            None => Self::remove_if_exists(&screenshot_path).await?,
        }

        let metadata = SlotMetadata {
            slot,
            timestamp: unix_now(),
            size_bytes: state.len(),
            has_screenshot: screenshot.is_some(),
        };
        let metadata_path = self.slot_path(rom, slot, "yaml");
        let yaml = serde_yaml_ng::to_string(&metadata).map_err(|source| StoreError::Metadata {
            path: metadata_path.clone(),
            source,
        })?;
        Self::write_atomic(&metadata_path, yaml.as_bytes()).await?;

        tracing::debug!("Wrote slot {} for {} to {}", slot, rom, state_path);
        Ok(())
    }

    async fn load_slot(&self, rom: &RomIdentity, slot: u32) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.slot_path(rom, slot, "state");
        match tokio::fs::read(&path).await {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn list_slots(&self, rom: &RomIdentity) -> Result<Vec<SlotMetadata>, StoreError> {
        let dir = self.rom_dir(rom);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut slots = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(StoreError::Io {
                        path: dir.clone(),
                        source,
                    });
                }
            };

            let Ok(path) = Utf8PathBuf::try_from(entry.path()) else {
                continue;
            };
            if path.extension() != Some("yaml") {
                continue;
            }

            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| StoreError::Io {
                    path: path.clone(),
                    source,
                })?;

            match serde_yaml_ng::from_str::<SlotMetadata>(&contents) {
                Ok(metadata) => slots.push(metadata),
                Err(e) => tracing::warn!("Skipping unreadable slot metadata {}: {}", path, e),
            }
        }

        slots.sort_by_key(|metadata| metadata.slot);
        Ok(slots)
    }

    async fn delete_slot(&self, rom: &RomIdentity, slot: u32) -> Result<(), StoreError> {
        for extension in ["state", "png", "yaml"] {
            Self::remove_if_exists(&self.slot_path(rom, slot, extension)).await?;
        }
        tracing::debug!("Deleted slot {} for {}", slot, rom);
        Ok(())
    }
}
