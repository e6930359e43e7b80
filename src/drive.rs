use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use thiserror::Error;

/// Remote item kinds as reported by the drive service. `AppLibrary`
/// entries (application bundles) are never synchronized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveKind {
    Folder,
    File,
    AppLibrary,
}

#[derive(Clone, Debug)]
pub struct DriveItem {
    pub name: String,
    pub kind: DriveKind,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
    pub handle: String,
    pub child_count: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct RootInfo {
    pub handle: String,
    pub file_count: u64,
    pub trash_count: u64,
}

#[derive(Clone, Debug, Error)]
pub enum DriveError {
    #[error("remote timeout: {0}")]
    Timeout(String),
    #[error("remote service error: {0}")]
    Service(String),
    #[error("zone busy")]
    ZoneBusy,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("{0}")]
    Other(String),
}

impl DriveError {
    /// Transient failures are retried by the executor; everything else
    /// is terminal for the action that hit it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriveError::Timeout(_) | DriveError::Service(_) | DriveError::ZoneBusy
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, DriveError::Auth(_))
    }
}

pub type DriveResult<T> = Result<T, DriveError>;

/// The narrow capability set the sync core consumes. Authentication,
/// cookie storage and the 2FA flow live entirely behind implementations
/// of this trait.
pub trait DriveClient: Send + Sync {
    fn list_root(&self) -> DriveResult<RootInfo>;
    fn list_folder(&self, handle: &str) -> DriveResult<Vec<DriveItem>>;
    fn download(&self, handle: &str, dest: &Path) -> DriveResult<()>;
    fn upload(&self, parent: &str, name: &str, source: &Path, mtime: i64) -> DriveResult<String>;
    fn create_folder(&self, parent: &str, name: &str) -> DriveResult<String>;
    fn delete(&self, handle: &str) -> DriveResult<()>;
    fn rename(&self, handle: &str, new_parent: &str, new_name: &str) -> DriveResult<()>;
}

pub const MEMORY_ROOT_HANDLE: &str = "root";

#[derive(Clone, Debug)]
struct MemEntry {
    name: String,
    kind: DriveKind,
    size: u64,
    mtime: i64,
    parent: Option<String>,
    child_count: u64,
}

#[derive(Default)]
struct MemState {
    entries: HashMap<String, MemEntry>,
    next_handle: u64,
    trash_count: u64,
    declared_override: Option<u64>,
    faults: Vec<DriveError>,
}

/// In-process drive used by the unit tests: a handle-indexed tree with
/// declared-count and trash-count reporting plus a small fault queue
/// for exercising the executor's retry path.
#[derive(Clone, Default)]
pub struct MemoryDrive {
    state: Arc<Mutex<MemState>>,
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_handle(state: &mut MemState) -> String {
        state.next_handle += 1;
        format!("h{}", state.next_handle)
    }

    fn child_by_name(state: &MemState, parent: &str, name: &str) -> Option<String> {
        let parent_key = (parent != MEMORY_ROOT_HANDLE).then(|| parent.to_string());
        state
            .entries
            .iter()
            .find(|(_, entry)| entry.parent == parent_key && entry.name == name)
            .map(|(handle, _)| handle.clone())
    }

    fn resolve_parent(&self, path: &str) -> (String, String) {
        match path.rsplit_once('/') {
            Some((parent, name)) => {
                let handle = self.add_folder(parent);
                (handle, name.to_string())
            }
            None => (MEMORY_ROOT_HANDLE.to_string(), path.to_string()),
        }
    }

    /// Ensures the folder at `path` exists (creating ancestors) and
    /// returns its handle.
    pub fn add_folder(&self, path: &str) -> String {
        let mut parent = MEMORY_ROOT_HANDLE.to_string();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = Self::child_by_name(&state, &parent, part) {
                parent = existing;
                continue;
            }
            let handle = Self::alloc_handle(&mut state);
            state.entries.insert(
                handle.clone(),
                MemEntry {
                    name: part.to_string(),
                    kind: DriveKind::Folder,
                    size: 0,
                    mtime: 0,
                    parent: (parent != MEMORY_ROOT_HANDLE).then(|| parent.clone()),
                    child_count: 0,
                },
            );
            parent = handle;
        }
        parent
    }

    pub fn add_file(&self, path: &str, size: u64, mtime: i64) -> String {
        let (parent, name) = self.resolve_parent(path);
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = Self::child_by_name(&state, &parent, &name) {
            state.entries.remove(&existing);
        }
        let handle = Self::alloc_handle(&mut state);
        state.entries.insert(
            handle.clone(),
            MemEntry {
                name,
                kind: DriveKind::File,
                size,
                mtime,
                parent: (parent != MEMORY_ROOT_HANDLE).then(|| parent.clone()),
                child_count: 0,
            },
        );
        handle
    }

    pub fn add_app_library(&self, name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_handle(&mut state);
        state.entries.insert(
            handle.clone(),
            MemEntry {
                name: name.to_string(),
                kind: DriveKind::AppLibrary,
                size: 0,
                mtime: 0,
                parent: None,
                child_count: 0,
            },
        );
        handle
    }

    pub fn remove_handle(&self, handle: &str) {
        let mut state = self.state.lock().unwrap();
        remove_subtree(&mut state, handle);
    }

    pub fn set_trash_count(&self, count: u64) {
        self.state.lock().unwrap().trash_count = count;
    }

    /// Forces `list_root` to report this file count regardless of the
    /// actual tree, to drive the integrity gate in tests.
    pub fn override_declared_count(&self, count: u64) {
        self.state.lock().unwrap().declared_override = Some(count);
    }

    /// Queues an error returned by the next mutating call.
    pub fn inject_fault(&self, fault: DriveError) {
        self.state.lock().unwrap().faults.push(fault);
    }

    pub fn file_count(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .entries
            .values()
            .filter(|entry| entry.kind == DriveKind::File)
            .count() as u64
    }

    pub fn entry_for_test(&self, handle: &str) -> Option<(String, u64, i64)> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(handle)
            .map(|entry| (entry.name.clone(), entry.size, entry.mtime))
    }

    fn take_fault(&self) -> Option<DriveError> {
        let mut state = self.state.lock().unwrap();
        if state.faults.is_empty() {
            None
        } else {
            Some(state.faults.remove(0))
        }
    }
}

fn remove_subtree(state: &mut MemState, handle: &str) {
    let children: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, entry)| entry.parent.as_deref() == Some(handle))
        .map(|(child, _)| child.clone())
        .collect();
    for child in children {
        remove_subtree(state, &child);
    }
    state.entries.remove(handle);
}

impl DriveClient for MemoryDrive {
    fn list_root(&self) -> DriveResult<RootInfo> {
        let state = self.state.lock().unwrap();
        let file_count = state
            .entries
            .values()
            .filter(|entry| entry.kind == DriveKind::File)
            .count() as u64;
        Ok(RootInfo {
            handle: MEMORY_ROOT_HANDLE.to_string(),
            file_count: state.declared_override.unwrap_or(file_count),
            trash_count: state.trash_count,
        })
    }

    fn list_folder(&self, handle: &str) -> DriveResult<Vec<DriveItem>> {
        let state = self.state.lock().unwrap();
        if handle != MEMORY_ROOT_HANDLE && !state.entries.contains_key(handle) {
            return Err(DriveError::NotFound(handle.to_string()));
        }
        let parent_key = (handle != MEMORY_ROOT_HANDLE).then(|| handle.to_string());
        let mut items: Vec<DriveItem> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.parent == parent_key)
            .map(|(child_handle, entry)| DriveItem {
                name: entry.name.clone(),
                kind: entry.kind,
                size: (entry.kind == DriveKind::File).then_some(entry.size),
                mtime: (entry.kind == DriveKind::File).then_some(entry.mtime),
                handle: child_handle.clone(),
                child_count: (entry.kind == DriveKind::Folder).then_some(entry.child_count),
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    fn download(&self, handle: &str, dest: &Path) -> DriveResult<()> {
        let size = {
            let state = self.state.lock().unwrap();
            let entry = state
                .entries
                .get(handle)
                .ok_or_else(|| DriveError::NotFound(handle.to_string()))?;
            entry.size
        };
        fs::write(dest, vec![0u8; size as usize])
            .map_err(|err| DriveError::Other(format!("write {}: {err}", dest.display())))
    }

    fn upload(&self, parent: &str, name: &str, source: &Path, mtime: i64) -> DriveResult<String> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let size = fs::metadata(source)
            .map_err(|err| DriveError::Other(format!("stat {}: {err}", source.display())))?
            .len();

        let mut state = self.state.lock().unwrap();
        if let Some(existing) = Self::child_by_name(&state, parent, name) {
            state.entries.remove(&existing);
        }
        let handle = Self::alloc_handle(&mut state);
        state.entries.insert(
            handle.clone(),
            MemEntry {
                name: name.to_string(),
                kind: DriveKind::File,
                size,
                mtime,
                parent: (parent != MEMORY_ROOT_HANDLE).then(|| parent.to_string()),
                child_count: 0,
            },
        );
        Ok(handle)
    }

    fn create_folder(&self, parent: &str, name: &str) -> DriveResult<String> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = Self::child_by_name(&state, parent, name) {
            return Ok(existing);
        }
        let handle = Self::alloc_handle(&mut state);
        state.entries.insert(
            handle.clone(),
            MemEntry {
                name: name.to_string(),
                kind: DriveKind::Folder,
                size: 0,
                mtime: 0,
                parent: (parent != MEMORY_ROOT_HANDLE).then(|| parent.to_string()),
                child_count: 0,
            },
        );
        Ok(handle)
    }

    fn delete(&self, handle: &str) -> DriveResult<()> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let mut state = self.state.lock().unwrap();
        if !state.entries.contains_key(handle) {
            return Err(DriveError::NotFound(handle.to_string()));
        }
        remove_subtree(&mut state, handle);
        Ok(())
    }

    fn rename(&self, handle: &str, new_parent: &str, new_name: &str) -> DriveResult<()> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let mut state = self.state.lock().unwrap();
        if !state.entries.contains_key(handle) {
            return Err(DriveError::NotFound(handle.to_string()));
        }
        let parent = (new_parent != MEMORY_ROOT_HANDLE).then(|| new_parent.to_string());
        if let Some(entry) = state.entries.get_mut(handle) {
            entry.parent = parent;
            entry.name = new_name.to_string();
        }
        Ok(())
    }
}
