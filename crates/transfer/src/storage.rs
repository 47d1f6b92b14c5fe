//! Backing storage capability.
//!
//! All paths handed to a [`Storage`] are relative to its root. Methods are
//! blocking; async callers run them on the blocking pool.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

/// A direct child of a directory returned by [`Storage::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub is_dir: bool,
    pub modified: SystemTime,
}

/// Narrow file-system capability used by the session lifecycle.
pub trait Storage: Send + Sync + 'static {
    /// Creates (or truncates) `path` and sizes it to `len` bytes.
    /// Parent directories are created.
    fn create(&self, path: &Path, len: u64) -> io::Result<()>;

    /// Writes `data` at `offset` without a shared cursor.
    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Writes `data` at the current end of file and returns the offset used.
    fn append(&self, path: &Path, data: &[u8]) -> io::Result<u64>;

    fn len(&self, path: &Path) -> io::Result<u64>;

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Replaces `path` with `data` so readers see either the old or the new
    /// contents, never a partial file.
    fn write_file_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Atomically moves `from` to `to`, creating the parents of `to`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Lists the direct children of `dir`.
    fn walk(&self, dir: &Path) -> io::Result<Vec<Entry>>;

    /// Absolute location of `path`, when the storage has one.
    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        let _ = path;
        None
    }
}

// ---------------------------------------------------------------------------
// LocalStorage
// ---------------------------------------------------------------------------

/// Storage rooted at a directory of the local file system.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[cfg(unix)]
fn positioned_write(file: &fs::File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn positioned_write(file: &fs::File, mut offset: u64, mut data: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl Storage for LocalStorage {
    fn create(&self, path: &Path, len: u64) -> io::Result<()> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&full)?;
        file.set_len(len)
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(self.full(path))?;
        positioned_write(&file, offset, data)
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<u64> {
        let mut file = OpenOptions::new().append(true).open(self.full(path))?;
        let offset = file.metadata()?.len();
        file.write_all(data)?;
        Ok(offset)
    }

    fn len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(self.full(path))?.len())
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(self.full(path))?))
    }

    fn write_file_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = full.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &full)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.full(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let to = self.full(to);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.full(from), to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.full(path))
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(self.full(path))
    }

    fn walk(&self, dir: &Path) -> io::Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.full(dir))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(Entry {
                path: dir.join(entry.file_name()),
                is_dir: meta.is_dir(),
                modified: meta.modified()?,
            });
        }
        Ok(entries)
    }

    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        Some(self.full(path))
    }
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct MemState {
    files: HashMap<PathBuf, MemFile>,
    skip_writes: usize,
    fail_writes: usize,
    fail_removals: usize,
    reads_opened: usize,
}

/// In-memory storage for tests, with write fault injection.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemState>,
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    )
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` mutating calls fail with an I/O error.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes_after(0, n);
    }

    /// Lets `skip` mutating calls through, then fails the following `n`.
    pub fn fail_writes_after(&self, skip: usize, n: usize) {
        let mut state = self.lock();
        state.skip_writes = skip;
        state.fail_writes = n;
    }

    /// Makes the next `n` removals fail with an I/O error.
    pub fn fail_next_removals(&self, n: usize) {
        self.lock().fail_removals = n;
    }

    /// Number of readers handed out by [`Storage::open_read`].
    pub fn reads_opened(&self) -> usize {
        self.lock().reads_opened
    }

    /// Overrides the modification time of every file under `path`.
    pub fn set_modified(&self, path: &Path, modified: SystemTime) {
        let mut state = self.lock();
        for (p, file) in state.files.iter_mut() {
            if p.starts_with(path) {
                file.modified = modified;
            }
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.lock().files.keys().any(|p| p.starts_with(path))
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_for_write(&self) -> io::Result<MutexGuard<'_, MemState>> {
        let mut state = self.lock();
        if state.skip_writes > 0 {
            state.skip_writes -= 1;
        } else if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(io::Error::other("injected write failure"));
        }
        Ok(state)
    }

    fn lock_for_removal(&self) -> io::Result<MutexGuard<'_, MemState>> {
        let mut state = self.lock();
        if state.fail_removals > 0 {
            state.fail_removals -= 1;
            return Err(io::Error::other("injected removal failure"));
        }
        Ok(state)
    }
}

impl Storage for MemoryStorage {
    fn create(&self, path: &Path, len: u64) -> io::Result<()> {
        let mut state = self.lock_for_write()?;
        state.files.insert(
            path.to_path_buf(),
            MemFile {
                data: vec![0; len as usize],
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut state = self.lock_for_write()?;
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        let start = offset as usize;
        let end = start + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[start..end].copy_from_slice(data);
        file.modified = SystemTime::now();
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<u64> {
        let mut state = self.lock_for_write()?;
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        let offset = file.data.len() as u64;
        file.data.extend_from_slice(data);
        file.modified = SystemTime::now();
        Ok(offset)
    }

    fn len(&self, path: &Path) -> io::Result<u64> {
        let state = self.lock();
        let file = state.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(file.data.len() as u64)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let mut state = self.lock();
        let data = state
            .files
            .get(path)
            .ok_or_else(|| not_found(path))?
            .data
            .clone();
        state.reads_opened += 1;
        Ok(Box::new(Cursor::new(data)))
    }

    fn write_file_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut state = self.lock_for_write()?;
        state.files.insert(
            path.to_path_buf(),
            MemFile {
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let state = self.lock();
        Ok(state
            .files
            .get(path)
            .ok_or_else(|| not_found(path))?
            .data
            .clone())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.lock_for_write()?;
        let file = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock_for_removal()?;
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock_for_removal()?;
        let before = state.files.len();
        state.files.retain(|p, _| !p.starts_with(path));
        if state.files.len() == before {
            return Err(not_found(path));
        }
        Ok(())
    }

    fn walk(&self, dir: &Path) -> io::Result<Vec<Entry>> {
        let state = self.lock();
        let mut children: HashMap<PathBuf, Entry> = HashMap::new();
        for (path, file) in &state.files {
            let Ok(rest) = path.strip_prefix(dir) else {
                continue;
            };
            let mut components = rest.components();
            let Some(first) = components.next() else {
                continue;
            };
            let child = dir.join(first);
            let is_dir = components.next().is_some();
            children
                .entry(child.clone())
                .and_modify(|e| {
                    if file.modified > e.modified {
                        e.modified = file.modified;
                    }
                })
                .or_insert(Entry {
                    path: child,
                    is_dir,
                    modified: file.modified,
                });
        }
        if children.is_empty() {
            return Err(not_found(dir));
        }
        Ok(children.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(storage: &dyn Storage) {
        let path = Path::new("a/b/data");
        storage.create(path, 8).unwrap();
        assert_eq!(storage.len(path).unwrap(), 8);

        storage.write_at(path, 4, b"WXYZ").unwrap();
        storage.write_at(path, 0, b"abcd").unwrap();
        assert_eq!(storage.read_file(path).unwrap(), b"abcdWXYZ");

        let offset = storage.append(path, b"!!").unwrap();
        assert_eq!(offset, 8);
        assert_eq!(storage.len(path).unwrap(), 10);

        let mut buf = Vec::new();
        storage.open_read(path).unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"abcdWXYZ!!");

        storage
            .write_file_atomic(Path::new("a/b/meta.json"), b"{}")
            .unwrap();
        let mut names: Vec<_> = storage
            .walk(Path::new("a/b"))
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![PathBuf::from("a/b/data"), PathBuf::from("a/b/meta.json")]
        );

        let top = storage.walk(Path::new("a")).unwrap();
        assert_eq!(top.len(), 1);
        assert!(top[0].is_dir);

        storage.rename(path, Path::new("out/x/final.bin")).unwrap();
        assert!(storage.len(path).is_err());
        assert_eq!(
            storage.read_file(Path::new("out/x/final.bin")).unwrap(),
            b"abcdWXYZ!!"
        );

        storage.remove_dir_all(Path::new("a")).unwrap();
        assert!(storage.read_file(Path::new("a/b/meta.json")).is_err());
        storage.remove_file(Path::new("out/x/final.bin")).unwrap();
    }

    #[test]
    fn local_storage_operations() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        exercise(&storage);
    }

    #[test]
    fn memory_storage_operations() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn local_create_truncates_existing() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        let path = Path::new("f");
        storage.create(path, 16).unwrap();
        storage.write_at(path, 0, b"0123456789abcdef").unwrap();
        storage.create(path, 4).unwrap();
        assert_eq!(storage.read_file(path).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn local_resolve_joins_root() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert_eq!(
            storage.resolve(Path::new("x/y")).unwrap(),
            dir.path().join("x/y")
        );
    }

    #[test]
    fn memory_fault_injection() {
        let storage = MemoryStorage::new();
        let path = Path::new("f");
        storage.create(path, 4).unwrap();

        storage.fail_next_writes(1);
        assert!(storage.write_at(path, 0, b"ab").is_err());
        storage.write_at(path, 0, b"ab").unwrap();
        assert_eq!(storage.read_file(path).unwrap(), b"ab\0\0");
    }

    #[test]
    fn memory_counts_readers() {
        let storage = MemoryStorage::new();
        storage.create(Path::new("f"), 1).unwrap();
        storage.open_read(Path::new("f")).unwrap();
        storage.open_read(Path::new("f")).unwrap();
        assert_eq!(storage.reads_opened(), 2);
    }

    #[test]
    fn walk_missing_dir_is_not_found() {
        let dir = TempDir::new().unwrap();
        let local = LocalStorage::new(dir.path());
        let err = local.walk(Path::new("nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let err = MemoryStorage::new().walk(Path::new("nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
