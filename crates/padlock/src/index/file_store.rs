use crate::utils::retry_interrupted;
use fs4::FileExt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Types usable as keys of a [`FileStore`]. The key decides the relative
/// path an entry is stored under.
pub trait StoreKey {
    /// The path suffix for this key.
    fn store_path(&self) -> PathBuf;
}

impl<T: StoreKey + ?Sized> StoreKey for &T {
    fn store_path(&self) -> PathBuf {
        (*self).store_path()
    }
}

impl StoreKey for [u8] {
    fn store_path(&self) -> PathBuf {
        let digest = rattler_digest::compute_bytes_digest::<rattler_digest::Sha256>(self);
        nested_path(digest.as_slice())
    }
}

impl StoreKey for str {
    fn store_path(&self) -> PathBuf {
        self.as_bytes().store_path()
    }
}

// Plenty of filesystems degrade with many entries in one directory, so
// entries are spread over a fixed fanout of nested directories.
const DIR_NEST_DEPTH: usize = 3;

/// Spreads an entry name over [`DIR_NEST_DEPTH`] directory levels.
pub fn nested_path(bytes: &[u8]) -> PathBuf {
    let encoded = data_encoding::BASE64URL_NOPAD.encode(bytes);
    let mut path = PathBuf::new();
    for i in 0..DIR_NEST_DEPTH {
        path.push(&encoded[i..i + 1]);
    }
    path.push(&encoded[DIR_NEST_DEPTH..]);
    path
}

/// A keyed blob store on disk. Writes land in a temporary file first and are
/// renamed into place on commit, so readers never observe a partial entry;
/// concurrent writers are serialized through a sibling `.lock` file.
#[derive(Debug)]
pub struct FileStore {
    base: PathBuf,
    tmp: PathBuf,
}

impl FileStore {
    /// Opens (and creates) a store rooted at `base`.
    pub fn new(base: &Path) -> io::Result<Self> {
        fs_err::create_dir_all(base)?;
        let base = dunce::canonicalize(base)?;
        // temp files live inside the store so the rename stays on one
        // filesystem
        let tmp = base.join(".tmp");
        fs_err::create_dir_all(&tmp)?;
        Ok(Self { base, tmp })
    }

    /// Reads the entry for `key`, populating it with `f` when missing.
    pub fn get_or_set<K: StoreKey, F>(&self, key: &K, f: F) -> io::Result<impl Read + Seek>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        let lock = self.lock(key)?;
        if let Some(reader) = lock.reader() {
            // entries are immutable once committed
            Ok(reader.detach_unlocked())
        } else {
            let mut writer = lock.begin()?;
            f(&mut writer)?;
            Ok(writer.commit()?.detach_unlocked())
        }
    }

    /// Reads the entry for `key`, or `None` when absent.
    pub fn get<K: StoreKey>(&self, key: &K) -> Option<impl Read + Seek> {
        let lock = self.lock_if_exists(key)?;
        let reader = lock.reader()?;
        Some(reader.detach_unlocked())
    }

    /// Locks the entry for `key` for exclusive access, creating parent
    /// directories as needed.
    pub fn lock<K: StoreKey>(&self, key: &K) -> io::Result<EntryLock> {
        let path = self.base.join(key.store_path());
        let lock = lock_file(&path, true)?;
        Ok(EntryLock {
            tmp: self.tmp.clone(),
            _lock_file: lock,
            path,
        })
    }

    /// Locks the entry for `key` only if it already exists, so probing does
    /// not litter the store with empty directories.
    pub fn lock_if_exists<K: StoreKey>(&self, key: &K) -> Option<EntryLock> {
        let path = self.base.join(key.store_path());
        lock_file(&path, false).ok().map(|lock| EntryLock {
            tmp: self.tmp.clone(),
            _lock_file: lock,
            path,
        })
    }
}

/// An exclusive lock over one store entry.
pub struct EntryLock {
    tmp: PathBuf,
    _lock_file: File,
    path: PathBuf,
}

impl EntryLock {
    /// Opens the locked entry for reading, or `None` when it has no content
    /// yet.
    pub fn reader(&self) -> Option<EntryReader<'_>> {
        Some(EntryReader {
            file: File::open(&self.path).ok()?,
            _lock: PhantomData,
        })
    }

    /// Starts writing the entry. Nothing is visible until
    /// [`EntryWriter::commit`].
    pub fn begin(&self) -> io::Result<EntryWriter<'_>> {
        Ok(EntryWriter {
            path: &self.path,
            file: tempfile::NamedTempFile::new_in(&self.tmp)?,
        })
    }

    /// Removes the entry.
    pub fn remove(self) -> io::Result<()> {
        fs_err::remove_file(&self.path)
    }
}

/// Writes into a temporary file, renamed over the entry on commit.
pub struct EntryWriter<'a> {
    path: &'a Path,
    file: tempfile::NamedTempFile,
}

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for EntryWriter<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl<'a> EntryWriter<'a> {
    /// Persists the written content and reopens it for reading.
    pub fn commit(self) -> io::Result<EntryReader<'a>> {
        self.file.as_file().sync_data()?;
        let mut file = self.file.persist(self.path)?;
        file.rewind()?;
        Ok(EntryReader {
            file,
            _lock: PhantomData,
        })
    }
}

/// Reads a committed entry while the lock is held.
pub struct EntryReader<'a> {
    file: File,
    _lock: PhantomData<&'a ()>,
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for EntryReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl EntryReader<'_> {
    /// Detaches the file from the lock. Safe for immutable entries.
    pub fn detach_unlocked(self) -> File {
        self.file
    }
}

fn lock_file(path: &Path, create: bool) -> io::Result<File> {
    let lock_path = path.with_extension("lock");

    // must be writable on windows to get exclusive semantics
    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    if create {
        let dir = lock_path
            .parent()
            .expect("store entries always sit inside a directory");
        fs_err::create_dir_all(dir)?;
        options.create(true);
    }
    let lock = options.open(&lock_path)?;

    // flock(2) is not restarted after EINTR
    retry_interrupted(|| lock.lock_exclusive())?;
    Ok(lock)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_get_or_set_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let payload = b"lock file engine".as_slice();
        let mut read_back = Vec::new();
        store
            .get_or_set(&payload, |w| w.write_all(payload))
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, payload);

        // the second access must not re-run the initializer
        let mut read_back = Vec::new();
        store
            .get_or_set(&payload, |_| panic!("entry should be cached"))
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn test_get_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(store.get(&b"absent".as_slice()).is_none());
    }
}
