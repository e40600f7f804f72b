use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use agentsync_protocol::Message;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{now_unix_millis, Checkpoint, FsThreadStore, StoreError, Thread, ThreadStore};

const THREAD_FILE: &str = "thread.json";
const LOCK_FILE: &str = ".thread.lock";

impl FsThreadStore {
    const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
    const LOCK_RETRY_DELAY: Duration = Duration::from_millis(5);
    const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join(thread_key(thread_id))
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        self.thread_dir(thread_id).join(THREAD_FILE)
    }

    /// Read-modify-write one thread under its lock file.
    fn update<T>(
        &self,
        thread_id: &str,
        f: impl FnOnce(&mut Thread) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock = self.acquire_lock(thread_id)?;
        let path = self.thread_path(thread_id);
        let mut thread = read_thread(&path)?.unwrap_or_else(|| Thread::empty(thread_id));
        let out = f(&mut thread)?;
        let bytes = serde_json::to_vec_pretty(&thread)
            .map_err(|err| StoreError::Serialize(format!("serialize thread failed: {err}")))?;
        write_atomic_bytes(&path, &bytes)?;
        drop(lock);
        Ok(out)
    }

    fn acquire_lock(&self, thread_id: &str) -> Result<ThreadLock, StoreError> {
        let dir = self.thread_dir(thread_id);
        fs::create_dir_all(&dir)
            .map_err(|err| StoreError::Io(format!("create thread dir failed: {err}")))?;
        let lock_path = dir.join(LOCK_FILE);

        let started = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    write_lock_metadata(&mut file)?;
                    return Ok(ThreadLock {
                        path: lock_path,
                        file,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path) {
                        tracing::warn!(
                            path = %lock_path.to_string_lossy(),
                            "removing stale thread lock"
                        );
                        match fs::remove_file(&lock_path) {
                            Ok(()) => continue,
                            Err(remove_err) if remove_err.kind() == ErrorKind::NotFound => {
                                continue;
                            }
                            Err(_) => {}
                        }
                    }
                    if started.elapsed() >= Self::LOCK_WAIT_TIMEOUT {
                        return Err(StoreError::Io(format!(
                            "thread lock timed out: {}",
                            lock_path.to_string_lossy()
                        )));
                    }
                    thread::sleep(Self::LOCK_RETRY_DELAY);
                }
                // The directory vanished under a concurrent delete; recreate it.
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    fs::create_dir_all(&dir).map_err(|err| {
                        StoreError::Io(format!("recreate thread dir failed: {err}"))
                    })?;
                }
                Err(err) => {
                    return Err(StoreError::Io(format!(
                        "thread lock failed at {}: {err}",
                        lock_path.to_string_lossy()
                    )))
                }
            }
        }
    }
}

impl ThreadStore for FsThreadStore {
    /// Unknown ids read as an empty thread; nothing is written until the
    /// first mutation.
    fn get(&self, thread_id: &str) -> Result<Thread, StoreError> {
        let path = self.thread_path(thread_id);
        Ok(read_thread(&path)?.unwrap_or_else(|| Thread::empty(thread_id)))
    }

    fn append_message(&self, thread_id: &str, message: Message) -> Result<(), StoreError> {
        self.update(thread_id, |thread| thread.append_message(message))
    }

    fn upsert_state(&self, thread_id: &str, agent: &str, state: Value) -> Result<(), StoreError> {
        self.update(thread_id, |thread| {
            thread.upsert_state(agent, state);
            Ok(())
        })
    }

    fn delete(&self, thread_id: &str) -> Result<bool, StoreError> {
        let dir = self.thread_dir(thread_id);
        if !dir.exists() {
            return Ok(false);
        }
        let lock = self.acquire_lock(thread_id)?;
        let existed = self.thread_path(thread_id).exists();
        fs::remove_dir_all(&dir)
            .map_err(|err| StoreError::Io(format!("remove thread dir failed: {err}")))?;
        drop(lock);
        Ok(existed)
    }

    fn save_checkpoint(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<(), StoreError> {
        self.update(thread_id, |thread| {
            thread.save_checkpoint(checkpoint);
            Ok(())
        })
    }

    fn take_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, StoreError> {
        self.update(thread_id, |thread| thread.take_checkpoint(checkpoint_id))
    }

    fn list_thread_ids(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::Io(format!("read store root failed: {err}"))),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::Io(format!("read dir entry: {err}")))?;
            if let Some(thread) = read_thread(&entry.path().join(THREAD_FILE))? {
                ids.push(thread.id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn read_thread(path: &Path) -> Result<Option<Thread>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::Io(format!("read thread failed: {err}"))),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| StoreError::Serialize(format!("parse thread failed: {err}")))
}

/// Stable directory name: readable prefix + hash suffix.
/// Allocation: one String. Complexity: O(n), n = thread_id length.
pub(crate) fn thread_key(thread_id: &str) -> String {
    let mut prefix: String = thread_id
        .chars()
        .take(48)
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if prefix.is_empty() {
        prefix.push_str("thread");
    }

    let mut hasher = Sha256::new();
    hasher.update(thread_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{prefix}_{}", &digest[..12])
}

fn write_lock_metadata(file: &mut fs::File) -> Result<(), StoreError> {
    let payload = format!("{}:{}\n", std::process::id(), now_unix_millis());
    file.write_all(payload.as_bytes())
        .map_err(|err| StoreError::Io(format!("write lock metadata failed: {err}")))?;
    file.sync_all()
        .map_err(|err| StoreError::Io(format!("sync lock metadata failed: {err}")))?;
    Ok(())
}

fn lock_is_stale(path: &Path) -> bool {
    let stale_window_ms = FsThreadStore::LOCK_STALE_AFTER.as_millis() as i64;
    if let Ok(raw) = fs::read_to_string(path) {
        if let Some(created) = raw
            .trim()
            .split_once(':')
            .and_then(|(_, ts)| ts.parse::<i64>().ok())
        {
            return now_unix_millis().saturating_sub(created) >= stale_window_ms;
        }
    }
    // Unreadable or half-written metadata: fall back to file age.
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|elapsed| elapsed >= FsThreadStore::LOCK_STALE_AFTER)
}

fn write_atomic_bytes(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tmp");
    let temp_path = path.with_file_name(format!("{name}.tmp-{}", std::process::id()));
    fs::write(&temp_path, bytes).map_err(|err| {
        StoreError::Io(format!(
            "write temp file failed at {}: {err}",
            temp_path.to_string_lossy()
        ))
    })?;
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::Io(format!(
            "atomic rename failed {} -> {}: {err}",
            temp_path.to_string_lossy(),
            path.to_string_lossy()
        )));
    }
    Ok(())
}

struct ThreadLock {
    path: PathBuf,
    file: fs::File,
}

impl Drop for ThreadLock {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
        let _ = fs::remove_file(&self.path);
    }
}
