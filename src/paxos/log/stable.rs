//! Stable storage: the durable half of the log (section 4.1/6).
//!
//! `FileStableStorage` persists the view with a write-temp-then-rename
//! plus `sync_all`, so a crash never observes a torn `sync.view` file,
//! and persists snapshots as one file per `nextInstanceId`. Everything
//! else in the log is rebuilt via catch-up/recovery rather than replayed
//! from an append-only file (see SPEC_FULL.md section 4.1).

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::paxos::error::*;
use crate::paxos::ordering::View;

use super::Snapshot;

/// Durable storage for the replica's view and most recent snapshot.
///
/// A `StorageIO` failure from any method here is fatal (section 7): the
/// caller is expected to halt the replica rather than guess at recovery.
pub trait StableStorage: Send {
    /// Durably persists `view`. Must complete — and be visible to any
    /// later `read_view` — before the caller sends any message tagged
    /// with that view (section 4.1's "synchronous fsync-equivalent").
    fn write_view(&mut self, view: View) -> Result<()>;

    /// Reads the most recently persisted view, or `View::ZERO` if none
    /// has ever been written (a fresh replica).
    fn read_view(&self) -> Result<View>;

    /// Durably persists a new snapshot, superseding any earlier one.
    fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// Reads the most recently persisted snapshot, if any.
    fn read_snapshot(&self) -> Result<Option<Snapshot>>;
}

/// File-backed `StableStorage`, one directory per replica.
pub struct FileStableStorage {
    dir: PathBuf,
}

impl FileStableStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).wrapped(ErrorKind::StorageIO)?;
        Ok(Self { dir })
    }

    fn view_path(&self) -> PathBuf {
        self.dir.join("sync.view")
    }

    fn view_tmp_path(&self) -> PathBuf {
        self.dir.join("sync.view.tmp")
    }

    fn snapshot_path(&self, next_instance_id: i64) -> PathBuf {
        self.dir.join(format!("snapshot-{next_instance_id}"))
    }

    fn latest_snapshot_path(&self) -> Result<Option<PathBuf>> {
        let mut best: Option<(i64, PathBuf)> = None;
        for entry in fs::read_dir(&self.dir).wrapped(ErrorKind::StorageIO)? {
            let entry = entry.wrapped(ErrorKind::StorageIO)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix("snapshot-") {
                if let Ok(id) = suffix.parse::<i64>() {
                    if best.as_ref().map(|(b, _)| id > *b).unwrap_or(true) {
                        best = Some((id, entry.path()));
                    }
                }
            }
        }
        Ok(best.map(|(_, path)| path))
    }
}

impl StableStorage for FileStableStorage {
    fn write_view(&mut self, view: View) -> Result<()> {
        let tmp = self.view_tmp_path();
        {
            let mut f = fs::File::create(&tmp).wrapped(ErrorKind::StorageIO)?;
            let n: i64 = view.into();
            f.write_all(&n.to_le_bytes()).wrapped(ErrorKind::StorageIO)?;
            f.sync_all().wrapped(ErrorKind::StorageIO)?;
        }
        fs::rename(&tmp, self.view_path()).wrapped(ErrorKind::StorageIO)?;
        Ok(())
    }

    fn read_view(&self) -> Result<View> {
        let path = self.view_path();
        if !path.exists() {
            return Ok(View::ZERO);
        }
        let bytes = fs::read(&path).wrapped(ErrorKind::StorageIO)?;
        if bytes.len() < 8 {
            return Err("corrupt sync.view file").simple(ErrorKind::StorageIO);
        }
        let n = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        Ok(View::from(n))
    }

    fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let next_id: i64 = snapshot.next_instance_id.into();
        let path = self.snapshot_path(next_id);
        let bytes = encode_snapshot(snapshot);
        let mut f = fs::File::create(&path).wrapped(ErrorKind::StorageIO)?;
        f.write_all(&bytes).wrapped(ErrorKind::StorageIO)?;
        f.sync_all().wrapped(ErrorKind::StorageIO)?;
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>> {
        match self.latest_snapshot_path()? {
            None => Ok(None),
            Some(path) => {
                let bytes = fs::read(&path).wrapped(ErrorKind::StorageIO)?;
                decode_snapshot(&bytes).map(Some)
            }
        }
    }
}

/// In-memory `StableStorage`, used in tests and by the bundled demo.
#[derive(Default)]
pub struct MemStableStorage {
    view: View,
    snapshot: Option<Snapshot>,
}

impl StableStorage for MemStableStorage {
    fn write_view(&mut self, view: View) -> Result<()> {
        self.view = view;
        Ok(())
    }

    fn read_view(&self) -> Result<View> {
        Ok(self.view)
    }

    fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}

fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    let mut out = Vec::new();
    let next_id: i64 = snapshot.next_instance_id.into();
    out.extend_from_slice(&next_id.to_le_bytes());
    out.extend_from_slice(&(snapshot.last_replies.len() as u32).to_le_bytes());
    for (client_id, reply) in snapshot.last_replies.iter() {
        out.extend_from_slice(&client_id.to_le_bytes());
        out.extend_from_slice(&reply.request_id.client_id.to_le_bytes());
        out.extend_from_slice(&reply.request_id.seq.to_le_bytes());
        out.extend_from_slice(&(reply.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&reply.payload);
    }
    out.extend_from_slice(&(snapshot.value.len() as u32).to_le_bytes());
    out.extend_from_slice(&snapshot.value);
    out
}

fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    use crate::paxos::client::{Reply, RequestId};
    use crate::paxos::collections;
    use crate::paxos::ordering::InstanceId;

    let mut off = 0usize;
    let need = |off: usize, n: usize| -> Result<()> {
        if bytes.len() < off + n {
            Err("corrupt snapshot file").simple(ErrorKind::StorageIO)
        } else {
            Ok(())
        }
    };

    need(off, 8)?;
    let next_id = i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
    off += 8;

    need(off, 4)?;
    let n_replies = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
    off += 4;

    let mut last_replies = collections::hash_map();
    for _ in 0..n_replies {
        need(off, 16)?;
        let client_id = u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        off += 8;
        let req_client_id = u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        off += 8;
        need(off, 8)?;
        let seq = i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        off += 4;
        let payload_len = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        need(off, payload_len)?;
        let payload = bytes[off..off + payload_len].to_vec();
        off += payload_len;
        last_replies.insert(client_id, Reply::new(RequestId::new(req_client_id, seq), payload));
    }

    need(off, 4)?;
    let value_len = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
    off += 4;
    need(off, value_len)?;
    let value = bytes[off..off + value_len].to_vec();

    Ok(Snapshot { next_instance_id: InstanceId::from(next_id), last_replies, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::client::{Reply, RequestId};
    use crate::paxos::collections;
    use crate::paxos::ordering::InstanceId;

    #[test]
    fn file_storage_round_trips_view_across_instances() {
        let dir = tempdir();
        {
            let mut storage = FileStableStorage::open(&dir).unwrap();
            storage.write_view(View::from(7i64)).unwrap();
        }
        let storage = FileStableStorage::open(&dir).unwrap();
        assert_eq!(storage.read_view().unwrap(), View::from(7i64));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_storage_round_trips_snapshot() {
        let dir = tempdir();
        let mut last_replies = collections::hash_map();
        last_replies.insert(42u64, Reply::new(RequestId::new(42, 1), b"A!".to_vec()));
        let snapshot = Snapshot { next_instance_id: InstanceId::from(5i64), last_replies, value: b"state".to_vec() };

        let mut storage = FileStableStorage::open(&dir).unwrap();
        storage.write_snapshot(&snapshot).unwrap();
        let read_back = storage.read_snapshot().unwrap().unwrap();
        assert_eq!(read_back.next_instance_id, snapshot.next_instance_id);
        assert_eq!(read_back.value, snapshot.value);
        fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("paxos-smr-test-{}-{}", std::process::id(), rand_suffix()));
        path
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }
}
