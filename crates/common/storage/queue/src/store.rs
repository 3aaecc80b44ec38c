// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ordered blob store.
//!
//! ## Architecture
//!
//! Each store owns one worker thread. Callers talk to it through
//! [`StoreRequest`]s on a crossbeam channel; every request carries its own
//! reply channel. The worker is the only code that touches the pending index
//! or the page files, so requests are applied one at a time in arrival order.
//!
//! ```text
//! ┌──────────────┐   StoreRequest    ┌──────────────┐   write/rename   ┌──────────────┐
//! │   callers    │ ───── channel ──► │ StoreWorker  │ ───────────────► │  <prefix>ID  │
//! │ (any thread) │ ◄──── reply ───── │  (bg thread) │ ◄─── read/rm ─── │    files     │
//! └──────────────┘                   └──────────────┘                  └──────────────┘
//! ```
//!
//! The index is built once from the directory at open time and maintained
//! incrementally afterwards.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, info, warn};

use crate::{
    Result,
    error::{AssertionSnafu, ClosedSnafu, EmptySnafu, IoSnafu, SpawnSnafu, WorkerPanickedSnafu},
    id::{FlakeId, IdGenerator},
    path::{page_file_path, partial_file_path, scan_pages},
};

const STORE_THREAD_NAME: &str = "spillway-store";
const STORE_REQUEST_CAPACITY: usize = 64;

/// A page removed from the store, now owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub id:   FlakeId,
    pub data: Bytes,
}

enum StoreRequest {
    Save {
        data:  Bytes,
        reply: Sender<Result<FlakeId>>,
    },
    Requeue {
        data:  Bytes,
        reply: Sender<Result<FlakeId>>,
    },
    OpenOldest {
        reply: Sender<Result<(FlakeId, File)>>,
    },
    DeleteOldest {
        reply: Sender<Result<FlakeId>>,
    },
    TakeOldest {
        reply: Sender<Result<StoredPage>>,
    },
    List {
        reply: Sender<Vec<FlakeId>>,
    },
    Shutdown,
}

/// Disk-backed FIFO of opaque blobs, named by [`FlakeId`].
pub struct BlobStore {
    dir:     PathBuf,
    prefix:  String,
    tx:      Sender<StoreRequest>,
    /// Mirror of the index length, updated by the worker.
    pending: Arc<AtomicUsize>,
    worker:  Mutex<Option<JoinHandle<()>>>,
}

impl BlobStore {
    /// Opens (creating if needed) the store in `dir`.
    ///
    /// Existing `<prefix><epoch>-<sequence>` files become the initial pending
    /// index, oldest first. Other names are ignored, except leftovers of
    /// interrupted writes, which are removed.
    pub fn open<P: Into<PathBuf>>(dir: P, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        let prefix = prefix.into();

        std::fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;
        let scan = scan_pages(&dir, &prefix)?;
        for partial in &scan.partials {
            warn!(path = ?partial, "Removing interrupted page write");
            std::fs::remove_file(partial).context(IoSnafu { path: partial })?;
        }

        let generator = scan
            .ids
            .last()
            .map_or_else(IdGenerator::new, |last| IdGenerator::resume_after(*last));
        let pending = Arc::new(AtomicUsize::new(scan.ids.len()));
        let (tx, rx) = bounded(STORE_REQUEST_CAPACITY);

        let worker = StoreWorker {
            rx,
            dir: dir.clone(),
            prefix: prefix.clone(),
            index: VecDeque::from(scan.ids),
            generator,
            pending: pending.clone(),
        };
        let handle = thread::Builder::new()
            .name(STORE_THREAD_NAME.into())
            .spawn(move || worker.run())
            .context(SpawnSnafu {
                name: STORE_THREAD_NAME,
            })?;

        info!(
            dir = ?dir,
            pending = pending.load(Ordering::Relaxed),
            "Blob store opened"
        );

        Ok(Self {
            dir,
            prefix,
            tx,
            pending,
            worker: Mutex::new(Some(handle)),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path { &self.dir }

    #[must_use]
    pub fn prefix(&self) -> &str { &self.prefix }

    /// Number of pending pages.
    #[must_use]
    pub fn len(&self) -> usize { self.pending.load(Ordering::Acquire) }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Pending ids, oldest first.
    pub fn list(&self) -> Result<Vec<FlakeId>> { self.call(|reply| StoreRequest::List { reply }) }

    /// Persists `data` as the newest page.
    ///
    /// The id is only indexed once the file is fully written.
    pub fn save(&self, data: Bytes) -> Result<FlakeId> {
        self.call(|reply| StoreRequest::Save { data, reply })?
    }

    /// Persists `data` ahead of every pending page.
    pub fn requeue(&self, data: Bytes) -> Result<FlakeId> {
        self.call(|reply| StoreRequest::Requeue { data, reply })?
    }

    /// Opens the oldest page for reading without removing it.
    pub fn open_oldest(&self) -> Result<(FlakeId, File)> {
        self.call(|reply| StoreRequest::OpenOldest { reply })?
    }

    /// Removes the oldest page from the index and from disk.
    pub fn delete_oldest(&self) -> Result<FlakeId> {
        self.call(|reply| StoreRequest::DeleteOldest { reply })?
    }

    /// Reads and removes the oldest page in one step, so no two callers can
    /// observe the same page.
    pub fn take_oldest(&self) -> Result<StoredPage> {
        self.call(|reply| StoreRequest::TakeOldest { reply })?
    }

    /// Stops the worker. Later calls fail with `Closed`.
    pub fn shutdown(&self) -> Result<()> {
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        // Only fails if the worker is already gone, which join reports.
        let _ = self.tx.send(StoreRequest::Shutdown);
        handle.join().ok().context(WorkerPanickedSnafu {
            name: STORE_THREAD_NAME,
        })
    }

    fn call<T>(&self, request: impl FnOnce(Sender<T>) -> StoreRequest) -> Result<T> {
        let (reply, response) = bounded(1);
        self.tx.send(request(reply)).ok().context(ClosedSnafu)?;
        response.recv().ok().context(ClosedSnafu)
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Blob store worker did not stop cleanly");
        }
    }
}

struct StoreWorker {
    rx:        Receiver<StoreRequest>,
    dir:       PathBuf,
    prefix:    String,
    /// Pending ids, oldest first. Mirrors the page files in `dir`.
    index:     VecDeque<FlakeId>,
    generator: IdGenerator,
    pending:   Arc<AtomicUsize>,
}

impl StoreWorker {
    fn run(mut self) {
        debug!(dir = ?self.dir, "Store worker starting");

        // A dropped reply receiver means the caller went away; the request
        // has still been applied.
        while let Ok(request) = self.rx.recv() {
            match request {
                StoreRequest::Save { data, reply } => {
                    let _ = reply.send(self.save(&data));
                }
                StoreRequest::Requeue { data, reply } => {
                    let _ = reply.send(self.requeue(&data));
                }
                StoreRequest::OpenOldest { reply } => {
                    let _ = reply.send(self.open_oldest());
                }
                StoreRequest::DeleteOldest { reply } => {
                    let _ = reply.send(self.delete_oldest());
                }
                StoreRequest::TakeOldest { reply } => {
                    let _ = reply.send(self.take_oldest());
                }
                StoreRequest::List { reply } => {
                    let _ = reply.send(self.index.iter().copied().collect());
                }
                StoreRequest::Shutdown => break,
            }
        }

        debug!(dir = ?self.dir, pending = self.index.len(), "Store worker stopped");
    }

    fn save(&mut self, data: &[u8]) -> Result<FlakeId> {
        let id = self.generator.next_id();
        self.write_page(id, data)?;
        self.index.push_back(id);
        self.sync_len();
        debug!(%id, bytes = data.len(), "Saved page");
        Ok(id)
    }

    fn requeue(&mut self, data: &[u8]) -> Result<FlakeId> {
        let id = self
            .index
            .front()
            .map_or_else(|| self.generator.next_id(), FlakeId::predecessor);
        self.write_page(id, data)?;
        self.index.push_front(id);
        self.sync_len();
        debug!(%id, bytes = data.len(), "Requeued page at head");
        Ok(id)
    }

    fn open_oldest(&self) -> Result<(FlakeId, File)> {
        let id = self.head()?;
        let path = self.page_path(id);
        match File::open(&path) {
            Ok(file) => Ok((id, file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => missing_page(id, &path),
            Err(source) => Err(source).context(IoSnafu { path }),
        }
    }

    fn delete_oldest(&mut self) -> Result<FlakeId> {
        let id = self.head()?;
        let path = self.page_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.pop_head();
                return missing_page(id, &path);
            }
            Err(source) => return Err(source).context(IoSnafu { path }),
        }
        self.pop_head();
        debug!(%id, "Deleted page");
        Ok(id)
    }

    fn take_oldest(&mut self) -> Result<StoredPage> {
        let id = self.head()?;
        let path = self.page_path(id);
        let data = match std::fs::read(&path) {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.pop_head();
                return missing_page(id, &path);
            }
            Err(source) => return Err(source).context(IoSnafu { path }),
        };
        std::fs::remove_file(&path).context(IoSnafu { path: &path })?;
        self.pop_head();
        debug!(%id, bytes = data.len(), "Took page");
        Ok(StoredPage { id, data })
    }

    fn write_page(&self, id: FlakeId, data: &[u8]) -> Result<()> {
        let partial = partial_file_path(&self.dir, &self.prefix, id);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .context(IoSnafu { path: &partial })?;
        file.write_all(data).context(IoSnafu { path: &partial })?;
        file.sync_all().context(IoSnafu { path: &partial })?;
        drop(file);

        let path = self.page_path(id);
        std::fs::rename(&partial, &path).context(IoSnafu { path })
    }

    fn head(&self) -> Result<FlakeId> { self.index.front().copied().context(EmptySnafu) }

    fn pop_head(&mut self) {
        self.index.pop_front();
        self.sync_len();
    }

    fn sync_len(&self) { self.pending.store(self.index.len(), Ordering::Release); }

    fn page_path(&self, id: FlakeId) -> PathBuf { page_file_path(&self.dir, &self.prefix, id) }
}

fn missing_page<T>(id: FlakeId, path: &Path) -> Result<T> {
    AssertionSnafu {
        message: format!("pending page {id} has no file at {}", path.display()),
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile::TempDir;

    use super::*;
    use crate::QueueError;

    struct StoreFixture {
        temp_dir: TempDir,
        store:    BlobStore,
    }

    impl StoreFixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let store = BlobStore::open(temp_dir.path(), ".").unwrap();
            Self { temp_dir, store }
        }

        fn reopen(self) -> Self {
            let Self { temp_dir, store } = self;
            store.shutdown().unwrap();
            drop(store);
            let store = BlobStore::open(temp_dir.path(), ".").unwrap();
            Self { temp_dir, store }
        }
    }

    #[test]
    fn test_empty_store() {
        let fixture = StoreFixture::new();
        assert!(fixture.store.is_empty());
        assert!(fixture.store.list().unwrap().is_empty());
        assert!(matches!(fixture.store.take_oldest(), Err(QueueError::Empty)));
        assert!(matches!(fixture.store.open_oldest(), Err(QueueError::Empty)));
        assert!(matches!(fixture.store.delete_oldest(), Err(QueueError::Empty)));
    }

    #[test]
    fn test_take_returns_oldest_first() {
        let fixture = StoreFixture::new();
        for i in 0..5 {
            fixture.store.save(Bytes::from(format!("page-{i}"))).unwrap();
        }
        assert_eq!(fixture.store.len(), 5);

        for i in 0..5 {
            let page = fixture.store.take_oldest().unwrap();
            assert_eq!(page.data, Bytes::from(format!("page-{i}")));
            assert!(!page_file_path(fixture.temp_dir.path(), ".", page.id).exists());
        }
        assert!(fixture.store.is_empty());
    }

    #[test]
    fn test_open_oldest_keeps_page() {
        let fixture = StoreFixture::new();
        let first = fixture.store.save(Bytes::from("first")).unwrap();
        fixture.store.save(Bytes::from("second")).unwrap();

        let (id, mut file) = fixture.store.open_oldest().unwrap();
        assert_eq!(id, first);
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "first");
        assert_eq!(fixture.store.len(), 2);

        assert_eq!(fixture.store.delete_oldest().unwrap(), first);
        assert_eq!(fixture.store.take_oldest().unwrap().data, Bytes::from("second"));
    }

    #[test]
    fn test_list_matches_saves() {
        let fixture = StoreFixture::new();
        let saved: Vec<FlakeId> = (0..4)
            .map(|i| fixture.store.save(Bytes::from(vec![i])).unwrap())
            .collect();
        assert!(saved.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(fixture.store.list().unwrap(), saved);
    }

    #[test]
    fn test_reopen_restores_index() {
        let fixture = StoreFixture::new();
        let saved: Vec<FlakeId> = (0..3)
            .map(|i| fixture.store.save(Bytes::from(format!("p{i}"))).unwrap())
            .collect();
        std::fs::write(fixture.temp_dir.path().join("notes.txt"), b"ignored").unwrap();

        let fixture = fixture.reopen();
        assert_eq!(fixture.store.list().unwrap(), saved);

        // New pages sort after the recovered ones.
        let newer = fixture.store.save(Bytes::from("p3")).unwrap();
        assert!(newer > saved[2]);
        assert_eq!(fixture.store.take_oldest().unwrap().data, Bytes::from("p0"));
    }

    #[test]
    fn test_partial_writes_removed_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let partial = partial_file_path(temp_dir.path(), ".", FlakeId::new(5, 0));
        std::fs::write(&partial, b"half").unwrap();

        let store = BlobStore::open(temp_dir.path(), ".").unwrap();
        assert!(store.is_empty());
        assert!(!partial.exists());
    }

    #[test]
    fn test_requeue_goes_to_head() {
        let fixture = StoreFixture::new();
        fixture.store.save(Bytes::from("b")).unwrap();
        fixture.store.save(Bytes::from("c")).unwrap();
        let head = fixture.store.requeue(Bytes::from("a")).unwrap();

        assert_eq!(fixture.store.list().unwrap()[0], head);
        let fixture = fixture.reopen();
        let drained: Vec<Bytes> = (0..3)
            .map(|_| fixture.store.take_oldest().unwrap().data)
            .collect();
        assert_eq!(drained, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }

    #[test]
    fn test_requeue_into_empty_store() {
        let fixture = StoreFixture::new();
        fixture.store.requeue(Bytes::from("only")).unwrap();
        assert_eq!(fixture.store.take_oldest().unwrap().data, Bytes::from("only"));
    }

    #[test]
    fn test_missing_file_is_assertion() {
        let fixture = StoreFixture::new();
        let id = fixture.store.save(Bytes::from("gone")).unwrap();
        fixture.store.save(Bytes::from("kept")).unwrap();
        std::fs::remove_file(page_file_path(fixture.temp_dir.path(), ".", id)).unwrap();

        assert!(matches!(
            fixture.store.take_oldest(),
            Err(QueueError::Assertion { .. })
        ));
        // The dangling id is dropped so the store can make progress.
        assert_eq!(fixture.store.take_oldest().unwrap().data, Bytes::from("kept"));
    }

    #[test]
    fn test_concurrent_save_and_take() {
        let fixture = StoreFixture::new();
        let store = &fixture.store;

        let taken = thread::scope(|s| {
            for t in 0..4u8 {
                s.spawn(move || {
                    for i in 0..50u8 {
                        store.save(Bytes::from(vec![t, i])).unwrap();
                    }
                });
            }
            let consumer = s.spawn(|| {
                let mut taken = Vec::new();
                while taken.len() < 100 {
                    match store.take_oldest() {
                        Ok(page) => taken.push(page.id),
                        Err(QueueError::Empty) => thread::yield_now(),
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                taken
            });
            consumer.join().unwrap()
        });

        assert!(taken.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.len(), 100);
    }

    #[test]
    fn test_calls_after_shutdown_are_closed() {
        let fixture = StoreFixture::new();
        fixture.store.shutdown().unwrap();
        assert!(matches!(
            fixture.store.save(Bytes::from("late")),
            Err(QueueError::Closed)
        ));
        // Idempotent.
        fixture.store.shutdown().unwrap();
    }
}
