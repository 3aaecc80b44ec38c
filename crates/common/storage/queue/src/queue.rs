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

//! Paged spillover queue.
//!
//! The [`Queue`] keeps the newest records in an in-memory write page owned
//! by a background writer, spills every full page to a [`BlobStore`], and
//! serves reads from an in-memory read page. Reads take from the oldest
//! available tier:
//!
//! 1. the read page, while it has records left;
//! 2. the oldest stored page, taken off disk;
//! 3. the write page, seized from the paused writer.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("/path/to/queue").page_size(64).build()?;
//!
//! let ack = queue.publish(Record::from_payload("hello"), &CancelToken::none())?;
//! assert!(ack.is_accepted());
//!
//! if let Fetched::Record(record) = queue.fetch(&CancelToken::with_timeout(timeout))? {
//!     handle(record.payload());
//! }
//!
//! queue.close()?;
//! ```

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::{
    channel::{Sender, after, bounded, unbounded},
    select,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use snafu::{OptionExt, ResultExt};
use tracing::{debug, error, info, warn};

use crate::{
    QueueConfig, Result,
    cancel::{CancelToken, Interrupt},
    codec::{PageCodec, RecordCodec},
    error::{
        ClosedSnafu, DecodeSnafu, EncodeSnafu, QueueError, SpawnSnafu, StalledSnafu, TimeoutSnafu,
        WorkerPanickedSnafu,
    },
    id::FlakeId,
    store::BlobStore,
    writer::{Control, PageWriter, PauseRequest, PausedWriter, WRITER_THREAD_NAME, WriterShared},
};

/// How often a fetch waiting for the read page re-checks its token.
const READ_LOCK_POLL: Duration = Duration::from_millis(10);

/// Outcome of handing a record to the queue.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The record is queued and will be persisted on close.
    Accepted,
    /// The deadline passed before the record could be queued.
    TimedOut,
    Cancelled,
    Closed,
}

impl Ack {
    pub const fn is_accepted(self) -> bool { matches!(self, Self::Accepted) }

    const fn interrupted(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => Self::Cancelled,
            Interrupt::DeadlineElapsed => Self::TimedOut,
        }
    }
}

/// Outcome of [`Queue::publish_batch`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchAck {
    /// Leading records that were queued.
    pub accepted: usize,
    /// `Accepted` if every record was queued, otherwise why it stopped.
    pub ack:      Ack,
}

/// Outcome of a fetch.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    Record(T),
    /// Nothing is pending right now.
    Empty,
    TimedOut,
    Cancelled,
    Closed,
}

impl<T> Fetched<T> {
    pub fn into_record(self) -> Option<T> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    pub const fn is_empty(&self) -> bool { matches!(self, Self::Empty) }

    const fn interrupted(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => Self::Cancelled,
            Interrupt::DeadlineElapsed => Self::TimedOut,
        }
    }
}

/// Point-in-time view of where records sit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_pages:  usize,
    pub write_page_len: usize,
    pub read_page_len:  usize,
    pub page_size:      usize,
}

#[derive(Debug, Clone, Copy)]
enum PageSource {
    Disk(FlakeId),
    WriteBuffer,
}

/// What lies past the read page.
enum NextPage<R> {
    Page(PageSource, Vec<R>),
    Empty,
    Interrupted(Interrupt),
}

struct ReadPage<R> {
    records: VecDeque<R>,
    source:  Option<PageSource>,
}

impl<R> ReadPage<R> {
    const fn new() -> Self {
        Self {
            records: VecDeque::new(),
            source:  None,
        }
    }

    fn load(&mut self, source: PageSource, records: Vec<R>) {
        self.records = records.into();
        self.source = Some(source);
    }
}

/// A durable FIFO queue that spills pages of records to disk.
///
/// All methods take `&self`; share the queue between threads with an `Arc`.
/// Records from one producer are fetched in publish order, and across
/// producers in the order they entered the inbound channel.
pub struct Queue<C: PageCodec = RecordCodec> {
    config:     QueueConfig,
    page_size:  usize,
    codec:      Arc<C>,
    store:      Arc<BlobStore>,
    /// Inbound records. `None` once closed.
    records_tx: RwLock<Option<Sender<C::Record>>>,
    control_tx: Sender<Control<C::Record>>,
    shared:     Arc<WriterShared>,
    read:       Mutex<ReadPage<C::Record>>,
    /// Cancelled on close to wake blocked publishers.
    closing:    CancelToken,
    closed:     AtomicBool,
    writer:     Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Queue<RecordCodec> {
    /// Opens a queue of [`Record`](crate::Record)s over `config.base_path`.
    pub fn open(config: QueueConfig) -> Result<Self> { Self::with_codec(config, RecordCodec) }
}

impl<C: PageCodec> Queue<C> {
    /// Opens a queue whose pages are framed by `codec`.
    ///
    /// Pages already in the directory are served before anything published
    /// through this handle.
    pub fn with_codec(config: QueueConfig, codec: C) -> Result<Self> {
        let page_size = config.effective_page_size();
        let channel_capacity = config.effective_channel_capacity();
        let store = Arc::new(BlobStore::open(
            config.base_path.clone(),
            config.file_prefix.clone(),
        )?);
        let codec = Arc::new(codec);
        let shared = Arc::new(WriterShared::default());

        let (records_tx, records_rx) = bounded(channel_capacity);
        let (control_tx, control_rx) = unbounded();
        let writer = PageWriter::new(
            records_rx,
            control_rx,
            store.clone(),
            codec.clone(),
            page_size,
            config.handoff_timeout,
            config.flush_retry_interval,
            shared.clone(),
        );
        let handle = thread::Builder::new()
            .name(WRITER_THREAD_NAME.into())
            .spawn(move || writer.run())
            .context(SpawnSnafu {
                name: WRITER_THREAD_NAME,
            })?;

        info!(
            path = ?config.base_path,
            page_size,
            channel_capacity,
            pending_pages = store.len(),
            "Queue opened"
        );

        Ok(Self {
            config,
            page_size,
            codec,
            store,
            records_tx: RwLock::new(Some(records_tx)),
            control_tx,
            shared,
            read: Mutex::new(ReadPage::new()),
            closing: CancelToken::new(),
            closed: AtomicBool::new(false),
            writer: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &QueueConfig { &self.config }

    pub fn path(&self) -> &Path { self.store.dir() }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Queues one record, blocking while the inbound channel is full.
    ///
    /// A token that is already cancelled or expired returns without queueing
    /// anything. Otherwise the record is either queued (`Accepted`) or
    /// dropped without a trace.
    ///
    /// Fails with `Stalled` while the writer holds a full page it could not
    /// persist.
    pub fn publish(&self, record: C::Record, cancel: &CancelToken) -> Result<Ack> {
        if self.is_closed() {
            return Ok(Ack::Closed);
        }
        if let Some(interrupt) = cancel.interruption() {
            return Ok(Ack::interrupted(interrupt));
        }
        if let Some(reason) = self.shared.stall_reason() {
            return StalledSnafu { reason }.fail();
        }

        // Close takes the write lock only after waking us through `closing`.
        let guard = self.records_tx.read();
        let Some(tx) = guard.as_ref() else {
            return Ok(Ack::Closed);
        };
        let closing = self.closing.signal();
        let cancelled = cancel.signal();
        let expiry = cancel.expiry();

        select! {
            send(tx, record) -> sent => Ok(sent.map_or(Ack::Closed, |()| Ack::Accepted)),
            recv(closing) -> _ => Ok(Ack::Closed),
            recv(cancelled) -> _ => Ok(Ack::Cancelled),
            recv(expiry) -> _ => Ok(Ack::TimedOut),
        }
    }

    /// Queues `records` in order, stopping at the first one not accepted.
    pub fn publish_batch<I>(&self, records: I, cancel: &CancelToken) -> Result<BatchAck>
    where
        I: IntoIterator<Item = C::Record>,
    {
        let mut accepted = 0;
        for record in records {
            match self.publish(record, cancel)? {
                Ack::Accepted => accepted += 1,
                ack => return Ok(BatchAck { accepted, ack }),
            }
        }
        Ok(BatchAck {
            accepted,
            ack: Ack::Accepted,
        })
    }

    /// Returns the oldest pending record.
    ///
    /// The token is honoured while waiting for another fetch to finish and
    /// while waiting for the writer to hand over its page. Once a page has
    /// been taken the call completes without further checks, so a cancelled
    /// fetch never loses a record.
    pub fn fetch(&self, cancel: &CancelToken) -> Result<Fetched<C::Record>> {
        if self.is_closed() {
            return Ok(Fetched::Closed);
        }
        let mut read = match self.lock_read(cancel) {
            Ok(read) => read,
            Err(interrupt) => return Ok(Fetched::interrupted(interrupt)),
        };
        if self.is_closed() {
            return Ok(Fetched::Closed);
        }

        if let Some(record) = read.records.pop_front() {
            return Ok(Fetched::Record(record));
        }

        match self.next_page(cancel) {
            Ok(NextPage::Page(source, records)) => read.load(source, records),
            Ok(NextPage::Empty) => return Ok(Fetched::Empty),
            Ok(NextPage::Interrupted(interrupt)) => return Ok(Fetched::interrupted(interrupt)),
            Err(QueueError::Closed) => return Ok(Fetched::Closed),
            Err(e) => return Err(e),
        }
        Ok(read
            .records
            .pop_front()
            .map_or(Fetched::Empty, Fetched::Record))
    }

    /// Returns what is left of the read page followed by the next page: the
    /// oldest stored page, or the write page when nothing is stored.
    ///
    /// The read page is left empty afterwards.
    pub fn fetch_batch(&self, cancel: &CancelToken) -> Result<Fetched<Vec<C::Record>>> {
        if self.is_closed() {
            return Ok(Fetched::Closed);
        }
        let mut read = match self.lock_read(cancel) {
            Ok(read) => read,
            Err(interrupt) => return Ok(Fetched::interrupted(interrupt)),
        };
        if self.is_closed() {
            return Ok(Fetched::Closed);
        }

        let mut batch: Vec<_> = read.records.drain(..).collect();
        read.source = None;

        match self.next_page(cancel) {
            Ok(NextPage::Page(_, records)) => batch.extend(records),
            Ok(NextPage::Empty) => {}
            Ok(NextPage::Interrupted(interrupt)) => {
                read.records.extend(batch);
                return Ok(Fetched::interrupted(interrupt));
            }
            Err(e) => {
                // Put the remainder back so close re-persists it.
                read.records.extend(batch);
                return match e {
                    QueueError::Closed => Ok(Fetched::Closed),
                    e => Err(e),
                };
            }
        }

        if batch.is_empty() {
            Ok(Fetched::Empty)
        } else {
            Ok(Fetched::Record(batch))
        }
    }

    /// Returns once every record accepted before this call is either in the
    /// write page or on disk.
    pub fn sync(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.control_tx
            .send(Control::Sync(ack_tx))
            .ok()
            .context(ClosedSnafu)?;
        ack_rx.recv().ok().context(ClosedSnafu)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending_pages:  self.store.len(),
            write_page_len: self.shared.fill(),
            read_page_len:  self.read.lock().records.len(),
            page_size:      self.page_size,
        }
    }

    /// Deletes the oldest stored page without reading it.
    ///
    /// Meant for an operator unblocking a queue whose head page keeps
    /// failing to decode. The page's records are gone for good.
    pub fn discard_oldest_page(&self) -> Result<FlakeId> {
        let id = self.store.delete_oldest()?;
        warn!(%id, "Discarded oldest stored page");
        Ok(id)
    }

    /// Stops the queue and persists everything it holds.
    ///
    /// Blocked publishers return `Closed`. Records already accepted are
    /// written as the newest page; records left in the read page go back to
    /// the head of the store. Later calls return immediately.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(path = ?self.config.base_path, "Closing queue");

        self.closing.cancel();
        self.records_tx.write().take();

        let writer_result = match self.writer.lock().take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                WorkerPanickedSnafu {
                    name: WRITER_THREAD_NAME,
                }
                .fail()
            }),
            None => Ok(()),
        };
        if let Err(e) = &writer_result {
            error!(error = %e, "Writer did not shut down cleanly");
        }

        let read_result = self.persist_read_page();
        if let Err(e) = &read_result {
            error!(error = %e, "Failed to re-persist read page");
        }

        let store_result = self.store.shutdown();
        info!(path = ?self.config.base_path, "Queue closed");
        writer_result.and(read_result).and(store_result)
    }

    fn lock_read(
        &self,
        cancel: &CancelToken,
    ) -> std::result::Result<MutexGuard<'_, ReadPage<C::Record>>, Interrupt> {
        loop {
            if let Some(interrupt) = cancel.interruption() {
                return Err(interrupt);
            }
            if let Some(read) = self.read.try_lock_for(READ_LOCK_POLL) {
                return Ok(read);
            }
        }
    }

    /// Takes the next page after the read page: the oldest stored page, or
    /// failing that the write page.
    fn next_page(&self, cancel: &CancelToken) -> Result<NextPage<C::Record>> {
        if let Some((id, records)) = self.take_stored_page()? {
            return Ok(NextPage::Page(PageSource::Disk(id), records));
        }

        let mut paused = match self.pause_writer(cancel)? {
            Ok(paused) => paused,
            Err(interrupt) => return Ok(NextPage::Interrupted(interrupt)),
        };

        // The writer may have spilled a page since we looked. It is older
        // than the write page.
        if let Some((id, mut records)) = self.take_stored_page()? {
            records.extend(paused.resume());
            return Ok(NextPage::Page(PageSource::Disk(id), records));
        }

        if paused.page_is_empty() {
            paused.resume();
            return Ok(NextPage::Empty);
        }

        let adopted = paused.adopt();
        paused.resume();
        debug!(records = adopted.len(), "Adopted write page");
        Ok(NextPage::Page(PageSource::WriteBuffer, adopted))
    }

    fn take_stored_page(&self) -> Result<Option<(FlakeId, Vec<C::Record>)>> {
        let page = match self.store.take_oldest() {
            Ok(page) => page,
            Err(QueueError::Empty) => return Ok(None),
            Err(e) => return Err(e),
        };

        match self.codec.decode(&page.data) {
            Ok(records) => {
                debug!(id = %page.id, records = records.len(), "Loaded stored page");
                Ok(Some((page.id, records)))
            }
            Err(source) => {
                match self.store.requeue(page.data) {
                    Ok(requeued) => warn!(
                        id = %page.id,
                        %requeued,
                        error = %source,
                        "Stored page failed to decode, put back at the head"
                    ),
                    Err(e) => error!(
                        id = %page.id,
                        error = %e,
                        "Failed to put undecodable page back"
                    ),
                }
                Err(source).context(DecodeSnafu { id: page.id })
            }
        }
    }

    /// Asks the writer for its page. An interrupted wait drops the hand-off
    /// channel, which makes the writer keep its page.
    fn pause_writer(
        &self,
        cancel: &CancelToken,
    ) -> Result<std::result::Result<PausedWriter<C::Record>, Interrupt>> {
        let timeout = self.config.handoff_timeout;
        let (handoff_tx, handoff_rx) = bounded(0);
        let (resume_tx, resume_rx) = bounded(0);
        self.control_tx
            .send(Control::Pause(PauseRequest {
                handoff: handoff_tx,
                resume:  resume_rx,
            }))
            .ok()
            .context(ClosedSnafu)?;

        let cancelled = cancel.signal();
        let expiry = cancel.expiry();
        let gave_up = after(timeout);
        select! {
            recv(handoff_rx) -> page => match page {
                Ok(page) => Ok(Ok(PausedWriter::new(
                    page,
                    resume_tx,
                    timeout,
                    self.shared.clone(),
                ))),
                Err(_) => ClosedSnafu.fail(),
            },
            recv(cancelled) -> _ => Ok(Err(Interrupt::Cancelled)),
            recv(expiry) -> _ => Ok(Err(Interrupt::DeadlineElapsed)),
            recv(gave_up) -> _ => TimeoutSnafu {
                operation: "write page hand-off",
                waited:    timeout,
            }
            .fail(),
        }
    }

    fn persist_read_page(&self) -> Result<()> {
        let mut read = self.read.lock();
        if read.records.is_empty() {
            return Ok(());
        }

        let records: Vec<_> = read.records.drain(..).collect();
        let data = self.codec.encode(&records).context(EncodeSnafu)?;
        let id = self.store.requeue(data)?;
        info!(
            %id,
            records = records.len(),
            source = ?read.source.take(),
            "Re-persisted undrained read page"
        );
        Ok(())
    }
}

impl<C: PageCodec> Drop for Queue<C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Queue did not close cleanly");
        }
    }
}
