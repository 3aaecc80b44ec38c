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

//! Background page writer.
//!
//! ## Architecture
//!
//! The writer runs on a dedicated thread and owns the write page. Publishers
//! feed it records over a bounded crossbeam channel; fetchers reach it over
//! an unbounded control channel. Control messages are checked before every
//! record.
//!
//! ```text
//! ┌──────────────┐  records (bounded)  ┌──────────────┐   full page   ┌──────────────┐
//! │  publishers  │ ──────────────────► │  PageWriter  │ ────────────► │  BlobStore   │
//! └──────────────┘                     │  (bg thread) │               └──────────────┘
//! ┌──────────────┐  Pause / Sync       │              │
//! │   fetchers   │ ──────────────────► │  write page  │
//! │              │ ◄── page hand-off ─►│              │
//! └──────────────┘                     └──────────────┘
//! ```
//!
//! ## Hand-off
//!
//! A fetcher that finds both its read page and the store empty sends
//! [`Control::Pause`]. The writer folds in the records already queued,
//! moves its page to the fetcher over a rendezvous channel and blocks until
//! a page is moved back. The fetcher either returns the page untouched or
//! keeps it and returns an empty one. Both transfers are rendezvous sends, so
//! a page is always owned by exactly one side.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crossbeam::{
    channel::{Receiver, RecvTimeoutError, Sender},
    select,
};
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::{debug, error, info, warn};

use crate::{
    Result,
    codec::PageCodec,
    error::EncodeSnafu,
    store::BlobStore,
};

pub(crate) const WRITER_THREAD_NAME: &str = "spillway-writer";

pub(crate) enum Control<R> {
    /// Hand the write page to a fetcher and wait for one back.
    Pause(PauseRequest<R>),
    /// Acknowledge once every record queued so far has been applied.
    Sync(Sender<()>),
}

pub(crate) struct PauseRequest<R> {
    pub handoff: Sender<Vec<R>>,
    pub resume:  Receiver<Vec<R>>,
}

/// State the writer publishes to the queue handle.
#[derive(Debug, Default)]
pub(crate) struct WriterShared {
    /// Length of the write page.
    fill:  AtomicUsize,
    /// Why the last attempt to spill a full page failed, if it did.
    stall: Mutex<Option<String>>,
}

impl WriterShared {
    pub fn fill(&self) -> usize { self.fill.load(Ordering::Acquire) }

    pub fn stall_reason(&self) -> Option<String> { self.stall.lock().clone() }

    pub fn set_fill(&self, len: usize) { self.fill.store(len, Ordering::Release); }

    fn set_stall(&self, reason: String) { *self.stall.lock() = Some(reason); }

    pub fn clear_stall(&self) { self.stall.lock().take(); }
}

pub(crate) struct PageWriter<C: PageCodec> {
    records:              Receiver<C::Record>,
    control:              Receiver<Control<C::Record>>,
    store:                Arc<BlobStore>,
    codec:                Arc<C>,
    /// Records not yet on disk, in arrival order.
    page:                 Vec<C::Record>,
    page_size:            usize,
    handoff_timeout:      Duration,
    flush_retry_interval: Duration,
    shared:               Arc<WriterShared>,
}

impl<C: PageCodec> PageWriter<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        records: Receiver<C::Record>,
        control: Receiver<Control<C::Record>>,
        store: Arc<BlobStore>,
        codec: Arc<C>,
        page_size: usize,
        handoff_timeout: Duration,
        flush_retry_interval: Duration,
        shared: Arc<WriterShared>,
    ) -> Self {
        Self {
            records,
            control,
            store,
            codec,
            page: Vec::with_capacity(page_size),
            page_size,
            handoff_timeout,
            flush_retry_interval,
            shared,
        }
    }

    /// Main run loop.
    ///
    /// Runs until the record channel is closed and drained, then persists
    /// whatever is left in the write page.
    pub fn run(mut self) -> Result<()> {
        info!(page_size = self.page_size, "Page writer starting");

        loop {
            // Control takes priority over records already waiting.
            if let Ok(control) = self.control.try_recv() {
                self.handle_control(control);
                continue;
            }

            select! {
                recv(self.control) -> msg => match msg {
                    Ok(control) => self.handle_control(control),
                    Err(_) => break,
                },
                recv(self.records) -> msg => match msg {
                    Ok(record) => self.accept(record),
                    Err(_) => break,
                },
                default(self.flush_retry_interval) => self.retry_stalled(),
            }
        }

        // Normally empty: the loop only exits on disconnect once drained.
        while let Ok(record) = self.records.try_recv() {
            self.accept(record);
        }

        let result = self.persist_remainder();
        info!("Page writer stopped");
        result
    }

    fn handle_control(&mut self, control: Control<C::Record>) {
        match control {
            Control::Sync(ack) => {
                self.absorb_queued();
                let _ = ack.send(());
            }
            Control::Pause(request) => self.hand_off(request),
        }
    }

    fn accept(&mut self, record: C::Record) {
        if self.page.len() >= self.page_size {
            // A stalled page; try once more before it grows further.
            self.spill();
        }
        self.page.push(record);
        self.shared.set_fill(self.page.len());

        if self.page.len() >= self.page_size {
            self.spill();
        }
    }

    /// Applies the records that were queued when this was called, so that a
    /// record acknowledged to a publisher is visible to the next fetch.
    fn absorb_queued(&mut self) {
        let queued = self.records.len();
        for _ in 0..queued {
            match self.records.try_recv() {
                Ok(record) => self.accept(record),
                Err(_) => break,
            }
        }
    }

    fn hand_off(&mut self, request: PauseRequest<C::Record>) {
        let PauseRequest { handoff, resume } = request;
        self.absorb_queued();

        let page = std::mem::take(&mut self.page);
        let records = page.len();
        if let Err(e) = handoff.send_timeout(page, self.handoff_timeout) {
            // The fetcher gave up waiting; the page never left.
            self.page = e.into_inner();
            debug!(records, "Fetcher abandoned hand-off");
            return;
        }
        debug!(records, "Write page handed off, paused");

        match resume.recv_timeout(self.handoff_timeout) {
            Ok(page) => self.page = page,
            Err(RecvTimeoutError::Timeout) => {
                self.resume_missing("timed out");
                self.page = Vec::with_capacity(self.page_size);
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.resume_missing("hand-off dropped");
                self.page = Vec::with_capacity(self.page_size);
            }
        }

        self.shared.set_fill(self.page.len());
        if self.page.len() < self.page_size {
            self.shared.clear_stall();
        }
        debug!(records = self.page.len(), "Writer resumed");
    }

    /// The fetcher kept the page without sending one back. It still owns
    /// those records; the writer carries on with a fresh page.
    fn resume_missing(&self, reason: &str) {
        assert!(
            !cfg!(debug_assertions),
            "writer was paused but never resumed ({reason}) after {:?}",
            self.handoff_timeout
        );
        error!(
            reason,
            timeout = ?self.handoff_timeout,
            "Writer was paused but never resumed, continuing with a fresh page"
        );
    }

    fn retry_stalled(&mut self) {
        if self.page.len() >= self.page_size && self.shared.stall_reason().is_some() {
            self.spill();
        }
    }

    /// Saves the write page as the newest stored page. On failure the page
    /// stays in memory and the writer is marked stalled.
    fn spill(&mut self) -> bool {
        match self.save_page() {
            Ok(()) => {
                self.page.clear();
                self.shared.set_fill(0);
                self.shared.clear_stall();
                true
            }
            Err(e) => {
                error!(
                    error = %e,
                    records = self.page.len(),
                    "Failed to spill page, keeping it in memory"
                );
                self.shared.set_stall(e.to_string());
                false
            }
        }
    }

    fn save_page(&self) -> Result<()> {
        let data = self.codec.encode(&self.page).context(EncodeSnafu)?;
        let id = self.store.save(data)?;
        debug!(%id, records = self.page.len(), "Spilled page");
        Ok(())
    }

    fn persist_remainder(&mut self) -> Result<()> {
        if self.page.is_empty() {
            return Ok(());
        }

        let records = self.page.len();
        match self.save_page() {
            Ok(()) => {
                info!(records, "Persisted partial write page on shutdown");
                self.page.clear();
                self.shared.set_fill(0);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, records, "Failed to persist write page on shutdown");
                Err(e)
            }
        }
    }
}

/// A writer paused by a fetcher, together with the page it handed over.
///
/// Dropping the guard resumes the writer with whatever page it holds.
pub(crate) struct PausedWriter<R> {
    page:    Option<Vec<R>>,
    resume:  Sender<Vec<R>>,
    timeout: Duration,
    shared:  Arc<WriterShared>,
}

impl<R> PausedWriter<R> {
    pub fn new(
        page: Vec<R>,
        resume: Sender<Vec<R>>,
        timeout: Duration,
        shared: Arc<WriterShared>,
    ) -> Self {
        Self {
            page: Some(page),
            resume,
            timeout,
            shared,
        }
    }

    pub fn page_is_empty(&self) -> bool { self.page.as_ref().is_none_or(Vec::is_empty) }

    /// Takes the writer's records, leaving it an empty page of the same
    /// capacity.
    ///
    /// The writer's fill and stall state are cleared here rather than on
    /// resume, so the records are never reported in both pages.
    pub fn adopt(&mut self) -> Vec<R> {
        let page = self.page.get_or_insert_with(Vec::new);
        let fresh = Vec::with_capacity(page.capacity());
        let adopted = std::mem::replace(page, fresh);
        self.shared.set_fill(0);
        self.shared.clear_stall();
        adopted
    }

    /// Resumes the writer. Returns the records it could not take back, which
    /// are newer than anything on disk and older than anything it writes
    /// next.
    pub fn resume(mut self) -> Vec<R> { self.send_back() }

    fn send_back(&mut self) -> Vec<R> {
        let Some(page) = self.page.take() else {
            return Vec::new();
        };
        match self.resume.send_timeout(page, self.timeout) {
            Ok(()) => Vec::new(),
            Err(e) => {
                let page = e.into_inner();
                warn!(records = page.len(), "Writer did not take its page back");
                page
            }
        }
    }
}

impl<R> Drop for PausedWriter<R> {
    fn drop(&mut self) {
        let lost = self.send_back();
        if !lost.is_empty() {
            error!(records = lost.len(), "Dropped write page records on failed resume");
        }
    }
}
