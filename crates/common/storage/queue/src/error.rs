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

use std::{io, path::PathBuf, time::Duration};

use snafu::Snafu;

use crate::{codec::CodecError, id::FlakeId};

/// Queue and store errors.
///
/// `Empty` and `Timeout` are expected outcomes a caller may retry; `Io`,
/// `Decode` and `Encode` mean the durable store is compromised and should be
/// surfaced to an operator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// The store holds no pending pages.
    #[snafu(display("No pending pages"))]
    Empty,

    /// The queue or store has been shut down.
    #[snafu(display("Queue is closed"))]
    Closed,

    #[snafu(display("{operation} timed out after {waited:?}"))]
    Timeout {
        operation: &'static str,
        waited:    Duration,
    },

    #[snafu(display("IO error on {}: {source}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    /// A stored page could not be decoded. The page stays at the head of the
    /// store.
    #[snafu(display("Corrupted page {id}: {source}"))]
    Decode { id: FlakeId, source: CodecError },

    #[snafu(display("Failed to encode page: {source}"))]
    Encode { source: CodecError },

    /// The pending index disagrees with the directory it mirrors.
    #[snafu(display("Store invariant violated: {message}"))]
    Assertion { message: String },

    /// The writer holds a full page it could not persist.
    #[snafu(display("Writer stalled: {reason}"))]
    Stalled { reason: String },

    #[snafu(display("Worker thread {name} panicked"))]
    WorkerPanicked { name: &'static str },

    #[snafu(display("Failed to spawn worker thread {name}: {source}"))]
    Spawn {
        name:   &'static str,
        source: io::Error,
    },
}

impl QueueError {
    /// Whether the caller may simply try again later.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool { matches!(self, Self::Empty | Self::Timeout { .. }) }
}

/// Result type for queue operations.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
