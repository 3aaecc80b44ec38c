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

//! Durable, order-preserving spillover queue.
//!
//! Records are published into an in-memory write page. Every full page is
//! spilled to disk as one file, and reads drain the oldest tier first, so
//! records come out in the order they went in, across restarts included.

pub mod builder;
pub mod cancel;
pub mod codec;
pub mod config;
mod crc;
pub mod error;
pub mod id;
pub mod path;
pub mod queue;
pub mod record;
pub mod store;
mod writer;

pub use builder::QueueBuilder;
pub use cancel::CancelToken;
pub use codec::{BytesCodec, CodecError, PageCodec, RecordCodec};
pub use config::{DEFAULT_PAGE_SIZE, QueueConfig};
pub use error::{QueueError, Result};
pub use id::{FlakeId, IdGenerator, IdParseError};
pub use queue::{Ack, BatchAck, Fetched, Queue, QueueStats};
pub use record::Record;
pub use store::{BlobStore, StoredPage};
