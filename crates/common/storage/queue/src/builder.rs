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

use std::{path::PathBuf, time::Duration};

use crate::{PageCodec, Queue, QueueConfig, RecordCodec, Result};

pub struct QueueBuilder {
    config: QueueConfig,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            config: QueueConfig {
                base_path: base_path.into(),
                ..Default::default()
            },
        }
    }

    pub fn from_config(config: QueueConfig) -> Self { Self { config } }

    pub const fn page_size(mut self, records: usize) -> Self {
        self.config.page_size = records;
        self
    }

    pub const fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = Some(capacity);
        self
    }

    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    pub const fn handoff_timeout(mut self, timeout: Duration) -> Self {
        self.config.handoff_timeout = timeout;
        self
    }

    pub const fn flush_retry_interval(mut self, interval: Duration) -> Self {
        self.config.flush_retry_interval = interval;
        self
    }

    pub fn build(self) -> Result<Queue<RecordCodec>> { Queue::open(self.config) }

    pub fn build_with_codec<C: PageCodec>(self, codec: C) -> Result<Queue<C>> {
        Queue::with_codec(self.config, codec)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{BytesCodec, CancelToken, config::DEFAULT_PAGE_SIZE};

    #[test]
    fn test_builder_default_config() {
        let builder = QueueBuilder::new("/tmp/test_queue");
        assert_eq!(builder.config.base_path, PathBuf::from("/tmp/test_queue"));
        assert_eq!(builder.config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(builder.config.channel_capacity, None);
        assert_eq!(builder.config.file_prefix, ".");
        assert_eq!(builder.config.handoff_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_custom_config() {
        let builder = QueueBuilder::new("/tmp/test_queue")
            .page_size(64)
            .channel_capacity(8)
            .file_prefix("page-")
            .handoff_timeout(Duration::from_secs(1))
            .flush_retry_interval(Duration::from_millis(20));

        assert_eq!(builder.config.page_size, 64);
        assert_eq!(builder.config.channel_capacity, Some(8));
        assert_eq!(builder.config.file_prefix, "page-");
        assert_eq!(builder.config.handoff_timeout, Duration::from_secs(1));
        assert_eq!(builder.config.flush_retry_interval, Duration::from_millis(20));
    }

    #[test]
    fn test_build_writes_pages_with_prefix() {
        let dir = TempDir::new().unwrap();
        let queue = QueueBuilder::new(dir.path())
            .page_size(2)
            .file_prefix("page-")
            .build_with_codec(BytesCodec)
            .unwrap();
        for payload in ["a", "b"] {
            let ack = queue.publish(payload.into(), &CancelToken::none()).unwrap();
            assert!(ack.is_accepted());
        }
        queue.sync().unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("page-"));
    }
}
