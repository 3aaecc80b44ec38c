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

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use tracing::warn;

/// Records per page when the configured page size is unusable.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// File name prefix of stored pages. A leading dot keeps them hidden.
pub const DEFAULT_FILE_PREFIX: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding the stored pages. Created if missing.
    #[default(_code = "PathBuf::from(\"./spillway_data\")")]
    pub base_path:            PathBuf,
    /// Records per page. `0` falls back to [`DEFAULT_PAGE_SIZE`].
    #[default(_code = "DEFAULT_PAGE_SIZE")]
    pub page_size:            usize,
    /// Capacity of the inbound record channel. Defaults to half a page.
    pub channel_capacity:     Option<usize>,
    #[default(_code = "DEFAULT_FILE_PREFIX.to_string()")]
    pub file_prefix:          String,
    /// How long either side of the writer hand-off waits for the other.
    #[default(_code = "Duration::from_secs(5)")]
    pub handoff_timeout:      Duration,
    /// Retry period for a full page that could not be saved.
    #[default(_code = "Duration::from_millis(100)")]
    pub flush_retry_interval: Duration,
}

impl QueueConfig {
    /// Page size actually used.
    #[must_use]
    pub fn effective_page_size(&self) -> usize {
        if self.page_size == 0 {
            warn!(
                default = DEFAULT_PAGE_SIZE,
                "Page size 0 is not usable, substituting default"
            );
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }

    /// Inbound channel capacity actually used, never below 1.
    #[must_use]
    pub fn effective_channel_capacity(&self) -> usize {
        let page_size = if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        };
        self.channel_capacity.unwrap_or(page_size / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.file_prefix, ".");
        assert_eq!(config.channel_capacity, None);
        assert_eq!(config.handoff_timeout, Duration::from_secs(5));
    }

    #[test_case(0, None, 20, 10 ; "zero page size substitutes default")]
    #[test_case(1, None, 1, 1 ; "single record page")]
    #[test_case(7, None, 7, 3 ; "half a page rounded down")]
    #[test_case(100, Some(5), 100, 5 ; "explicit capacity")]
    #[test_case(100, Some(0), 100, 1 ; "explicit zero capacity clamps")]
    fn test_effective_sizes(
        page_size: usize,
        channel_capacity: Option<usize>,
        expected_page: usize,
        expected_capacity: usize,
    ) {
        let config = QueueConfig {
            page_size,
            channel_capacity,
            ..Default::default()
        };
        assert_eq!(config.effective_page_size(), expected_page);
        assert_eq!(config.effective_channel_capacity(), expected_capacity);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"base_path":"/var/lib/spill","page_size":64}"#).unwrap();
        assert_eq!(config.base_path, PathBuf::from("/var/lib/spill"));
        assert_eq!(config.page_size, 64);
        assert_eq!(config.effective_channel_capacity(), 32);
        assert_eq!(config.file_prefix, DEFAULT_FILE_PREFIX);
    }
}
