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

use bon::Builder;
use bytes::Bytes;

/// A queued message: an opaque payload plus the tags a consumer needs to
/// interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Builder)]
pub struct Record {
    /// Application-defined kind of the payload, e.g. `"metrics"`.
    #[builder(into, default)]
    data_type: String,
    /// Serialization of the payload, e.g. `"json"` or `"protobuf"`.
    #[builder(into, default)]
    coding:    String,
    /// Compression applied to the payload, empty when uncompressed.
    #[builder(into, default)]
    compress:  String,
    #[builder(into, default)]
    payload:   Bytes,
}

impl Record {
    /// A record with only a payload and no tags.
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn data_type(&self) -> &str { &self.data_type }

    #[must_use]
    pub fn coding(&self) -> &str { &self.coding }

    #[must_use]
    pub fn compress(&self) -> &str { &self.compress }

    #[must_use]
    pub const fn payload(&self) -> &Bytes { &self.payload }

    #[must_use]
    pub fn into_payload(self) -> Bytes { self.payload }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let record = Record::builder().payload("hello").build();
        assert_eq!(record.payload(), &Bytes::from("hello"));
        assert!(record.data_type().is_empty());
        assert!(record.coding().is_empty());
        assert!(record.compress().is_empty());
        assert_eq!(record, Record::from_payload("hello"));
    }

    #[test]
    fn test_builder_tags() {
        let record = Record::builder()
            .data_type("metrics")
            .coding("json")
            .compress("zstd")
            .payload(Bytes::from_static(b"{}"))
            .build();
        assert_eq!(record.data_type(), "metrics");
        assert_eq!(record.coding(), "json");
        assert_eq!(record.compress(), "zstd");
        assert_eq!(record.into_payload(), Bytes::from_static(b"{}"));
    }
}
