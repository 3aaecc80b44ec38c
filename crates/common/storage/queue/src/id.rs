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

//! Flake identifiers: `(epoch_millis, sequence)` pairs that name stored
//! pages and give the store its ordering without a separate index file.

use std::{fmt, str::FromStr};

use chrono::Utc;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt, Snafu};

/// Separator between the two halves of the textual form.
pub const ID_SEPARATOR: char = '-';

/// Size of [`FlakeId::to_bytes`].
pub const ID_BYTES: usize = 16;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum IdParseError {
    #[snafu(display("Identifier {input:?} has no '{ID_SEPARATOR}' separator"))]
    MissingSeparator { input: String },

    #[snafu(display("Identifier {input:?} has a non-numeric component: {source}"))]
    InvalidNumber {
        input:  String,
        source: std::num::ParseIntError,
    },
}

/// Ordering key of a stored page.
///
/// Ordering is lexicographic on `(epoch_millis, sequence)`, which is what the
/// derived `Ord` yields given the field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlakeId {
    epoch_millis: i64,
    sequence:     i64,
}

impl FlakeId {
    #[must_use]
    pub const fn new(epoch_millis: i64, sequence: i64) -> Self {
        Self {
            epoch_millis,
            sequence,
        }
    }

    #[must_use]
    pub const fn epoch_millis(&self) -> i64 { self.epoch_millis }

    #[must_use]
    pub const fn sequence(&self) -> i64 { self.sequence }

    /// Sequence bytes first, then epoch bytes, both little-endian.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ID_BYTES] {
        let mut buf = [0u8; ID_BYTES];
        buf[..8].copy_from_slice(&self.sequence.to_le_bytes());
        buf[8..].copy_from_slice(&self.epoch_millis.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        let mut sequence = [0u8; 8];
        let mut epoch = [0u8; 8];
        sequence.copy_from_slice(&bytes[..8]);
        epoch.copy_from_slice(&bytes[8..]);
        Self {
            epoch_millis: i64::from_le_bytes(epoch),
            sequence:     i64::from_le_bytes(sequence),
        }
    }

    /// The identifier immediately before this one in the total order.
    #[must_use]
    pub const fn predecessor(&self) -> Self {
        if self.sequence > 0 {
            Self::new(self.epoch_millis, self.sequence - 1)
        } else {
            Self::new(self.epoch_millis.saturating_sub(1), i64::MAX)
        }
    }
}

impl fmt::Display for FlakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ID_SEPARATOR}{}", self.epoch_millis, self.sequence)
    }
}

impl FromStr for FlakeId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A leading '-' is the epoch's sign, not the separator.
        let split = s
            .get(1..)
            .and_then(|rest| rest.find(ID_SEPARATOR))
            .map(|pos| pos + 1)
            .context(MissingSeparatorSnafu { input: s })?;

        let epoch_millis = s[..split]
            .parse::<i64>()
            .context(InvalidNumberSnafu { input: s })?;
        let sequence = s[split + 1..]
            .parse::<i64>()
            .context(InvalidNumberSnafu { input: s })?;

        Ok(Self::new(epoch_millis, sequence))
    }
}

#[derive(Debug)]
struct GeneratorState {
    last_ms:  i64,
    sequence: i64,
}

/// Issues strictly increasing [`FlakeId`]s.
///
/// Safe to share between threads; every call takes the internal lock, so ids
/// are totally ordered by issuance.
#[derive(Debug)]
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

impl Default for IdGenerator {
    fn default() -> Self { Self::new() }
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                last_ms:  current_millis(),
                sequence: -1,
            }),
        }
    }

    /// A generator that never issues an id `<= last`.
    #[must_use]
    pub fn resume_after(last: FlakeId) -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                last_ms:  last.epoch_millis,
                sequence: last.sequence,
            }),
        }
    }

    /// Returns the next identifier.
    ///
    /// The sequence restarts at zero whenever the wall clock moves past the
    /// last issued millisecond. When the sequence is exhausted within one
    /// millisecond the call spins until the clock ticks over. A clock that
    /// steps backwards is ignored.
    pub fn next_id(&self) -> FlakeId {
        let mut state = self.state.lock();
        let now = current_millis();

        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else if state.sequence == i64::MAX {
            let mut now = now;
            while now <= state.last_ms {
                std::hint::spin_loop();
                now = current_millis();
            }
            state.last_ms = now;
            state.sequence = 0;
        } else {
            state.sequence += 1;
        }

        FlakeId::new(state.last_ms, state.sequence)
    }
}

fn current_millis() -> i64 { Utc::now().timestamp_millis() }
