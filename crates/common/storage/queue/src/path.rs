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

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::{Result, error::IoSnafu, id::FlakeId};

/// Suffix of a page that is still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

pub fn page_file_name(prefix: &str, id: FlakeId) -> String { format!("{prefix}{id}") }

pub fn page_file_path<P: AsRef<Path>>(dir: P, prefix: &str, id: FlakeId) -> PathBuf {
    dir.as_ref().join(page_file_name(prefix, id))
}

pub fn partial_file_path<P: AsRef<Path>>(dir: P, prefix: &str, id: FlakeId) -> PathBuf {
    dir.as_ref()
        .join(format!("{}{PARTIAL_SUFFIX}", page_file_name(prefix, id)))
}

/// Parses a directory entry name back into the id it was saved under.
/// Returns `None` for anything that is not a complete page file.
pub fn parse_page_file_name(prefix: &str, name: &str) -> Option<FlakeId> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Directory contents relevant to a store.
#[derive(Debug, Default)]
pub struct PageScan {
    /// Complete pages, oldest first.
    pub ids:      Vec<FlakeId>,
    /// Leftovers of writes interrupted by a crash.
    pub partials: Vec<PathBuf>,
}

/// Lists the pages in `dir`. Names that do not parse are skipped.
pub fn scan_pages<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<PageScan> {
    let dir = dir.as_ref();
    let mut scan = PageScan::default();

    for entry in std::fs::read_dir(dir).context(IoSnafu { path: dir })? {
        let entry = entry.context(IoSnafu { path: dir })?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !entry.file_type().context(IoSnafu { path: entry.path() })?.is_file() {
            continue;
        }

        if let Some(id) = parse_page_file_name(prefix, &name) {
            scan.ids.push(id);
        } else if name
            .strip_suffix(PARTIAL_SUFFIX)
            .and_then(|stem| parse_page_file_name(prefix, stem))
            .is_some()
        {
            scan.partials.push(entry.path());
        }
    }

    scan.ids.sort_unstable();
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_page_file_name() {
        let id = FlakeId::new(1_768_392_000_000, 3);
        assert_eq!(page_file_name(".", id), ".1768392000000-3");
        assert_eq!(page_file_name("page-", id), "page-1768392000000-3");
    }

    #[test]
    fn test_full_paths() {
        let id = FlakeId::new(10, 0);
        assert_eq!(
            page_file_path("/queue", ".", id),
            PathBuf::from("/queue/.10-0")
        );
        assert_eq!(
            partial_file_path("/queue", ".", id),
            PathBuf::from("/queue/.10-0.partial")
        );
    }

    #[test_case(".", ".10-0", Some(FlakeId::new(10, 0)) ; "hidden page")]
    #[test_case(".", "10-0", None ; "missing prefix")]
    #[test_case(".", ".10-0.partial", None ; "partial")]
    #[test_case(".", ".DS_Store", None ; "foreign file")]
    #[test_case("p_", "p_7-9", Some(FlakeId::new(7, 9)) ; "custom prefix")]
    fn test_parse_page_file_name(prefix: &str, name: &str, expected: Option<FlakeId>) {
        assert_eq!(parse_page_file_name(prefix, name), expected);
    }

    #[test]
    fn test_scan_pages_sorted_and_filtered() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let base = temp_dir.path();

        let ids = [
            FlakeId::new(20, 0),
            FlakeId::new(10, 5),
            FlakeId::new(10, 11),
        ];
        for id in ids {
            std::fs::File::create(page_file_path(base, ".", id)).unwrap();
        }
        std::fs::File::create(partial_file_path(base, ".", FlakeId::new(30, 0))).unwrap();
        std::fs::File::create(base.join("README")).unwrap();
        std::fs::create_dir(base.join(".40-0")).unwrap();

        let scan = scan_pages(base, ".").unwrap();
        assert_eq!(
            scan.ids,
            vec![
                FlakeId::new(10, 5),
                FlakeId::new(10, 11),
                FlakeId::new(20, 0)
            ]
        );
        assert_eq!(scan.partials, vec![partial_file_path(base, ".", FlakeId::new(30, 0))]);
    }
}
