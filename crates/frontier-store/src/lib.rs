// farcrawl is a polite, high-throughput web crawler.
// Copyright (C) 2024 The farcrawl Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Append-only per-domain frontier files (spec §4.2): `domain -> file` with
//! `append_many`/`read_line_at`. Paths are two-level sharded
//! (`<root>/<shard>/<2-hex-prefix>/<domain>.frontier`); readers mmap the
//! file and tolerate a partial trailing line the way
//! `crates/core/src/crawler/file_queue.rs`'s `FileQueue` tolerates a
//! not-yet-flushed record, except the wire format here is the spec's plain
//! text line, not a bincode/postcard frame.

mod line;

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
};

pub use line::UrlEntry;

pub const MAX_LINE_BYTES: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error for domain {domain}: {source}")]
    Io {
        domain: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed frontier line for domain {domain} at offset {offset}: {reason}")]
    Malformed {
        domain: String,
        offset: u64,
        reason: String,
    },
}

/// Result of reading one frontier line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete entry, plus the offset of the next line.
    Entry(UrlEntry, u64),
    /// `offset == size`: the domain is exhausted.
    Exhausted,
    /// The line at `offset` is not terminated by `\n` yet (a writer is
    /// mid-flush, or this is the live tail). Callers should retry later
    /// without advancing past it.
    Pending,
}

pub struct FrontierStore {
    root: PathBuf,
    shard: u32,
}

impl FrontierStore {
    pub fn new(root: impl Into<PathBuf>, shard: u32) -> Self {
        Self {
            root: root.into(),
            shard,
        }
    }

    /// Two-level sharded relative path for `domain`, matching spec §3/§6:
    /// `<shard>/<2-hex-prefix>/<domain>.frontier`.
    pub fn relative_path(shard: u32, domain: &str) -> String {
        let prefix = hash_prefix(domain);
        format!("{shard}/{prefix}/{domain}.frontier")
    }

    pub fn absolute_path(&self, domain: &str) -> PathBuf {
        self.root.join(Self::relative_path(self.shard, domain))
    }

    /// Appends `entries` to `domain`'s frontier file, creating it (and its
    /// parent directories) if needed. Returns the file's new total size in
    /// bytes, i.e. the new `frontier_size`. `flush()` alone only moves bytes
    /// out of this process's userspace buffer; it makes no durability claim
    /// once they reach the OS page cache. `force_fsync` additionally calls
    /// `sync_all()` per spec §4.2's "each flush fsync'd on a configurable
    /// cadence"; callers decide the cadence (the frontier manager tracks a
    /// per-domain last-fsync time against the configured interval).
    pub fn append_many(&self, domain: &str, entries: &[UrlEntry], force_fsync: bool) -> Result<u64, Error> {
        let path = self.absolute_path(domain);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::Io {
                domain: domain.to_string(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| Error::Io {
                domain: domain.to_string(),
                source,
            })?;

        for entry in entries {
            let line = entry.encode();
            debug_assert!(line.len() <= MAX_LINE_BYTES, "caller must enforce MAX_URL_LEN");
            file.write_all(line.as_bytes())
                .map_err(|source| Error::Io {
                    domain: domain.to_string(),
                    source,
                })?;
        }
        file.flush().map_err(|source| Error::Io {
            domain: domain.to_string(),
            source,
        })?;

        if force_fsync {
            file.sync_all().map_err(|source| Error::Io {
                domain: domain.to_string(),
                source,
            })?;
        }

        file.metadata()
            .map(|m| m.len())
            .map_err(|source| Error::Io {
                domain: domain.to_string(),
                source,
            })
    }

    /// Reads one line at `offset`. Tolerates partial trailing lines (no
    /// `\n` yet) by returning `Pending`, and skips-and-logs lines longer
    /// than [`MAX_LINE_BYTES`] by treating the next `\n` as the line's true
    /// end and returning a `Malformed` error for that one line so the
    /// caller can advance past it.
    pub fn read_line_at(&self, domain: &str, offset: u64) -> Result<ReadOutcome, Error> {
        let path = self.absolute_path(domain);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ReadOutcome::Exhausted),
            Err(source) => {
                return Err(Error::Io {
                    domain: domain.to_string(),
                    source,
                })
            }
        };

        let size = file
            .metadata()
            .map_err(|source| Error::Io {
                domain: domain.to_string(),
                source,
            })?
            .len();

        if offset >= size {
            return Ok(ReadOutcome::Exhausted);
        }

        // SAFETY: the file is append-only and owned exclusively by this
        // shard's process; concurrent truncation never happens in normal
        // operation.
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|source| Error::Io {
            domain: domain.to_string(),
            source,
        })?;

        let remaining = &mmap[offset as usize..];
        let scan_len = remaining.len().min(MAX_LINE_BYTES + 1);
        let window = &remaining[..scan_len];

        match window.iter().position(|&b| b == b'\n') {
            None => {
                if remaining.len() > MAX_LINE_BYTES {
                    // No newline within the cap: this line is malformed
                    // (too long). We cannot know its true end without a
                    // newline, so we can't safely skip it yet; surface the
                    // error and let the caller retry (more bytes may still
                    // arrive) or quarantine the domain.
                    return Err(Error::Malformed {
                        domain: domain.to_string(),
                        offset,
                        reason: format!("line exceeds {MAX_LINE_BYTES} bytes with no terminator"),
                    });
                }
                Ok(ReadOutcome::Pending)
            }
            Some(nl) if nl >= MAX_LINE_BYTES => {
                tracing::warn!(domain, offset, len = nl, "skipping oversized frontier line");
                Err(Error::Malformed {
                    domain: domain.to_string(),
                    offset,
                    reason: format!("line of {nl} bytes exceeds {MAX_LINE_BYTES}"),
                })
            }
            Some(nl) => {
                let line = std::str::from_utf8(&window[..nl]).map_err(|e| Error::Malformed {
                    domain: domain.to_string(),
                    offset,
                    reason: e.to_string(),
                })?;
                let entry = UrlEntry::decode(line).map_err(|reason| Error::Malformed {
                    domain: domain.to_string(),
                    offset,
                    reason,
                })?;
                Ok(ReadOutcome::Entry(entry, offset + nl as u64 + 1))
            }
        }
    }

    pub fn exists(&self, domain: &str) -> bool {
        self.absolute_path(domain).exists()
    }

    pub fn size(&self, domain: &str) -> Result<u64, Error> {
        let path = self.absolute_path(domain);
        match std::fs::metadata(&path) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(Error::Io {
                domain: domain.to_string(),
                source,
            }),
        }
    }

    /// Used by the resharder (spec §4.9): moves `domain`'s file from this
    /// store's shard to `new_shard` under the same root, returning the new
    /// relative path.
    pub fn move_to_shard(&self, domain: &str, new_shard: u32) -> Result<String, Error> {
        let from = self.absolute_path(domain);
        let to_rel = Self::relative_path(new_shard, domain);
        let to = self.root.join(&to_rel);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::Io {
                domain: domain.to_string(),
                source,
            })?;
        }
        std::fs::rename(&from, &to).map_err(|source| Error::Io {
            domain: domain.to_string(),
            source,
        })?;
        Ok(to_rel)
    }
}

fn hash_prefix(domain: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    domain.hash(&mut hasher);
    let h = hasher.finish();
    format!("{:02x}", (h & 0xff) as u8)
}

/// Convenience used by tests and the resharder to derive a domain's shard
/// from its name.
pub fn shard_for_domain(domain: &str, num_shards: u32) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    domain.hash(&mut hasher);
    (hasher.finish() % num_shards as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, depth: u32) -> UrlEntry {
        UrlEntry {
            url: url.to_string(),
            depth,
            priority: 0,
            added_at: 1_700_000_000,
        }
    }

    #[test]
    fn append_then_read_round_trips_l3() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrontierStore::new(dir.path(), 0);

        let e1 = entry("http://example.com/a", 1);
        let e2 = entry("http://example.com/b", 2);
        let size = store.append_many("example.com", &[e1.clone(), e2.clone()], true).unwrap();
        assert!(size > 0);

        let ReadOutcome::Entry(got1, off1) = store.read_line_at("example.com", 0).unwrap() else {
            panic!("expected entry");
        };
        assert_eq!(got1, e1);

        let ReadOutcome::Entry(got2, off2) = store.read_line_at("example.com", off1).unwrap() else {
            panic!("expected entry");
        };
        assert_eq!(got2, e2);
        assert_eq!(off2, size);

        assert_eq!(
            store.read_line_at("example.com", off2).unwrap(),
            ReadOutcome::Exhausted
        );
    }

    #[test]
    fn missing_domain_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrontierStore::new(dir.path(), 0);
        assert_eq!(
            store.read_line_at("nope.example", 0).unwrap(),
            ReadOutcome::Exhausted
        );
    }

    #[test]
    fn partial_trailing_line_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrontierStore::new(dir.path(), 0);
        let path = store.absolute_path("example.com");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"http%3A%2F%2Fexample.com%2Fa|1|0|170000").unwrap(); // no trailing \n

        assert_eq!(
            store.read_line_at("example.com", 0).unwrap(),
            ReadOutcome::Pending
        );
    }

    #[test]
    fn oversized_line_without_newline_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrontierStore::new(dir.path(), 0);
        let path = store.absolute_path("example.com");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "a".repeat(MAX_LINE_BYTES + 100)).unwrap();

        assert!(store.read_line_at("example.com", 0).is_err());
    }

    #[test]
    fn move_to_shard_relocates_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrontierStore::new(dir.path(), 0);
        store.append_many("example.com", &[entry("http://example.com/a", 0)], false).unwrap();

        let new_rel = store.move_to_shard("example.com", 3).unwrap();
        assert!(new_rel.starts_with("3/"));
        assert!(!store.absolute_path("example.com").exists());
    }

    #[test]
    fn domain_shard_hash_is_stable() {
        assert_eq!(
            shard_for_domain("example.com", 4),
            shard_for_domain("example.com", 4)
        );
    }
}
