//! Shared string pool: maps hashes back to their original bytes for
//! diagnostics and dumping. Append-only during training, readable
//! concurrently with appends via the same [`ConcurrentMap`] the feature
//! table uses.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::concurrent_map::ConcurrentMap;
use crate::error::{Error, Result};
use crate::hash::hash_bytes;

const ABSENT_SENTINEL: &str = "<absent>";

pub struct StringPool {
    entries: ConcurrentMap<String>,
    /// "store all" mode: keep every interned string, not just mandatory ones.
    store_all: bool,
}

impl StringPool {
    pub fn new(store_all: bool) -> Self {
        Self {
            entries: ConcurrentMap::new(),
            store_all,
        }
    }

    /// Intern `bytes`, returning its 63-bit hash. The byte sequence is
    /// stored iff `mandatory` or the pool is in store-all mode.
    pub fn intern(&self, bytes: &[u8], mandatory: bool) -> u64 {
        let h = hash_bytes(bytes);
        if mandatory || self.store_all {
            if self.entries.find(h).is_none() {
                let s = String::from_utf8_lossy(bytes).into_owned();
                self.entries.insert(h, s);
            }
        }
        h
    }

    pub fn intern_str(&self, s: &str, mandatory: bool) -> u64 {
        self.intern(s.as_bytes(), mandatory)
    }

    /// Return the stored string for `h`, or a sentinel if it was never
    /// stored (e.g. an optional string while not in store-all mode).
    pub fn get(&self, h: u64) -> Arc<str> {
        match self.entries.find(h) {
            Some(s) => Arc::from(s.as_str()),
            None => Arc::from(ABSENT_SENTINEL),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load a string-pool file: one `hex_hash string` pair per line. The
    /// hash token is ignored (recomputed from the string) so files can be
    /// hand-edited without re-deriving hashes.
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((_, s)) = line.split_once(' ') else {
                return Err(Error::Format {
                    path: path.to_path_buf(),
                    line: lineno + 1,
                    message: "expected '<hex-hash> <string>'".into(),
                });
            };
            self.intern_str(s, true);
        }
        Ok(())
    }

    /// Save every stored string, one `hex_hash string` pair per line.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut w = BufWriter::new(file);
        for (h, s) in self.entries.iter() {
            writeln!(w, "{:016x} {}", h, s).map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}
