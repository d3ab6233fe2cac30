use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use chrono::Utc;
use regex::Regex;
use tracing::debug;
use crate::core::error::{Error, Result};
use crate::core::types::Index;
use crate::storage::file_lock::FileLock;

pub const CATALOG_SIGNATURE: u32 = 0xdeadbeaf;
const HEADER_SIZE: usize = 16;

/// Fixed little-endian header at the start of the catalog index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogHeader {
    pub signature: u32,
    pub total_items: u32,
    pub total_length: u64,
}

impl Default for CatalogHeader {
    fn default() -> Self {
        CatalogHeader {
            signature: CATALOG_SIGNATURE,
            total_items: 0,
            total_length: 0,
        }
    }
}

impl CatalogHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.signature.to_le_bytes());
        buf[4..8].copy_from_slice(&self.total_items.to_le_bytes());
        buf[8..16].copy_from_slice(&self.total_length.to_le_bytes());
        buf
    }

    // a missing or short header starts a new catalog
    fn from_bytes(buf: &[u8]) -> Self {
        if buf.len() < HEADER_SIZE {
            return CatalogHeader::default();
        }
        let mut w4 = [0u8; 4];
        let mut w8 = [0u8; 8];
        w4.copy_from_slice(&buf[0..4]);
        let signature = u32::from_le_bytes(w4);
        w4.copy_from_slice(&buf[4..8]);
        let total_items = u32::from_le_bytes(w4);
        w8.copy_from_slice(&buf[8..16]);
        CatalogHeader {
            signature,
            total_items,
            total_length: u64::from_le_bytes(w8),
        }
    }
}

/// Files backing one catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPaths {
    pub data: PathBuf,      // dir/name.ext
    pub index: PathBuf,     // dir/.name-index.ext
    pub lock: PathBuf,      // dir/.name-lock.ext
}

pub fn split_catalog_path(catalog: &Path) -> CatalogPaths {
    let dir = catalog.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = catalog
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = catalog
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    CatalogPaths {
        data: dir.join(format!("{}{}", stem, ext)),
        index: dir.join(format!(".{}-index{}", stem, ext)),
        lock: dir.join(format!(".{}-lock{}", stem, ext)),
    }
}

static RANDOM_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new("<random>").expect("static pattern"));

/// Replace every `<random>` in the path with a time based token
pub fn randomize_path(path: &str) -> String {
    RANDOM_TOKEN
        .replace_all(path, |_: &regex::Captures| {
            let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            format!("{:016x}", nanos)
        })
        .into_owned()
}

/// A long-lived concatenation of many small files: one data file and a
/// text index of `<name>,<offset>,<length>,0` lines.
pub struct Catalog {
    paths: CatalogPaths,
}

impl Catalog {
    /// `catalog` is relative to `mount_point`
    pub fn open(mount_point: &Path, catalog: &str) -> Self {
        let mut paths = split_catalog_path(Path::new(catalog));
        paths.data = mount_point.join(&paths.data);
        paths.index = mount_point.join(&paths.index);
        paths.lock = mount_point.join(&paths.lock);
        Catalog { paths }
    }

    pub fn paths(&self) -> &CatalogPaths {
        &self.paths
    }

    /// Reserve an offset, record it in the index and write the content.
    ///
    /// Returns the offset assigned to the content.
    pub fn append(&self, name: &str, content: &[u8]) -> Result<u64> {
        if let Some(dir) = self.paths.index.parent() {
            fs::create_dir_all(dir)?;
        }

        let offset = {
            let _lock = FileLock::acquire(&self.paths.lock)?;

            let mut index = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.paths.index)?;

            let mut buf = Vec::with_capacity(HEADER_SIZE);
            (&mut index).take(HEADER_SIZE as u64).read_to_end(&mut buf)?;
            let mut header = CatalogHeader::from_bytes(&buf);
            if header.signature != CATALOG_SIGNATURE {
                return Err(Error::format(format!(
                    "bad catalog signature {:#x} in {}",
                    header.signature,
                    self.paths.index.display()
                )));
            }

            let offset = header.total_length;
            header.total_items += 1;
            header.total_length += content.len() as u64;

            index.seek(SeekFrom::Start(0))?;
            index.write_all(&header.to_bytes())?;
            index.seek(SeekFrom::End(0))?;
            index.write_all(Index::new(name, offset, content.len() as u64, 0).to_line().as_bytes())?;
            offset
        };

        let mut data = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.paths.data)?;
        data.seek(SeekFrom::Start(offset))?;
        data.write_all(content)?;

        debug!("catalog {}: {} added at {} ({} bytes)", self.paths.data.display(), name, offset, content.len());
        Ok(offset)
    }

    pub fn header(&self) -> Result<CatalogHeader> {
        let buf = read_or_empty(&self.paths.index)?;
        Ok(CatalogHeader::from_bytes(&buf))
    }

    /// All entries in append order
    pub fn entries(&self) -> Result<Vec<Index>> {
        let buf = read_or_empty(&self.paths.index)?;
        if buf.len() <= HEADER_SIZE {
            return Ok(Vec::new());
        }
        String::from_utf8_lossy(&buf[HEADER_SIZE..])
            .lines()
            .filter(|line| !line.is_empty())
            .map(Index::parse)
            .collect()
    }
}

fn read_or_empty(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(buf) => Ok(buf),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}
