use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use parking_lot::RwLock;
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, info, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Index, Record};
use crate::search::aggs::Aggregations;
use crate::search::result::{CancelToken, ResultSink};
use crate::search::transform::{self, Transform};
use crate::storage::view::{ViewItem, ViewWriter};

/// One match of a stored backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreItem {
    pub index: Index,       // as the backend reported it, `data_pos` set
    pub origin: Index,      // the same bytes in the source file
    pub shift: u64,         // leading bytes of DATA not covered by `origin`
}

/// INDEX/DATA pair of one backend call
#[derive(Debug, Clone)]
pub struct IndexFile {
    pub data_path: String,
    pub items: Vec<StoreItem>,  // ascending `data_pos`
    pub delimiter: String,
    pub width: i32,
    pub is_final: bool,
}

impl IndexFile {
    /// Item whose DATA range, delimiter included, covers `pos`
    pub fn find(&self, pos: u64) -> Option<usize> {
        let n = self.items.partition_point(|it| it.index.data_pos <= pos);
        if n == 0 {
            return None;
        }
        let it = &self.items[n - 1].index;
        (pos < it.data_pos + it.length + self.delimiter.len() as u64).then_some(n - 1)
    }
}

/// Output artifacts and filters of the final drain
#[derive(Debug, Clone, Default)]
pub struct DrainOptions {
    pub home: String,
    pub host: String,
    pub file_filter: Option<Regex>,
    pub limit: u64,
    pub delimiter: String,          // between records of `keep_data_as`
    pub keep_data_as: Option<PathBuf>,
    pub keep_index_as: Option<PathBuf>,
    pub keep_view_as: Option<PathBuf>,
    pub transforms: Vec<Transform>, // applied to DATA, INDEX stays as is
}

struct Resolved {
    index: Index,
    data_path: String,
    data_pos: u64,
}

/// Intermediate and final results of one request.
///
/// Intermediate items are mapped back to source files when added, so
/// any later call that searched their DATA unwinds in a single step.
#[derive(Default)]
pub struct ResultStore {
    files: RwLock<HashMap<String, IndexFile>>,
    order: RwLock<Vec<String>>,
}

impl ResultStore {
    pub fn new() -> Self {
        ResultStore::default()
    }

    pub fn len(&self) -> usize {
        self.order.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a finished INDEX file and check its DATA file.
    ///
    /// Returns the number of items added.
    pub fn add(&self, data_path: &Path, index_path: &Path, delimiter: &str, width: i32, is_final: bool) -> Result<usize> {
        let key = data_path.to_string_lossy().into_owned();
        if self.files.read().contains_key(&key) {
            return Err(Error::new(ErrorKind::Internal, format!("{} already exists", key)));
        }

        let delim_len = delimiter.len() as u64;
        let mut items = Vec::new();
        let mut data_pos = 0u64;
        let mut rd = open_index(index_path)?;
        let mut line = String::new();
        loop {
            line.clear();
            if rd.read_line(&mut line)? == 0 {
                break;
            }
            let mut index = Index::parse(&line).map_err(|e| e.wrap("failed to parse index"))?;
            index.data_pos = data_pos;
            data_pos = data_pos
                .checked_add(index.length)
                .and_then(|p| p.checked_add(delim_len))
                .ok_or_else(|| Error::format(format!("bad index length {} at {}", index.length, data_pos)))?;

            let (origin, shift) = if is_final {
                (index.clone(), 0)
            } else {
                self.unwind(&index, width)
            };
            items.push(StoreItem { index, origin, shift });
        }

        let actual = std::fs::metadata(data_path).map(|m| m.len()).unwrap_or(0);
        let trimmed = data_pos.saturating_sub(if items.is_empty() { 0 } else { delim_len });
        if actual != data_pos && actual != trimmed {
            return Err(Error::format(format!(
                "inconsistent data file '{}' size: expected:{}, actual:{}",
                key, data_pos, actual
            )));
        }

        let count = items.len();
        debug!("store: {} added with {} items (final: {})", key, count, is_final);
        self.files.write().insert(
            key.clone(),
            IndexFile {
                data_path: key.clone(),
                items,
                delimiter: delimiter.to_string(),
                width,
                is_final,
            },
        );
        self.order.write().push(key);
        Ok(count)
    }

    /// Map an index that points into a stored DATA file back to the
    /// source file, dropping surrounding bytes that belong to the
    /// neighbour records.
    ///
    /// Indexes nothing covers are returned unchanged.
    pub fn unwind(&self, index: &Index, width: i32) -> (Index, u64) {
        // also called under the drain's read guard
        let files = self.files.read_recursive();
        let file = match files.get(&index.file) {
            Some(file) => file,
            None => return (index.clone(), 0),
        };

        // data is usually surrounded: [w]data[w], at the file edges
        // only part of the surrounding may be present
        let at = if width < 0 {
            index.offset + index.length / 2
        } else if index.offset == 0 {
            index.length.saturating_sub(width as u64 + 1)
        } else {
            index.offset + width as u64
        };

        let base = match file.find(at) {
            Some(n) => &file.items[n],
            None => {
                debug!("store: no base for {}", index);
                return (index.clone(), 0);
            }
        };

        let base_beg = base.index.data_pos + base.shift;
        let base_end = base_beg + base.origin.length;
        let beg = index.offset;
        let end = index.offset + index.length;
        if end <= base_beg || base_end <= beg {
            warn!("store: bad base [{}..{}) for [{}..{})", base_beg, base_end, beg, end);
            return (index.clone(), 0);
        }

        let new_beg = beg.max(base_beg);
        let new_end = end.min(base_end);
        let res = Index {
            file: base.origin.file.clone(),
            offset: base.origin.offset + (new_beg - base_beg),
            length: new_end - new_beg,
            fuzziness: index.fuzziness,
            host: index.host.clone(),
            data_pos: index.data_pos,
        };
        (res, new_beg - beg)
    }

    fn resolve_final(&self, opts: &DrainOptions) -> Vec<Resolved> {
        let files = self.files.read();
        let order = self.order.read();
        let finals: Vec<(&IndexFile, &StoreItem)> = order
            .iter()
            .filter_map(|key| files.get(key))
            .filter(|f| f.is_final)
            .flat_map(|f| f.items.iter().map(move |it| (f, it)))
            .collect();

        let mut all: Vec<Resolved> = finals
            .par_iter()
            .map(|(file, item)| {
                let (mut index, shift) = self.unwind(&item.index, file.width);
                index.relative_to(&opts.home);
                Resolved {
                    index,
                    data_path: file.data_path.clone(),
                    data_pos: item.index.data_pos + shift,
                }
            })
            .filter(|r| opts.file_filter.as_ref().is_none_or(|re| re.is_match(&r.index.file)))
            .collect();

        all.sort_by(|a, b| {
            (&a.index.file, a.index.offset, a.index.length).cmp(&(&b.index.file, b.index.offset, b.index.length))
        });
        all.dedup_by(|a, b| a.index.file == b.index.file && a.index.offset == b.index.offset && a.index.length == b.index.length);
        if opts.limit > 0 {
            all.truncate(opts.limit as usize);
        }
        all
    }

    /// Unwind all final items, report them as records and write the
    /// requested artifacts.
    ///
    /// Records come out sorted by file, offset and length without
    /// duplicates. A record the transforms drop is skipped, one they
    /// fail on is reported as an error. DATA that reaches the sink is
    /// also added to `aggs`. Returns the number of records reported.
    pub fn drain_final(
        &self,
        opts: &DrainOptions,
        mut aggs: Option<&mut Aggregations>,
        sink: &ResultSink,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let all = self.resolve_final(opts);
        info!("store: draining {} final records", all.len());

        let mut data_out = create_opt(opts.keep_data_as.as_deref())?;
        let mut index_out = create_opt(opts.keep_index_as.as_deref())?;
        let mut view_out = match &opts.keep_view_as {
            Some(path) => Some(ViewWriter::create(path)?),
            None => None,
        };

        let mut sources: HashMap<String, BufReader<File>> = HashMap::new();
        let mut index_pos = 0u64;
        let mut data_pos = 0u64;
        let mut count = 0u64;
        for r in all {
            if cancel.is_cancelled() {
                return Err(Error::cancelled());
            }

            let data = read_data(&mut sources, &r)?;
            let data = match transform::apply(&opts.transforms, data) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    debug!("store: transform failed on {}: {}", r.index, e);
                    sink.error(&e, &opts.host);
                    continue;
                }
            };
            if let Some(a) = aggs.as_deref_mut() {
                if let Err(e) = a.add(&data) {
                    sink.error(&e.wrap(&format!("failed to aggregate {}", r.index)), &opts.host);
                }
            }
            if let Some(w) = data_out.as_mut() {
                w.write_all(&data)?;
                w.write_all(opts.delimiter.as_bytes())?;
            }
            let line = r.index.to_line();
            if let Some(w) = index_out.as_mut() {
                w.write_all(line.as_bytes())?;
            }
            if let Some(w) = view_out.as_mut() {
                w.put(ViewItem::new(
                    index_pos as i64,
                    (index_pos + line.len() as u64) as i64,
                    data_pos as i64,
                    (data_pos + data.len() as u64) as i64,
                ))?;
            }
            index_pos += line.len() as u64;
            data_pos += data.len() as u64 + opts.delimiter.len() as u64;

            let mut index = r.index;
            index.update_host(&opts.host);
            if !sink.record(Record::new(index, data)) {
                return Err(Error::cancelled());
            }
            count += 1;
        }

        if let Some(mut w) = data_out {
            w.flush()?;
        }
        if let Some(mut w) = index_out {
            w.flush()?;
        }
        if let Some(mut w) = view_out {
            w.update(index_pos as i64, data_pos as i64)?;
            w.close()?;
        }
        Ok(count)
    }
}

// a backend that found nothing may skip its outputs
fn open_index(path: &Path) -> Result<Box<dyn BufRead>> {
    match File::open(path) {
        Ok(file) => Ok(Box::new(BufReader::new(file))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Box::new(std::io::empty())),
        Err(e) => Err(e.into()),
    }
}

fn create_opt(path: Option<&Path>) -> Result<Option<BufWriter<File>>> {
    match path {
        Some(path) => Ok(Some(BufWriter::new(File::create(path)?))),
        None => Ok(None),
    }
}

fn read_data(sources: &mut HashMap<String, BufReader<File>>, r: &Resolved) -> Result<Vec<u8>> {
    if !sources.contains_key(&r.data_path) {
        let file = File::open(&r.data_path)
            .map_err(|e| Error::new(ErrorKind::Io, format!("failed to open data file {}: {}", r.data_path, e)))?;
        sources.insert(r.data_path.clone(), BufReader::new(file));
    }
    let rd = sources
        .get_mut(&r.data_path)
        .ok_or_else(|| Error::new(ErrorKind::Internal, format!("no reader for {}", r.data_path)))?;

    rd.seek(SeekFrom::Start(r.data_pos))?;
    let mut buf = vec![0u8; r.index.length as usize];
    rd.read_exact(&mut buf).map_err(|e| {
        Error::new(
            ErrorKind::Io,
            format!("failed to read {} bytes at {} of {}: {}", r.index.length, r.data_pos, r.data_path, e),
        )
    })?;
    Ok(buf)
}
