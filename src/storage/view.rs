use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::Index;

/// "ryftview" in ASCII
pub const VIEW_SIGNATURE: i64 = 0x7279667476696577;

const HEADER_SIZE: u64 = 8 * 8;
const ITEM_SIZE: u64 = 4 * 8;

// forward gaps below this are read through instead of seeking
const SEQUENTIAL_WINDOW: i64 = 256 * 1024;

/// Byte ranges of one record in the INDEX and DATA files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewItem {
    pub index_beg: i64,
    pub index_end: i64,
    pub data_beg: i64,
    pub data_end: i64,
}

impl ViewItem {
    pub fn new(index_beg: i64, index_end: i64, data_beg: i64, data_end: i64) -> Self {
        ViewItem { index_beg, index_end, data_beg, data_end }
    }

    fn to_bytes(self) -> [u8; ITEM_SIZE as usize] {
        let mut buf = [0u8; ITEM_SIZE as usize];
        for (i, v) in [self.index_beg, self.index_end, self.data_beg, self.data_end].iter().enumerate() {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&v.to_be_bytes());
        }
        buf
    }
}

fn header_bytes(count: i64, index_len: i64, data_len: i64) -> [u8; HEADER_SIZE as usize] {
    let mut buf = [0u8; HEADER_SIZE as usize];
    for (i, v) in [VIEW_SIGNATURE, count, index_len, data_len].iter().enumerate() {
        buf[i * 8..(i + 1) * 8].copy_from_slice(&v.to_be_bytes());
    }
    buf
}

fn word(buf: &[u8], i: usize) -> i64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
    i64::from_be_bytes(w)
}

/// Appends VIEW items, the header is rewritten on every `update`.
pub struct ViewWriter {
    file: BufWriter<File>,
    count: i64,
}

impl ViewWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = BufWriter::new(File::create(path)?);
        // lengths are unknown until the first update
        file.write_all(&header_bytes(0, -1, -1))?;
        Ok(ViewWriter { file, count: 0 })
    }

    pub fn put(&mut self, item: ViewItem) -> Result<()> {
        self.file.write_all(&item.to_bytes())?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    /// Checkpoint: flush and rewrite the header in place
    pub fn update(&mut self, index_len: i64, data_len: i64) -> Result<()> {
        self.file.flush()?;
        let file = self.file.get_mut();
        let pos = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes(self.count, index_len, data_len))?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Random access to VIEW items by ordinal.
pub struct ViewReader {
    file: BufReader<File>,
    pos: Option<u64>,           // read position, unknown after a failed read
    count: i64,
    index_len: i64,
    data_len: i64,
}

impl ViewReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);

        let mut header = [0u8; HEADER_SIZE as usize];
        read_exact(&mut file, &mut header, "VIEW header")?;
        if word(&header, 0) != VIEW_SIGNATURE {
            return Err(Error::format("bad VIEW signature"));
        }

        Ok(ViewReader {
            file,
            pos: Some(HEADER_SIZE),
            count: word(&header, 1),
            index_len: word(&header, 2),
            data_len: word(&header, 3),
        })
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn index_len(&self) -> i64 {
        self.index_len
    }

    pub fn data_len(&self) -> i64 {
        self.data_len
    }

    pub fn get(&mut self, pos: i64) -> Result<ViewItem> {
        if pos < 0 || pos >= self.count {
            return Err(Error::new(
                ErrorKind::Range,
                format!("VIEW out of range: {} of {}", pos, self.count),
            ));
        }

        let target = HEADER_SIZE + pos as u64 * ITEM_SIZE;
        match self.pos.take().map(|cur| target as i64 - cur as i64) {
            Some(delta) if (0..SEQUENTIAL_WINDOW).contains(&delta) => self.file.seek_relative(delta)?,
            _ => {
                self.file.seek(SeekFrom::Start(target))?;
            }
        }

        let mut buf = [0u8; ITEM_SIZE as usize];
        read_exact(&mut self.file, &mut buf, "VIEW item")?;
        self.pos = Some(target + ITEM_SIZE);

        Ok(ViewItem::new(word(&buf, 0), word(&buf, 1), word(&buf, 2), word(&buf, 3)))
    }
}

/// Build the VIEW of a completed INDEX file.
///
/// Data ranges skip `delimiter` between consecutive records.
pub fn create_view_file(index_path: &Path, view_path: &Path, delimiter: &str) -> Result<()> {
    let mut rd = BufReader::with_capacity(256 * 1024, File::open(index_path)?);
    let mut w = ViewWriter::create(view_path)?;

    let delim_len = delimiter.len() as i64;
    let mut index_pos = 0i64;
    let mut data_pos = 0i64;
    let mut line = String::new();
    loop {
        line.clear();
        if rd.read_line(&mut line)? == 0 {
            break;
        }
        let index = Index::parse(&line).map_err(|e| e.wrap("failed to parse index"))?;

        let line_len = line.len() as i64;
        w.put(ViewItem::new(index_pos, index_pos + line_len, data_pos, data_pos + index.length as i64))?;
        index_pos += line_len;
        data_pos += index.length as i64 + delim_len;
    }

    w.update(index_pos, data_pos)?;
    w.close()
}

// short read is a format problem, not an I/O one
fn read_exact(r: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::format(format!("failed to read {}: unexpected EOF", what)),
        _ => e.into(),
    })
}
