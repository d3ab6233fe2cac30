use std::fmt;
use std::path::Path;
use bytes::Bytes;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, Result};

/// One INDEX line: where a match was found in the source file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Index {
    pub file: String,
    pub offset: u64,
    pub length: u64,
    pub fuzziness: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    // position of the match in the backend DATA file
    #[serde(skip)]
    pub data_pos: u64,
}

impl Index {
    pub fn new(file: impl Into<String>, offset: u64, length: u64, fuzziness: u8) -> Self {
        Index {
            file: file.into(),
            offset,
            length,
            fuzziness,
            ..Index::default()
        }
    }

    /// Parse `<file>,<offset>,<length>,<fuzziness>`.
    ///
    /// The file name may contain commas, so the numeric fields are
    /// taken from the right.
    pub fn parse(line: &str) -> Result<Index> {
        let line = line.trim_end_matches(['\n', '\r']);
        let fields: Vec<&str> = line.rsplitn(4, ',').collect();
        if fields.len() != 4 {
            return Err(Error::format(format!("invalid number of fields in {:?}", line)));
        }

        let offset = fields[2]
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::format(format!("failed to parse offset: {}", e)))?;
        let length = fields[1]
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::format(format!("failed to parse length: {}", e)))?;
        let fuzz = fields[0].trim();
        let fuzziness = if fuzz.eq_ignore_ascii_case("n/a") {
            0
        } else {
            fuzz.parse::<u8>()
                .map_err(|e| Error::format(format!("failed to parse fuzziness: {}", e)))?
        };

        Ok(Index::new(fields[3].trim(), offset, length, fuzziness))
    }

    /// INDEX file line including the newline
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }

    /// Set the host unless it is already known
    pub fn update_host(&mut self, host: &str) {
        if self.host.is_empty() {
            self.host = host.to_string();
        }
    }

    /// Make the file path relative to the user home
    pub fn relative_to(&mut self, home: &str) {
        if home.is_empty() {
            return;
        }
        if let Ok(rel) = Path::new(&self.file).strip_prefix(home) {
            self.file = rel.to_string_lossy().into_owned();
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{},{},{}", self.file, self.offset, self.length, self.fuzziness)
    }
}

/// Search result: the index and the matched bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub index: Index,
    #[serde(with = "lossy_text")]
    pub data: Bytes,
}

impl Record {
    pub fn new(index: Index, data: impl Into<Bytes>) -> Self {
        Record { index, data: data.into() }
    }
}

// record data travels as a plain string, lossy for binary content
mod lossy_text {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(d)?;
        Ok(Bytes::from(text.into_bytes()))
    }
}
