use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use crate::core::error::{Error, Result};

/// Scratch file naming inside the instance directory.
///
/// Names carry the task id and step number so concurrent requests
/// never share a file.
#[derive(Debug, Clone)]
pub struct ScratchLayout {
    pub instance_dir: PathBuf,
}

impl ScratchLayout {
    pub fn new(instance_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&instance_dir)?;
        Ok(ScratchLayout { instance_dir })
    }

    pub fn data_path(&self, task: &str, step: usize, ext: &str) -> PathBuf {
        self.instance_dir.join(format!(".temp-dat-{}-{}{}", task, step, ext))
    }

    pub fn index_path(&self, task: &str, step: usize) -> PathBuf {
        self.instance_dir.join(format!(".temp-idx-{}-{}.txt", task, step))
    }

    pub fn view_path(&self, task: &str, step: usize) -> PathBuf {
        self.instance_dir.join(format!(".temp-view-{}-{}.bin", task, step))
    }
}

fn extension(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
}

/// Extension shared by the input files and the requested data file.
///
/// Backends pick the record format by extension, so intermediate DATA
/// files must keep it. Mixed extensions are rejected.
pub fn detect_extension(files: &[String], data: &str) -> Result<String> {
    let found: BTreeSet<String> = std::iter::once(data)
        .chain(files.iter().map(String::as_str))
        .filter_map(extension)
        .collect();

    match found.len() {
        0 => Ok(String::new()),
        1 => Ok(found.into_iter().next().unwrap_or_default()),
        _ => Err(Error::parse(format!("ambiguous extension: {:?}", found))),
    }
}
