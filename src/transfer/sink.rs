//! Destinations for completed transfers

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::types::{PeerId, PeerdropError, Result, TransferId};

/// Numbered variants tried before giving up on a name
const MAX_NAME_ATTEMPTS: usize = 1000;

/// A fully reassembled file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub from: PeerId,
    pub id: TransferId,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Consumes completed transfers
#[async_trait]
pub trait FileSink: Send + Sync {
    async fn deliver(&self, file: ReceivedFile) -> Result<()>;
}

/// Keeps delivered files in memory
#[derive(Default)]
pub struct MemorySink {
    files: Mutex<Vec<ReceivedFile>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files delivered so far, in delivery order
    pub fn files(&self) -> Vec<ReceivedFile> {
        self.files
            .lock()
            .map(|files| files.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FileSink for MemorySink {
    async fn deliver(&self, file: ReceivedFile) -> Result<()> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(file);
        Ok(())
    }
}

/// Writes delivered files into one directory.
///
/// Existing files are never overwritten: a taken name gets a ` (n)` suffix
/// before its extension.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Target path for a remote-supplied name; always directly inside the directory
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(sanitize_file_name(name))
    }

    /// Create a new file for `name`, numbering it if the name is taken
    async fn create_unique(&self, name: &str) -> Result<(PathBuf, File)> {
        let name = sanitize_file_name(name);
        for n in 0..MAX_NAME_ATTEMPTS {
            let path = self.dir.join(numbered_name(&name, n));
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PeerdropError::Transfer(format!("no free file name for {}", name)))
    }
}

/// `notes.txt` -> `notes (2).txt`; `n == 0` keeps the name
fn numbered_name(name: &str, n: usize) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{} ({})", name, n),
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn deliver(&self, file: ReceivedFile) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let (path, mut out) = self.create_unique(&file.name).await?;
        out.write_all(&file.bytes).await?;
        out.flush().await?;
        info!(
            transfer = %file.id,
            from = %file.from,
            path = %path.display(),
            bytes = file.bytes.len(),
            "File saved"
        );
        Ok(())
    }
}

/// Reduce a remote-supplied file name to a single safe path component
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}
