use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

use pd_core::ports::{ReceivedContent, TransferSinkPort};

const FALLBACK_FILE_NAME: &str = "received.bin";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Writes received files into the download directory.
///
/// The sender's file name is reduced to its last path component and never
/// overwrites an existing file: `report.pdf` becomes `report (1).pdf`.
pub struct FileDownloadSink {
    dir: PathBuf,
}

impl FileDownloadSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn create_unique(&self, name: &str) -> Result<(PathBuf, fs::File)> {
        let (stem, extension) = split_name(name);
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = match (attempt, extension) {
                (0, _) => name.to_string(),
                (n, Some(ext)) => format!("{stem} ({n}).{ext}"),
                (n, None) => format!("{stem} ({n})"),
            };
            let path = self.dir.join(&candidate);
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e).with_context(|| format!("create download failed: {}", path.display())),
            }
        }
        anyhow::bail!("no free file name for {name} in {}", self.dir.display())
    }
}

#[async_trait]
impl TransferSinkPort for FileDownloadSink {
    async fn deliver(&self, content: ReceivedContent) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create download dir failed: {}", self.dir.display()))?;

        let name = sanitize_file_name(content.meta.file_name.as_deref().unwrap_or(FALLBACK_FILE_NAME));
        let (path, mut file) = self.create_unique(&name).await?;
        file.write_all(&content.data)
            .await
            .with_context(|| format!("write download failed: {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flush download failed: {}", path.display()))?;

        info!(
            session_id = %content.session_id,
            from = %content.from,
            path = %path.display(),
            size = content.data.len(),
            "file received"
        );
        Ok(())
    }
}

/// Keeps only the last path component and drops characters that are not
/// valid in file names on common platforms.
pub fn sanitize_file_name(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}
