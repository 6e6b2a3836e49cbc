//! Append-only build logs with any number of followers
//!
//! The writer appends to a file and publishes the new length on a watch
//! channel. Followers keep their own offset and read from the file, so a
//! slow follower never holds the writer back.

use fatbuildr_common::Result;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

const EXCERPT_BYTES: u64 = 4096;
const CHUNK_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogState {
    len: u64,
    closed: bool,
}

/// Log of one build, written by one producer
pub struct BuildLog {
    path: PathBuf,
    file: Mutex<File>,
    state: watch::Sender<LogState>,
}

impl BuildLog {
    /// Create (or truncate) the log file at `path`
    pub async fn create(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        let (state, _) = watch::channel(LogState {
            len: 0,
            closed: false,
        });
        Ok(Arc::new(Self {
            path,
            file: Mutex::new(file),
            state,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw output
    pub async fn append(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock().await;
        file.write_all(data).await?;
        file.flush().await?;
        self.state.send_modify(|state| state.len += data.len() as u64);
        Ok(())
    }

    /// Append one line of daemon commentary
    pub async fn line(&self, message: &str) -> Result<()> {
        self.append(format!("[fatbuildr] {}\n", message).as_bytes())
            .await
    }

    /// Mark the log complete; followers stop after draining it
    pub fn close(&self) {
        self.state.send_modify(|state| state.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn len(&self) -> u64 {
        self.state.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Follow the log from its beginning
    pub fn follow(&self) -> LogFollower {
        LogFollower {
            path: self.path.clone(),
            offset: 0,
            state: self.state.subscribe(),
        }
    }

    /// Last bytes of the log, for error reports
    pub async fn excerpt(&self) -> Result<String> {
        let len = self.len();
        let start = len.saturating_sub(EXCERPT_BYTES);
        let (data, _) = read_chunk(&self.path, start, len - start).await?;
        let text = String::from_utf8_lossy(&data);
        // drop the partial first line
        let text = match (start > 0, text.find('\n')) {
            (true, Some(pos)) => &text[pos + 1..],
            _ => &text[..],
        };
        Ok(text.trim_end().to_string())
    }
}

/// Reader of a live log
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
    state: watch::Receiver<LogState>,
}

impl LogFollower {
    /// Follower over the log file of a finished build
    pub async fn finished(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let len = tokio::fs::metadata(&path).await?.len();
        let (_, state) = watch::channel(LogState { len, closed: true });
        Ok(Self {
            path,
            offset: 0,
            state,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next available chunk. Waits for new output while the log is open and
    /// returns `None` once it is closed and fully read.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let state = *self.state.borrow_and_update();
            if state.len > self.offset {
                let wanted = (state.len - self.offset).min(CHUNK_BYTES);
                let (data, next) = read_chunk(&self.path, self.offset, wanted).await?;
                self.offset = next;
                return Ok(Some(data));
            }
            if state.closed {
                return Ok(None);
            }
            if self.state.changed().await.is_err() {
                // writer dropped without closing
                return Ok(None);
            }
        }
    }
}

/// Read up to `max` bytes of a log file from `offset`. Returns the data and
/// the offset following it.
pub async fn read_chunk(path: &Path, offset: u64, max: u64) -> Result<(Vec<u8>, u64)> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut data = Vec::new();
    file.take(max).read_to_end(&mut data).await?;
    let next = offset + data.len() as u64;
    Ok((data, next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_followers_read_independently() {
        let dir = tempfile::tempdir().unwrap();
        let log = BuildLog::create(dir.path().join("build.log")).await.unwrap();

        let mut early = log.follow();
        log.append(b"configure\n").await.unwrap();

        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(chunk) = early.next_chunk().await.unwrap() {
                out.extend(chunk);
            }
            out
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append(b"make\n").await.unwrap();
        log.close();

        assert_eq!(collector.await.unwrap(), b"configure\nmake\n");

        let mut late = log.follow();
        let mut out = Vec::new();
        while let Some(chunk) = late.next_chunk().await.unwrap() {
            out.extend(chunk);
        }
        assert_eq!(out, b"configure\nmake\n");
        assert_eq!(late.offset(), log.len());

        let mut reopened = LogFollower::finished(log.path()).await.unwrap();
        assert_eq!(reopened.next_chunk().await.unwrap().unwrap(), b"configure\nmake\n");
        assert!(reopened.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_excerpt_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = BuildLog::create(dir.path().join("build.log")).await.unwrap();
        for i in 0..1000 {
            log.line(&format!("step {}", i)).await.unwrap();
        }
        let excerpt = log.excerpt().await.unwrap();
        assert!(excerpt.ends_with("[fatbuildr] step 999"));
        assert!(excerpt.starts_with("[fatbuildr] step"));
        assert!(excerpt.len() <= EXCERPT_BYTES as usize);
    }
}
