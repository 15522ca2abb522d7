//! Tails a service log file into the current build step while an RPC runs.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ui::StepLog;
use crate::util::format::relay_line;

/// Running relay. Stop it with [`LogRelay::finish`], which signals the task
/// once and waits until everything written so far has been forwarded.
pub struct LogRelay {
    done: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

struct Tail {
    path: PathBuf,
    source: String,
    offset: u64,
    partial: Vec<u8>,
    log: Arc<dyn StepLog>,
}

impl Tail {
    async fn pump(&mut self) {
        let Ok(mut file) = File::open(&self.path).await else {
            // the service may not have created it yet
            return;
        };
        let len = match file.metadata().await {
            Ok(m) => m.len(),
            Err(_) => return,
        };
        if len < self.offset {
            debug!("{} truncated, rewinding", self.path.display());
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return;
        }
        if file.seek(SeekFrom::Start(self.offset)).await.is_err() {
            return;
        }
        let mut buf = Vec::new();
        match file.read_to_end(&mut buf).await {
            Ok(n) => self.offset += n as u64,
            Err(_) => return,
        }
        self.partial.extend_from_slice(&buf);

        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.emit(&line);
        }
    }

    fn flush(&mut self) {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.emit(&rest);
        }
    }

    fn emit(&self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        if let Some(line) = relay_line(&self.source, &text) {
            self.log.write_line(&line);
        }
    }
}

impl LogRelay {
    pub fn start(
        path: PathBuf,
        source: impl Into<String>,
        log: Arc<dyn StepLog>,
        interval: Duration,
    ) -> Self {
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let mut tail = Tail {
            path,
            source: source.into(),
            offset: 0,
            partial: Vec::new(),
            log,
        };

        let handle = tokio::spawn(async move {
            loop {
                tail.pump().await;
                tokio::select! {
                    _ = &mut done_rx => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            // final drain after the RPC returned
            tail.pump().await;
            tail.flush();
        });

        Self {
            done: Some(done_tx),
            handle: Some(handle),
        }
    }

    pub async fn finish(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LogRelay {
    fn drop(&mut self) {
        // dropped without finish(): let the task end on its own
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
