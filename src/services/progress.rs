use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::errors::{InstallerError, Result};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub file_name: String,
    pub downloaded: u64,
}

pin_project! {
    /// AsyncRead adapter reporting every chunk length to a callback.
    pub struct ReadWithCallback<R, F>
    where
        R: AsyncRead,
        F: FnMut(usize),
    {
        #[pin]
        pub reader: R,
        pub callback: F,
    }
}

impl<R, F> AsyncRead for ReadWithCallback<R, F>
where
    R: AsyncRead,
    F: FnMut(usize),
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        let this = self.project();
        let res = this.reader.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            if !buf.filled().is_empty() {
                (this.callback)(buf.filled().len());
            }
        }
        res
    }
}

/// Stalled-transfer detector. Transfers get a 10 s grace period, after
/// which every 5 s window must move at least 5 KiB.
pub struct DownloadMonitor {
    start_time: Instant,
    last_check: Instant,
    last_bytes: u64,
    grace_period: Duration,
    check_interval: Duration,
    min_bytes_per_check: u64,
}

impl Default for DownloadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadMonitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_check: now,
            last_bytes: 0,
            grace_period: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
            min_bytes_per_check: 5 * 1024,
        }
    }

    pub fn check_stall(&mut self, current_bytes: u64) -> Result<()> {
        let now = Instant::now();
        if now.duration_since(self.start_time) < self.grace_period {
            return Ok(());
        }
        if now.duration_since(self.last_check) >= self.check_interval {
            let transferred = current_bytes.saturating_sub(self.last_bytes);
            if transferred < self.min_bytes_per_check {
                return Err(InstallerError::Stalled(format!(
                    "only {transferred} bytes transferred in the last {} seconds",
                    self.check_interval.as_secs()
                )));
            }
            self.last_check = now;
            self.last_bytes = current_bytes;
        }
        Ok(())
    }
}
