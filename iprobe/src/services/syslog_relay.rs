//! syslog_relay service client

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::{Idevice, IdeviceError, IdeviceService};

/// Client for the syslog relay, which streams device log lines
#[derive(Debug)]
pub struct SyslogRelayClient {
    idevice: Idevice,
}

impl IdeviceService for SyslogRelayClient {
    fn service_name() -> &'static str {
        "com.apple.syslog_relay"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl SyslogRelayClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Reads the next log line
    ///
    /// # Errors
    /// `ConnectionClosed` once the relay hangs up.
    pub async fn next(&mut self) -> Result<String, IdeviceError> {
        match self.idevice.read_until_delim(b"\n\x00").await? {
            Some(line) => Ok(String::from_utf8_lossy(&line).into_owned()),
            None => Err(IdeviceError::ConnectionClosed),
        }
    }

    /// Moves the relay onto its own task, publishing lines on a bounded channel
    ///
    /// The task ends when the receiver is dropped or the relay hangs up.
    pub fn into_stream(self, buffer: usize) -> mpsc::Receiver<String> {
        self.spawn_stream(buffer).0
    }

    /// Like [`into_stream`](Self::into_stream), also returning the task so it can be aborted
    pub fn spawn_stream(mut self, buffer: usize) -> (mpsc::Receiver<String>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    line = self.next() => match line {
                        Ok(line) => {
                            if tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("Syslog relay ended: {e}");
                            break;
                        }
                    },
                }
            }
        });
        (rx, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn streams_lines_until_hangup() {
        let (a, mut b) = tokio::io::duplex(8192);
        let client = SyslogRelayClient::new(Idevice::new(Box::new(a), "test"));
        b.write_all(b"Oct 19 kernel[0]: one\n\0Oct 19 backboardd[12]: two\n\0")
            .await
            .unwrap();
        drop(b);

        let mut rx = client.into_stream(4);
        assert_eq!(rx.recv().await.unwrap(), "Oct 19 kernel[0]: one");
        assert_eq!(rx.recv().await.unwrap(), "Oct 19 backboardd[12]: two");
        assert!(rx.recv().await.is_none());
    }
}
