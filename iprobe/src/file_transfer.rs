//! File-transfer collaborator interface
//!
//! Staging packages for install and pulling crash reports need a file system on the
//! device. The AFC wire protocol lives outside this crate; callers open the service
//! stream with [`Device::open_service`](crate::Device::open_service), wrap it in their AFC
//! client and hand it in through this trait.

use std::{future::Future, pin::Pin};

use crate::IdeviceError;

pub type TransferFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, IdeviceError>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub is_dir: bool,
}

/// A device-side file system reached through some file service
pub trait FileTransfer: Send {
    fn stat<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, FileInfo>;

    /// Creates a directory; succeeds if it already exists
    fn mkdir<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, ()>;

    fn write_file<'a>(&'a mut self, path: &'a str, data: &'a [u8]) -> TransferFuture<'a, ()>;

    fn read_file<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, Vec<u8>>;

    /// Lists entry names in `path`, without `.` and `..`
    fn read_dir<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, Vec<String>>;

    fn remove<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, ()>;
}

/// Joins a device path and an entry name
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::BTreeMap;

    use super::*;

    /// A file system held in a map, directories included as `None` entries
    #[derive(Debug, Default)]
    pub struct MemoryTransfer {
        pub entries: BTreeMap<String, Option<Vec<u8>>>,
    }

    impl MemoryTransfer {
        pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
            let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
            let mut dir = String::from("/");
            for part in &parts[..parts.len() - 1] {
                dir = join(&dir, part);
                self.entries.insert(dir.clone(), None);
            }
            self.entries.insert(path.to_string(), Some(data.to_vec()));
            self
        }
    }

    impl FileTransfer for MemoryTransfer {
        fn stat<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, FileInfo> {
            Box::pin(async move {
                if path == "/" {
                    return Ok(FileInfo { size: 0, is_dir: true });
                }
                match self.entries.get(path) {
                    Some(Some(data)) => Ok(FileInfo {
                        size: data.len() as u64,
                        is_dir: false,
                    }),
                    Some(None) => Ok(FileInfo { size: 0, is_dir: true }),
                    None => Err(IdeviceError::NotFound),
                }
            })
        }

        fn mkdir<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, ()> {
            Box::pin(async move {
                self.entries.entry(path.to_string()).or_insert(None);
                Ok(())
            })
        }

        fn write_file<'a>(&'a mut self, path: &'a str, data: &'a [u8]) -> TransferFuture<'a, ()> {
            Box::pin(async move {
                self.entries.insert(path.to_string(), Some(data.to_vec()));
                Ok(())
            })
        }

        fn read_file<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, Vec<u8>> {
            Box::pin(async move {
                match self.entries.get(path) {
                    Some(Some(data)) => Ok(data.clone()),
                    _ => Err(IdeviceError::NotFound),
                }
            })
        }

        fn read_dir<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, Vec<String>> {
            Box::pin(async move {
                let prefix = join(path, "");
                Ok(self
                    .entries
                    .keys()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                    .map(str::to_string)
                    .collect())
            })
        }

        fn remove<'a>(&'a mut self, path: &'a str) -> TransferFuture<'a, ()> {
            Box::pin(async move {
                self.entries
                    .remove(path)
                    .map(|_| ())
                    .ok_or(IdeviceError::NotFound)
            })
        }
    }
}
