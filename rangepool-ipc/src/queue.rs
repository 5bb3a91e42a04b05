//! Process-Shared FIFO Queues
//!
//! A [`SharedQueue`] is a connected `AF_UNIX`/`SOCK_DGRAM` socket pair. Every
//! item travels as one datagram, so concurrent producers and consumers never
//! observe partial items and delivery order is FIFO. The receiving end can be
//! inherited by spawned workers, which rebuild it with [`QueueReceiver::from_env`].

use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// The socket pair could not be created
    #[error("failed to create queue {name}: {source}")]
    Create {
        /// Queue name
        name: String,
        /// OS error
        source: std::io::Error,
    },

    /// An item could not be sent
    #[error("send on queue {name} failed: {source}")]
    Send {
        /// Queue name
        name: String,
        /// OS error
        source: std::io::Error,
    },

    /// An item could not be received
    #[error("receive on queue {name} failed: {source}")]
    Receive {
        /// Queue name
        name: String,
        /// OS error
        source: std::io::Error,
    },

    /// A datagram of the wrong size arrived
    #[error("queue {name}: item of {got} bytes, expected {expected}")]
    ShortItem {
        /// Queue name
        name: String,
        /// Bytes received
        got: usize,
        /// Encoded item size
        expected: usize,
    },

    /// The inherited descriptor is not announced in the environment
    #[error("queue descriptor variable {var} missing or invalid")]
    MissingDescriptor {
        /// Environment variable consulted
        var: String,
    },

    /// Every sender is gone and nothing is queued
    #[error("queue {name} is closed")]
    Closed {
        /// Queue name
        name: String,
    },
}

/// Fixed-size item that can travel through a [`SharedQueue`]
pub trait QueueItem: Copy {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Encode into `buf` (exactly `SIZE` bytes)
    fn encode(&self, buf: &mut [u8]);

    /// Decode from `buf` (exactly `SIZE` bytes)
    fn decode(buf: &[u8]) -> Self;
}

impl QueueItem for i32 {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
}

/// Producer side of a FIFO channel
pub trait QueueSink<T> {
    /// Append one item
    fn send_basic(&self, item: T) -> Result<(), QueueError>;
}

/// Consumer side of a FIFO channel
pub trait QueueSource<T> {
    /// Remove the oldest item, blocking until one is available
    fn receive_basic(&self) -> Result<T, QueueError>;
}

impl<T, Q: QueueSink<T> + ?Sized> QueueSink<T> for Arc<Q> {
    fn send_basic(&self, item: T) -> Result<(), QueueError> {
        (**self).send_basic(item)
    }
}

impl<T, Q: QueueSource<T> + ?Sized> QueueSource<T> for Arc<Q> {
    fn receive_basic(&self) -> Result<T, QueueError> {
        (**self).receive_basic()
    }
}

fn set_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
    }
}

fn send_item<T: QueueItem>(name: &str, fd: RawFd, item: T) -> Result<(), QueueError> {
    let mut buf = vec![0u8; T::SIZE];
    item.encode(&mut buf);
    loop {
        let ret = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), 0) };
        if ret >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(QueueError::Send {
                name: name.to_string(),
                source: err,
            });
        }
    }
}

/// Receive one datagram. `Ok(None)` only when non-blocking and the queue is empty.
fn recv_item<T: QueueItem>(
    name: &str,
    fd: RawFd,
    nonblocking: bool,
) -> Result<Option<T>, QueueError> {
    let mut buf = vec![0u8; T::SIZE];
    let flags = if nonblocking { libc::MSG_DONTWAIT } else { 0 };
    loop {
        let ret = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::Interrupted => continue,
                std::io::ErrorKind::WouldBlock if nonblocking => return Ok(None),
                _ => {
                    return Err(QueueError::Receive {
                        name: name.to_string(),
                        source: err,
                    });
                }
            }
        }
        let got = ret as usize;
        if got == 0 {
            return Err(QueueError::Closed {
                name: name.to_string(),
            });
        }
        if got != T::SIZE {
            return Err(QueueError::ShortItem {
                name: name.to_string(),
                got,
                expected: T::SIZE,
            });
        }
        return Ok(Some(T::decode(&buf)));
    }
}

/// Named FIFO of fixed-size items shared between the coordinator and its workers
pub struct SharedQueue<T: QueueItem> {
    name: String,
    send_end: OwnedFd,
    recv_end: OwnedFd,
    _item: PhantomData<T>,
}

impl<T: QueueItem> SharedQueue<T> {
    /// Create a new queue. Both ends are close-on-exec until explicitly inherited.
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();
        let mut fds = [0 as RawFd; 2];
        let ret =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        if ret != 0 {
            return Err(QueueError::Create {
                name,
                source: std::io::Error::last_os_error(),
            });
        }
        for &fd in &fds {
            set_cloexec(fd);
        }

        Ok(Self {
            name,
            send_end: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            recv_end: unsafe { OwnedFd::from_raw_fd(fds[1]) },
            _item: PhantomData,
        })
    }

    /// Queue name (for logs)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor a spawned worker must inherit to consume from this queue
    pub fn inheritable_fd(&self) -> RawFd {
        self.recv_end.as_raw_fd()
    }

    /// Remove the oldest item without blocking
    pub fn try_receive(&self) -> Result<Option<T>, QueueError> {
        recv_item(&self.name, self.recv_end.as_raw_fd(), true)
    }

    /// Drain every item currently queued
    pub fn drain(&self) -> Result<Vec<T>, QueueError> {
        let mut items = Vec::new();
        while let Some(item) = self.try_receive()? {
            items.push(item);
        }
        Ok(items)
    }
}

impl<T: QueueItem> QueueSink<T> for SharedQueue<T> {
    fn send_basic(&self, item: T) -> Result<(), QueueError> {
        send_item(&self.name, self.send_end.as_raw_fd(), item)
    }
}

impl<T: QueueItem> QueueSource<T> for SharedQueue<T> {
    fn receive_basic(&self) -> Result<T, QueueError> {
        recv_item(&self.name, self.recv_end.as_raw_fd(), false)?.ok_or(QueueError::Closed {
            name: self.name.clone(),
        })
    }
}

/// Consumer end of a [`SharedQueue`] inherited by a worker process
pub struct QueueReceiver<T: QueueItem> {
    name: String,
    fd: OwnedFd,
    _item: PhantomData<T>,
}

impl<T: QueueItem> QueueReceiver<T> {
    /// Rebuild the receiver from the descriptor number stored in `var`
    pub fn from_env(name: impl Into<String>, var: &str) -> Result<Self, QueueError> {
        let fd: RawFd = std::env::var(var)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .filter(|fd| *fd >= 0)
            .ok_or_else(|| QueueError::MissingDescriptor {
                var: var.to_string(),
            })?;

        // Keep the descriptor out of anything this worker spawns itself
        set_cloexec(fd);

        Ok(Self {
            name: name.into(),
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            _item: PhantomData,
        })
    }
}

impl<T: QueueItem> QueueSource<T> for QueueReceiver<T> {
    fn receive_basic(&self) -> Result<T, QueueError> {
        recv_item(&self.name, self.fd.as_raw_fd(), false)?.ok_or(QueueError::Closed {
            name: self.name.clone(),
        })
    }
}
