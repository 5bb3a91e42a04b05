//! Range Request/Response Channel
//!
//! Workers talk to the range service over a Unix stream socket named per run:
//! `<socket_dir>/<channel>_<token>`. Messages are raw length-prefixed frames.

use crate::framing::{FrameError, FrameReader, FrameWriter};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors on the range channel
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No range service listens on the socket
    #[error("failed to connect to range channel {path}: {source}")]
    Connect {
        /// Socket path
        path: PathBuf,
        /// OS error
        source: std::io::Error,
    },

    /// The service-side socket could not be bound
    #[error("failed to bind range channel {path}: {source}")]
    Bind {
        /// Socket path
        path: PathBuf,
        /// OS error
        source: std::io::Error,
    },

    /// Reading or writing a message failed
    #[error("range channel I/O: {0}")]
    Frame(#[from] FrameError),
}

/// Request/response transport between one worker and the range service
pub trait RangeTransport {
    /// Send one message
    fn send(&mut self, message: &[u8]) -> Result<(), ChannelError>;

    /// Receive one message, blocking
    fn recv(&mut self) -> Result<Vec<u8>, ChannelError>;
}

/// Socket path of a run's range channel
pub fn channel_path(socket_dir: &Path, channel: &str, token: &str) -> PathBuf {
    socket_dir.join(format!("{channel}_{token}"))
}

/// One end of an established range channel
pub struct RangeConnection {
    reader: FrameReader<UnixStream>,
    writer: FrameWriter<UnixStream>,
}

impl RangeConnection {
    /// Connect to the range service listening on `path`
    pub fn connect(path: &Path) -> Result<Self, ChannelError> {
        let stream = UnixStream::connect(path).map_err(|source| ChannelError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_stream(stream).map_err(|source| ChannelError::Connect {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_stream(stream: UnixStream) -> Result<Self, std::io::Error> {
        let write_half = stream.try_clone()?;
        Ok(Self {
            reader: FrameReader::new(stream),
            writer: FrameWriter::new(write_half),
        })
    }
}

impl RangeTransport for RangeConnection {
    fn send(&mut self, message: &[u8]) -> Result<(), ChannelError> {
        self.writer.write_bytes(message)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        Ok(self.reader.read_bytes()?)
    }
}

/// Service-side endpoint of a range channel. Removes its socket file on drop.
pub struct RangeListener {
    listener: UnixListener,
    path: PathBuf,
}

impl RangeListener {
    /// Bind the channel socket, replacing a stale socket file
    pub fn bind(path: &Path) -> Result<Self, ChannelError> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        let listener = UnixListener::bind(path).map_err(|source| ChannelError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Socket path workers connect to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the next worker connection
    pub fn accept(&self) -> Result<RangeConnection, ChannelError> {
        let (stream, _) = self
            .listener
            .accept()
            .map_err(|e| ChannelError::Frame(FrameError::Io(e)))?;
        RangeConnection::from_stream(stream).map_err(|e| ChannelError::Frame(FrameError::Io(e)))
    }
}

impl Drop for RangeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{RangeResponse, readiness_message};

    #[test]
    fn test_channel_path_naming() {
        let path = channel_path(Path::new("/tmp"), "EventService_EventRanges", "ab12");
        assert_eq!(path, PathBuf::from("/tmp/EventService_EventRanges_ab12"));
    }

    #[test]
    fn test_request_response_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = channel_path(dir.path(), "ranges", "t1");
        let listener = RangeListener::bind(&path).unwrap();

        let service = std::thread::spawn(move || {
            let mut peer = listener.accept().unwrap();
            let hello = peer.recv().unwrap();
            peer.send(b"R1,1,2").unwrap();
            let _ = peer.recv().unwrap();
            peer.send(b"\0").unwrap();
            hello
        });

        let mut client = RangeConnection::connect(&path).unwrap();
        client.send(readiness_message(7).as_bytes()).unwrap();
        let first = RangeResponse::parse(&client.recv().unwrap()).unwrap();
        assert!(matches!(first, RangeResponse::Assignment(_)));
        client.send(readiness_message(7).as_bytes()).unwrap();
        assert_eq!(
            RangeResponse::parse(&client.recv().unwrap()).unwrap(),
            RangeResponse::Terminate
        );

        assert_eq!(service.join().unwrap(), b"7 ready for event processing");
    }

    #[test]
    fn test_connect_without_service_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = RangeConnection::connect(&dir.path().join("missing"));
        assert!(matches!(result, Err(ChannelError::Connect { .. })));
    }
}
