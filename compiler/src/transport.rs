// transport.rs — External byte-stream transports for I/O bundles
//
// A transport moves whole frames (one block of every bundle member). The
// bridge only reads when `poll_readable` says so and only writes when
// `poll_writable` says so; the read and write calls themselves may block.

use std::io::{self, Read, Write};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("peer disconnected")]
    Disconnected,
    #[error("frame of {got} bytes, expected {expected}")]
    FrameSize { expected: usize, got: usize },
    #[error("stream ended {got} bytes into a {expected}-byte frame")]
    Truncated { expected: usize, got: usize },
}

/// Outcome of a frame read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRead {
    Frame,
    /// Clean end of stream at a frame boundary.
    Eof,
}

pub trait Transport: Send {
    /// True if `read_frame` will return without waiting (data or EOF).
    fn poll_readable(&mut self) -> Result<bool, TransportError>;

    /// Fill `frame` exactly, or report end of stream.
    fn read_frame(&mut self, frame: &mut [u8]) -> Result<FrameRead, TransportError>;

    /// True if `write_frame` will be accepted without waiting.
    fn poll_writable(&mut self) -> Result<bool, TransportError>;

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Signal end of stream to the peer.
    fn shutdown(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ── In-process transport ────────────────────────────────────────────────────

/// One end of an in-process frame link. Dropping an end (or calling
/// `shutdown`) is seen as end of stream by the other.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
    pending: Option<Vec<u8>>,
    peer_gone: bool,
}

/// Two connected ends, each buffering up to `frames` frames in flight.
pub fn memory_link(frames: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = bounded(frames);
    let (b_tx, a_rx) = bounded(frames);
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: a_rx,
            pending: None,
            peer_gone: false,
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: b_rx,
            pending: None,
            peer_gone: false,
        },
    )
}

impl Transport for MemoryTransport {
    fn poll_readable(&mut self) -> Result<bool, TransportError> {
        if self.pending.is_some() || self.peer_gone {
            return Ok(true);
        }
        match self.rx.try_recv() {
            Ok(frame) => {
                self.pending = Some(frame);
                Ok(true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => {
                self.peer_gone = true;
                Ok(true)
            }
        }
    }

    fn read_frame(&mut self, frame: &mut [u8]) -> Result<FrameRead, TransportError> {
        let next = match self.pending.take() {
            Some(bytes) => bytes,
            None if self.peer_gone => return Ok(FrameRead::Eof),
            None => match self.rx.recv() {
                Ok(bytes) => bytes,
                Err(_) => {
                    self.peer_gone = true;
                    return Ok(FrameRead::Eof);
                }
            },
        };
        if next.len() != frame.len() {
            return Err(TransportError::FrameSize {
                expected: frame.len(),
                got: next.len(),
            });
        }
        frame.copy_from_slice(&next);
        Ok(FrameRead::Frame)
    }

    fn poll_writable(&mut self) -> Result<bool, TransportError> {
        match &self.tx {
            Some(tx) => Ok(!tx.is_full()),
            None => Err(TransportError::Disconnected),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Disconnected)?;
        tx.send(frame.to_vec())
            .map_err(|_| TransportError::Disconnected)
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

// ── Byte-stream transport ───────────────────────────────────────────────────

/// Frames over any blocking byte stream (pipe, socket, file). The stream is
/// always reported ready; reads and writes block in the stream itself.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
}

impl<S: Read + Write + Send> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        StreamTransport { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write + Send> Transport for StreamTransport<S> {
    fn poll_readable(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn read_frame(&mut self, frame: &mut [u8]) -> Result<FrameRead, TransportError> {
        let mut filled = 0;
        while filled < frame.len() {
            match self.stream.read(&mut frame[filled..]) {
                Ok(0) if filled == 0 => return Ok(FrameRead::Eof),
                Ok(0) => {
                    return Err(TransportError::Truncated {
                        expected: frame.len(),
                        got: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(FrameRead::Frame)
    }

    fn poll_writable(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frame)?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        self.stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn memory_link_delivers_frames_then_eof() {
        let (mut host, mut bridge) = memory_link(2);
        assert!(!bridge.poll_readable().unwrap());
        host.write_frame(&[1, 2, 3]).unwrap();
        assert!(bridge.poll_readable().unwrap());
        let mut buf = [0u8; 3];
        assert_eq!(bridge.read_frame(&mut buf).unwrap(), FrameRead::Frame);
        assert_eq!(buf, [1, 2, 3]);
        drop(host);
        assert!(bridge.poll_readable().unwrap());
        assert_eq!(bridge.read_frame(&mut buf).unwrap(), FrameRead::Eof);
    }

    #[test]
    fn memory_link_reports_full_and_wrong_size() {
        let (mut host, mut bridge) = memory_link(1);
        host.write_frame(&[0; 4]).unwrap();
        assert!(!host.poll_writable().unwrap());
        let mut buf = [0u8; 2];
        assert!(matches!(
            bridge.read_frame(&mut buf),
            Err(TransportError::FrameSize { expected: 2, got: 4 })
        ));
    }

    #[test]
    fn stream_reads_whole_frames() {
        let mut t = StreamTransport::new(Cursor::new(vec![1u8, 2, 3, 4, 5]));
        let mut buf = [0u8; 2];
        assert_eq!(t.read_frame(&mut buf).unwrap(), FrameRead::Frame);
        assert_eq!(t.read_frame(&mut buf).unwrap(), FrameRead::Frame);
        assert_eq!(buf, [3, 4]);
        assert!(matches!(
            t.read_frame(&mut buf),
            Err(TransportError::Truncated { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn stream_eof_at_boundary() {
        let mut t = StreamTransport::new(Cursor::new(vec![9u8, 9]));
        let mut buf = [0u8; 2];
        t.read_frame(&mut buf).unwrap();
        assert_eq!(t.read_frame(&mut buf).unwrap(), FrameRead::Eof);
    }

    #[test]
    fn stream_writes_append() {
        let mut t = StreamTransport::new(Cursor::new(Vec::new()));
        t.write_frame(&[1, 2]).unwrap();
        t.write_frame(&[3]).unwrap();
        t.shutdown().unwrap();
        assert_eq!(t.into_inner().into_inner(), vec![1, 2, 3]);
    }
}
