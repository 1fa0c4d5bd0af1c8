// channel.rs — Channel Synchronization Protocol
//
// Single-producer/single-consumer ring buffer with block-granular transfers.
// State machine: Uninitialized → Attaching → Steady → Closed.
//
//   * `Producer::open` allocates the ring and signals "ready" (once).
//   * `Consumer::attach` waits for "ready", moves the channel to Steady and
//     signals "attached"; `Producer::await_attached` waits for that signal.
//     This rendezvous is the only use of the blocking signal pair.
//   * In Steady state the `available` counter is the single source of truth:
//     the producer only increments it, the consumer only decrements it. Ring
//     cursors are private to each side.
//   * Close is sticky. Writes after Close fail; reads drain whole blocks and
//     then fail. Dropping either endpoint closes the channel.
//
// Failure modes: `ChannelError` (Closed is end of stream, not a fault).
// Side effects: allocates the ring on `open`.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use thiserror::Error;
use tracing::trace;

use crate::config::PollConfig;
use crate::poll::{poll_until, CancelToken, Cancelled};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    /// Ring size in elements.
    pub capacity: usize,
    /// Elements moved by every transfer.
    pub block_size: usize,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, capacity: usize, block_size: usize) -> Self {
        ChannelConfig {
            name: name.into(),
            capacity,
            block_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Uninitialized = 0,
    Attaching = 1,
    Steady = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Uninitialized,
            1 => ChannelState::Attaching,
            2 => ChannelState::Steady,
            _ => ChannelState::Closed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Uninitialized => "uninitialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Steady => "steady",
            ChannelState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a non-blocking transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// One whole block moved.
    Done,
    /// Not enough room (write) or data (read); nothing moved.
    WouldBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("wait cancelled")]
    Cancelled,
    #[error("block of {got} elements, channel transfers {expected}")]
    BlockSize { expected: usize, got: usize },
    #[error("channel not attached")]
    NotAttached,
    #[error("capacity {capacity} cannot hold a block of {block_size}")]
    InvalidConfig { capacity: usize, block_size: usize },
}

impl From<Cancelled> for ChannelError {
    fn from(_: Cancelled) -> Self {
        ChannelError::Cancelled
    }
}

// ── Shared state ────────────────────────────────────────────────────────────

struct Shared<T> {
    name: String,
    capacity: usize,
    block: usize,
    ring: OnceLock<Box<[UnsafeCell<T>]>>,
    available: AtomicUsize,
    state: AtomicU8,
}

// SAFETY: ring slots are only touched by the single Producer (slots counted
// free by `available`) and the single Consumer (slots counted full). The
// producer publishes writes with a Release increment that the consumer
// observes with an Acquire load, and the consumer frees slots with a Release
// decrement that the producer observes with an Acquire load, so no slot is
// ever accessed from both sides concurrently.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn close(&self) {
        let prev = self.state.swap(ChannelState::Closed as u8, Ordering::AcqRel);
        if prev != ChannelState::Closed as u8 {
            trace!(channel = %self.name, "closed");
        }
    }
}

/// Create an unopened channel.
pub fn channel<T: Copy + Default + Send>(
    config: ChannelConfig,
) -> Result<(Producer<T>, Consumer<T>), ChannelError> {
    if config.block_size == 0 || config.capacity < config.block_size {
        return Err(ChannelError::InvalidConfig {
            capacity: config.capacity,
            block_size: config.block_size,
        });
    }
    let shared = Arc::new(Shared {
        name: config.name,
        capacity: config.capacity,
        block: config.block_size,
        ring: OnceLock::new(),
        available: AtomicUsize::new(0),
        state: AtomicU8::new(ChannelState::Uninitialized as u8),
    });
    let (ready_tx, ready_rx) = bounded(1);
    let (attached_tx, attached_rx) = bounded(1);
    Ok((
        Producer {
            shared: Arc::clone(&shared),
            cursor: 0,
            ready_tx: Some(ready_tx),
            attached_rx,
            attached: false,
        },
        Consumer {
            shared,
            cursor: 0,
            ready_rx,
            attached_tx: Some(attached_tx),
        },
    ))
}

/// Create a channel and run the startup handshake on the calling thread.
pub fn attached_pair<T: Copy + Default + Send>(
    config: ChannelConfig,
) -> Result<(Producer<T>, Consumer<T>), ChannelError> {
    let (mut tx, mut rx) = channel(config)?;
    let cancel = CancelToken::new();
    let poll = PollConfig::default();
    tx.open()?;
    rx.attach(&cancel, &poll)?;
    tx.await_attached(&cancel, &poll)?;
    Ok((tx, rx))
}

// ── Producer ────────────────────────────────────────────────────────────────

pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    cursor: usize,
    ready_tx: Option<Sender<()>>,
    attached_rx: Receiver<()>,
    attached: bool,
}

impl<T: Copy + Default + Send> Producer<T> {
    /// Allocate the ring and signal the consumer. Idempotent.
    pub fn open(&mut self) -> Result<(), ChannelError> {
        let Some(ready) = self.ready_tx.take() else {
            return match self.shared.state() {
                ChannelState::Closed => Err(ChannelError::Closed),
                _ => Ok(()),
            };
        };
        let ring: Box<[UnsafeCell<T>]> = (0..self.shared.capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();
        let _ = self.shared.ring.set(ring);
        self.shared
            .state
            .compare_exchange(
                ChannelState::Uninitialized as u8,
                ChannelState::Attaching as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| ChannelError::Closed)?;
        // The consumer may already be gone; it then observes Closed.
        let _ = ready.send(());
        Ok(())
    }

    /// Wait until the consumer has attached.
    pub fn await_attached(
        &mut self,
        cancel: &CancelToken,
        poll: &PollConfig,
    ) -> Result<(), ChannelError> {
        if self.attached {
            return Ok(());
        }
        if self.ready_tx.is_some() {
            return Err(ChannelError::NotAttached);
        }
        let rx = &self.attached_rx;
        poll_until(cancel, poll, || match rx.try_recv() {
            Ok(()) => Ok(Some(())),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Closed),
        })?;
        self.attached = true;
        Ok(())
    }

    /// Write one block if the ring has room for it.
    pub fn try_write(&mut self, block: &[T]) -> Result<Transfer, ChannelError> {
        let shared = &*self.shared;
        if block.len() != shared.block {
            return Err(ChannelError::BlockSize {
                expected: shared.block,
                got: block.len(),
            });
        }
        match shared.state() {
            ChannelState::Steady => {}
            ChannelState::Closed => return Err(ChannelError::Closed),
            _ => return Err(ChannelError::NotAttached),
        }
        let available = shared.available.load(Ordering::Acquire);
        if shared.capacity - available < shared.block {
            return Ok(Transfer::WouldBlock);
        }
        let ring = shared.ring.get().ok_or(ChannelError::NotAttached)?;
        for (i, &value) in block.iter().enumerate() {
            let slot = &ring[(self.cursor + i) % shared.capacity];
            // SAFETY: the slot lies in the free region, which the consumer
            // does not touch until the increment below publishes it.
            unsafe { *slot.get() = value };
        }
        self.cursor = (self.cursor + shared.block) % shared.capacity;
        shared.available.fetch_add(shared.block, Ordering::Release);
        Ok(Transfer::Done)
    }

    /// Write one block, polling until there is room, the channel closes, or
    /// `cancel` fires.
    pub fn write_blocking(
        &mut self,
        block: &[T],
        cancel: &CancelToken,
        poll: &PollConfig,
    ) -> Result<(), ChannelError> {
        poll_until(cancel, poll, || match self.try_write(block)? {
            Transfer::Done => Ok(Some(())),
            Transfer::WouldBlock => Ok(None),
        })
    }

    pub fn has_room(&self) -> bool {
        let s = &*self.shared;
        s.state() == ChannelState::Steady
            && s.capacity - s.available.load(Ordering::Acquire) >= s.block
    }
}

// ── Consumer ────────────────────────────────────────────────────────────────

pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    cursor: usize,
    ready_rx: Receiver<()>,
    attached_tx: Option<Sender<()>>,
}

impl<T: Copy + Default + Send> Consumer<T> {
    /// Wait for the producer's ring, then complete the rendezvous.
    pub fn attach(&mut self, cancel: &CancelToken, poll: &PollConfig) -> Result<(), ChannelError> {
        let Some(attached) = self.attached_tx.take() else {
            return match self.shared.state() {
                ChannelState::Steady | ChannelState::Closed => Ok(()),
                _ => Err(ChannelError::NotAttached),
            };
        };
        let rx = &self.ready_rx;
        let waited = poll_until(cancel, poll, || match rx.try_recv() {
            Ok(()) => Ok(Some(())),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Closed),
        });
        if let Err(e) = waited {
            // Keep the signal so a later attach can retry after cancellation.
            self.attached_tx = Some(attached);
            return Err(e);
        }
        self.shared
            .state
            .compare_exchange(
                ChannelState::Attaching as u8,
                ChannelState::Steady as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| ChannelError::Closed)?;
        let _ = attached.send(());
        trace!(channel = %self.shared.name, "attached");
        Ok(())
    }

    /// Read one block if a whole block is buffered. After Close, buffered
    /// blocks still drain before `Closed` is reported.
    pub fn try_read(&mut self, out: &mut [T]) -> Result<Transfer, ChannelError> {
        let shared = &*self.shared;
        if out.len() != shared.block {
            return Err(ChannelError::BlockSize {
                expected: shared.block,
                got: out.len(),
            });
        }
        let mut available = shared.available.load(Ordering::Acquire);
        if available < shared.block {
            match shared.state() {
                ChannelState::Steady => return Ok(Transfer::WouldBlock),
                ChannelState::Closed => {
                    // Writes that raced the close are visible now.
                    available = shared.available.load(Ordering::Acquire);
                    if available < shared.block {
                        return Err(ChannelError::Closed);
                    }
                }
                _ => return Err(ChannelError::NotAttached),
            }
        }
        let ring = shared.ring.get().ok_or(ChannelError::NotAttached)?;
        for (i, slot) in out.iter_mut().enumerate() {
            let cell = &ring[(self.cursor + i) % shared.capacity];
            // SAFETY: the slot lies in the full region, which the producer
            // does not touch until the decrement below releases it.
            *slot = unsafe { *cell.get() };
        }
        self.cursor = (self.cursor + shared.block) % shared.capacity;
        shared.available.fetch_sub(shared.block, Ordering::Release);
        Ok(Transfer::Done)
    }

    /// Read one block, polling until data arrives, the channel is closed and
    /// drained, or `cancel` fires.
    pub fn read_blocking(
        &mut self,
        out: &mut [T],
        cancel: &CancelToken,
        poll: &PollConfig,
    ) -> Result<(), ChannelError> {
        poll_until(cancel, poll, || match self.try_read(out)? {
            Transfer::Done => Ok(Some(())),
            Transfer::WouldBlock => Ok(None),
        })
    }

    /// True if a whole block can be read, including after Close.
    pub fn has_data(&self) -> bool {
        let s = &*self.shared;
        matches!(s.state(), ChannelState::Steady | ChannelState::Closed)
            && s.available.load(Ordering::Acquire) >= s.block
    }
}

// ── Common endpoint surface ─────────────────────────────────────────────────

macro_rules! endpoint_common {
    ($endpoint:ident) => {
        impl<T> $endpoint<T> {
            pub fn name(&self) -> &str {
                &self.shared.name
            }

            pub fn capacity(&self) -> usize {
                self.shared.capacity
            }

            pub fn block_size(&self) -> usize {
                self.shared.block
            }

            /// Elements currently buffered.
            pub fn available(&self) -> usize {
                self.shared.available.load(Ordering::Acquire)
            }

            pub fn state(&self) -> ChannelState {
                self.shared.state()
            }

            pub fn close(&self) {
                self.shared.close();
            }

            pub fn is_closed(&self) -> bool {
                self.shared.state() == ChannelState::Closed
            }
        }

        impl<T> Drop for $endpoint<T> {
            fn drop(&mut self) {
                self.shared.close();
            }
        }

        impl<T> fmt::Debug for $endpoint<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($endpoint))
                    .field("name", &self.shared.name)
                    .field("state", &self.shared.state())
                    .field("available", &self.available())
                    .field("capacity", &self.shared.capacity)
                    .field("block_size", &self.shared.block)
                    .finish()
            }
        }
    };
}

endpoint_common!(Producer);
endpoint_common!(Consumer);

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair(capacity: usize, block: usize) -> (Producer<u32>, Consumer<u32>) {
        attached_pair(ChannelConfig::new("t", capacity, block)).unwrap()
    }

    #[test]
    fn rejects_capacity_below_block() {
        let err = channel::<u32>(ChannelConfig::new("t", 2, 3)).unwrap_err();
        assert_eq!(
            err,
            ChannelError::InvalidConfig {
                capacity: 2,
                block_size: 3
            }
        );
    }

    #[test]
    fn state_machine_walks_through_handshake() {
        let (mut tx, mut rx) = channel::<u32>(ChannelConfig::new("t", 4, 2)).unwrap();
        assert_eq!(tx.state(), ChannelState::Uninitialized);
        assert_eq!(tx.try_write(&[1, 2]), Err(ChannelError::NotAttached));
        tx.open().unwrap();
        assert_eq!(rx.state(), ChannelState::Attaching);
        let cancel = CancelToken::new();
        rx.attach(&cancel, &PollConfig::default()).unwrap();
        assert_eq!(rx.state(), ChannelState::Steady);
        tx.await_attached(&cancel, &PollConfig::default()).unwrap();
        tx.close();
        assert_eq!(rx.state(), ChannelState::Closed);
    }

    #[test]
    fn full_capacity_write_then_read() {
        let (mut tx, mut rx) = pair(10, 10);
        let block: Vec<u32> = (0..10).collect();
        assert_eq!(tx.try_write(&block), Ok(Transfer::Done));
        assert_eq!(tx.available(), 10);
        assert_eq!(tx.try_write(&block), Ok(Transfer::WouldBlock));
        let mut out = vec![0; 10];
        assert_eq!(rx.try_read(&mut out), Ok(Transfer::Done));
        assert_eq!(out, block);
        assert_eq!(rx.available(), 0);
        assert_eq!(rx.try_read(&mut out), Ok(Transfer::WouldBlock));
    }

    #[test]
    fn wraparound_preserves_order() {
        let (mut tx, mut rx) = pair(6, 4);
        let mut out = [0; 4];
        for round in 0..5u32 {
            let block = [round * 4, round * 4 + 1, round * 4 + 2, round * 4 + 3];
            assert_eq!(tx.try_write(&block), Ok(Transfer::Done));
            assert_eq!(rx.try_read(&mut out), Ok(Transfer::Done));
            assert_eq!(out, block);
        }
    }

    #[test]
    fn wrong_block_length_rejected() {
        let (mut tx, mut rx) = pair(4, 2);
        assert_eq!(
            tx.try_write(&[1, 2, 3]),
            Err(ChannelError::BlockSize {
                expected: 2,
                got: 3
            })
        );
        let mut out = [0; 1];
        assert!(matches!(
            rx.try_read(&mut out),
            Err(ChannelError::BlockSize { .. })
        ));
    }

    #[test]
    fn close_fails_writes_but_drains_reads() {
        let (mut tx, mut rx) = pair(4, 2);
        tx.try_write(&[1, 2]).unwrap();
        tx.close();
        assert_eq!(tx.try_write(&[3, 4]), Err(ChannelError::Closed));
        let mut out = [0; 2];
        assert!(rx.has_data());
        assert_eq!(rx.try_read(&mut out), Ok(Transfer::Done));
        assert_eq!(out, [1, 2]);
        assert_eq!(rx.try_read(&mut out), Err(ChannelError::Closed));
    }

    #[test]
    fn dropping_consumer_closes_producer() {
        let (mut tx, rx) = pair(4, 2);
        drop(rx);
        assert!(!tx.has_room());
        assert_eq!(tx.try_write(&[1, 2]), Err(ChannelError::Closed));
    }

    #[test]
    fn attach_after_producer_dropped_reports_closed() {
        let (tx, mut rx) = channel::<u32>(ChannelConfig::new("t", 4, 2)).unwrap();
        drop(tx);
        let err = rx.attach(&CancelToken::new(), &PollConfig::default());
        assert_eq!(err, Err(ChannelError::Closed));
    }

    #[test]
    fn cancelled_read_moves_nothing() {
        let (_tx, mut rx) = pair(4, 2);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut out = [9; 2];
        let got = rx.read_blocking(&mut out, &cancel, &PollConfig::default());
        assert_eq!(got, Err(ChannelError::Cancelled));
        assert_eq!(rx.available(), 0);
        assert_eq!(out, [9, 9]);
    }

    #[test]
    fn threaded_fifo() {
        let (mut tx, mut rx) = channel::<u32>(ChannelConfig::new("t", 8, 4)).unwrap();
        let cancel = CancelToken::new();
        let poll = PollConfig::default();
        let producer = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                tx.open().unwrap();
                tx.await_attached(&cancel, &poll).unwrap();
                for i in 0..1000u32 {
                    let block = [i * 4, i * 4 + 1, i * 4 + 2, i * 4 + 3];
                    tx.write_blocking(&block, &cancel, &poll).unwrap();
                }
            })
        };
        rx.attach(&cancel, &poll).unwrap();
        let mut expected = 0u32;
        let mut out = [0; 4];
        loop {
            match rx.read_blocking(&mut out, &cancel, &poll) {
                Ok(()) => {
                    for v in out {
                        assert_eq!(v, expected);
                        expected += 1;
                    }
                }
                Err(ChannelError::Closed) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        producer.join().unwrap();
        assert_eq!(expected, 4000);
    }
}
