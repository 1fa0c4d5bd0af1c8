// worker.rs — Partition unit: the per-thread activation loop
//
// A unit owns the consumer ends of its input Channels, the producer ends of
// its output Channels, and a kernel standing in for the partition's internal
// subgraph. Activation is all-or-nothing: every output must have room and
// every input must hold a block before anything moves. Local Channels (both
// ends in this unit) are not part of the firing rule: each activation reads
// the block the previous activation wrote, then writes a fresh one.
//
// Preconditions: one unit per partition; each Channel endpoint owned by
//                exactly one unit or bundle.
// Postconditions: on exit every owned endpoint is closed, so neighbours see
//                 end of stream (downstream) or a vanished reader (upstream).
// Failure modes: none surfaced as errors; the exit reason is reported in
//                `UnitReport`.
// Side effects: blocks in channel startup and in the poll loop of `run`.

use tracing::{debug, info};

use crate::channel::{ChannelError, Consumer, Producer, Transfer};
use crate::config::PollConfig;
use crate::id::PartitionId;
use crate::poll::{Backoff, CancelToken};

// ── Kernel ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Continue,
    /// The kernel has produced its last block; outputs close after it.
    Finished,
}

/// One activation's worth of computation: one block per input in, one block
/// per output out. Slice lengths equal the Channels' block sizes. Local
/// Channels follow the external ones in both slices.
pub trait Kernel<T>: Send {
    fn fire(&mut self, inputs: &[&[T]], outputs: &mut [&mut [T]]) -> KernelStatus;
}

impl<T, F> Kernel<T> for F
where
    F: FnMut(&[&[T]], &mut [&mut [T]]) -> KernelStatus + Send,
{
    fn fire(&mut self, inputs: &[&[T]], outputs: &mut [&mut [T]]) -> KernelStatus {
        self(inputs, outputs)
    }
}

// ── Reports ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// An input closed and drained.
    EndOfStream,
    /// An output's reader went away.
    DownstreamClosed,
    /// The kernel reported `Finished`.
    Finished,
    Cancelled,
    /// Startup failed for a reason other than close or cancellation.
    Fault(ChannelError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub partition: PartitionId,
    pub activations: u64,
    pub exit: UnitExit,
}

/// Result of one non-blocking activation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Fired,
    /// Some output lacked room or some input lacked data; nothing moved.
    Idle,
    Exit(UnitExit),
}

// ── Unit ────────────────────────────────────────────────────────────────────

pub struct PartitionUnit<T> {
    partition: PartitionId,
    inputs: Vec<Consumer<T>>,
    outputs: Vec<Producer<T>>,
    locals: Vec<(Producer<T>, Consumer<T>)>,
    kernel: Box<dyn Kernel<T>>,
    in_blocks: Vec<Vec<T>>,
    out_blocks: Vec<Vec<T>>,
    activations: u64,
}

impl<T: Copy + Default + Send + 'static> PartitionUnit<T> {
    pub fn new(
        partition: PartitionId,
        inputs: Vec<Consumer<T>>,
        outputs: Vec<Producer<T>>,
        kernel: Box<dyn Kernel<T>>,
    ) -> Self {
        let in_blocks = inputs
            .iter()
            .map(|c| vec![T::default(); c.block_size()])
            .collect();
        let out_blocks = outputs
            .iter()
            .map(|p| vec![T::default(); p.block_size()])
            .collect();
        PartitionUnit {
            partition,
            inputs,
            outputs,
            locals: Vec::new(),
            kernel,
            in_blocks,
            out_blocks,
            activations: 0,
        }
    }

    /// Channels whose producer and consumer both live in this unit. Their
    /// blocks are appended after the external inputs and outputs.
    pub fn with_locals(mut self, locals: Vec<(Producer<T>, Consumer<T>)>) -> Self {
        for (tx, rx) in &locals {
            self.in_blocks.push(vec![T::default(); rx.block_size()]);
            self.out_blocks.push(vec![T::default(); tx.block_size()]);
        }
        self.locals.extend(locals);
        self
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn activations(&self) -> u64 {
        self.activations
    }

    /// Two-phase startup: open every output, attach every input, then wait
    /// for every output's reader. Opening never blocks, so no ordering of
    /// peer threads can deadlock here.
    pub fn start(&mut self, cancel: &CancelToken, poll: &PollConfig) -> Result<(), UnitExit> {
        self.open_outputs()?;
        self.attach_inputs(cancel, poll)?;
        self.await_outputs(cancel, poll)
    }

    pub fn open_outputs(&mut self) -> Result<(), UnitExit> {
        for out in self.outputs.iter_mut().chain(self.locals.iter_mut().map(|(tx, _)| tx)) {
            out.open().map_err(|e| startup_exit(e, UnitExit::DownstreamClosed))?;
        }
        Ok(())
    }

    pub fn attach_inputs(&mut self, cancel: &CancelToken, poll: &PollConfig) -> Result<(), UnitExit> {
        let locals = self.locals.iter_mut().map(|(_, rx)| rx);
        for input in self.inputs.iter_mut().chain(locals) {
            input
                .attach(cancel, poll)
                .map_err(|e| startup_exit(e, UnitExit::EndOfStream))?;
        }
        Ok(())
    }

    pub fn await_outputs(&mut self, cancel: &CancelToken, poll: &PollConfig) -> Result<(), UnitExit> {
        let locals = self.locals.iter_mut().map(|(tx, _)| tx);
        for out in self.outputs.iter_mut().chain(locals) {
            out.await_attached(cancel, poll)
                .map_err(|e| startup_exit(e, UnitExit::DownstreamClosed))?;
        }
        Ok(())
    }

    /// Attempt one activation without blocking.
    pub fn try_activate(&mut self) -> Activation {
        if self.inputs.is_empty() && self.outputs.is_empty() && self.locals.is_empty() {
            return Activation::Exit(UnitExit::Finished);
        }
        if self.outputs.iter().any(|o| o.is_closed()) {
            return Activation::Exit(UnitExit::DownstreamClosed);
        }
        if !self.outputs.iter().all(|o| o.has_room()) {
            return Activation::Idle;
        }
        if !self.inputs.iter().all(|i| i.has_data()) {
            if self.inputs.iter().any(|i| i.is_closed() && !i.has_data()) {
                return Activation::Exit(UnitExit::EndOfStream);
            }
            return Activation::Idle;
        }

        for (input, block) in self.inputs.iter_mut().zip(&mut self.in_blocks) {
            match input.try_read(block) {
                Ok(Transfer::Done) => {}
                Ok(Transfer::WouldBlock) => return Activation::Idle,
                Err(ChannelError::Closed) => return Activation::Exit(UnitExit::EndOfStream),
                Err(e) => return Activation::Exit(UnitExit::Fault(e)),
            }
        }
        let n_in = self.inputs.len();
        for ((_, rx), block) in self.locals.iter_mut().zip(&mut self.in_blocks[n_in..]) {
            match rx.try_read(block) {
                Ok(Transfer::Done) => {}
                // First activation: nothing written yet.
                Ok(Transfer::WouldBlock) => block.fill(T::default()),
                Err(e) => return Activation::Exit(UnitExit::Fault(e)),
            }
        }

        let ins: Vec<&[T]> = self.in_blocks.iter().map(Vec::as_slice).collect();
        let mut outs: Vec<&mut [T]> = self.out_blocks.iter_mut().map(Vec::as_mut_slice).collect();
        let status = self.kernel.fire(&ins, &mut outs);

        for (out, block) in self.outputs.iter_mut().zip(&self.out_blocks) {
            match out.try_write(block) {
                Ok(Transfer::Done) => {}
                // Room was checked and this unit is the only writer.
                Ok(Transfer::WouldBlock) => {
                    return Activation::Exit(UnitExit::Fault(ChannelError::NotAttached))
                }
                Err(ChannelError::Closed) => {
                    return Activation::Exit(UnitExit::DownstreamClosed)
                }
                Err(e) => return Activation::Exit(UnitExit::Fault(e)),
            }
        }
        // The local was drained above, so it always has room for one block.
        let n_out = self.outputs.len();
        for ((tx, _), block) in self.locals.iter_mut().zip(&self.out_blocks[n_out..]) {
            match tx.try_write(block) {
                Ok(Transfer::Done) => {}
                Ok(Transfer::WouldBlock) => {
                    return Activation::Exit(UnitExit::Fault(ChannelError::NotAttached))
                }
                Err(e) => return Activation::Exit(UnitExit::Fault(e)),
            }
        }
        self.activations += 1;

        match status {
            KernelStatus::Continue => Activation::Fired,
            KernelStatus::Finished => Activation::Exit(UnitExit::Finished),
        }
    }

    /// Start, then activate until end of stream or cancellation. Every owned
    /// endpoint is closed before returning.
    pub fn run(mut self, cancel: &CancelToken, poll: &PollConfig) -> UnitReport {
        info!(partition = %self.partition, "unit starting");
        let exit = match self.start(cancel, poll) {
            Err(exit) => exit,
            Ok(()) => self.activation_loop(cancel, poll),
        };
        self.close_all(&exit);
        info!(
            partition = %self.partition,
            activations = self.activations,
            exit = ?exit,
            "unit exited"
        );
        UnitReport {
            partition: self.partition,
            activations: self.activations,
            exit,
        }
    }

    fn activation_loop(&mut self, cancel: &CancelToken, poll: &PollConfig) -> UnitExit {
        let mut backoff = Backoff::new(*poll);
        loop {
            if cancel.is_cancelled() {
                return UnitExit::Cancelled;
            }
            match self.try_activate() {
                Activation::Fired => backoff.reset(),
                Activation::Idle => backoff.snooze(),
                Activation::Exit(exit) => return exit,
            }
        }
    }

    pub(crate) fn close_all(&self, exit: &UnitExit) {
        debug!(
            partition = %self.partition,
            inputs = self.inputs.len(),
            outputs = self.outputs.len(),
            locals = self.locals.len(),
            reason = ?exit,
            "closing channels"
        );
        for out in &self.outputs {
            out.close();
        }
        for input in &self.inputs {
            input.close();
        }
        for (tx, rx) in &self.locals {
            tx.close();
            rx.close();
        }
    }
}

pub(crate) fn startup_exit(err: ChannelError, closed: UnitExit) -> UnitExit {
    match err {
        ChannelError::Closed => closed,
        ChannelError::Cancelled => UnitExit::Cancelled,
        other => UnitExit::Fault(other),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
