// bridge.rs — External I/O Bridge (runtime side)
//
// The I/O partition's thread. Each bundle is double-buffered between its
// external transport and its internal Channels: an external frame buffer and
// an internal block buffer, each with a filled flag. One `step` applies:
//
//   1. external full, internal empty      → decode frame into blocks
//   2. otherwise, transport ready, external empty → read one frame
//   3. independently, internal full, Channels ready → move the blocks
//
// (mirrored for output bundles). A slow transport never stalls the Channel
// side and vice versa.
//
// Failure modes: `BridgeError` (transport failures, unexpected channel
// faults). End of stream on either side is a normal exit.
// Side effects: transport I/O; closes every owned Channel on exit.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, Consumer, Producer, Transfer};
use crate::config::PollConfig;
use crate::graph::IoDirection;
use crate::poll::{Backoff, CancelToken};
use crate::sample::{decode_block, encode_block, Sample};
use crate::transport::{FrameRead, Transport, TransportError};
use crate::worker::{Activation, PartitionUnit, UnitExit, UnitReport};

// ── Errors and reports ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bundle '{bundle}': {source}")]
    Transport {
        bundle: String,
        #[source]
        source: TransportError,
    },
    #[error("bundle '{bundle}': {source}")]
    Channel {
        bundle: String,
        #[source]
        source: ChannelError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStep {
    Progress,
    Idle,
    Ended,
}

#[derive(Debug)]
pub enum BridgeExit {
    /// Every bundle reached end of stream.
    Drained,
    Cancelled,
    Failed(BridgeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReport {
    pub name: String,
    pub direction: IoDirection,
    pub frames: u64,
}

#[derive(Debug)]
pub struct BridgeReport {
    pub bundles: Vec<BundleReport>,
    pub unit: Option<UnitReport>,
    pub exit: BridgeExit,
}

// ── Input bundle ────────────────────────────────────────────────────────────

struct InputMember<T> {
    offset: usize,
    block: Vec<T>,
    outputs: Vec<Producer<T>>,
}

/// External frames in, Channel blocks out.
pub struct InputBundle<T> {
    name: String,
    transport: Box<dyn Transport>,
    members: Vec<InputMember<T>>,
    frame: Vec<u8>,
    external_filled: bool,
    internal_filled: bool,
    eof: bool,
    ended: bool,
    frames: u64,
}

impl<T: Sample> InputBundle<T> {
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        InputBundle {
            name: name.into(),
            transport,
            members: Vec::new(),
            frame: Vec::new(),
            external_filled: false,
            internal_filled: false,
            eof: false,
            ended: false,
            frames: 0,
        }
    }

    /// Append the next member. Every producer receives the same block.
    pub fn member(mut self, block_size: usize, outputs: Vec<Producer<T>>) -> Self {
        let offset = self.frame.len();
        self.frame.resize(offset + block_size * T::WIDTH, 0);
        self.members.push(InputMember {
            offset,
            block: vec![T::default(); block_size],
            outputs,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame.len()
    }

    pub fn external_filled(&self) -> bool {
        self.external_filled
    }

    pub fn internal_filled(&self) -> bool {
        self.internal_filled
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn open(&mut self) -> Result<(), ChannelError> {
        for p in self.members.iter_mut().flat_map(|m| &mut m.outputs) {
            p.open()?;
        }
        Ok(())
    }

    pub fn await_attached(
        &mut self,
        cancel: &CancelToken,
        poll: &PollConfig,
    ) -> Result<(), ChannelError> {
        for p in self.members.iter_mut().flat_map(|m| &mut m.outputs) {
            p.await_attached(cancel, poll)?;
        }
        Ok(())
    }

    pub fn step(&mut self) -> Result<BundleStep, BridgeError> {
        if self.ended {
            return Ok(BundleStep::Ended);
        }
        let mut progress = false;

        if self.external_filled && !self.internal_filled {
            for m in &mut self.members {
                let bytes = m.block.len() * T::WIDTH;
                decode_block(&self.frame[m.offset..m.offset + bytes], &mut m.block);
            }
            self.external_filled = false;
            self.internal_filled = true;
            progress = true;
        } else if !self.external_filled && !self.eof && self.poll_readable()? {
            match self.transport.read_frame(&mut self.frame) {
                Ok(FrameRead::Frame) => {
                    self.external_filled = true;
                    self.frames += 1;
                }
                Ok(FrameRead::Eof) => {
                    debug!(bundle = %self.name, frames = self.frames, "input transport ended");
                    self.eof = true;
                }
                Err(source) => {
                    return Err(BridgeError::Transport {
                        bundle: self.name.clone(),
                        source,
                    })
                }
            }
            progress = true;
        }

        if self.internal_filled {
            if self.producers().any(|p| p.is_closed()) {
                debug!(bundle = %self.name, "reader gone, ending bundle");
                self.close();
                return Ok(BundleStep::Ended);
            }
            if self.producers().all(|p| p.has_room()) {
                for m in &mut self.members {
                    for p in &mut m.outputs {
                        expect_done(&self.name, p.try_write(&m.block))?;
                    }
                }
                self.internal_filled = false;
                progress = true;
            }
        }

        if self.eof && !self.external_filled && !self.internal_filled {
            self.close();
            return Ok(BundleStep::Ended);
        }
        Ok(if progress {
            BundleStep::Progress
        } else {
            BundleStep::Idle
        })
    }

    pub fn close(&mut self) {
        self.ended = true;
        for p in self.producers() {
            p.close();
        }
    }

    fn producers(&self) -> impl Iterator<Item = &Producer<T>> {
        self.members.iter().flat_map(|m| &m.outputs)
    }

    fn poll_readable(&mut self) -> Result<bool, BridgeError> {
        self.transport
            .poll_readable()
            .map_err(|source| BridgeError::Transport {
                bundle: self.name.clone(),
                source,
            })
    }
}

// ── Output bundle ───────────────────────────────────────────────────────────

struct OutputMember<T> {
    offset: usize,
    block: Vec<T>,
    input: Consumer<T>,
}

/// Channel blocks in, external frames out.
pub struct OutputBundle<T> {
    name: String,
    transport: Box<dyn Transport>,
    members: Vec<OutputMember<T>>,
    frame: Vec<u8>,
    external_filled: bool,
    internal_filled: bool,
    upstream_done: bool,
    ended: bool,
    frames: u64,
}

impl<T: Sample> OutputBundle<T> {
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        OutputBundle {
            name: name.into(),
            transport,
            members: Vec::new(),
            frame: Vec::new(),
            external_filled: false,
            internal_filled: false,
            upstream_done: false,
            ended: false,
            frames: 0,
        }
    }

    pub fn member(mut self, input: Consumer<T>) -> Self {
        let block_size = input.block_size();
        let offset = self.frame.len();
        self.frame.resize(offset + block_size * T::WIDTH, 0);
        self.members.push(OutputMember {
            offset,
            block: vec![T::default(); block_size],
            input,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn external_filled(&self) -> bool {
        self.external_filled
    }

    pub fn internal_filled(&self) -> bool {
        self.internal_filled
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn attach(&mut self, cancel: &CancelToken, poll: &PollConfig) -> Result<(), ChannelError> {
        for m in &mut self.members {
            m.input.attach(cancel, poll)?;
        }
        Ok(())
    }

    pub fn step(&mut self) -> Result<BundleStep, BridgeError> {
        if self.ended {
            return Ok(BundleStep::Ended);
        }
        let mut progress = false;

        if self.internal_filled && !self.external_filled {
            for m in &self.members {
                let bytes = m.block.len() * T::WIDTH;
                encode_block(&m.block, &mut self.frame[m.offset..m.offset + bytes]);
            }
            self.internal_filled = false;
            self.external_filled = true;
            progress = true;
        } else if self.external_filled && self.transport_call(|t| t.poll_writable())? {
            let frame = &self.frame;
            let sent = self.transport.write_frame(frame);
            sent.map_err(|source| BridgeError::Transport {
                bundle: self.name.clone(),
                source,
            })?;
            self.external_filled = false;
            self.frames += 1;
            progress = true;
        }

        if !self.internal_filled && !self.upstream_done {
            if self.members.iter().all(|m| m.input.has_data()) {
                for m in &mut self.members {
                    expect_done(&self.name, m.input.try_read(&mut m.block))?;
                }
                self.internal_filled = true;
                progress = true;
            } else if self
                .members
                .iter()
                .any(|m| m.input.is_closed() && !m.input.has_data())
            {
                debug!(bundle = %self.name, frames = self.frames, "upstream ended");
                self.upstream_done = true;
            }
        }

        if self.upstream_done && !self.internal_filled && !self.external_filled {
            self.transport_call(|t| t.shutdown())?;
            self.close();
            return Ok(BundleStep::Ended);
        }
        Ok(if progress {
            BundleStep::Progress
        } else {
            BundleStep::Idle
        })
    }

    pub fn close(&mut self) {
        self.ended = true;
        for m in &self.members {
            m.input.close();
        }
    }

    fn transport_call<R>(
        &mut self,
        f: impl FnOnce(&mut Box<dyn Transport>) -> Result<R, TransportError>,
    ) -> Result<R, BridgeError> {
        f(&mut self.transport).map_err(|source| BridgeError::Transport {
            bundle: self.name.clone(),
            source,
        })
    }
}

/// Room or data was checked first and this side is the only writer or
/// reader, so a transfer that does not complete is a fault.
fn expect_done(bundle: &str, r: Result<Transfer, ChannelError>) -> Result<(), BridgeError> {
    match r {
        Ok(Transfer::Done) => Ok(()),
        Ok(Transfer::WouldBlock) => Err(BridgeError::Channel {
            bundle: bundle.to_string(),
            source: ChannelError::NotAttached,
        }),
        Err(source) => Err(BridgeError::Channel {
            bundle: bundle.to_string(),
            source,
        }),
    }
}

// ── Bundle dispatch ─────────────────────────────────────────────────────────

pub enum Bundle<T> {
    Input(InputBundle<T>),
    Output(OutputBundle<T>),
}

impl<T> From<InputBundle<T>> for Bundle<T> {
    fn from(b: InputBundle<T>) -> Self {
        Bundle::Input(b)
    }
}

impl<T> From<OutputBundle<T>> for Bundle<T> {
    fn from(b: OutputBundle<T>) -> Self {
        Bundle::Output(b)
    }
}

impl<T: Sample> Bundle<T> {
    fn name(&self) -> &str {
        match self {
            Bundle::Input(b) => b.name(),
            Bundle::Output(b) => b.name(),
        }
    }

    fn step(&mut self) -> Result<BundleStep, BridgeError> {
        match self {
            Bundle::Input(b) => b.step(),
            Bundle::Output(b) => b.step(),
        }
    }

    fn close(&mut self) {
        match self {
            Bundle::Input(b) => b.close(),
            Bundle::Output(b) => b.close(),
        }
    }

    fn report(&self) -> BundleReport {
        let (direction, frames) = match self {
            Bundle::Input(b) => (IoDirection::In, b.frames()),
            Bundle::Output(b) => (IoDirection::Out, b.frames()),
        };
        BundleReport {
            name: self.name().to_string(),
            direction,
            frames,
        }
    }
}

// ── Bridge thread body ──────────────────────────────────────────────────────

/// Everything the I/O partition's thread drives: its bundles plus the unit
/// for the partition's internal nodes, if any.
pub struct IoBridge<T> {
    bundles: Vec<Bundle<T>>,
    unit: Option<PartitionUnit<T>>,
    unit_exit: Option<UnitExit>,
}

impl<T: Sample> Default for IoBridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Sample> IoBridge<T> {
    pub fn new() -> Self {
        IoBridge {
            bundles: Vec::new(),
            unit: None,
            unit_exit: None,
        }
    }

    pub fn with_bundle(mut self, bundle: impl Into<Bundle<T>>) -> Self {
        self.bundles.push(bundle.into());
        self
    }

    pub fn with_unit(mut self, unit: PartitionUnit<T>) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn run(mut self, cancel: &CancelToken, poll: &PollConfig) -> BridgeReport {
        info!(bundles = self.bundles.len(), unit = self.unit.is_some(), "io bridge starting");
        let exit = match self.start(cancel, poll) {
            Err(exit) => exit,
            Ok(()) => self.pump(cancel, poll),
        };
        if let BridgeExit::Failed(e) = &exit {
            warn!(error = %e, "io bridge failed");
        }
        for b in &mut self.bundles {
            b.close();
        }
        let unit = self.unit.take().map(|u| {
            let exit = self.unit_exit.take().unwrap_or(UnitExit::Cancelled);
            u.close_all(&exit);
            UnitReport {
                partition: u.partition(),
                activations: u.activations(),
                exit,
            }
        });
        let bundles: Vec<BundleReport> = self.bundles.iter().map(Bundle::report).collect();
        info!(exit = ?exit, "io bridge exited");
        BridgeReport {
            bundles,
            unit,
            exit,
        }
    }

    /// Same two-phase startup as a partition unit, across every bundle and
    /// the internal unit together.
    fn start(&mut self, cancel: &CancelToken, poll: &PollConfig) -> Result<(), BridgeExit> {
        for b in &mut self.bundles {
            if let Bundle::Input(ib) = b {
                let r = ib.open();
                settle(b, r)?;
            }
        }
        self.unit_phase(|u| u.open_outputs())?;
        for b in &mut self.bundles {
            if let Bundle::Output(ob) = b {
                let r = ob.attach(cancel, poll);
                settle(b, r)?;
            }
        }
        self.unit_phase(|u| u.attach_inputs(cancel, poll))?;
        for b in &mut self.bundles {
            if let Bundle::Input(ib) = b {
                let r = ib.await_attached(cancel, poll);
                settle(b, r)?;
            }
        }
        self.unit_phase(|u| u.await_outputs(cancel, poll))
    }

    fn unit_phase(
        &mut self,
        phase: impl FnOnce(&mut PartitionUnit<T>) -> Result<(), UnitExit>,
    ) -> Result<(), BridgeExit> {
        let Some(unit) = self.unit.as_mut() else {
            return Ok(());
        };
        if self.unit_exit.is_some() {
            return Ok(());
        }
        match phase(unit) {
            Ok(()) => Ok(()),
            Err(UnitExit::Cancelled) => Err(BridgeExit::Cancelled),
            Err(exit) => {
                unit.close_all(&exit);
                self.unit_exit = Some(exit);
                Ok(())
            }
        }
    }

    fn pump(&mut self, cancel: &CancelToken, poll: &PollConfig) -> BridgeExit {
        let mut backoff = Backoff::new(*poll);
        loop {
            if cancel.is_cancelled() {
                return BridgeExit::Cancelled;
            }
            let mut progress = false;
            let mut all_ended = true;
            for b in &mut self.bundles {
                match b.step() {
                    Ok(BundleStep::Progress) => {
                        progress = true;
                        all_ended = false;
                    }
                    Ok(BundleStep::Idle) => all_ended = false,
                    Ok(BundleStep::Ended) => {}
                    Err(e) => return BridgeExit::Failed(e),
                }
            }
            if self.unit_exit.is_none() {
                if let Some(unit) = self.unit.as_mut() {
                    match unit.try_activate() {
                        Activation::Fired => progress = true,
                        Activation::Idle => {}
                        Activation::Exit(exit) => {
                            unit.close_all(&exit);
                            self.unit_exit = Some(exit);
                            progress = true;
                        }
                    }
                }
            }
            let unit_done = self.unit.is_none() || self.unit_exit.is_some();
            if all_ended && unit_done {
                return BridgeExit::Drained;
            }
            if progress {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
    }
}

fn settle<T: Sample>(bundle: &mut Bundle<T>, r: Result<(), ChannelError>) -> Result<(), BridgeExit> {
    match r {
        Ok(()) => Ok(()),
        Err(ChannelError::Cancelled) => Err(BridgeExit::Cancelled),
        Err(ChannelError::Closed) => {
            debug!(bundle = %bundle.name(), "peer closed during startup");
            bundle.close();
            Ok(())
        }
        Err(source) => Err(BridgeExit::Failed(BridgeError::Channel {
            bundle: bundle.name().to_string(),
            source,
        })),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{attached_pair, ChannelConfig};
    use crate::transport::memory_link;

    fn pair(cap: usize, block: usize) -> (Producer<f32>, Consumer<f32>) {
        attached_pair(ChannelConfig::new("t", cap, block)).unwrap()
    }

    fn frame(values: &[f32]) -> Vec<u8> {
        let mut bytes = vec![0u8; values.len() * 4];
        encode_block(values, &mut bytes);
        bytes
    }

    #[test]
    fn copy_to_internal_does_not_wait_for_channel_room() {
        let (host, link) = memory_link(4);
        let (tx, rx) = pair(2, 2);
        let mut bundle = InputBundle::new("adc", Box::new(link)).member(2, vec![tx]);
        bundle.frame.copy_from_slice(&frame(&[1.0, 2.0]));
        bundle.external_filled = true;
        // Fill the channel so it has no room.
        bundle.members[0].outputs[0].try_write(&[0.0, 0.0]).unwrap();

        assert_eq!(bundle.step().unwrap(), BundleStep::Progress);
        assert!(bundle.internal_filled());
        assert!(!bundle.external_filled());
        assert_eq!(rx.available(), 2);
        drop(host);
    }

    #[test]
    fn input_frames_reach_channels_in_member_order() {
        let (mut host, link) = memory_link(4);
        let (tx_a, mut rx_a) = pair(4, 1);
        let (tx_b, mut rx_b) = pair(4, 2);
        let mut bundle = InputBundle::new("rx", Box::new(link))
            .member(1, vec![tx_a])
            .member(2, vec![tx_b]);
        assert_eq!(bundle.frame_bytes(), 12);
        host.write_frame(&frame(&[7.0, 8.0, 9.0])).unwrap();
        drop(host);

        let mut steps = 0;
        while bundle.step().unwrap() != BundleStep::Ended {
            steps += 1;
            assert!(steps < 10);
        }
        assert_eq!(bundle.frames(), 1);
        let mut a = [0.0; 1];
        let mut b = [0.0; 2];
        assert_eq!(rx_a.try_read(&mut a), Ok(Transfer::Done));
        assert_eq!(rx_b.try_read(&mut b), Ok(Transfer::Done));
        assert_eq!(a, [7.0]);
        assert_eq!(b, [8.0, 9.0]);
        assert_eq!(rx_a.try_read(&mut a), Err(ChannelError::Closed));
    }

    #[test]
    fn fan_out_member_feeds_every_channel() {
        let (mut host, link) = memory_link(1);
        let (tx_a, mut rx_a) = pair(2, 2);
        let (tx_b, mut rx_b) = pair(2, 2);
        let mut bundle = InputBundle::new("rx", Box::new(link)).member(2, vec![tx_a, tx_b]);
        host.write_frame(&frame(&[3.0, 4.0])).unwrap();
        bundle.step().unwrap();
        bundle.step().unwrap();
        let mut out = [0.0; 2];
        rx_a.try_read(&mut out).unwrap();
        assert_eq!(out, [3.0, 4.0]);
        rx_b.try_read(&mut out).unwrap();
        assert_eq!(out, [3.0, 4.0]);
    }

    #[test]
    fn output_bundle_frames_blocks_and_signals_eof() {
        let (mut host, link) = memory_link(4);
        let (mut tx, rx) = pair(4, 2);
        let mut bundle = OutputBundle::new("dac", Box::new(link)).member(rx);
        tx.try_write(&[0.5, -0.5]).unwrap();
        tx.close();

        let mut steps = 0;
        while bundle.step().unwrap() != BundleStep::Ended {
            steps += 1;
            assert!(steps < 10);
        }
        assert_eq!(bundle.frames(), 1);
        let mut buf = [0u8; 8];
        assert_eq!(host.read_frame(&mut buf).unwrap(), FrameRead::Frame);
        assert_eq!(buf.to_vec(), frame(&[0.5, -0.5]));
        assert_eq!(host.read_frame(&mut buf).unwrap(), FrameRead::Eof);
    }

    #[test]
    fn bridge_loops_input_to_output() {
        let (mut host_in, link_in) = memory_link(8);
        let (mut host_out, link_out) = memory_link(8);
        let (tx, rx) = channel_pair_unopened();
        let bridge = IoBridge::new()
            .with_bundle(InputBundle::new("adc", Box::new(link_in)).member(1, vec![tx]))
            .with_bundle(OutputBundle::new("dac", Box::new(link_out)).member(rx));
        for v in [1.0f32, 2.0, 3.0] {
            host_in.write_frame(&frame(&[v])).unwrap();
        }
        drop(host_in);

        let report = bridge.run(&CancelToken::new(), &PollConfig::default());
        assert!(matches!(report.exit, BridgeExit::Drained), "{:?}", report.exit);
        assert_eq!(report.bundles[0].frames, 3);
        assert_eq!(report.bundles[1].frames, 3);
        let mut buf = [0u8; 4];
        let mut got = Vec::new();
        while host_out.read_frame(&mut buf).unwrap() == FrameRead::Frame {
            got.push(f32::decode(&buf));
        }
        assert_eq!(got, vec![1.0, 2.0, 3.0]);
    }

    fn channel_pair_unopened() -> (Producer<f32>, Consumer<f32>) {
        crate::channel::channel(ChannelConfig::new("loop", 2, 1)).unwrap()
    }

    #[test]
    fn transport_error_fails_bridge() {
        let (mut host, link) = memory_link(1);
        let (tx, _rx) = pair(4, 2);
        host.write_frame(&[0u8; 3]).unwrap();
        let mut bundle = InputBundle::new("adc", Box::new(link)).member(2, vec![tx]);
        assert!(matches!(
            bundle.step(),
            Err(BridgeError::Transport {
                source: TransportError::FrameSize { .. },
                ..
            })
        ));
    }
}
