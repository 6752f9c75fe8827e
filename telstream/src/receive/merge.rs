//! Dual-stream merge receiver.
//!
//! Two workers each receive one sub-stream and fill one half of the open
//! block; a coordinator owns the channel and rotates blocks once both halves
//! are handed back.
//!
//! ```text
//!               open block (bufsz)
//!   ┌──────────────────────┬──────────────────────┐
//!   │ half 0 (worker 0)    │ half 1 (worker 1)    │
//!   └──────────────────────┴──────────────────────┘
//!        ^ stream _0 offsets     ^ stream _1 offsets
//!          [k·half, (k+1)·half)    [k·half, (k+1)·half)
//! ```
//!
//! All shared state lives behind one mutex with one condition variable:
//! the halves on offer, the halves handed back (`filled`), which workers have
//! left the observation, and the control command. A worker never waits for
//! rotation unless a packet lands beyond its overflow window; packets for the
//! next block are staged in a private overflow buffer and flushed into the
//! start of the next half.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::config::{DEFAULT_MAX_BLOCK_SKIP, MergeConfig, check_block_geometry, observation_header};
use super::{IDLE_SLEEP, PACKET_SLACK, ReceiveError, check_packet_size};
use crate::control::{CommandTarget, ControlCommand, ControlError, ControlMessage, ControlState, lock};
use crate::format::{Decoded, PacketFormat};
use crate::header::AsciiHeader;
use crate::ipc::{RingBufferChannel, RingError, Role, WriteBlock};
use crate::net::DatagramSource;
use crate::stats::IngestStats;
use crate::trace::{debug, error, info, trace, warn};

/// A half handed back by a worker, with its valid byte count.
type Returned = (WriteBlock, usize);

#[derive(Debug)]
struct MergeState {
    state: ControlState,
    pending: Option<AsciiHeader>,
    /// Incremented each time an observation begins.
    observation: u64,
    header: Option<Arc<AsciiHeader>>,
    offered: [Option<WriteBlock>; 2],
    returned: [Option<Returned>; 2],
    left: [bool; 2],
    failed: bool,
}

impl MergeState {
    fn filled(&self) -> [bool; 2] {
        [self.returned[0].is_some(), self.returned[1].is_some()]
    }
}

/// Shared state of a [`MergeReceiver`], and its control target.
#[derive(Debug)]
pub struct MergeControl {
    /// Mirror of the command for lock-free polling; written under the lock.
    command: AtomicU8,
    inner: Mutex<MergeState>,
    cond: Condvar,
}

/// What the coordinator collected for the open block.
enum Collected {
    Halves {
        halves: [Option<Returned>; 2],
        /// Both workers have left the observation.
        last: bool,
    },
    Stalled {
        filled: [bool; 2],
    },
}

impl Default for MergeControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeControl {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            command: AtomicU8::new(ControlCommand::None as u8),
            inner: Mutex::new(MergeState {
                state: ControlState::Idle,
                pending: None,
                observation: 0,
                header: None,
                offered: [None, None],
                returned: [None, None],
                left: [true, true],
                failed: false,
            }),
            cond: Condvar::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn command(&self) -> ControlCommand {
        ControlCommand::from_u8(self.command.load(Ordering::Acquire))
    }

    #[inline]
    fn stopping(&self) -> bool {
        matches!(self.command(), ControlCommand::Stop | ControlCommand::Quit)
    }

    fn set_command(&self, command: ControlCommand) {
        self.command.store(command as u8, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, MergeState> {
        lock(&self.inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, MergeState>) -> MutexGuard<'a, MergeState> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> ControlState {
        self.lock().state
    }

    /// Which halves of the open block have been handed back.
    #[must_use]
    pub fn filled(&self) -> [bool; 2] {
        self.lock().filled()
    }

    pub fn request_stop(&self) {
        let _ = self.deliver(ControlMessage::Stop);
    }

    pub fn request_quit(&self) {
        let _ = self.deliver(ControlMessage::Quit);
    }

    /// Stops the observation from inside the receiver.
    fn halt(&self) {
        let mut inner = self.lock();
        if inner.state == ControlState::Active {
            inner.state = ControlState::Stopping;
        }
        if !self.stopping() {
            self.set_command(ControlCommand::Stop);
        }
        self.cond.notify_all();
    }

    fn quit(&self) {
        let _guard = self.lock();
        self.set_command(ControlCommand::Quit);
        self.cond.notify_all();
    }

    // Coordinator side.

    fn wait_for_start(&self) -> Option<AsciiHeader> {
        let mut inner = self.lock();
        loop {
            match self.command() {
                ControlCommand::Quit => return None,
                ControlCommand::Start => {
                    let header = inner.pending.take().unwrap_or_default();
                    inner.state = ControlState::Active;
                    self.set_command(ControlCommand::None);
                    return Some(header);
                }
                _ => inner = self.wait(inner),
            }
        }
    }

    fn begin_observation(&self, header: AsciiHeader, halves: (WriteBlock, WriteBlock)) {
        let mut inner = self.lock();
        inner.observation += 1;
        inner.header = Some(Arc::new(header));
        inner.offered = [Some(halves.0), Some(halves.1)];
        inner.returned = [None, None];
        inner.left = [false, false];
        inner.failed = false;
        self.cond.notify_all();
    }

    fn offer(&self, halves: (WriteBlock, WriteBlock)) {
        let mut inner = self.lock();
        inner.offered = [Some(halves.0), Some(halves.1)];
        self.cond.notify_all();
    }

    /// Waits until every worker has handed back its half or left.
    ///
    /// With a stall timeout, gives up once one half has been handed back and
    /// the other has not followed within the timeout.
    fn collect(&self, stall_timeout: Option<Duration>) -> Collected {
        let mut deadline = None;
        let mut inner = self.lock();
        loop {
            if (0..2).all(|p| inner.returned[p].is_some() || inner.left[p]) {
                let state = &mut *inner;
                let halves = [0, 1].map(|p| {
                    state.returned[p].take().or_else(|| {
                        // Unclaimed by a worker that left.
                        state.offered[p].take().map(|mut half| {
                            half.as_mut_slice().fill(0);
                            (half, 0)
                        })
                    })
                });
                let last = state.left == [true, true];
                return Collected::Halves { halves, last };
            }

            if deadline.is_none()
                && let Some(timeout) = stall_timeout
                && inner.filled().contains(&true)
            {
                deadline = Some(Instant::now() + timeout);
            }
            inner = match deadline {
                None => self.wait(inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Collected::Stalled {
                            filled: inner.filled(),
                        };
                    }
                    self.cond
                        .wait_timeout(inner, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Waits for both workers to leave, then returns to Idle.
    ///
    /// Returns whether a worker failed during the observation.
    fn finish_observation(&self) -> bool {
        let mut inner = self.lock();
        while inner.left != [true, true] {
            inner = self.wait(inner);
        }
        inner.state = ControlState::Idle;
        inner.header = None;
        inner.offered = [None, None];
        inner.returned = [None, None];
        if self.command() == ControlCommand::Stop {
            self.set_command(ControlCommand::None);
        }
        self.cond.notify_all();
        inner.failed
    }

    // Worker side.

    fn wait_for_observation(&self, seen: u64) -> Option<(u64, Arc<AsciiHeader>)> {
        let mut inner = self.lock();
        loop {
            if self.command() == ControlCommand::Quit {
                return None;
            }
            if inner.observation > seen
                && let Some(header) = &inner.header
            {
                return Some((inner.observation, Arc::clone(header)));
            }
            inner = self.wait(inner);
        }
    }

    fn take_half(&self, worker: usize, wait: bool) -> Option<WriteBlock> {
        let mut inner = self.lock();
        loop {
            if self.stopping() {
                return None;
            }
            if let Some(half) = inner.offered[worker].take() {
                return Some(half);
            }
            if !wait {
                return None;
            }
            inner = self.wait(inner);
        }
    }

    fn return_half(&self, worker: usize, half: WriteBlock, bytes: usize) {
        let mut inner = self.lock();
        inner.returned[worker] = Some((half, bytes));
        self.cond.notify_all();
    }

    fn leave(&self, worker: usize, failed: bool) {
        let mut inner = self.lock();
        inner.left[worker] = true;
        if failed {
            inner.failed = true;
            if !self.stopping() {
                self.set_command(ControlCommand::Stop);
            }
        }
        self.cond.notify_all();
    }
}

impl CommandTarget for MergeControl {
    fn deliver(&self, message: ControlMessage) -> Result<(), ControlError> {
        let mut inner = self.lock();
        let command = message.command();
        match message {
            ControlMessage::Start(header) => {
                if inner.state != ControlState::Idle || self.command() != ControlCommand::None {
                    warn!(state = ?inner.state, "start ignored");
                    return Err(ControlError::InvalidTransition {
                        command,
                        state: inner.state,
                    });
                }
                inner.pending = Some(header);
                self.set_command(ControlCommand::Start);
                info!("start requested");
            }
            ControlMessage::Stop => match inner.state {
                ControlState::Idle if self.command() == ControlCommand::Start => {
                    inner.pending = None;
                    self.set_command(ControlCommand::None);
                }
                ControlState::Idle => debug!("stop while idle ignored"),
                _ => {
                    inner.state = ControlState::Stopping;
                    if self.command() != ControlCommand::Quit {
                        self.set_command(ControlCommand::Stop);
                    }
                    info!("stop requested");
                }
            },
            ControlMessage::Quit => {
                self.set_command(ControlCommand::Quit);
                info!("quit requested");
            }
        }
        self.cond.notify_all();
        Ok(())
    }
}

/// Per-worker placement state and the resources it owns exclusively.
struct Lane {
    index: usize,
    suffix: String,
    format: PacketFormat,
    stats: Arc<IngestStats>,
    half_size: u64,
    max_block_skip: u64,
    zero_fill: bool,
    overflow: Vec<u8>,
    overflow_bytes: u64,
    overflow_hw: usize,
    half: Option<WriteBlock>,
    /// Stream offset of the held (or last handed back) half.
    start: u64,
    /// Stream offset of the next half.
    next: u64,
    bytes: u64,
    high_water: usize,
}

impl Lane {
    fn reset(&mut self) {
        self.overflow_bytes = 0;
        self.overflow_hw = 0;
        self.half = None;
        self.start = 0;
        self.next = 0;
        self.bytes = 0;
        self.high_water = 0;
    }

    fn install(&mut self, control: &MergeControl, mut half: WriteBlock) {
        self.start = self.next;
        self.next += self.half_size;
        if self.zero_fill {
            half.as_mut_slice().fill(0);
        }
        self.bytes = 0;
        self.high_water = 0;
        if self.overflow_hw > 0 {
            if half.write_at(0, &self.overflow[..self.overflow_hw]) {
                self.bytes = self.overflow_bytes;
                self.high_water = self.overflow_hw;
            } else {
                warn!(
                    worker = self.index,
                    id = half.id(),
                    staged = self.overflow_hw,
                    "staged payload does not fit the half"
                );
                self.stats.lost_bytes(self.overflow_bytes);
            }
            self.overflow[..self.overflow_hw].fill(0);
        }
        self.overflow_bytes = 0;
        self.overflow_hw = 0;
        trace!(worker = self.index, id = half.id(), start = self.start, "half taken");
        self.half = Some(half);
        if self.bytes >= self.half_size {
            self.hand_back(control, false);
        }
    }

    /// Hands the held half back to the coordinator.
    ///
    /// `rotating` marks a half closed by a later packet, whose shortfall is lost.
    fn hand_back(&mut self, control: &MergeControl, rotating: bool) {
        let Some(half) = self.half.take() else {
            return;
        };
        if rotating {
            let lost = self.half_size.saturating_sub(self.bytes);
            if lost > 0 {
                self.stats.lost_bytes(lost);
                debug!(worker = self.index, id = half.id(), lost, "half closed short");
            }
        }
        control.return_half(self.index, half, self.high_water);
    }

    /// Commits staged payload and hands back whatever is held.
    ///
    /// Staged payload is only discarded when the observation is stopping.
    fn drain(&mut self, control: &MergeControl) {
        if self.half.is_none() && self.overflow_hw > 0 {
            match control.take_half(self.index, true) {
                Some(half) => self.install(control, half),
                None => {
                    debug!(
                        worker = self.index,
                        bytes = self.overflow_bytes,
                        "staged payload discarded on stop"
                    );
                    self.overflow[..self.overflow_hw].fill(0);
                    self.overflow_bytes = 0;
                    self.overflow_hw = 0;
                }
            }
        }
        self.hand_back(control, false);
    }

    /// Places one decoded packet. Returns `false` once the observation is
    /// stopping.
    fn place(
        &mut self,
        control: &MergeControl,
        packet: &[u8],
        offset: u64,
        payload_len: usize,
    ) -> Result<bool, ReceiveError> {
        let mut rotations = 0;
        loop {
            if let Some(half) = self.half.as_mut() {
                if offset < self.start {
                    self.stats.drop_bytes(payload_len as u64);
                    return Ok(true);
                }
                if offset < self.next {
                    let rel = (offset - self.start) as usize;
                    let n = self
                        .format
                        .insert_last_packet(packet, &mut half.as_mut_slice()[rel..]);
                    self.stats.increment_bytes(n as u64);
                    self.bytes += n as u64;
                    self.high_water = self.high_water.max(rel + n);
                    if self.bytes >= self.half_size {
                        self.hand_back(control, false);
                    }
                    return Ok(true);
                }
                rotations += 1;
                if rotations > self.max_block_skip {
                    return Err(self.gap(offset, rotations));
                }
                self.hand_back(control, true);
            }

            if let Some(half) = control.take_half(self.index, false) {
                self.install(control, half);
                continue;
            }

            if offset < self.next {
                self.stats.drop_bytes(payload_len as u64);
                trace!(worker = self.index, offset, "late packet dropped");
                return Ok(true);
            }
            let rel = (offset - self.next) as usize;
            if rel < self.overflow.len() {
                let n = self
                    .format
                    .insert_last_packet(packet, &mut self.overflow[rel..]);
                self.stats.increment_bytes(n as u64);
                self.overflow_bytes += n as u64;
                self.overflow_hw = self.overflow_hw.max(rel + n);
                return Ok(true);
            }

            // Beyond the overflow window: wait for the coordinator to rotate.
            match control.take_half(self.index, true) {
                Some(half) => self.install(control, half),
                None => return Ok(false),
            }
        }
    }

    fn gap(&self, offset: u64, blocks: u64) -> ReceiveError {
        error!(worker = self.index, offset, blocks, "stream gap");
        ReceiveError::StreamGap {
            offset,
            blocks,
            max: self.max_block_skip,
        }
    }
}

/// One sub-stream: its source, receive buffer and placement state.
struct Worker<S> {
    source: S,
    packet: Vec<u8>,
    lane: Lane,
}

impl<S: DatagramSource> Worker<S> {
    fn new(
        index: usize,
        source: S,
        format: PacketFormat,
        stats: Arc<IngestStats>,
        half_size: usize,
    ) -> Self {
        Self {
            source,
            packet: vec![0u8; format.packet_size() + PACKET_SLACK],
            lane: Lane {
                index,
                suffix: format!("_{index}"),
                format,
                stats,
                half_size: half_size as u64,
                max_block_skip: DEFAULT_MAX_BLOCK_SKIP,
                zero_fill: false,
                overflow: vec![0u8; half_size],
                overflow_bytes: 0,
                overflow_hw: 0,
                half: None,
                start: 0,
                next: 0,
                bytes: 0,
                high_water: 0,
            },
        }
    }

    fn run(&mut self, control: &MergeControl) -> Result<(), ReceiveError> {
        let mut seen = 0;
        while let Some((observation, header)) = control.wait_for_observation(seen) {
            seen = observation;
            let result = self.observe(control, &header);
            if let Err(e) = &result {
                error!(worker = self.lane.index, error = %e, "worker failed");
            }
            control.leave(self.lane.index, result.is_err());
            result?;
        }
        Ok(())
    }

    fn observe(&mut self, control: &MergeControl, header: &AsciiHeader) -> Result<(), ReceiveError> {
        self.lane.format.configure(header, &self.lane.suffix)?;
        self.lane.format.prepare(header, &self.lane.suffix)?;
        self.lane.stats.reset();
        self.lane.reset();

        let result = match control.take_half(self.lane.index, true) {
            Some(half) => {
                self.lane.install(control, half);
                self.capture(control)
            }
            None => Ok(()),
        };
        self.lane.drain(control);
        info!(
            worker = self.lane.index,
            stats = %self.lane.stats.snapshot(),
            "worker left observation"
        );
        result
    }

    fn capture(&mut self, control: &MergeControl) -> Result<(), ReceiveError> {
        loop {
            if control.stopping() {
                return Ok(());
            }
            let Some(len) = self.source.recv_datagram(&mut self.packet)? else {
                self.lane.stats.record_sleep(1);
                if self.lane.half.is_none()
                    && let Some(half) = control.take_half(self.lane.index, false)
                {
                    self.lane.install(control, half);
                }
                thread::sleep(IDLE_SLEEP);
                continue;
            };
            check_packet_size(len, self.lane.format.packet_size())?;
            let packet = &self.packet[..len];

            match self.lane.format.decode_packet(packet)? {
                Decoded::TooEarly => {}
                Decoded::StreamStop => {
                    info!(worker = self.lane.index, "end of stream marker");
                    return Ok(());
                }
                Decoded::Packet {
                    byte_offset,
                    payload_len,
                } => {
                    if !self.lane.place(control, packet, byte_offset, payload_len)? {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Marks a worker as gone if its thread unwinds.
struct LeaveOnPanic<'a> {
    control: &'a MergeControl,
    worker: usize,
}

impl Drop for LeaveOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.control.leave(self.worker, true);
        }
    }
}

/// Receives two sub-streams into the halves of each block of a
/// writer-locked channel.
pub struct MergeReceiver<S> {
    channel: RingBufferChannel,
    workers: [Worker<S>; 2],
    config: AsciiHeader,
    control: Arc<MergeControl>,
    stats: [Arc<IngestStats>; 2],
    resolution: u64,
    half_size: usize,
    stall_timeout: Option<Duration>,
    zero_fill: bool,
}

impl<S: DatagramSource> MergeReceiver<S> {
    /// Creates a merge receiver. Sub-stream `p` uses `sources[p]` and the
    /// format named by `PKT_FORMAT_p` (or `PKT_FORMAT`).
    ///
    /// # Errors
    ///
    /// The channel is not writer-locked, a format configuration is invalid,
    /// or a block does not split into two halves of whole format units.
    pub fn new(
        channel: RingBufferChannel,
        sources: [S; 2],
        config: AsciiHeader,
    ) -> Result<Self, ReceiveError> {
        if channel.role() != Some(Role::Writer) {
            return Err(RingError::WrongRole {
                op: "MergeReceiver::new",
                required: &[Role::Writer],
                held: channel.role(),
            }
            .into());
        }
        let bufsz = channel.get_data_block_size()?;
        let formats = [
            PacketFormat::from_config(&config, "_0")?,
            PacketFormat::from_config(&config, "_1")?,
        ];
        for format in &formats {
            check_block_geometry(bufsz, 2, format)?;
        }
        let resolution = formats[0].get_resolution().max(formats[1].get_resolution());
        let half_size = bufsz / 2;

        let stats = [Arc::new(IngestStats::new()), Arc::new(IngestStats::new())];
        let [s0, s1] = sources;
        let [f0, f1] = formats;
        let workers = [
            Worker::new(0, s0, f0, Arc::clone(&stats[0]), half_size),
            Worker::new(1, s1, f1, Arc::clone(&stats[1]), half_size),
        ];

        Ok(Self {
            channel,
            workers,
            config,
            control: Arc::new(MergeControl::new()),
            stats,
            resolution,
            half_size,
            stall_timeout: None,
            zero_fill: false,
        })
    }

    /// Applies the tunables of `config`.
    ///
    /// The overflow window is capped at one half: staged payload must fit the
    /// half it is flushed into.
    #[must_use]
    pub fn with_settings(mut self, config: &MergeConfig) -> Self {
        let overflow = match config.overflow_capacity {
            Some(capacity) if capacity > self.half_size => {
                warn!(
                    capacity,
                    half_size = self.half_size,
                    "overflow capacity capped at one half"
                );
                self.half_size
            }
            Some(capacity) => capacity,
            None => self.half_size,
        };
        for worker in &mut self.workers {
            worker.lane.overflow = vec![0u8; overflow];
            worker.lane.max_block_skip = config.max_block_skip;
            worker.lane.zero_fill = config.zero_fill;
        }
        self.stall_timeout = config.stall_timeout;
        self.zero_fill = config.zero_fill;
        self
    }

    /// Bounds how long the coordinator waits for a block to fill.
    #[must_use]
    pub const fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    #[must_use]
    pub fn control(&self) -> Arc<MergeControl> {
        Arc::clone(&self.control)
    }

    #[must_use]
    pub fn stats(&self, worker: usize) -> Option<Arc<IngestStats>> {
        self.stats.get(worker).map(Arc::clone)
    }

    /// Runs the coordinator on this thread and the workers on two scoped
    /// threads, until Quit or a failure.
    ///
    /// # Errors
    ///
    /// The first worker error, a channel failure, or
    /// [`ReceiveError::WorkerStalled`] when the stall timeout expires.
    pub fn run(&mut self) -> Result<(), ReceiveError> {
        let control: &MergeControl = &self.control;
        let channel = &mut self.channel;
        let [w0, w1] = &mut self.workers;
        let coordinator = Coordinator {
            channel,
            config: &self.config,
            resolution: self.resolution,
            stall_timeout: self.stall_timeout,
            zero_fill: self.zero_fill,
        };

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(2);
            for (p, worker) in [(0, w0), (1, w1)] {
                let spawned = thread::Builder::new()
                    .name(format!("telstream-rx{p}"))
                    .spawn_scoped(scope, move || {
                        let _guard = LeaveOnPanic { control, worker: p };
                        info!(worker = p, "worker thread started");
                        let result = worker.run(control);
                        info!(worker = p, "worker thread exiting");
                        result
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        control.quit();
                        for handle in handles {
                            let _ = handle.join();
                        }
                        return Err(ReceiveError::Io(e));
                    }
                }
            }

            let coordinated = coordinator.run(control);
            control.quit();

            let mut first_error = coordinated.err();
            for (p, handle) in handles.into_iter().enumerate() {
                let result = handle
                    .join()
                    .unwrap_or(Err(ReceiveError::WorkerPanic { worker: p }));
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }

    /// Runs the merge receiver on a named thread.
    ///
    /// # Errors
    ///
    /// The thread cannot be spawned.
    pub fn spawn(mut self) -> Result<MergeHandle, ReceiveError>
    where
        S: 'static,
    {
        let control = self.control();
        let stats = self.stats.clone();
        let handle = thread::Builder::new()
            .name("telstream-merge".into())
            .spawn(move || {
                info!("merge thread started");
                let result = self.run();
                if let Err(e) = &result {
                    error!(error = %e, "merge receiver failed");
                }
                info!("merge thread exiting");
                result
            })?;
        Ok(MergeHandle {
            control,
            stats,
            handle: Some(handle),
        })
    }
}

/// The coordinator's borrowed view of the receiver.
struct Coordinator<'a> {
    channel: &'a mut RingBufferChannel,
    config: &'a AsciiHeader,
    resolution: u64,
    stall_timeout: Option<Duration>,
    zero_fill: bool,
}

impl Coordinator<'_> {
    fn run(mut self, control: &MergeControl) -> Result<(), ReceiveError> {
        info!(key = %self.channel.key(), "merge receiver waiting for start");
        while let Some(start) = control.wait_for_start() {
            let result = self.observe(control, &start);
            if result.is_err() {
                control.halt();
            }
            let failed = control.finish_observation();
            result?;
            if failed {
                break;
            }
        }
        Ok(())
    }

    fn open_halves(&mut self) -> Result<(WriteBlock, WriteBlock), ReceiveError> {
        let mut block = self.channel.open_block()?;
        if self.zero_fill {
            block.as_mut_slice().fill(0);
        }
        trace!(id = block.id(), "block opened");
        let half = block.len() / 2;
        Ok(block.split_at(half))
    }

    fn observe(&mut self, control: &MergeControl, start: &AsciiHeader) -> Result<(), ReceiveError> {
        let resolution = self.resolution * 2;
        let header = observation_header(self.config, start, resolution);
        self.channel.set_resolution(resolution)?;
        self.channel.write_header(header.raw().as_bytes())?;
        info!(
            key = %self.channel.key(),
            utc_start = header.get_str("UTC_START"),
            "merged observation started"
        );

        let first = self.open_halves()?;
        control.begin_observation(header, first);

        let rotated = self.rotate(control);
        if let Err(e) = &rotated {
            error!(error = %e, "merge failed, closing observation");
            control.halt();
        }
        let closed = self.channel.close_observation();
        rotated?;
        closed?;
        Ok(())
    }

    /// Closes each block once both halves are back, until every worker has
    /// left the observation.
    fn rotate(&mut self, control: &MergeControl) -> Result<(), ReceiveError> {
        let mut stalled = None;
        loop {
            let timeout = if stalled.is_some() {
                None
            } else {
                self.stall_timeout
            };
            match control.collect(timeout) {
                Collected::Stalled { filled } => {
                    let waited = timeout.unwrap_or_default();
                    warn!(?filled, ?waited, "block not filling, stopping observation");
                    control.halt();
                    stalled = Some(ReceiveError::WorkerStalled { waited, filled });
                }
                Collected::Halves { halves, last } => {
                    self.close(halves)?;
                    if last {
                        break;
                    }
                    // While stopping, only collect what the workers still hold.
                    if !control.stopping() {
                        let next = self.open_halves()?;
                        control.offer(next);
                    }
                }
            }
        }
        stalled.map_or(Ok(()), Err)
    }

    fn close(&mut self, halves: [Option<Returned>; 2]) -> Result<(), ReceiveError> {
        let ((h0, b0), (h1, b1)) = match halves {
            [None, None] => return Ok(()),
            [Some(a), Some(b)] => (a, b),
            [Some(_), None] => return Err(ReceiveError::WorkerPanic { worker: 1 }),
            [None, Some(_)] => return Err(ReceiveError::WorkerPanic { worker: 0 }),
        };
        let block = h0.join(h1).map_err(|_| ReceiveError::Geometry {
            reason: "halves of different blocks".to_string(),
        })?;
        let id = block.id();
        let bytes = if b0 + b1 > 0 { block.len() } else { 0 };
        self.channel.close_block(block, bytes)?;
        debug!(id, half0 = b0, half1 = b1, "merged block closed");
        Ok(())
    }
}

/// Handle to a spawned [`MergeReceiver`].
///
/// Dropping the handle requests Quit without waiting.
pub struct MergeHandle {
    control: Arc<MergeControl>,
    stats: [Arc<IngestStats>; 2],
    handle: Option<JoinHandle<Result<(), ReceiveError>>>,
}

impl MergeHandle {
    #[must_use]
    pub const fn control(&self) -> &Arc<MergeControl> {
        &self.control
    }

    #[must_use]
    pub const fn stats(&self) -> &[Arc<IngestStats>; 2] {
        &self.stats
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the receiver to exit on its own.
    ///
    /// # Errors
    ///
    /// The receiver's error, or [`ReceiveError::WorkerPanic`].
    pub fn join(mut self) -> Result<(), ReceiveError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ReceiveError::WorkerPanic { worker: 2 })?,
            None => Ok(()),
        }
    }

    /// Requests Quit and waits for the receiver to exit.
    ///
    /// # Errors
    ///
    /// See [`join`](Self::join).
    pub fn shutdown(self) -> Result<(), ReceiveError> {
        self.control.request_quit();
        self.join()
    }
}

impl Drop for MergeHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.control.request_quit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_transitions() {
        let control = MergeControl::new();
        control
            .deliver(ControlMessage::Start(AsciiHeader::new()))
            .unwrap();
        assert!(matches!(
            control.deliver(ControlMessage::Start(AsciiHeader::new())),
            Err(ControlError::InvalidTransition { .. })
        ));
        assert!(control.wait_for_start().is_some());
        assert_eq!(control.state(), ControlState::Active);

        control.request_stop();
        assert_eq!(control.command(), ControlCommand::Stop);
        assert_eq!(control.state(), ControlState::Stopping);

        // No observation began, so no worker is outstanding.
        assert!(!control.finish_observation());
        assert_eq!(control.state(), ControlState::Idle);
        assert_eq!(control.command(), ControlCommand::None);
    }

    #[test]
    fn test_quit_releases_waiting_workers() {
        let control = Arc::new(MergeControl::new());
        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_for_observation(0).is_none())
        };
        thread::sleep(Duration::from_millis(20));
        control.request_quit();
        assert!(waiter.join().unwrap());
        assert!(control.wait_for_start().is_none());
    }

    #[test]
    fn test_worker_failure_stops_observation() {
        let control = MergeControl::new();
        control
            .deliver(ControlMessage::Start(AsciiHeader::new()))
            .unwrap();
        assert!(control.wait_for_start().is_some());
        {
            let mut inner = control.lock();
            inner.left = [false, false];
        }
        control.leave(0, true);
        assert_eq!(control.command(), ControlCommand::Stop);
        assert!(control.take_half(1, false).is_none());
        control.leave(1, false);
        assert!(control.finish_observation());
    }
}
