//! Simulated pump controller
//!
//! Runs the controller's command table on a background thread and talks the
//! wire protocol over an in-memory [`DuplexChannel`], so the whole stack can be
//! exercised without hardware. Finite runs step in (optionally accelerated)
//! real time and report completion with the finished signal, like the firmware.

use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::protocol::commands::{
    SIGNAL_ACK, SIGNAL_BOOTED, SIGNAL_CHECKSUM_ERROR, SIGNAL_COMMAND_ERROR, SIGNAL_FINISHED_BASE,
};
use crate::protocol::frame::read_frame;
use crate::protocol::{
    Access, CommunicationChannel, Frame, Parameter, ProtocolError, CHANNEL_COUNT, COMMAND_TABLE,
    FRAME_LEN,
};

// ----------------------------------------------------------------------------
// In-memory link
// ----------------------------------------------------------------------------

struct Inbound {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// One end of an in-memory byte link
///
/// Reads time out like a serial port and return `Ok(0)` once the other end
/// is gone.
pub struct DuplexChannel {
    tx: Sender<Vec<u8>>,
    inbound: Arc<Mutex<Inbound>>,
    timeout: Duration,
}

impl DuplexChannel {
    /// Two connected ends
    pub fn pair() -> (DuplexChannel, DuplexChannel) {
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            tx,
            inbound: Arc::new(Mutex::new(Inbound {
                rx,
                pending: VecDeque::new(),
            })),
            timeout: Duration::from_millis(100),
        }
    }

    fn inbound(&self) -> MutexGuard<'_, Inbound> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Read for DuplexChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let timeout = self.timeout;
        let mut inbound = self.inbound();
        if inbound.pending.is_empty() {
            match inbound.rx.recv_timeout(timeout) {
                Ok(chunk) => inbound.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(inbound.pending.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for DuplexChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for DuplexChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        let mut inbound = self.inbound();
        inbound.pending.clear();
        while inbound.rx.try_recv().is_ok() {}
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(Box::new(DuplexChannel {
            tx: self.tx.clone(),
            inbound: self.inbound.clone(),
            timeout: self.timeout,
        }))
    }
}

// ----------------------------------------------------------------------------
// Simulated controller
// ----------------------------------------------------------------------------

/// Simulator settings
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Timer ticks per microsecond
    pub sub_us_divider: u32,
    /// Channels that accept microstep exponent changes
    pub var_microstep_support: [bool; CHANNEL_COUNT],
    /// Simulated seconds per real second
    pub time_scale: f64,
    /// Send the boot signal this long after start
    pub boot_delay: Option<Duration>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sub_us_divider: 1,
            var_microstep_support: [true; CHANNEL_COUNT],
            time_scale: 1.0,
            boot_delay: None,
        }
    }
}

/// Register file of one simulated channel
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotorRegisters {
    pub running: bool,
    pub steps: u32,
    pub target_steps: u32,
    pub step_interval: u32,
    pub finite_mode: bool,
    pub direction: bool,
    pub enabled: bool,
    pub var_microstep_support: bool,
    pub microstep_exponent: u8,
    /// Elapsed ticks not yet turned into steps
    tick_accumulator: f64,
}

impl MotorRegisters {
    fn get(&self, parameter: Parameter) -> u32 {
        match parameter {
            Parameter::Running => self.running as u32,
            Parameter::Steps => self.steps,
            Parameter::TargetSteps => self.target_steps,
            Parameter::StepInterval => self.step_interval,
            Parameter::FiniteMode => self.finite_mode as u32,
            Parameter::Direction => self.direction as u32,
            Parameter::Enabled => self.enabled as u32,
            Parameter::VarMicrostepSupport => self.var_microstep_support as u32,
            Parameter::MicrostepExponent => self.microstep_exponent as u32,
            Parameter::SubUsDivider => 0,
        }
    }

    /// Apply a set command, `false` when the controller would reject it
    fn set(&mut self, parameter: Parameter, value: u32) -> bool {
        match parameter {
            Parameter::Running => {
                self.running = value != 0;
                self.tick_accumulator = 0.0;
            }
            Parameter::Steps => {
                self.steps = value;
                self.target_steps = value;
            }
            Parameter::TargetSteps => self.target_steps = value,
            Parameter::StepInterval => self.step_interval = value,
            Parameter::FiniteMode => self.finite_mode = value != 0,
            Parameter::Direction => self.direction = value != 0,
            Parameter::Enabled => self.enabled = value != 0,
            Parameter::MicrostepExponent => {
                if !self.var_microstep_support {
                    return false;
                }
                self.microstep_exponent = value as u8;
            }
            Parameter::VarMicrostepSupport | Parameter::SubUsDivider => return false,
        }
        true
    }

    /// Advance by `ticks`; returns true when a finite run just completed
    fn advance(&mut self, ticks: f64) -> bool {
        if !self.running || self.step_interval == 0 {
            return false;
        }
        self.tick_accumulator += ticks;
        let due = (self.tick_accumulator / self.step_interval as f64).floor();
        if due < 1.0 {
            return false;
        }
        self.tick_accumulator -= due * self.step_interval as f64;
        if !self.finite_mode {
            return false;
        }
        let taken = (due as u64).min(self.steps as u64) as u32;
        self.steps -= taken;
        if self.steps == 0 {
            self.running = false;
            return true;
        }
        false
    }
}

struct SimState {
    motors: [MotorRegisters; CHANNEL_COUNT],
    sub_us_divider: u32,
    received: Vec<Frame>,
    outbound: VecDeque<[u8; FRAME_LEN]>,
    corrupt_next: bool,
    rejected: HashSet<u8>,
    drop_replies: bool,
}

impl SimState {
    fn queue(&mut self, frame: Frame) {
        let mut bytes = frame.to_bytes();
        if self.corrupt_next {
            bytes[FRAME_LEN - 1] ^= 0xFF;
            self.corrupt_next = false;
        }
        self.outbound.push_back(bytes);
    }

    fn reply(&mut self, frame: Frame) {
        if self.drop_replies {
            trace!("sim: dropping reply {}", frame.id);
            return;
        }
        self.queue(frame);
    }

    fn handle(&mut self, bytes: &[u8; FRAME_LEN]) {
        let frame = match Frame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(_) => {
                self.reply(Frame::command(SIGNAL_CHECKSUM_ERROR));
                return;
            }
        };
        self.received.push(frame);

        let entry = match COMMAND_TABLE.by_id(frame.id) {
            Some(entry) if !self.rejected.contains(&frame.id) => entry,
            _ => {
                self.reply(Frame::command(SIGNAL_COMMAND_ERROR));
                return;
            }
        };

        match (entry.access, entry.channel) {
            (Access::Get, None) => {
                let value = self.sub_us_divider;
                self.reply(Frame::with_value(frame.id, entry.width, value));
            }
            (Access::Get, Some(channel)) => {
                let value = self.motors[channel as usize].get(entry.parameter);
                self.reply(Frame::with_value(frame.id, entry.width, value));
            }
            (Access::Set, Some(channel)) => {
                let channel = channel as usize;
                let value = frame.value(entry.width);
                if !self.motors[channel].set(entry.parameter, value) {
                    self.reply(Frame::command(SIGNAL_COMMAND_ERROR));
                    return;
                }
                self.reply(Frame::command(SIGNAL_ACK));

                // a finite run with nothing left ends at once
                let motor = &mut self.motors[channel];
                if entry.parameter == Parameter::Running
                    && motor.running
                    && motor.finite_mode
                    && motor.steps == 0
                {
                    motor.running = false;
                    self.queue(Frame::command(SIGNAL_FINISHED_BASE + channel as u8));
                }
            }
            (Access::Set, None) => self.reply(Frame::command(SIGNAL_COMMAND_ERROR)),
        }
    }

    fn advance(&mut self, ticks: f64) {
        for channel in 0..CHANNEL_COUNT {
            if self.motors[channel].advance(ticks) {
                debug!("sim: channel {} finished", channel);
                self.queue(Frame::command(SIGNAL_FINISHED_BASE + channel as u8));
            }
        }
    }
}

struct SimShared {
    shutdown: AtomicBool,
    state: Mutex<SimState>,
}

impl SimShared {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Simulated pump controller running on its own thread
pub struct SimulatedDevice {
    shared: Arc<SimShared>,
    handle: Option<JoinHandle<()>>,
}

impl SimulatedDevice {
    /// Start the simulator; returns it with the host end of the link
    pub fn spawn(config: SimConfig) -> io::Result<(Self, DuplexChannel)> {
        let (host, mut device) = DuplexChannel::pair();
        device.set_timeout(Duration::from_millis(1))?;

        let mut motors = [MotorRegisters::default(); CHANNEL_COUNT];
        for (motor, supported) in motors.iter_mut().zip(config.var_microstep_support) {
            motor.var_microstep_support = supported;
            motor.step_interval = 2000;
        }

        let shared = Arc::new(SimShared {
            shutdown: AtomicBool::new(false),
            state: Mutex::new(SimState {
                motors,
                sub_us_divider: config.sub_us_divider,
                received: Vec::new(),
                outbound: VecDeque::new(),
                corrupt_next: false,
                rejected: HashSet::new(),
                drop_replies: false,
            }),
        });

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("pump-sim".to_string())
                .spawn(move || run(device, shared, config))?
        };

        Ok((
            Self {
                shared,
                handle: Some(handle),
            },
            host,
        ))
    }

    /// Registers of a channel
    pub fn motor(&self, channel: usize) -> MotorRegisters {
        self.shared.state().motors[channel]
    }

    /// Overwrite registers of a channel
    pub fn set_motor(&self, channel: usize, registers: MotorRegisters) {
        self.shared.state().motors[channel] = registers;
    }

    /// Frames received from the host, in order
    pub fn received(&self) -> Vec<Frame> {
        self.shared.state().received.clone()
    }

    pub fn clear_received(&self) {
        self.shared.state().received.clear();
    }

    /// Flip the checksum of the next frame sent to the host
    pub fn corrupt_next_frame(&self) {
        self.shared.state().corrupt_next = true;
    }

    /// Answer this command id with a command error from now on
    pub fn reject_command(&self, id: u8) {
        self.shared.state().rejected.insert(id);
    }

    /// Stop answering requests (signals are still sent)
    pub fn set_drop_replies(&self, drop: bool) {
        self.shared.state().drop_replies = drop;
    }

    /// Send an arbitrary frame to the host
    pub fn send_frame(&self, frame: Frame) {
        self.shared.state().outbound.push_back(frame.to_bytes());
    }

    /// End a channel's run now, as if its last step was taken
    pub fn finish(&self, channel: usize) {
        let mut state = self.shared.state();
        let motor = &mut state.motors[channel];
        motor.running = false;
        if motor.finite_mode {
            motor.steps = 0;
        }
        state.queue(Frame::command(SIGNAL_FINISHED_BASE + channel as u8));
    }

    /// Stop the simulator thread; the host end then reads end-of-stream
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut link: DuplexChannel, shared: Arc<SimShared>, config: SimConfig) {
    let started = Instant::now();
    let mut last = started;
    let mut boot_pending = config.boot_delay;
    let ticks_per_sec = config.sub_us_divider.max(1) as f64 * 1_000_000.0 * config.time_scale;

    while !shared.shutdown.load(Ordering::Relaxed) {
        let incoming = match read_frame(&mut link) {
            Ok(frame) => frame,
            Err(ProtocolError::ConnectionClosed) => break,
            Err(_) => None,
        };

        let now = Instant::now();
        let elapsed = now.duration_since(last).as_secs_f64();
        last = now;

        let outbound: Vec<[u8; FRAME_LEN]> = {
            let mut state = shared.state();
            state.advance(elapsed * ticks_per_sec);
            if let Some(bytes) = incoming {
                state.handle(&bytes);
            }
            if let Some(delay) = boot_pending {
                if now.duration_since(started) >= delay {
                    state.queue(Frame::command(SIGNAL_BOOTED));
                    boot_pending = None;
                }
            }
            state.outbound.drain(..).collect()
        };

        for bytes in outbound {
            if link.write_all(&bytes).is_err() {
                return;
            }
        }
    }
}
