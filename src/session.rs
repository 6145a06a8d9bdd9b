//! Command sequencing against one connection
//!
//! A [Session] moves its [Connection] onto a worker thread which performs all
//! wire traffic. Callers hand it commands and firmware uploads; the worker runs
//! them one at a time in the order they were accepted, so at most one command
//! is ever in flight and nothing interleaves with an upload.
//!
//! Every accepted command resolves to exactly one [CommandResult]. A command
//! the device does not answer in time resolves as [CommandStatus::TimedOut]
//! and leaves the connection usable, but
//! [SessionConfig::max_consecutive_timeouts] timeouts in a row fault it: the
//! queue drains as [DeviceFault::Unresponsive] and new work is refused with
//! [Error::DeviceUnresponsive] until [Session::reopen] succeeds.

use std::{
    collections::VecDeque,
    sync::{
        mpsc::{self, Receiver, SyncSender},
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    codec::{self, Frame, FrameDecoder, Telemetry},
    command::{CommandRequest, CommandResult, CommandStatus, DeviceFault, Opcode},
    connection::{Connection, ConnectionState, Incoming},
    error::{ConnectionError, Error},
    flasher::{FlashState, FlashStatus, Flasher},
    profile::FlashConfig,
    progress::ProgressCallbacks,
};

/// How long the worker waits for a response before checking for aborts
const RESPONSE_SLICE: Duration = Duration::from_millis(50);
/// How long an idle worker sleeps when the connection cannot be polled
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// What to do with work submitted while the session is busy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BusyPolicy {
    /// Queue it behind the current work, up to the queue capacity
    #[default]
    Queue,
    /// Refuse it with [Error::Busy]
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionConfig {
    /// Response timeout for commands without a longer one of their own
    pub response_timeout_ms: u64,
    /// Consecutive timeouts after which the connection is considered faulted
    pub max_consecutive_timeouts: u32,
    pub busy_policy: BusyPolicy,
    pub queue_capacity: usize,
    /// Telemetry events retained until drained; older ones are dropped
    pub telemetry_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            response_timeout_ms: Opcode::default_timeout().as_millis() as u64,
            max_consecutive_timeouts: 3,
            busy_policy: BusyPolicy::Queue,
            queue_capacity: 32,
            telemetry_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Reject settings under which no command could ever be served
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |field: &str| {
            Err(Error::InvalidSessionConfig(format!(
                "`{field}` must be at least 1"
            )))
        };

        if self.response_timeout_ms == 0 {
            return invalid("response-timeout-ms");
        }
        if self.max_consecutive_timeouts == 0 {
            return invalid("max-consecutive-timeouts");
        }
        if self.queue_capacity == 0 {
            return invalid("queue-capacity");
        }

        Ok(())
    }
}

/// What the session's worker is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionPhase {
    Idle,
    Dispatching,
    AwaitingResponse,
    Flashing,
    Closed,
}

/// Outcome of [PendingCommand::cancel]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The command had not been sent and never will be
    Dequeued,
    /// The command was already sent; the worker stops waiting for its
    /// response, but whatever the device did with it stands
    AbortRequested,
    /// The command has already resolved
    AlreadyFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Timeouts(u32),
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Cancelled,
    Closing,
}

struct CommandJob {
    opcode: Opcode,
    correlation_id: u16,
    bytes: Vec<u8>,
    reply: SyncSender<CommandResult>,
}

impl CommandJob {
    fn resolve(self, status: CommandStatus) {
        let result = CommandResult {
            correlation_id: self.correlation_id,
            opcode: self.opcode,
            status,
        };

        // The caller may have stopped waiting
        self.reply.send(result).ok();
    }
}

struct FlashJob {
    flasher: Flasher,
    config: FlashConfig,
    image: Vec<u8>,
    progress: Option<Box<dyn ProgressCallbacks + Send>>,
    reply: SyncSender<Result<(), Error>>,
}

enum Job {
    Command(CommandJob),
    Flash(FlashJob),
    Reopen(SyncSender<Result<(), Error>>),
}

impl Job {
    /// Resolve work that will never run
    fn abandon(self, fault: DeviceFault, err: impl FnOnce() -> Error) {
        match self {
            Job::Command(job) => job.resolve(CommandStatus::DeviceError(fault)),
            Job::Flash(job) => {
                job.reply.send(Err(err())).ok();
            }
            Job::Reopen(reply) => {
                reply.send(Err(err())).ok();
            }
        }
    }
}

struct Inner {
    queue: VecDeque<Job>,
    phase: SessionPhase,
    link: ConnectionState,
    fault: Option<Fault>,
    consecutive_timeouts: u32,
    next_id: u16,
    in_flight: Option<u16>,
    abort: Option<Abort>,
    telemetry: VecDeque<Telemetry>,
    flash_status: FlashStatus,
    closing: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
    port_path: String,
    config: SessionConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serializes commands and uploads against one connection
pub struct Session {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("port_path", &self.shared.port_path)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Take ownership of `connection` and start the worker
    pub fn new(connection: Connection, config: SessionConfig) -> Result<Self, Error> {
        config.validate()?;
        if !connection.is_usable() {
            return Err(Error::NotConnected);
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                phase: SessionPhase::Idle,
                link: connection.state(),
                fault: None,
                consecutive_timeouts: 0,
                next_id: 0,
                in_flight: None,
                abort: None,
                telemetry: VecDeque::new(),
                flash_status: FlashStatus::default(),
                closing: false,
            }),
            wake: Condvar::new(),
            port_path: connection.port_path().to_string(),
            config,
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("periphlink-session".into())
                .spawn(move || Worker::new(shared, connection).run())?
        };

        Ok(Session {
            shared,
            worker: Some(worker),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn port_path(&self) -> &str {
        &self.shared.port_path
    }

    /// State of the underlying connection
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().link
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.lock().phase
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.shared.lock().consecutive_timeouts
    }

    /// Stage and progress of the current or last firmware upload
    pub fn flash_status(&self) -> FlashStatus {
        self.shared.lock().flash_status
    }

    /// Take the telemetry received so far, oldest first
    pub fn drain_telemetry(&self) -> Vec<Telemetry> {
        self.shared.lock().telemetry.drain(..).collect()
    }

    /// Refuse new work unless the session can accept it
    fn admit(&self, inner: &Inner) -> Result<(), Error> {
        if inner.closing {
            return Err(Error::SessionClosed);
        }

        match (inner.link, inner.fault) {
            (ConnectionState::Faulted, Some(Fault::Timeouts(n))) => {
                return Err(Error::DeviceUnresponsive(n))
            }
            (ConnectionState::Faulted, _) => {
                return Err(Error::Connection(ConnectionError::Faulted))
            }
            (ConnectionState::Disconnected, _) => return Err(Error::NotConnected),
            _ => {}
        }

        let busy = inner.phase != SessionPhase::Idle || !inner.queue.is_empty();
        if busy && self.shared.config.busy_policy == BusyPolicy::Reject {
            return Err(Error::Busy);
        }
        if inner.queue.len() >= self.shared.config.queue_capacity {
            return Err(Error::Busy);
        }

        Ok(())
    }

    /// Accept a command and return a handle to its result
    ///
    /// The request's correlation id is assigned here.
    pub fn enqueue(&self, mut request: CommandRequest) -> Result<PendingCommand, Error> {
        let mut inner = self.shared.lock();
        self.admit(&inner)?;

        inner.next_id = inner.next_id.wrapping_add(1);
        request.correlation_id = inner.next_id;
        let bytes = codec::encode(&request)?;

        let (reply, receiver) = mpsc::sync_channel(1);
        inner.queue.push_back(Job::Command(CommandJob {
            opcode: request.opcode,
            correlation_id: request.correlation_id,
            bytes,
            reply,
        }));
        self.shared.wake.notify_all();

        debug!(
            "Accepted {} #{} ({} queued)",
            request.opcode,
            request.correlation_id,
            inner.queue.len()
        );

        Ok(PendingCommand {
            correlation_id: request.correlation_id,
            receiver,
            shared: self.shared.clone(),
            cancelled: false,
        })
    }

    /// Run a command and wait for its result
    pub fn submit(&self, request: CommandRequest) -> Result<CommandResult, Error> {
        self.enqueue(request)?.wait()
    }

    /// Upload firmware as an exclusive job
    ///
    /// Commands accepted before the upload run first; commands submitted
    /// while it runs are queued or refused according to the busy policy.
    pub fn flash(
        &self,
        flasher: Flasher,
        config: FlashConfig,
        image: Vec<u8>,
        progress: Option<Box<dyn ProgressCallbacks + Send>>,
    ) -> Result<(), Error> {
        let receiver = {
            let mut inner = self.shared.lock();
            self.admit(&inner)?;

            let (reply, receiver) = mpsc::sync_channel(1);
            inner.queue.push_back(Job::Flash(FlashJob {
                flasher,
                config,
                image,
                progress,
                reply,
            }));
            self.shared.wake.notify_all();

            receiver
        };

        receiver.recv().unwrap_or(Err(Error::SessionClosed))
    }

    /// Reopen the connection, clearing a fault
    pub fn reopen(&self) -> Result<(), Error> {
        let receiver = {
            let mut inner = self.shared.lock();
            if inner.closing {
                return Err(Error::SessionClosed);
            }

            let (reply, receiver) = mpsc::sync_channel(1);
            inner.queue.push_back(Job::Reopen(reply));
            self.shared.wake.notify_all();

            receiver
        };

        receiver.recv().unwrap_or(Err(Error::SessionClosed))
    }

    /// Stop the worker and close the connection
    ///
    /// Queued work is resolved as lost; a command in flight resolves as soon
    /// as the worker notices.
    pub fn close(&mut self) {
        {
            let mut inner = self.shared.lock();
            inner.closing = true;
            if inner.in_flight.is_some() {
                inner.abort = Some(Abort::Closing);
            }
            self.shared.wake.notify_all();
        }

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Session worker for {} panicked", self.shared.port_path);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to an accepted command
#[derive(Debug)]
pub struct PendingCommand {
    correlation_id: u16,
    receiver: Receiver<CommandResult>,
    shared: Arc<Shared>,
    cancelled: bool,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("port_path", &self.port_path)
            .finish_non_exhaustive()
    }
}

impl PendingCommand {
    pub fn correlation_id(&self) -> u16 {
        self.correlation_id
    }

    /// Cancel the command
    ///
    /// A queued command is removed at no cost. Cancelling a command which has
    /// already been sent is a best-effort abort: the session stops waiting for
    /// the response, but the device may already have acted on it and nothing
    /// is rolled back.
    pub fn cancel(&mut self) -> CancelOutcome {
        let mut inner = self.shared.lock();

        let position = inner.queue.iter().position(|job| {
            matches!(job, Job::Command(cmd) if cmd.correlation_id == self.correlation_id)
        });

        if let Some(position) = position {
            inner.queue.remove(position);
            self.cancelled = true;
            debug!("Cancelled queued command #{}", self.correlation_id);
            return CancelOutcome::Dequeued;
        }

        if inner.in_flight == Some(self.correlation_id) {
            inner.abort = Some(Abort::Cancelled);
            self.cancelled = true;
            return CancelOutcome::AbortRequested;
        }

        CancelOutcome::AlreadyFinished
    }

    /// Wait for the result
    pub fn wait(self) -> Result<CommandResult, Error> {
        match self.receiver.recv() {
            Ok(result) => Ok(result),
            Err(_) if self.cancelled => Err(Error::Cancelled),
            Err(_) => Err(Error::SessionClosed),
        }
    }
}

/// Mirrors flash progress into the session state
struct StatusTracker<'a> {
    shared: &'a Shared,
    total: usize,
    forward: Option<&'a mut Box<dyn ProgressCallbacks + Send>>,
}

impl ProgressCallbacks for StatusTracker<'_> {
    fn init(&mut self, total: usize) {
        self.total = total;
        if let Some(cb) = self.forward.as_mut() {
            cb.init(total);
        }
    }

    fn update(&mut self, current: usize) {
        let progress = (current.saturating_mul(100) / self.total.max(1)).min(100) as u8;
        self.shared.lock().flash_status.progress = progress;

        if let Some(cb) = self.forward.as_mut() {
            cb.update(current);
        }
    }

    fn finish(&mut self) {
        if let Some(cb) = self.forward.as_mut() {
            cb.finish();
        }
    }

    fn stage(&mut self, state: FlashState) {
        self.shared.lock().flash_status.state = state;

        if let Some(cb) = self.forward.as_mut() {
            cb.stage(state);
        }
    }
}

/// The session's worker thread
struct Worker {
    shared: Arc<Shared>,
    connection: Connection,
    decoder: FrameDecoder,
}

impl Worker {
    fn new(shared: Arc<Shared>, connection: Connection) -> Self {
        Worker {
            shared,
            connection,
            decoder: FrameDecoder::new(),
        }
    }

    fn run(mut self) {
        debug!("Session worker for {} started", self.shared.port_path);

        loop {
            let job = {
                let mut inner = self.shared.lock();
                if inner.closing {
                    break;
                }

                match inner.queue.pop_front() {
                    Some(job) => {
                        inner.phase = match &job {
                            Job::Command(cmd) => {
                                inner.in_flight = Some(cmd.correlation_id);
                                inner.abort = None;
                                SessionPhase::Dispatching
                            }
                            Job::Flash(_) => SessionPhase::Flashing,
                            Job::Reopen(_) => SessionPhase::Idle,
                        };
                        Some(job)
                    }
                    None if self.connection.is_usable() => None,
                    None => {
                        // Nothing to poll until the connection is reopened
                        let _unused = self
                            .shared
                            .wake
                            .wait_timeout(inner, IDLE_WAIT)
                            .unwrap_or_else(PoisonError::into_inner);
                        continue;
                    }
                }
            };

            match job {
                Some(Job::Command(cmd)) => self.dispatch(cmd),
                Some(Job::Flash(job)) => self.flash(job),
                Some(Job::Reopen(reply)) => {
                    let result = self.reopen();
                    reply.send(result).ok();
                }
                None => self.poll_idle(),
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        let abandoned = {
            let mut inner = self.shared.lock();
            inner.phase = SessionPhase::Closed;
            inner.link = ConnectionState::Disconnected;
            inner.queue.drain(..).collect::<Vec<_>>()
        };

        for job in abandoned {
            job.abandon(DeviceFault::ConnectionLost, || Error::SessionClosed);
        }

        self.connection.close();
        debug!("Session worker for {} stopped", self.shared.port_path);
    }

    /// Listen for telemetry while there is nothing to send
    fn poll_idle(&mut self) {
        match self.connection.read_frame(&mut self.decoder, Instant::now()) {
            Ok(Incoming::Frame(frame)) => self.unsolicited(frame),
            Ok(_) => {}
            Err(err) => {
                error!("Lost connection to {}: {err}", self.shared.port_path);
                self.fault(Fault::Io);
            }
        }
    }

    /// Handle a frame which does not answer the command in flight
    fn unsolicited(&mut self, frame: Frame) {
        match frame {
            Frame::Telemetry(event) => {
                let mut inner = self.shared.lock();
                if inner.telemetry.len() >= self.shared.config.telemetry_capacity {
                    inner.telemetry.pop_front();
                }
                inner.telemetry.push_back(event);
            }
            Frame::Response(result) => {
                debug!(
                    "Dropping late response to {} #{}",
                    result.opcode, result.correlation_id
                );
            }
            Frame::Request(request) => {
                warn!("Ignoring request frame {} from the device", request.opcode);
            }
        }
    }

    fn dispatch(&mut self, cmd: CommandJob) {
        debug!("Dispatching {} #{}", cmd.opcode, cmd.correlation_id);

        if let Err(err) = self.connection.write(&cmd.bytes) {
            error!("Failed to send {}: {err}", cmd.opcode);
            self.finish(
                cmd,
                CommandStatus::DeviceError(DeviceFault::ConnectionLost),
                Some(Fault::Io),
            );
            return;
        }

        self.shared.lock().phase = SessionPhase::AwaitingResponse;

        let timeout = cmd.opcode.timeout_or(self.shared.config.response_timeout());
        let deadline = Instant::now() + timeout;

        loop {
            let abort = self.shared.lock().abort.take();
            match abort {
                Some(Abort::Cancelled) => {
                    debug!("Abandoned {} #{}", cmd.opcode, cmd.correlation_id);
                    self.settle();
                    // Dropping the job tells the caller it was cancelled
                    return;
                }
                Some(Abort::Closing) => {
                    self.finish(cmd, CommandStatus::DeviceError(DeviceFault::ConnectionLost), None);
                    return;
                }
                None => {}
            }

            let slice = (Instant::now() + RESPONSE_SLICE).min(deadline);
            match self.connection.read_frame(&mut self.decoder, slice) {
                Ok(Incoming::Frame(Frame::Response(result)))
                    if result.correlation_id == cmd.correlation_id
                        && result.opcode == cmd.opcode =>
                {
                    self.finish(cmd, result.status, None);
                    return;
                }
                Ok(Incoming::Frame(frame)) => self.unsolicited(frame),
                Ok(Incoming::Malformed(_)) => {}
                Ok(Incoming::Idle) if Instant::now() >= deadline => {
                    warn!(
                        "{} #{} timed out after {timeout:?}",
                        cmd.opcode, cmd.correlation_id
                    );
                    self.finish(cmd, CommandStatus::TimedOut, None);
                    return;
                }
                Ok(Incoming::Idle) => {}
                Err(err) => {
                    error!("Lost connection while awaiting {}: {err}", cmd.opcode);
                    self.finish(
                        cmd,
                        CommandStatus::DeviceError(DeviceFault::ConnectionLost),
                        Some(Fault::Io),
                    );
                    return;
                }
            }
        }
    }

    /// Record the outcome of a command, then deliver it
    ///
    /// Session state is updated first so a caller woken by the result
    /// observes it.
    fn finish(&mut self, cmd: CommandJob, status: CommandStatus, fault: Option<Fault>) {
        let escalate = {
            let mut inner = self.shared.lock();
            match status {
                CommandStatus::TimedOut => {
                    inner.consecutive_timeouts += 1;
                    let n = inner.consecutive_timeouts;
                    (n >= self.shared.config.max_consecutive_timeouts).then_some(Fault::Timeouts(n))
                }
                CommandStatus::Ok(_) | CommandStatus::DeviceError(DeviceFault::Code(_)) => {
                    inner.consecutive_timeouts = 0;
                    None
                }
                CommandStatus::DeviceError(_) => None,
            }
        };

        if let Some(fault) = fault.or(escalate) {
            if let Fault::Timeouts(n) = fault {
                error!(
                    "{} stopped responding after {n} consecutive timeouts",
                    self.shared.port_path
                );
            }
            self.fault(fault);
        }

        self.settle();
        cmd.resolve(status);
    }

    /// Return to idle after a command
    fn settle(&mut self) {
        let mut inner = self.shared.lock();
        inner.in_flight = None;
        inner.abort = None;
        if inner.phase != SessionPhase::Closed {
            inner.phase = SessionPhase::Idle;
        }
        inner.link = self.connection.state();
    }

    /// Fault the connection and resolve all queued work
    fn fault(&mut self, fault: Fault) {
        self.connection.fault();

        let abandoned = {
            let mut inner = self.shared.lock();
            inner.link = ConnectionState::Faulted;
            inner.fault = Some(fault);

            // Reopen requests stay queued, they are what clears the fault
            let (reopen, abandoned): (VecDeque<Job>, VecDeque<Job>) = inner
                .queue
                .drain(..)
                .partition(|job| matches!(job, Job::Reopen(_)));
            inner.queue = reopen;

            abandoned
        };

        for job in abandoned {
            match fault {
                Fault::Timeouts(n) => {
                    job.abandon(DeviceFault::Unresponsive, || Error::DeviceUnresponsive(n))
                }
                Fault::Io => job.abandon(DeviceFault::ConnectionLost, || {
                    Error::Connection(ConnectionError::Faulted)
                }),
            }
        }
    }

    fn flash(&mut self, job: FlashJob) {
        let FlashJob {
            mut flasher,
            config,
            image,
            mut progress,
            reply,
        } = job;

        info!("Starting firmware upload to {}", self.shared.port_path);
        {
            let mut inner = self.shared.lock();
            inner.link = ConnectionState::Flashing;
            inner.flash_status = FlashStatus {
                state: FlashState::Idle,
                progress: 0,
            };
        }

        let result = {
            let mut tracker = StatusTracker {
                shared: &self.shared,
                total: 0,
                forward: progress.as_mut(),
            };

            flasher.flash(&mut self.connection, &config, &image, Some(&mut tracker))
        };

        // Bootloader traffic is not part of the command protocol
        self.decoder.reset();

        if self.connection.state() == ConnectionState::Faulted {
            self.fault(Fault::Io);
        }

        {
            let mut inner = self.shared.lock();
            inner.phase = SessionPhase::Idle;
            inner.link = self.connection.state();
            if result.is_ok() {
                inner.flash_status.progress = 100;
            }
        }

        reply.send(result).ok();
    }

    fn reopen(&mut self) -> Result<(), Error> {
        let result = self.connection.reopen();
        self.decoder.reset();

        let mut inner = self.shared.lock();
        inner.link = self.connection.state();
        if result.is_ok() {
            info!("Reopened {}", self.shared.port_path);
            inner.fault = None;
            inner.consecutive_timeouts = 0;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_toml() {
        let config: SessionConfig = toml::from_str(
            r#"
            response-timeout-ms = 500
            busy-policy = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.response_timeout(), Duration::from_millis(500));
        assert_eq!(config.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.max_consecutive_timeouts, 3);
        assert_eq!(config.queue_capacity, 32);
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(SessionConfig::default().validate().is_ok());

        for config in [
            SessionConfig {
                max_consecutive_timeouts: 0,
                ..SessionConfig::default()
            },
            SessionConfig {
                queue_capacity: 0,
                ..SessionConfig::default()
            },
            SessionConfig {
                response_timeout_ms: 0,
                ..SessionConfig::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(Error::InvalidSessionConfig(_))
            ));
        }
    }

    #[test]
    fn default_policy_queues() {
        let config = SessionConfig::default();
        assert_eq!(config.busy_policy, BusyPolicy::Queue);
        assert_eq!(config.response_timeout(), Duration::from_secs(3));
    }
}
