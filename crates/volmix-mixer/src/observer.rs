//! Mixer change observer
//!
//! A dedicated thread keeps one handle on the control open, registers its
//! change descriptors with an edge-triggered epoll instance and calls back on
//! every wake-up. An eventfd registered next to the device descriptors lets
//! [`Observer::stop`] interrupt the wait at any time.
//!
//! When the device goes away or epoll cannot be set up, the thread waits a
//! randomized delay and starts over until it is stopped.

use crate::{MixerError, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use rand::Rng;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use volmix_hal::{DeviceError, DeviceIdentity, MixerBackend, MixerHandle};

/// epoll data of the stop eventfd; device descriptors use their index
const WAKE_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 8;

/// Lifecycle of an observer thread
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    /// Thread started, device not watched yet or being reopened
    Created = 0,
    /// Descriptors registered, waiting for changes
    Running = 1,
    /// Stop observed, releasing resources
    Stopping = 2,
    Stopped = 3,
}

impl ObserverState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ObserverState::Created,
            1 => ObserverState::Running,
            2 => ObserverState::Stopping,
            _ => ObserverState::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct Status(AtomicU8);

impl Status {
    fn get(&self) -> ObserverState {
        ObserverState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ObserverState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Observer timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverOptions {
    /// Lower bound of the delay before retrying a failed setup
    pub retry_min: Duration,
    /// Upper bound of the delay before retrying a failed setup
    pub retry_max: Duration,
    /// How long `stop` waits for the thread before detaching it
    pub stop_timeout: Duration,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            retry_min: Duration::from_secs(5),
            retry_max: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

impl ObserverOptions {
    /// Random delay between `retry_min` and `retry_max`
    pub fn retry_delay(&self) -> Duration {
        if self.retry_max <= self.retry_min {
            return self.retry_min;
        }
        rand::thread_rng().gen_range(self.retry_min..=self.retry_max)
    }
}

/// Stop request shared between the owner and the thread
struct StopSignal {
    requested: Mutex<bool>,
    changed: Condvar,
    wake: EventFd,
}

impl StopSignal {
    fn new() -> Result<Self> {
        let wake = EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(|e| setup_error("eventfd", e))?;
        Ok(Self {
            requested: Mutex::new(false),
            changed: Condvar::new(),
            wake,
        })
    }

    fn request(&self) {
        let mut requested = self.requested.lock().unwrap_or_else(PoisonError::into_inner);
        if *requested {
            return;
        }
        *requested = true;
        self.changed.notify_all();
        drop(requested);

        if let Err(e) = self.wake.write(1) {
            warn!("Failed to wake mixer observer: {}", e);
        }
    }

    fn is_requested(&self) -> bool {
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`; returns true if a stop was requested
    fn wait(&self, timeout: Duration) -> bool {
        let requested = self.requested.lock().unwrap_or_else(PoisonError::into_inner);
        let (requested, _) = self
            .changed
            .wait_timeout_while(requested, timeout, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        *requested
    }
}

fn setup_error(what: &str, err: Errno) -> MixerError {
    MixerError::ObserverSetup(format!("{}: {}", what, err))
}

/// Why a listen pass ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stop,
    HungUp,
    Orphaned,
}

struct Worker<B, F> {
    backend: Arc<B>,
    identity: DeviceIdentity,
    options: ObserverOptions,
    signal: Arc<StopSignal>,
    status: Arc<Status>,
    on_change: F,
}

impl<B, F> Worker<B, F>
where
    B: MixerBackend,
    F: FnMut() -> bool,
{
    fn run(mut self) {
        debug!("Mixer observer started for {}", self.identity);

        while !self.signal.is_requested() {
            let outcome = self.listen();
            if matches!(outcome, Ok(Exit::HungUp) | Err(_)) {
                self.status.set(ObserverState::Created);
            }

            match outcome {
                Ok(Exit::Stop) => break,
                Ok(Exit::Orphaned) => {
                    info!("Mixer controller is gone, stopping observer");
                    break;
                }
                Ok(Exit::HungUp) => {
                    debug!("Change descriptors of {} hung up, reopening", self.identity);
                }
                Err(e) => {
                    let delay = self.options.retry_delay();
                    debug!(
                        "Mixer observer is unable to poll controls. Retrying in {:.1}s... Error: {}",
                        delay.as_secs_f64(),
                        e
                    );
                    if self.signal.wait(delay) {
                        break;
                    }
                }
            }
        }

        self.status.set(ObserverState::Stopping);
        info!("Stopping ALSA mixer observer loop...");
    }

    /// Watch one freshly opened handle until stop, hangup or failure
    fn listen(&mut self) -> Result<Exit> {
        let handle = self.backend.open_identity(&self.identity)?;
        let descriptors = handle.poll_descriptors()?;

        // Declared after `handle` so it is closed before the descriptors are
        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| setup_error("epoll_create", e))?;
        epoll
            .add(
                self.signal.wake.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, WAKE_TOKEN),
            )
            .map_err(|e| setup_error("epoll_ctl(wake)", e))?;

        let mut registered = 0;
        for (token, descriptor) in descriptors.iter().enumerate() {
            if !descriptor.is_valid() {
                debug!("Skipping invalid poll descriptor {}", descriptor.fd);
                continue;
            }

            // SAFETY: the descriptor belongs to `handle`, which outlives `epoll`
            let fd = unsafe { BorrowedFd::borrow_raw(descriptor.fd) };
            let flags =
                EpollFlags::from_bits_truncate(descriptor.events as libc::c_int) | EpollFlags::EPOLLET;
            epoll
                .add(fd, EpollEvent::new(flags, token as u64))
                .map_err(|e| setup_error("epoll_ctl", e))?;
            registered += 1;
        }

        if registered == 0 {
            return Err(MixerError::ObserverSetup(format!(
                "{} has no pollable descriptors",
                self.identity
            )));
        }
        if self.signal.is_requested() {
            return Ok(Exit::Stop);
        }

        self.status.set(ObserverState::Running);
        debug!("Watching {} descriptors of {}", registered, self.identity);

        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        loop {
            let ready = match epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(setup_error("epoll_wait", e)),
            };

            let mut changed = false;
            for event in &events[..ready] {
                if event.data() == WAKE_TOKEN {
                    return Ok(Exit::Stop);
                }

                let flags = event.events();
                if flags.contains(EpollFlags::EPOLLERR) {
                    return Err(DeviceError::Unavailable(format!(
                        "change descriptor of {} reported an error",
                        self.identity
                    ))
                    .into());
                }
                if flags.contains(EpollFlags::EPOLLHUP) {
                    return Ok(Exit::HungUp);
                }
                changed = true;
            }

            if changed {
                if let Err(e) = handle.drain_events() {
                    debug!("Draining change events failed: {}", e);
                }
                if !(self.on_change)() {
                    return Ok(Exit::Orphaned);
                }
            }
        }
    }
}

/// Handle on a running observer thread; stops it when dropped
pub struct Observer {
    signal: Arc<StopSignal>,
    status: Arc<Status>,
    thread: Option<JoinHandle<()>>,
    done: Mutex<Receiver<()>>,
    stop_timeout: Duration,
}

impl Observer {
    /// Spawn the observer thread.
    ///
    /// `on_change` runs on the observer thread after every change; returning
    /// false ends the observer.
    pub fn start<B, F>(
        backend: Arc<B>,
        identity: DeviceIdentity,
        options: ObserverOptions,
        on_change: F,
    ) -> Result<Self>
    where
        B: MixerBackend,
        F: FnMut() -> bool + Send + 'static,
    {
        let signal = Arc::new(StopSignal::new()?);
        let status = Arc::new(Status::default());
        let (done_tx, done) = mpsc::channel();
        let stop_timeout = options.stop_timeout;

        let worker = Worker {
            backend,
            identity,
            options,
            signal: Arc::clone(&signal),
            status: Arc::clone(&status),
            on_change,
        };
        let thread_status = Arc::clone(&status);

        let thread = thread::Builder::new()
            .name("volmix-observer".into())
            .spawn(move || {
                worker.run();
                thread_status.set(ObserverState::Stopped);
                let _ = done_tx.send(());
            })
            .map_err(|e| {
                MixerError::ObserverSetup(format!("failed to spawn observer thread: {}", e))
            })?;

        Ok(Self {
            signal,
            status,
            thread: Some(thread),
            done: Mutex::new(done),
            stop_timeout,
        })
    }

    pub fn state(&self) -> ObserverState {
        self.status.get()
    }

    /// Whether the thread has been started and not yet stopped
    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.state() != ObserverState::Stopped
    }

    /// Ask the thread to exit and wait for it, at most `stop_timeout`
    pub fn stop(&mut self) {
        self.signal.request();

        let Some(thread) = self.thread.take() else {
            return;
        };

        let done = self.done.get_mut().unwrap_or_else(PoisonError::into_inner);
        match done.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    warn!("Mixer observer thread panicked");
                }
                debug!("Mixer observer stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Mixer observer did not stop within {:?}, detaching it",
                    self.stop_timeout
                );
            }
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.stop();
    }
}
