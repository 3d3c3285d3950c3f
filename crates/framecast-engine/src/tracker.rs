//! Command-Buffer Completion Tracker
//!
//! Turns GPU completion callbacks (which arrive on whatever thread the GPU driver likes, in
//! whatever order) into single-fire continuations that run:
//! - on one dedicated dispatch thread (`publish`), and
//! - strictly in submission order.
//!
//! A completion that arrives early is parked until every earlier submission has been
//! dispatched. Publishing out of order would let a consumer see an older frame as "newest".
//!
//! A submission pending longer than the GPU timeout is dispatched as `GpuTimeout` so a hung
//! command buffer cannot hold back later frames forever. A late completion for it is ignored.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{ShareError, ShareResult};
use crate::gpu::{CommandBuffer, CommandStatus};
use crate::{logi, logw};

pub type Continuation = Box<dyn FnOnce(ShareResult<()>) + Send + 'static>;

enum TrackerMsg {
    Register { ticket: u64, cont: Continuation, submitted_at: Instant },
    Completed { ticket: u64, status: CommandStatus },
    Shutdown { deadline: Instant },
}

struct Pending {
    cont: Continuation,
    submitted_at: Instant,
    outcome: Option<ShareResult<()>>,
}

struct Submit {
    next_ticket: u64,
    accepting: bool,
}

pub struct CompletionTracker {
    tx: Sender<TrackerMsg>,
    submit: Mutex<Submit>,
    in_flight: Arc<AtomicUsize>,
    join: Mutex<Option<JoinHandle<usize>>>,
}

impl CompletionTracker {
    pub fn new(gpu_timeout: Duration) -> ShareResult<Self> {
        let (tx, rx) = unbounded::<TrackerMsg>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let in_flight_thread = in_flight.clone();
        let join = std::thread::Builder::new()
            .name("publish".to_string())
            .spawn(move || dispatch_loop(rx, gpu_timeout, in_flight_thread))
            .map_err(ShareError::io)?;

        Ok(Self {
            tx,
            submit: Mutex::new(Submit { next_ticket: 0, accepting: true }),
            in_flight,
            join: Mutex::new(Some(join)),
        })
    }

    /// Run `cont` once `cb` has completed, after every earlier submission's continuation.
    ///
    /// Returns the submission ticket.
    pub fn await_completion(&self, cb: &dyn CommandBuffer, cont: Continuation) -> ShareResult<u64> {
        let ticket = {
            let mut submit = self
                .submit
                .lock()
                .map_err(|_| ShareError::Io { msg: "tracker lock poisoned".into() })?;
            if !submit.accepting {
                return Err(ShareError::Stopped);
            }
            let ticket = submit.next_ticket;
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            // Registration is sent under the lock so tickets reach the dispatcher gap-free.
            let sent = self
                .tx
                .send(TrackerMsg::Register { ticket, cont, submitted_at: Instant::now() });
            if sent.is_err() {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(ShareError::Stopped);
            }
            submit.next_ticket += 1;
            ticket
        };

        let tx = self.tx.clone();
        cb.on_completed(Box::new(move |status| {
            let _ = tx.send(TrackerMsg::Completed { ticket, status });
        }));
        Ok(ticket)
    }

    /// Submissions whose continuation has not run yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting work, give in-flight submissions up to `timeout` to complete, abandon the
    /// rest and join the dispatch thread. Returns the number of abandoned submissions.
    pub fn shutdown(&self, timeout: Duration) -> usize {
        if let Ok(mut submit) = self.submit.lock() {
            if submit.accepting {
                submit.accepting = false;
                let _ = self.tx.send(TrackerMsg::Shutdown { deadline: Instant::now() + timeout });
            }
        }
        let join = self.join.lock().ok().and_then(|mut j| j.take());
        match join {
            Some(j) => j.join().unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for CompletionTracker {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

fn status_to_result(status: CommandStatus) -> ShareResult<()> {
    match status {
        CommandStatus::Completed => Ok(()),
        CommandStatus::Error(msg) => Err(ShareError::RenderFailed { msg }),
        CommandStatus::DeviceLost => Err(ShareError::DeviceLost),
    }
}

fn dispatch_loop(rx: Receiver<TrackerMsg>, gpu_timeout: Duration, in_flight: Arc<AtomicUsize>) -> usize {
    let mut pending: BTreeMap<u64, Pending> = BTreeMap::new();
    let mut next: u64 = 0;
    let mut shutdown_at: Option<Instant> = None;

    loop {
        // Wake for the earliest GPU timeout or the shutdown deadline.
        let mut wake: Option<Instant> = pending
            .values()
            .filter(|p| p.outcome.is_none())
            .map(|p| p.submitted_at + gpu_timeout)
            .min();
        if let Some(d) = shutdown_at {
            wake = Some(wake.map_or(d, |w| w.min(d)));
        }

        let msg = match wake {
            Some(at) => match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(m) => Some(m),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    shutdown_at.get_or_insert_with(Instant::now);
                    None
                }
            },
            None => match rx.recv() {
                Ok(m) => Some(m),
                Err(_) => {
                    shutdown_at = Some(Instant::now());
                    None
                }
            },
        };

        match msg {
            Some(TrackerMsg::Register { ticket, cont, submitted_at }) => {
                pending.insert(ticket, Pending { cont, submitted_at, outcome: None });
            }
            Some(TrackerMsg::Completed { ticket, status }) => match pending.get_mut(&ticket) {
                Some(p) if p.outcome.is_none() => p.outcome = Some(status_to_result(status)),
                _ => logw!("TRACKER", "late completion for submission {ticket} ignored"),
            },
            Some(TrackerMsg::Shutdown { deadline }) => shutdown_at = Some(deadline),
            None => {}
        }

        let now = Instant::now();
        for p in pending.values_mut() {
            if p.outcome.is_none() && now >= p.submitted_at + gpu_timeout {
                p.outcome = Some(Err(ShareError::GpuTimeout {
                    waited_ms: now.duration_since(p.submitted_at).as_millis() as u64,
                }));
            }
        }

        // Dispatch the completed prefix, in order.
        while pending.get(&next).map_or(false, |p| p.outcome.is_some()) {
            if let Some(p) = pending.remove(&next) {
                if let Some(outcome) = p.outcome {
                    (p.cont)(outcome);
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            next += 1;
        }

        if let Some(deadline) = shutdown_at {
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                let abandoned = pending.values().filter(|p| p.outcome.is_none()).count();
                logw!("TRACKER", "abandoning {abandoned} in-flight submission(s) at shutdown");
                // Keep submission order even while abandoning.
                for (_, p) in std::mem::take(&mut pending) {
                    let outcome = p.outcome.unwrap_or(Err(ShareError::Abandoned));
                    (p.cont)(outcome);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                return abandoned;
            }
        }
    }

    logi!("TRACKER", "dispatch stopped");
    0
}
