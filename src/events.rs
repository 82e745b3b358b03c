//! Changefeed published by the engine, and the optional delivery context that
//! lets a consumer (e.g. a UI thread) run every hop update itself.

use std::thread::{self, ThreadId};

use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::engine::SessionState;
use crate::hop_stats::HopRecord;

/// Capacity of the broadcast changefeed. Slow subscribers see `Lagged` and should
/// re-read [`HopProbeEngine::hops`](crate::engine::HopProbeEngine::hops).
pub const EVENT_CAPACITY: usize = 4096;

/// Everything a consumer needs to mirror the hop collection.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Human readable progress text.
    Status(String),
    StateChanged(SessionState),
    /// A record was inserted at `index` of the ordered collection.
    HopInserted { index: usize, record: HopRecord },
    /// The record for `hop` was removed (pruned beyond the target).
    HopRemoved { hop: u8 },
    /// Fields of an existing record changed; carries the new snapshot.
    HopChanged(HopRecord),
    /// The whole collection was emptied.
    HopsCleared,
}

pub(crate) fn channel() -> broadcast::Sender<SessionEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

/// Unit of work scheduled onto a delivery context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A thread that should execute hop updates. Created on that thread together with
/// the [`DeliveryPump`] the thread must drive.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    owner: ThreadId,
    sender: mpsc::UnboundedSender<Job>,
}

impl DeliveryContext {
    /// Designate the calling thread as the delivery context.
    pub fn for_current_thread() -> (Self, DeliveryPump) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let context = Self {
            owner: thread::current().id(),
            sender,
        };
        (context, DeliveryPump { receiver })
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Queue a job. Hands the job back when the pump is gone.
    fn post(&self, job: Job) -> Result<(), Job> {
        self.sender.send(job).map_err(|e| e.0)
    }
}

/// Receiving end of a [`DeliveryContext`]; jobs run in the order they were posted.
pub struct DeliveryPump {
    receiver: mpsc::UnboundedReceiver<Job>,
}

impl DeliveryPump {
    /// Run every job queued so far without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Wait for the next job and run it. Returns `false` once every sender is gone.
    pub async fn run_next(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}

/// Routes jobs either inline or onto the designated delivery context.
#[derive(Debug, Clone, Default)]
pub(crate) struct Dispatcher {
    context: Option<DeliveryContext>,
}

impl Dispatcher {
    pub(crate) fn new(context: Option<DeliveryContext>) -> Self {
        Self { context }
    }

    /// Run inline when there is no context or we are already on it; otherwise post.
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match &self.context {
            Some(context) if !context.is_current() => {
                if let Err(job) = context.post(Box::new(job)) {
                    trace!("Delivery pump dropped, running update inline");
                    job();
                }
            }
            _ => job(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_dispatch_inline_without_context() {
        let dispatcher = Dispatcher::new(None);
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        dispatcher.execute(move || *flag.lock().unwrap() = true);
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_dispatch_inline_on_owner_thread() {
        let (context, mut pump) = DeliveryContext::for_current_thread();
        let dispatcher = Dispatcher::new(Some(context));
        let ran = Arc::new(Mutex::new(0));
        let counter = ran.clone();
        dispatcher.execute(move || *counter.lock().unwrap() += 1);
        assert_eq!(*ran.lock().unwrap(), 1);
        assert_eq!(pump.run_pending(), 0);
    }

    #[test]
    fn test_dispatch_from_other_thread_is_queued_in_order() {
        let (context, mut pump) = DeliveryContext::for_current_thread();
        let dispatcher = Dispatcher::new(Some(context));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let seen = seen.clone();
            thread::spawn(move || {
                for i in 0..5 {
                    let seen = seen.clone();
                    dispatcher.execute(move || seen.lock().unwrap().push(i));
                }
            })
        };
        worker.join().unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(pump.run_pending(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_run_next_drains_then_reports_closed() {
        let (context, mut pump) = DeliveryContext::for_current_thread();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let seen = seen.clone();
            let dispatcher = Dispatcher::new(Some(context.clone()));
            thread::spawn(move || {
                for i in 0..2 {
                    let seen = seen.clone();
                    dispatcher.execute(move || seen.lock().unwrap().push(i));
                }
            })
        };
        worker.join().unwrap();
        drop(context);

        assert!(tokio_test::block_on(pump.run_next()));
        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert!(tokio_test::block_on(pump.run_next()));
        assert!(!tokio_test::block_on(pump.run_next()));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_dropped_pump_falls_back_to_inline() {
        let (context, pump) = DeliveryContext::for_current_thread();
        drop(pump);
        let dispatcher = Dispatcher::new(Some(context));
        let ran = Arc::new(Mutex::new(false));

        let handle = {
            let ran = ran.clone();
            thread::spawn(move || dispatcher.execute(move || *ran.lock().unwrap() = true))
        };
        handle.join().unwrap();
        assert!(*ran.lock().unwrap());
    }
}
