//! Single-threaded event loop driving all transport IO and deferred work.
//!
//! Streams register with an edge-triggered interest and a weak handler
//! reference; jobs posted from any thread run on the loop after every IO
//! callback of the current iteration has returned, which is what makes
//! "record the error, destroy later" teardown paths safe.

use chassis::logging::{self, Logger};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Token of the internal wakeup registration.
const WAKE_TOKEN: mio::Token = mio::Token(0);

/// Receiver of readiness events for one registered stream.
pub trait EventHandler: Send + Sync {
    fn on_ready(&self, reactor: &Arc<Reactor>, ready: mio::Ready);
}

/// Deferred unit of work executed on the reactor once the current iteration's
/// IO callbacks have unwound.
pub type Job = Box<dyn FnOnce(&Arc<Reactor>) + Send>;

pub struct Reactor {
    log: Logger,
    poll: mio::Poll,
    events: Mutex<mio::Events>,
    handlers: Mutex<HashMap<usize, Weak<dyn EventHandler>>>,
    next_token: AtomicUsize,
    jobs: Mutex<Vec<Job>>,
    wake: mio::SetReadiness,
    // Keeps the wakeup event source registered for the lifetime of the loop.
    _wake_registration: mio::Registration,
}

impl Reactor {
    pub fn new(log: &Logger) -> io::Result<Arc<Reactor>> {
        let poll = mio::Poll::new()?;
        let (registration, wake) = mio::Registration::new2();

        poll.register(
            &registration,
            WAKE_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        Ok(Arc::new(Reactor {
            log: log.new(logging::o!("component" => "reactor")),
            poll,
            events: Mutex::new(mio::Events::with_capacity(1024)),
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            jobs: Mutex::new(Vec::new()),
            wake,
            _wake_registration: registration,
        }))
    }

    /// Allocates a token, stores the handler and lets the caller perform the
    /// actual poll registration of its event source.
    pub fn register_io<F>(&self, handler: Weak<dyn EventHandler>, register: F) -> io::Result<mio::Token>
    where
        F: FnOnce(&mio::Poll, mio::Token) -> io::Result<()>,
    {
        let token = mio::Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        register(&self.poll, token)?;
        self.handlers.lock().insert(token.0, handler);

        logging::trace!(self.log, "io source registered"; "token" => token.0);
        Ok(token)
    }

    /// Drops the handler table entry and lets the caller deregister its event
    /// source from the poll.
    pub fn deregister_io<F>(&self, token: mio::Token, deregister: F) -> io::Result<()>
    where
        F: FnOnce(&mio::Poll) -> io::Result<()>,
    {
        self.handlers.lock().remove(&token.0);

        let result = deregister(&self.poll);
        logging::trace!(self.log, "io source deregistered"; "token" => token.0, "result" => ?result);
        result
    }

    /// Enqueues a job and wakes the loop. Safe to call from any thread,
    /// including from inside an IO callback.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce(&Arc<Reactor>) + Send + 'static,
    {
        self.jobs.lock().push(Box::new(job));

        if let Err(err) = self.wake.set_readiness(mio::Ready::readable()) {
            logging::error!(self.log, "reactor wakeup failed"; "error" => %err);
        }
    }

    /// Runs one loop iteration: dispatch all pending readiness events, then
    /// drain the job queue. Returns the number of IO events dispatched.
    pub fn poll_once(self: &Arc<Self>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut ready_handlers: Vec<(mio::Token, mio::Ready)> = Vec::new();

        {
            let mut events = self.events.lock();
            self.poll.poll(&mut events, timeout)?;

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    // Reset the wakeup source; the queued jobs run below.
                    let _ = self.wake.set_readiness(mio::Ready::empty());
                } else {
                    ready_handlers.push((event.token(), event.readiness()));
                }
            }
        }

        let dispatched = ready_handlers.len();

        for (token, ready) in ready_handlers {
            let handler = self.handlers.lock().get(&token.0).cloned();

            if let Some(handler) = handler.and_then(|weak| weak.upgrade()) {
                handler.on_ready(self, ready);
            }
        }

        // Jobs posted during the callbacks above run with no IO callback
        // frames left on the stack.
        loop {
            let jobs = mem::replace(&mut *self.jobs.lock(), Vec::new());

            if jobs.is_empty() {
                break;
            }

            for job in jobs {
                job(self);
            }
        }

        Ok(dispatched)
    }

    /// Drives the loop until `running` is cleared. Intended for the dedicated
    /// reactor thread.
    pub fn run(self: &Arc<Self>, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            if let Err(err) = self.poll_once(Some(Duration::from_millis(50))) {
                logging::error!(self.log, "reactor poll failed"; "error" => %err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        hits: AtomicUsize,
    }

    impl EventHandler for CountingHandler {
        fn on_ready(&self, _reactor: &Arc<Reactor>, _ready: mio::Ready) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_posted_job_runs_on_poll() {
        let reactor = Reactor::new(&logging::discard()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_clone = ran.clone();
        reactor.post(move |_| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        reactor.poll_once(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_job_posted_from_job_runs_same_iteration() {
        let reactor = Reactor::new(&logging::discard()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let outer = ran.clone();
        reactor.post(move |reactor| {
            let inner = outer.clone();
            outer.fetch_add(1, Ordering::SeqCst);
            reactor.post(move |_| {
                inner.fetch_add(1, Ordering::SeqCst);
            });
        });

        reactor.poll_once(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registered_source_dispatches_to_handler() {
        let reactor = Reactor::new(&logging::discard()).unwrap();
        let handler = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });

        let (registration, readiness) = mio::Registration::new2();
        let handler_dyn: Arc<dyn EventHandler> = handler.clone();
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler_dyn);

        reactor
            .register_io(weak, |poll, token| {
                poll.register(
                    &registration,
                    token,
                    mio::Ready::readable(),
                    mio::PollOpt::edge(),
                )
            })
            .unwrap();

        readiness.set_readiness(mio::Ready::readable()).unwrap();
        reactor.poll_once(Some(Duration::from_millis(100))).unwrap();

        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dead_handler_is_skipped() {
        let reactor = Reactor::new(&logging::discard()).unwrap();

        let (registration, readiness) = mio::Registration::new2();
        let handler = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });
        let handler_dyn: Arc<dyn EventHandler> = handler.clone();
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler_dyn);

        reactor
            .register_io(weak, |poll, token| {
                poll.register(
                    &registration,
                    token,
                    mio::Ready::readable(),
                    mio::PollOpt::edge(),
                )
            })
            .unwrap();

        drop(handler);
        readiness.set_readiness(mio::Ready::readable()).unwrap();

        // Must not panic; the dead weak reference is simply skipped.
        reactor.poll_once(Some(Duration::from_millis(100))).unwrap();
    }
}
