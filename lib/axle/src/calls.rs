//! Session-correlated method promises.
//!
//! Every outstanding method request owns one slot keyed by its session id.
//! The reactor completes slots when responses arrive; disconnects and
//! service-down events cancel all of them at once. The map has its own short
//! critical section because it is mutated both from the reactor (completion)
//! and from application threads (new requests).

use chassis::ident::SessionId;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

use crate::shared::ErrorKind;

struct CallState<T> {
    slot: Mutex<Option<Result<T, ErrorKind>>>,
    ready: Condvar,
}

/// Blocking handle on one outstanding call.
pub struct CallFuture<T> {
    state: Arc<CallState<T>>,
}

impl<T> CallFuture<T> {
    /// Blocks until the call completes.
    pub fn wait(&self) -> Result<T, ErrorKind>
    where
        T: Clone,
    {
        let mut slot = self.state.slot.lock();

        while slot.is_none() {
            self.state.ready.wait(&mut slot);
        }

        slot.as_ref().expect("Completed slot must hold a value").clone()
    }

    /// Blocks until the call completes or the timeout elapses.
    pub fn wait_for(&self, timeout: Duration) -> Option<Result<T, ErrorKind>>
    where
        T: Clone,
    {
        let mut slot = self.state.slot.lock();

        if slot.is_none() {
            self.state.ready.wait_for(&mut slot, timeout);
        }

        slot.clone()
    }

    /// Non-blocking completion check.
    pub fn poll(&self) -> Option<Result<T, ErrorKind>>
    where
        T: Clone,
    {
        self.state.slot.lock().clone()
    }
}

pub struct PendingCalls<T> {
    calls: Mutex<HashMap<SessionId, Arc<CallState<T>>>>,
}

impl<T> PendingCalls<T> {
    pub fn new() -> PendingCalls<T> {
        PendingCalls {
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    /// Registers a new outstanding call and hands back its future.
    pub fn register(&self, session: SessionId) -> CallFuture<T> {
        let state = Arc::new(CallState {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        });

        self.calls.lock().insert(session, state.clone());

        CallFuture { state }
    }

    /// Drops an outstanding call without completing it (caller gave up).
    pub fn forget(&self, session: SessionId) {
        self.calls.lock().remove(&session);
    }

    /// Completes the call for `session`. Returns false when no such call is
    /// outstanding (late or duplicate response).
    pub fn complete(&self, session: SessionId, value: T) -> bool {
        self.finish(session, Ok(value))
    }

    /// Fails the call for `session`.
    pub fn fail(&self, session: SessionId, kind: ErrorKind) -> bool {
        self.finish(session, Err(kind))
    }

    /// Cancels every outstanding call with `kind`. Used on disconnect and on
    /// service-down, before the triggering callback returns.
    pub fn cancel_all(&self, kind: ErrorKind) {
        let drained: Vec<Arc<CallState<T>>> = self.calls.lock().drain().map(|(_, state)| state).collect();

        for state in drained {
            let mut slot = state.slot.lock();

            if slot.is_none() {
                *slot = Some(Err(kind));
                state.ready.notify_all();
            }
        }
    }

    fn finish(&self, session: SessionId, result: Result<T, ErrorKind>) -> bool {
        let state = self.calls.lock().remove(&session);

        match state {
            Some(state) => {
                let mut slot = state.slot.lock();
                *slot = Some(result);
                state.ready.notify_all();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_wakes_waiter() {
        let calls: Arc<PendingCalls<u32>> = Arc::new(PendingCalls::new());
        let future = calls.register(1);

        let completer = calls.clone();
        let handle = thread::spawn(move || {
            assert!(completer.complete(1, 42));
        });

        assert_eq!(future.wait().unwrap(), 42);
        handle.join().unwrap();
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn test_fail_surfaces_error_kind() {
        let calls: PendingCalls<u32> = PendingCalls::new();
        let future = calls.register(7);

        assert!(calls.fail(7, ErrorKind::UnknownMethodId));
        assert_eq!(future.wait().unwrap_err(), ErrorKind::UnknownMethodId);
    }

    #[test]
    fn test_late_response_is_reported() {
        let calls: PendingCalls<u32> = PendingCalls::new();

        assert!(!calls.complete(99, 1));
    }

    #[test]
    fn test_cancel_all_fails_every_pending_call() {
        let calls: PendingCalls<u32> = PendingCalls::new();

        let first = calls.register(1);
        let second = calls.register(2);

        calls.cancel_all(ErrorKind::ServiceNotAvailable);

        assert_eq!(first.wait().unwrap_err(), ErrorKind::ServiceNotAvailable);
        assert_eq!(second.wait().unwrap_err(), ErrorKind::ServiceNotAvailable);
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn test_wait_for_times_out_on_silence() {
        let calls: PendingCalls<u32> = PendingCalls::new();
        let future = calls.register(1);

        assert!(future.wait_for(Duration::from_millis(20)).is_none());

        calls.complete(1, 5);
        assert_eq!(future.wait_for(Duration::from_millis(20)), Some(Ok(5)));
    }

    #[test]
    fn test_forget_makes_completion_a_no_op() {
        let calls: PendingCalls<u32> = PendingCalls::new();
        let _future = calls.register(3);

        calls.forget(3);
        assert!(!calls.complete(3, 1));
    }
}
