//! Deliver buffers to requesters, immediately or once one becomes available.

use crate::Buffer;
use futures::channel::{mpsc, oneshot};

/// A requester that can receive a [Buffer] asynchronously.
///
/// A pool invokes [Notify::deliver] at most once per registered request and never while holding
/// its critical section, so implementations may allocate from or release to the same pool.
pub trait Notify: Send + 'static {
    /// Deliver `buffer` to the requester.
    ///
    /// Returns the buffer if the requester can no longer accept it (for example, because the
    /// task waiting on it was dropped). The pool then releases it again.
    fn deliver(self: Box<Self>, buffer: Buffer) -> Result<(), Buffer>;

    /// Returns `true` if delivery is already known to be refused.
    ///
    /// Pools drop abandoned requesters from their wait list instead of holding them until a
    /// buffer reaches them.
    fn is_abandoned(&self) -> bool {
        false
    }
}

impl Notify for oneshot::Sender<Buffer> {
    fn deliver(self: Box<Self>, buffer: Buffer) -> Result<(), Buffer> {
        (*self).send(buffer)
    }

    fn is_abandoned(&self) -> bool {
        self.is_canceled()
    }
}

impl Notify for mpsc::UnboundedSender<Buffer> {
    fn deliver(self: Box<Self>, buffer: Buffer) -> Result<(), Buffer> {
        self.unbounded_send(buffer).map_err(|err| err.into_inner())
    }

    fn is_abandoned(&self) -> bool {
        self.is_closed()
    }
}

/// A [Notify] target that runs a closure with the delivered buffer.
///
/// The closure always accepts the buffer.
pub struct Callback<F>(pub F);

impl<F> Notify for Callback<F>
where
    F: FnOnce(Buffer) + Send + 'static,
{
    fn deliver(self: Box<Self>, buffer: Buffer) -> Result<(), Buffer> {
        (self.0)(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DynamicConfig, DynamicPool};
    use futures::{FutureExt, StreamExt};
    use prometheus_client::registry::Registry;
    use std::sync::{Arc, Mutex};

    fn pool() -> DynamicPool {
        DynamicPool::new(DynamicConfig::default(), &mut Registry::default())
    }

    #[test]
    fn test_oneshot_delivers() {
        let pool = pool();
        let (tx, rx) = oneshot::channel();
        let target: Box<dyn Notify> = Box::new(tx);
        assert!(target.deliver(pool.alloc(3)).is_ok());

        let buffer = rx.now_or_never().unwrap().unwrap();
        assert_eq!(buffer.size(), 3);
    }

    #[test]
    fn test_oneshot_refuses_when_receiver_dropped() {
        let pool = pool();
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let target: Box<dyn Notify> = Box::new(tx);
        let refused = target.deliver(pool.alloc(7)).unwrap_err();
        assert_eq!(refused.size(), 7);
    }

    #[test]
    fn test_unbounded_sender() {
        let pool = pool();
        let (tx, mut rx) = mpsc::unbounded();
        let target: Box<dyn Notify> = Box::new(tx.clone());
        assert!(target.deliver(pool.alloc(1)).is_ok());
        assert_eq!(rx.next().now_or_never().unwrap().unwrap().size(), 1);

        drop(rx);
        let target: Box<dyn Notify> = Box::new(tx);
        assert!(target.deliver(pool.alloc(1)).is_err());
    }

    #[test]
    fn test_abandoned_targets() {
        let (tx, rx) = oneshot::channel::<Buffer>();
        assert!(!Notify::is_abandoned(&tx));
        drop(rx);
        assert!(Notify::is_abandoned(&tx));

        let (tx, rx) = mpsc::unbounded::<Buffer>();
        assert!(!Notify::is_abandoned(&tx));
        drop(rx);
        assert!(Notify::is_abandoned(&tx));

        assert!(!Callback(|_: Buffer| {}).is_abandoned());
    }

    #[test]
    fn test_callback_accepts() {
        let pool = pool();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let target: Box<dyn Notify> = Box::new(Callback({
            let seen = seen.clone();
            move |buffer: Buffer| seen.lock().unwrap().push(buffer.size())
        }));
        assert!(target.deliver(pool.alloc(12)).is_ok());
        assert_eq!(*seen.lock().unwrap(), vec![12]);
    }
}
