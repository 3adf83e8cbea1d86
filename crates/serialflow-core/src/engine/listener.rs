//! Connection and raw-data listeners

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SerialError;

/// Connection lifecycle notifications
pub trait ConnectListener: Send + Sync {
    fn on_connect(&self, path: &str);

    /// Open failure, or reconnection given up with [`SerialError::ReconnectFailed`]
    fn on_disconnect(&self, path: &str, error: SerialError);
}

/// Observes every frame written and every frame read, matched or not
pub trait DataListener: Send + Sync {
    fn on_request(&self, data: &[u8]);

    fn on_response(&self, data: &[u8]);
}

struct FnConnectListener<C, D> {
    on_connect: C,
    on_disconnect: D,
}

impl<C, D> ConnectListener for FnConnectListener<C, D>
where
    C: Fn(&str) + Send + Sync,
    D: Fn(&str, SerialError) + Send + Sync,
{
    fn on_connect(&self, path: &str) {
        (self.on_connect)(path)
    }

    fn on_disconnect(&self, path: &str, error: SerialError) {
        (self.on_disconnect)(path, error)
    }
}

struct FnDataListener<Q, R> {
    on_request: Q,
    on_response: R,
}

impl<Q, R> DataListener for FnDataListener<Q, R>
where
    Q: Fn(&[u8]) + Send + Sync,
    R: Fn(&[u8]) + Send + Sync,
{
    fn on_request(&self, data: &[u8]) {
        (self.on_request)(data)
    }

    fn on_response(&self, data: &[u8]) {
        (self.on_response)(data)
    }
}

/// Build a connect listener from two closures
pub fn connect_listener<C, D>(on_connect: C, on_disconnect: D) -> Arc<dyn ConnectListener>
where
    C: Fn(&str) + Send + Sync + 'static,
    D: Fn(&str, SerialError) + Send + Sync + 'static,
{
    Arc::new(FnConnectListener {
        on_connect,
        on_disconnect,
    })
}

/// Build a data listener from two closures
pub fn data_listener<Q, R>(on_request: Q, on_response: R) -> Arc<dyn DataListener>
where
    Q: Fn(&[u8]) + Send + Sync + 'static,
    R: Fn(&[u8]) + Send + Sync + 'static,
{
    Arc::new(FnDataListener {
        on_request,
        on_response,
    })
}

/// Registered listeners, identified by handle
pub(crate) struct Registry<L: ?Sized> {
    entries: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for Registry<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> Registry<L> {
    pub(crate) fn add(&self, listener: Arc<L>) {
        let mut entries = self.entries.write();
        if !entries.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entries.push(listener);
        }
    }

    pub(crate) fn remove(&self, listener: &Arc<L>) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|l| !Arc::ptr_eq(l, listener));
        entries.len() != before
    }

    /// Copy of the current list; callbacks run without the lock held
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries.read().clone()
    }
}

#[derive(Default)]
pub(crate) struct Listeners {
    pub(crate) connect: Registry<dyn ConnectListener>,
    pub(crate) data: Registry<dyn DataListener>,
}
