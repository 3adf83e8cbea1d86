//! Callback dispatcher
//!
//! Every user callback runs on one task, in the order events were produced
//! by the I/O loops. A panicking callback is logged and skipped.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, trace};

use super::listener::Listeners;
use crate::error::SerialError;
use crate::request::{Request, Response, ResponseListener};

pub(crate) enum Event {
    Connected {
        path: String,
    },
    Disconnected {
        path: String,
        error: SerialError,
    },
    RawRequest(Vec<u8>),
    RawResponse(Vec<u8>),
    Response {
        listener: Arc<dyn ResponseListener>,
        response: Response,
    },
    Failure {
        listener: Arc<dyn ResponseListener>,
        request: Arc<Request>,
        error: SerialError,
    },
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::Disconnected { .. } => "disconnected",
            Event::RawRequest(_) => "raw_request",
            Event::RawResponse(_) => "raw_response",
            Event::Response { .. } => "response",
            Event::Failure { .. } => "failure",
        }
    }
}

pub(crate) type EventSender = mpsc::UnboundedSender<Event>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub(crate) fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Runs until every sender is gone
pub(crate) async fn run(mut events: EventReceiver, listeners: Arc<Listeners>) {
    while let Some(event) = events.recv().await {
        let kind = event.kind();
        trace!(kind, "dispatching event");
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| deliver(&listeners, event))) {
            error!(kind, panic = %panic_message(panic.as_ref()), "listener panicked");
        }
    }
    trace!("dispatcher stopped");
}

fn deliver(listeners: &Listeners, event: Event) {
    match event {
        Event::Connected { path } => {
            for l in listeners.connect.snapshot() {
                l.on_connect(&path);
            }
        }
        Event::Disconnected { path, error } => {
            for l in listeners.connect.snapshot() {
                l.on_disconnect(&path, error.clone());
            }
        }
        Event::RawRequest(data) => {
            for l in listeners.data.snapshot() {
                l.on_request(&data);
            }
        }
        Event::RawResponse(data) => {
            for l in listeners.data.snapshot() {
                l.on_response(&data);
            }
        }
        Event::Response { listener, response } => listener.on_response(response),
        Event::Failure {
            listener,
            request,
            error,
        } => listener.on_failure(request, error),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
