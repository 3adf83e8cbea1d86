//! Requests, responses and match rules
//!
//! A [`Request`] carries the outgoing payload together with everything the
//! engine needs to correlate it: match rules, timeout, retry budget,
//! expected response count and the listener to notify.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SerialError;

/// Default response timeout for a request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Response counts at or above this value mean "unlimited"
pub const UNLIMITED_RESPONSE_COUNT: u32 = 10_000;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a request instance
///
/// Two requests with identical payloads still get distinct ids, so the
/// correlation table never confuses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How many responses a request expects before it is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCount {
    /// Resolve after this many matched frames
    Times(u32),
    /// Streaming expectation, never removed by a match
    Unlimited,
}

impl Default for ResponseCount {
    fn default() -> Self {
        Self::Times(1)
    }
}

impl From<u32> for ResponseCount {
    fn from(count: u32) -> Self {
        if count >= UNLIMITED_RESPONSE_COUNT {
            Self::Unlimited
        } else {
            Self::Times(count.max(1))
        }
    }
}

impl ResponseCount {
    /// Count one delivered response; returns true once the expectation is used up
    pub fn consume(&mut self) -> bool {
        match self {
            Self::Unlimited => false,
            Self::Times(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        }
    }
}

/// Predicate deciding whether an incoming frame answers a request
pub trait ResponseRule: Send + Sync {
    fn matches(&self, request: &Request, data: &[u8]) -> bool;
}

impl<F> ResponseRule for F
where
    F: Fn(&Request, &[u8]) -> bool + Send + Sync,
{
    fn matches(&self, request: &Request, data: &[u8]) -> bool {
        self(request, data)
    }
}

/// Receives the outcome of a submitted request
///
/// Called on the engine's callback task, never on an I/O loop.
pub trait ResponseListener: Send + Sync {
    fn on_response(&self, response: Response);

    fn on_failure(&self, request: Arc<Request>, error: SerialError);
}

struct FnListener<R, F> {
    on_response: R,
    on_failure: F,
}

impl<R, F> ResponseListener for FnListener<R, F>
where
    R: Fn(Response) + Send + Sync,
    F: Fn(Arc<Request>, SerialError) + Send + Sync,
{
    fn on_response(&self, response: Response) {
        (self.on_response)(response)
    }

    fn on_failure(&self, request: Arc<Request>, error: SerialError) {
        (self.on_failure)(request, error)
    }
}

/// Build a listener from two closures
pub fn listener<R, F>(on_response: R, on_failure: F) -> Arc<dyn ResponseListener>
where
    R: Fn(Response) + Send + Sync + 'static,
    F: Fn(Arc<Request>, SerialError) + Send + Sync + 'static,
{
    Arc::new(FnListener {
        on_response,
        on_failure,
    })
}

/// An outgoing request awaiting one or more responses
#[derive(Clone)]
pub struct Request {
    id: RequestId,
    data: Vec<u8>,
    tag: Option<String>,
    rules: Vec<Arc<dyn ResponseRule>>,
    listener: Option<Arc<dyn ResponseListener>>,
    timeout: Duration,
    timeout_retry: u32,
    response_count: ResponseCount,
    exclusive: bool,
}

impl Request {
    /// Create a request with default timeout, no retries and one expected response
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: RequestId::next(),
            data: data.into(),
            tag: None,
            rules: Vec::new(),
            listener: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            timeout_retry: 0,
            response_count: ResponseCount::default(),
            exclusive: false,
        }
    }

    /// Add a match rule; all rules must pass for a frame to match
    pub fn with_rule(mut self, rule: impl ResponseRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ResponseListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Response timeout; `Duration::ZERO` disables it
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of resends allowed after a timeout
    pub fn with_timeout_retry(mut self, count: u32) -> Self {
        self.timeout_retry = count;
        self
    }

    pub fn with_response_count(mut self, count: impl Into<ResponseCount>) -> Self {
        self.response_count = count.into();
        self
    }

    /// Block the send loop until this request's response or timeout resolves
    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the payload (used by outgoing interceptors)
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn set_tag(&mut self, tag: Option<String>) {
        self.tag = tag;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout_retry(&self) -> u32 {
        self.timeout_retry
    }

    pub fn set_timeout_retry(&mut self, count: u32) {
        self.timeout_retry = count;
    }

    pub fn response_count(&self) -> ResponseCount {
        self.response_count
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    pub(crate) fn rules(&self) -> &[Arc<dyn ResponseRule>] {
        &self.rules
    }

    pub(crate) fn listener(&self) -> Option<&Arc<dyn ResponseListener>> {
        self.listener.as_ref()
    }

    /// Keep the identity of `original` after an interceptor rebuilt the request
    pub(crate) fn adopt_id(&mut self, original: RequestId) {
        self.id = original;
    }

    /// Payload as upper-case hex
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.data)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("data", &self.to_hex())
            .field("tag", &self.tag)
            .field("rules", &self.rules.len())
            .field("timeout", &self.timeout)
            .field("timeout_retry", &self.timeout_retry)
            .field("response_count", &self.response_count)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

/// A frame that matched a request
#[derive(Debug, Clone)]
pub struct Response {
    data: Vec<u8>,
    request: Option<Arc<Request>>,
}

impl Response {
    pub fn new(data: impl Into<Vec<u8>>, request: Option<Arc<Request>>) -> Self {
        Self {
            data: data.into(),
            request,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the payload (used by incoming interceptors)
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// The request this frame was matched against
    pub fn request(&self) -> Option<&Arc<Request>> {
        self.request.as_ref()
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.data)
    }
}

/// Ready-made match rules
pub mod rules {
    use super::{Request, ResponseRule};

    /// Byte at `index` equals `value`
    pub fn byte_at(index: usize, value: u8) -> impl ResponseRule {
        move |_: &Request, data: &[u8]| data.get(index) == Some(&value)
    }

    /// Frame starts with `prefix`
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> impl ResponseRule {
        let prefix = prefix.into();
        move |_: &Request, data: &[u8]| data.starts_with(&prefix)
    }

    /// Frame is at least `len` bytes long
    pub fn min_len(len: usize) -> impl ResponseRule {
        move |_: &Request, data: &[u8]| data.len() >= len
    }
}
