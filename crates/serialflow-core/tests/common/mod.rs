//! Shared harness for engine integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serialflow_core::config::{EngineConfig, EngineConfigBuilder};
use serialflow_core::engine::{ConnectListener, DataListener, SerialEngine};
use serialflow_core::error::SerialError;
use serialflow_core::request::{Request, RequestId, Response, ResponseListener};
use serialflow_core::transport::mock::MockLink;
use tracing_subscriber::EnvFilter;

pub const DEVICE: &str = "/dev/ttyMOCK0";

/// Install a test subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> EngineConfigBuilder {
    EngineConfig::builder().device_path(DEVICE).baud_rate(115200)
}

pub async fn connected(link: &MockLink, builder: EngineConfigBuilder) -> anyhow::Result<SerialEngine> {
    init_tracing();
    let engine = SerialEngine::with_opener(builder.build()?, link.opener());
    engine.connect().await?;
    Ok(engine)
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Records everything delivered to a request
#[derive(Default)]
pub struct Recorder {
    responses: Mutex<Vec<Response>>,
    failures: Mutex<Vec<(RequestId, SerialError)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().clone()
    }

    pub fn response_data(&self) -> Vec<Vec<u8>> {
        self.responses
            .lock()
            .iter()
            .map(|r| r.data().to_vec())
            .collect()
    }

    pub fn failures(&self) -> Vec<(RequestId, SerialError)> {
        self.failures.lock().clone()
    }
}

impl ResponseListener for Recorder {
    fn on_response(&self, response: Response) {
        self.responses.lock().push(response);
    }

    fn on_failure(&self, request: Arc<Request>, error: SerialError) {
        self.failures.lock().push((request.id(), error));
    }
}

/// Records connect listener calls plus a shared ordering log
#[derive(Default)]
pub struct ConnectLog {
    connects: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<SerialError>>,
}

impl ConnectLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn disconnects(&self) -> Vec<SerialError> {
        self.disconnects.lock().clone()
    }
}

impl ConnectListener for ConnectLog {
    fn on_connect(&self, path: &str) {
        self.connects.lock().push(path.to_string());
    }

    fn on_disconnect(&self, _path: &str, error: SerialError) {
        self.disconnects.lock().push(error);
    }
}

/// Records raw traffic
#[derive(Default)]
pub struct Traffic {
    sent: Mutex<Vec<Vec<u8>>>,
    received: Mutex<Vec<Vec<u8>>>,
}

impl Traffic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }
}

impl DataListener for Traffic {
    fn on_request(&self, data: &[u8]) {
        self.sent.lock().push(data.to_vec());
    }

    fn on_response(&self, data: &[u8]) {
        self.received.lock().push(data.to_vec());
    }
}

/// Connected engine with a connect log registered before the first connect
pub async fn connected_with_log(
    link: &MockLink,
    builder: EngineConfigBuilder,
) -> anyhow::Result<(SerialEngine, Arc<ConnectLog>)> {
    init_tracing();
    let engine = SerialEngine::with_opener(builder.build()?, link.opener());
    let log = ConnectLog::new();
    engine.add_connect_listener(log.clone());
    engine.connect().await?;
    Ok((engine, log))
}
