/*!
 * Transport-agnostic request handling.
 *
 * A transport decodes client messages into [`Request`]s, submits them
 * together with the client's [`Session`] and forwards the [`Response`]s it
 * receives back. Requests run on the worker pool; a `startSampling` request
 * keeps its worker busy until the session disables sampling.
 */
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

use propbridge_core::config::{BridgeConfig, Config, SamplingConfig};
use propbridge_devices::RegistryEvent;

use crate::coordinator::{Coordinator, PropertyValue, Reading};
use crate::error::{Error, Result};
use crate::introspect::TreeSnapshot;
use crate::sampler::{Frame, Sampler, SamplingControl};
use crate::worker::WorkerPool;

/// A client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Request {
    /// Snapshot every online device
    GetDevices,
    /// Read one property
    GetProperty {
        /// Dotted path
        path: String,
    },
    /// Write one property and read it back
    SetProperty {
        /// Dotted path
        path: String,
        /// Raw value
        val: JsonValue,
        /// Declared type of the value
        #[serde(rename = "type")]
        declared_type: String,
    },
    /// Invoke a callable
    CallFunction {
        /// Dotted path
        path: String,
    },
    /// Start background discovery
    FindDevices,
    /// Set the session's sampling flag
    EnableSampling,
    /// Clear the session's sampling flag
    StopSampling,
    /// Declare the paths to sample
    SampledVarNames {
        /// Dotted paths, duplicates allowed
        paths: Vec<String>,
    },
    /// Run the sampling loop until sampling is disabled
    StartSampling,
}

impl Request {
    /// Get the event name of the request
    pub fn event(&self) -> &'static str {
        match self {
            Request::GetDevices => "getDevices",
            Request::GetProperty { .. } => "getProperty",
            Request::SetProperty { .. } => "setProperty",
            Request::CallFunction { .. } => "callFunction",
            Request::FindDevices => "findDevices",
            Request::EnableSampling => "enableSampling",
            Request::StopSampling => "stopSampling",
            Request::SampledVarNames { .. } => "sampledVarNames",
            Request::StartSampling => "startSampling",
        }
    }
}

/// A message to a client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Response {
    /// Snapshots of the online devices
    Devices(BTreeMap<String, TreeSnapshot>),
    /// A property value
    Property(PropertyValue),
    /// A read was skipped because a write was in flight
    PropertySkipped {
        /// Dotted path
        path: String,
    },
    /// Sampling was enabled
    SamplingEnabled,
    /// Sampling was disabled
    SamplingDisabled,
    /// One sampling frame
    SampledData {
        /// Position in the sampling run
        sequence: u64,
        /// When the tick started
        timestamp: DateTime<Utc>,
        /// Values keyed by path
        values: Frame,
    },
    /// Online status of every known device
    DevicesStatus(BTreeMap<String, bool>),
    /// A device was registered
    DeviceFound {
        /// Logical name
        name: String,
        /// Stable identifier
        serial: String,
    },
    /// A request failed
    Error {
        /// Event name of the failed request
        request: String,
        /// Error description
        message: String,
    },
}

impl Response {
    fn error(request: &str, error: &Error) -> Self {
        Response::Error {
            request: request.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<Frame> for Response {
    fn from(frame: Frame) -> Self {
        Response::SampledData {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            values: frame,
        }
    }
}

impl From<RegistryEvent> for Response {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::DeviceFound { name, serial } => Response::DeviceFound { name, serial },
            RegistryEvent::StatusChanged(statuses) => Response::DevicesStatus(statuses),
        }
    }
}

/// State of one connected client
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    sampling: SamplingControl,
}

impl Session {
    /// Create a session with sampling disabled
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            sampling: SamplingControl::new(),
        }
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the sampling controls
    pub fn sampling(&self) -> &SamplingControl {
        &self.sampling
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes requests against a coordinator
#[derive(Debug)]
pub struct Dispatcher {
    coordinator: Arc<Coordinator>,
    sampling: SamplingConfig,
    bridge: BridgeConfig,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(coordinator: Arc<Coordinator>, config: &Config) -> Self {
        Self {
            coordinator,
            sampling: config.sampling.clone(),
            bridge: config.bridge.clone(),
        }
    }

    /// Get the coordinator
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Handle a request on the calling thread.
    ///
    /// Failures of the request are reported through `emit` as
    /// [`Response::Error`]; only a failing `emit` is returned as an error.
    pub fn dispatch<F>(&self, session: &Session, request: Request, mut emit: F) -> Result<()>
    where
        F: FnMut(Response) -> Result<()>,
    {
        let event = request.event();
        debug!("Session {} requested {}", session.id(), event);

        match request {
            Request::GetDevices => match self.coordinator.list_devices() {
                Ok(devices) => emit(Response::Devices(devices)),
                Err(e) => emit(Response::error(event, &e)),
            },
            Request::GetProperty { path } => match self.coordinator.read_property(&path) {
                Ok(Reading::Value(value)) => emit(Response::Property(PropertyValue { path, value })),
                Ok(Reading::Skipped) => emit(Response::PropertySkipped { path }),
                Err(e) => emit(Response::error(event, &e)),
            },
            Request::SetProperty {
                path,
                val,
                declared_type,
            } => match self.coordinator.write_property(&path, &val, &declared_type) {
                Ok(written) => emit(Response::Property(written)),
                Err(e) => emit(Response::error(event, &e)),
            },
            Request::CallFunction { path } => match self.coordinator.invoke(&path) {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!("Call of {} failed: {}", path, e);
                    emit(Response::error(event, &e))
                }
            },
            Request::FindDevices => match self.coordinator.start_discovery() {
                Ok(_) => Ok(()),
                Err(e) => emit(Response::error(event, &e)),
            },
            Request::EnableSampling => {
                session.sampling().enable();
                emit(Response::SamplingEnabled)
            }
            Request::StopSampling => {
                session.sampling().disable();
                emit(Response::SamplingDisabled)
            }
            Request::SampledVarNames { paths } => {
                session.sampling().declare(paths);
                Ok(())
            }
            Request::StartSampling => {
                let mut sampler = Sampler::from_config(
                    self.coordinator.clone(),
                    session.sampling().clone(),
                    &self.sampling,
                    &self.bridge,
                );
                sampler.run(|frame| emit(Response::from(frame)))?;
                Ok(())
            }
        }
    }
}

/// Channel half a transport reads responses from
pub type Responder = UnboundedSender<Response>;

/// Request service: a dispatcher running on a worker pool
#[derive(Debug)]
pub struct Service {
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
}

impl Service {
    /// Start a service with its own worker pool
    pub fn new(coordinator: Arc<Coordinator>, config: &Config) -> Result<Self> {
        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(coordinator, config)),
            pool: WorkerPool::new(&config.runtime)?,
        })
    }

    /// Get the dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Queue a request; responses are sent to `responder`
    pub fn submit(&self, session: &Arc<Session>, request: Request, responder: Responder) -> Result<()> {
        let dispatcher = self.dispatcher.clone();
        let session = session.clone();
        self.pool.execute(move || {
            let result = dispatcher.dispatch(&session, request, |response| {
                responder
                    .send(response)
                    .map_err(|_| Error::other("response channel closed"))
            });
            if let Err(e) = result {
                debug!("Session {} stopped receiving responses: {}", session.id(), e);
                session.sampling().disable();
            }
        })
    }

    /// Decode a JSON request and queue it; undecodable requests are answered with an error
    pub fn submit_json(&self, session: &Arc<Session>, raw: &str, responder: Responder) -> Result<()> {
        match serde_json::from_str::<Request>(raw) {
            Ok(request) => self.submit(session, request, responder),
            Err(e) => {
                warn!("Rejected request {}: {}", raw, e);
                responder
                    .send(Response::error("unknown", &Error::from(e)))
                    .map_err(|_| Error::other("response channel closed"))
            }
        }
    }

    /// Stop the worker pool and background discovery
    pub fn shutdown(&self) {
        self.dispatcher.coordinator().stop_discovery();
        self.pool.shutdown();
    }
}
