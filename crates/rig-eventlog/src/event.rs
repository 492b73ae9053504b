//! The `Event` record and its payload variants (spec §3).

use serde::{Deserialize, Serialize};

use rig_domain::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WiringResolved,
    IngressPublished,
    ServiceStarting,
    ServiceHealthy,
    ServiceReady,
    ServiceStopping,
    ServiceFailed,
    ServiceStopped,
    EnvironmentUp,
    EnvironmentDown,
    EnvironmentFailing,
    HealthCheckFailed,
    ArtifactStarted,
    ArtifactCompleted,
    ArtifactCached,
    ArtifactFailed,
    ProgressStall,
    ConnectionOpened,
    ConnectionClosed,
    RequestCompleted,
    GrpcCallCompleted,
    ServiceLog,
    CallbackRequest,
    CallbackResponse,
    TestNote,
    TestFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRequest {
    pub handler: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub handler: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionObserved {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestObserved {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub request_headers: std::collections::HashMap<String, String>,
    pub response_headers: std::collections::HashMap<String, String>,
    pub request_body: Vec<u8>,
    pub response_body: Vec<u8>,
    pub request_body_truncated: bool,
    pub response_body_truncated: bool,
    pub request_size: usize,
    pub response_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcCallObserved {
    pub service: String,
    pub method: String,
    pub grpc_status: String,
    pub grpc_message: Option<String>,
    pub request_body_decoded: Option<serde_json::Value>,
    pub response_body_decoded: Option<serde_json::Value>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    pub services: Vec<ServiceDiagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDiagnostic {
    pub service: String,
    pub phase: String,
    #[serde(default)]
    pub waiting_on: Vec<String>,
}

/// An immutable, sequenced record in one environment's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub environment: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub ingress: Option<String>,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub log: Option<LogLine>,
    #[serde(default)]
    pub callback_request: Option<CallbackRequest>,
    #[serde(default)]
    pub callback_response: Option<CallbackResponse>,
    #[serde(default)]
    pub connection: Option<ConnectionObserved>,
    #[serde(default)]
    pub request: Option<RequestObserved>,
    #[serde(default)]
    pub grpc_call: Option<GrpcCallObserved>,
    #[serde(default)]
    pub diagnostic: Option<DiagnosticSnapshot>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Event {
    /// Builds the fixed fields of an event; `seq` is assigned by the log on
    /// publish, never by the caller.
    pub fn builder(environment: impl Into<String>, event_type: EventType) -> EventBuilder {
        EventBuilder {
            event: Event {
                seq: 0,
                event_type,
                timestamp: chrono::Utc::now(),
                environment: environment.into(),
                service: None,
                ingress: None,
                endpoint: None,
                log: None,
                callback_request: None,
                callback_response: None,
                connection: None,
                request: None,
                grpc_call: None,
                diagnostic: None,
                message: None,
            },
        }
    }

    /// High-frequency classes excluded from `lifecycleEvents()` (§4.1):
    /// service logs, health-probe failures, connection-open, observed
    /// traffic.
    pub fn is_high_frequency(&self) -> bool {
        matches!(
            self.event_type,
            EventType::ServiceLog
                | EventType::HealthCheckFailed
                | EventType::ConnectionOpened
                | EventType::ConnectionClosed
                | EventType::RequestCompleted
                | EventType::GrpcCallCompleted
        )
    }
}

pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.event.service = Some(service.into());
        self
    }

    pub fn ingress(mut self, ingress: impl Into<String>) -> Self {
        self.event.ingress = Some(ingress.into());
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.event.endpoint = Some(endpoint);
        self
    }

    pub fn log(mut self, stream: LogStream, data: impl Into<String>) -> Self {
        self.event.log = Some(LogLine {
            stream,
            data: data.into(),
        });
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.event.message = Some(message.into());
        self
    }

    pub fn connection(mut self, observed: ConnectionObserved) -> Self {
        self.event.connection = Some(observed);
        self
    }

    pub fn request(mut self, observed: RequestObserved) -> Self {
        self.event.request = Some(observed);
        self
    }

    pub fn grpc_call(mut self, observed: GrpcCallObserved) -> Self {
        self.event.grpc_call = Some(observed);
        self
    }

    pub fn diagnostic(mut self, snapshot: DiagnosticSnapshot) -> Self {
        self.event.diagnostic = Some(snapshot);
        self
    }

    pub fn callback_request(mut self, req: CallbackRequest) -> Self {
        self.event.callback_request = Some(req);
        self
    }

    pub fn callback_response(mut self, resp: CallbackResponse) -> Self {
        self.event.callback_response = Some(resp);
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}
