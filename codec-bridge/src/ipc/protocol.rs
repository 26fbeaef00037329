//! Wire protocol types for bridge-worker communication.
//!
//! One duplex channel carries everything:
//! - **Bridge → worker**: Init (module load trigger), Job, Cancel, Shutdown
//! - **Worker → bridge**: Ready, Log, Result, Error
//!
//! Byte payloads are base64 strings inside the JSON body.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::options::CodecOptions;

/// Correlation token carried by every job and its response.
///
/// UUID v4 so a late response from an abandoned job can never collide with
/// the id of a job submitted afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from bridge to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Load the codec module. Sent exactly once, as the first message.
    Init { protocol_version: u32 },

    Job {
        request_id: RequestId,
        #[serde(with = "base64_bytes")]
        input: Bytes,
        options: CodecOptions,
    },

    /// Best-effort: the worker may already be past the point of no return.
    Cancel { request_id: RequestId },

    Shutdown,
}

/// Messages from worker to bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Codec module finished loading.
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        codec: Option<String>,
    },

    /// Diagnostic output; never terminal.
    Log {
        level: LogLevel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        message: String,
    },

    Result {
        request_id: RequestId,
        #[serde(with = "base64_bytes")]
        output: Bytes,
        content_type: String,
    },

    /// Job failure, or module-load failure when `request_id` is absent.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        detail: String,
    },
}

impl WorkerResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Log { .. } => "log",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Result { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            Self::Ready { .. } | Self::Log { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// Serde adapter: `Bytes` as a standard base64 string.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ImageMime, PdfQualityProfile};

    fn test_request_id() -> RequestId {
        RequestId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn init_serializes() {
        let req = WorkerRequest::Init {
            protocol_version: 1,
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "kind": "init",
          "protocol_version": 1
        }
        "#);
    }

    #[test]
    fn job_serializes_with_base64_input() {
        let req = WorkerRequest::Job {
            request_id: test_request_id(),
            input: Bytes::from_static(b"hello"),
            options: CodecOptions::pdf_compress(PdfQualityProfile::Ebook),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "kind": "job",
          "request_id": "550e8400-e29b-41d4-a716-446655440000",
          "input": "aGVsbG8=",
          "options": {
            "format": "pdf-compress",
            "quality_profile": "ebook"
          }
        }
        "#);
    }

    #[test]
    fn cancel_and_shutdown_serialize() {
        let cancel = WorkerRequest::Cancel {
            request_id: test_request_id(),
        };
        insta::assert_json_snapshot!(cancel, @r#"
        {
          "kind": "cancel",
          "request_id": "550e8400-e29b-41d4-a716-446655440000"
        }
        "#);
        insta::assert_json_snapshot!(WorkerRequest::Shutdown, @r#"
        {
          "kind": "shutdown"
        }
        "#);
    }

    #[test]
    fn load_phase_error_omits_request_id() {
        let resp = WorkerResponse::Error {
            request_id: None,
            detail: "failed to fetch gs.wasm".to_string(),
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "kind": "error",
          "detail": "failed to fetch gs.wasm"
        }
        "#);
    }

    #[test]
    fn result_deserializes_from_worker_json() {
        let json = r#"{
            "kind": "result",
            "request_id": "550e8400-e29b-41d4-a716-446655440000",
            "output": "JVBERi0=",
            "content_type": "application/pdf"
        }"#;
        let resp: WorkerResponse = serde_json::from_str(json).unwrap();
        match resp {
            WorkerResponse::Result {
                request_id,
                output,
                content_type,
            } => {
                assert_eq!(request_id, test_request_id());
                assert_eq!(&output[..], b"%PDF-");
                assert_eq!(content_type, "application/pdf");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn ready_and_log_deserialize_minimal() {
        let ready: WorkerResponse = serde_json::from_str(r#"{"kind":"ready"}"#).unwrap();
        assert!(matches!(ready, WorkerResponse::Ready { codec: None }));

        let log: WorkerResponse =
            serde_json::from_str(r#"{"kind":"log","level":"warn","message":"slow page"}"#)
                .unwrap();
        assert!(matches!(
            log,
            WorkerResponse::Log {
                level: LogLevel::Warn,
                target: None,
                ..
            }
        ));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let json = r#"{"kind":"job","request_id":"550e8400-e29b-41d4-a716-446655440000","input":"@@@","options":{"format":"image-convert","target_mime":"image/png"}}"#;
        assert!(serde_json::from_str::<WorkerRequest>(json).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(serde_json::from_str::<WorkerResponse>(r#"{"kind":"progress"}"#).is_err());
    }

    #[test]
    fn request_id_accessor() {
        let id = test_request_id();
        let resp = WorkerResponse::Result {
            request_id: id,
            output: Bytes::new(),
            content_type: ImageMime::Png.as_str().to_string(),
        };
        assert_eq!(resp.request_id(), Some(id));
        assert_eq!(resp.kind(), "result");
        assert_eq!(WorkerResponse::Ready { codec: None }.request_id(), None);
    }
}
