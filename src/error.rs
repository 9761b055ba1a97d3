use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

macro_rules! define_error_codes {
    ($($variant:ident),* $(,)?) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $($variant,)*
            Other(String),
        }

        impl ErrorCode {
            pub fn as_str(&self) -> &str {
                match self {
                    $(ErrorCode::$variant => stringify!($variant),)*
                    ErrorCode::Other(code) => code,
                }
            }

            pub fn parse(raw: &str) -> Self {
                match raw {
                    $(stringify!($variant) => ErrorCode::$variant,)*
                    other => ErrorCode::Other(other.to_string()),
                }
            }
        }
    };
}

define_error_codes!(
    PlaybookNotValid,
    InputValidationFailed,
    OutputValidationFailed,
    InvalidPlaybookConfig,
    PlaybookNotFound,
    ActionNotFound,
    DuplicateAction,
    InvalidActionName,
    DuplicatePlaybook,
    InvalidPlaybookName,
    MissingStepExecutor,
    DuplicateLoaderName,
    CircularReferenceDetected,
    MaxRecursionDepthExceeded,
    ExecutionFailed,
    PlaybookExecutionFailed,
    Cancelled,
    CheckpointMessageRequired,
    StateSaveFailed,
    StateLoadFailed,
    StateArchiveFailed,
    StateCorrupted,
    PlaybookIncompatible,
    ResumeFailed,
    ResourceLocked,
    TemplateError,
    VarConfigInvalid,
    VarInvalidName,
    ReturnConfigInvalid,
    ThrowConfigInvalid,
    IfConfigInvalid,
    IfConditionEvaluationFailed,
    ForEachConfigInvalid,
    ForEachInvalidArray,
    PlaybookRunConfigInvalid,
    InvalidInput,
    MissingPlaybookId,
);

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Err(D::Error::custom("error code must be non-empty"));
        }
        Ok(ErrorCode::parse(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCause {
    Engine(Box<CatalystError>),
    Foreign(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct CatalystError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guidance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorCause>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl CatalystError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            guidance: String::new(),
            cause: None,
            metadata: None,
        }
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = guidance.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn caused_by(mut self, cause: CatalystError) -> Self {
        self.cause = Some(Box::new(ErrorCause::Engine(Box::new(cause))));
        self
    }

    pub fn caused_by_foreign(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(Box::new(ErrorCause::Foreign(cause.to_string())));
        self
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionFailed, message)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            Value::String(format!("{}: {}", self.code.as_str(), self.message))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_through_strings() {
        assert_eq!(ErrorCode::ResourceLocked.as_str(), "ResourceLocked");
        assert_eq!(
            ErrorCode::parse("ResourceLocked"),
            ErrorCode::ResourceLocked
        );
        assert_eq!(
            ErrorCode::parse("ServiceError"),
            ErrorCode::Other("ServiceError".to_string())
        );
        assert_eq!(ErrorCode::parse("ServiceError").as_str(), "ServiceError");
    }

    #[test]
    fn serialization_walks_the_cause_chain() {
        let inner = CatalystError::new(ErrorCode::StateLoadFailed, "state file missing");
        let outer = CatalystError::new(ErrorCode::ResumeFailed, "cannot resume run")
            .with_guidance("check that the run id is still live")
            .with_meta("runId", "20250101-000000-000")
            .caused_by(inner);

        let json = outer.to_json();
        assert_eq!(json["code"], "ResumeFailed");
        assert_eq!(json["metadata"]["runId"], "20250101-000000-000");
        assert_eq!(json["cause"]["engine"]["code"], "StateLoadFailed");

        let back: CatalystError = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, outer);
    }

    #[test]
    fn foreign_causes_are_captured_as_text() {
        let io = std::io::Error::other("disk full");
        let err =
            CatalystError::new(ErrorCode::StateSaveFailed, "could not persist state").caused_by_foreign(&io);
        match err.cause.as_deref() {
            Some(ErrorCause::Foreign(text)) => assert_eq!(text, "disk full"),
            other => panic!("unexpected cause: {other:?}"),
        }
    }

    #[test]
    fn display_pairs_code_and_message() {
        let err = CatalystError::new(ErrorCode::PlaybookNotFound, "no loader matched `deploy`");
        assert_eq!(err.to_string(), "PlaybookNotFound: no loader matched `deploy`");
    }
}
