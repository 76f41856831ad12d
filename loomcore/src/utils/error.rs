use loomir::{coder::CoderError, utils::Error};
use semver::{Version, VersionReq};
use strum::Display;
use thiserror::Error;

/// Step of a weaving pass, reported with every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Phase {
    #[strum(serialize = "discovery")]
    Discovery,
    #[strum(serialize = "class wide method")]
    Promotion,
    #[strum(serialize = "root provisioning")]
    RootProvisioning,
    #[strum(serialize = "field provisioning")]
    FieldProvisioning,
    #[strum(serialize = "body wrapping")]
    BodyWrapping,
    #[strum(serialize = "async exception patching")]
    AsyncPatching,
    #[strum(serialize = "attribute removal")]
    AttributeRemoval,
    #[strum(serialize = "verify")]
    Verification,
}

#[derive(Debug, Error)]
pub enum WeaveError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration file '{file}': {source}")]
    ConfigParseError { source: toml::de::Error, file: String },

    #[error("Failed to serialize the configuration: {0}")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error("[{phase}] Framework type '{name}' is not defined in the program unit")]
    MissingFrameworkType { phase: Phase, name: String },

    #[error("[{phase}] Type '{ty}' has no member '{member}' with {params} parameter(s)")]
    MissingMember {
        phase: Phase,
        ty: String,
        member: String,
        params: usize,
    },

    #[error("[{phase}] Type '{ty}' has no {what} constructor")]
    MissingConstructor {
        phase: Phase,
        ty: String,
        what: &'static str,
    },

    #[error("[{phase}] Field '{field}' of interceptor '{ty}' asks for unknown injected value '{value}'")]
    InvalidBinding {
        phase: Phase,
        ty: String,
        field: String,
        value: String,
    },

    #[error("[{phase}] Target '{method}' was removed or changed after discovery")]
    TargetVanished { phase: Phase, method: String },

    #[error("[{phase}] State machine of '{method}' has an unexpected shape: {reason}")]
    StateMachineShape {
        phase: Phase,
        method: String,
        reason: String,
    },

    #[error("[{phase}] Catch type '{name}' cannot be resolved in the program unit (target '{method}')")]
    UnresolvedCatchType {
        phase: Phase,
        name: String,
        method: String,
    },

    #[error("[{phase}] Weaving state of '{method}' cannot go from {from} to {to}")]
    InvalidTransition {
        phase: Phase,
        method: String,
        from: String,
        to: String,
    },

    #[error("[{phase}] {target}: {source}")]
    Ir {
        phase: Phase,
        target: String,
        source: Error,
    },

    #[error("[{phase}] {target}: {source}")]
    Coder {
        phase: Phase,
        target: String,
        source: CoderError,
    },

    #[error("Failed to encode program storage: {0}")]
    StorageEncode(String),

    #[error("Failed to decode program storage: {0}")]
    StorageDecode(String),

    #[error("Invalid magic bytes in program storage")]
    StorageMagic,

    #[error("Incompatible program storage version. Required: {req}, found: {version}")]
    StorageVersion { req: VersionReq, version: Version },
}

pub type WeaveResult<T> = Result<T, WeaveError>;

/// Attach the phase and target identity to lower level errors.
pub trait InPhase<T> {
    fn in_phase(self, phase: Phase, target: &str) -> WeaveResult<T>;
}

impl<T> InPhase<T> for Result<T, Error> {
    fn in_phase(self, phase: Phase, target: &str) -> WeaveResult<T> {
        self.map_err(|source| WeaveError::Ir {
            phase,
            target: target.to_string(),
            source,
        })
    }
}

impl<T> InPhase<T> for Result<T, CoderError> {
    fn in_phase(self, phase: Phase, target: &str) -> WeaveResult<T> {
        self.map_err(|source| match source {
            CoderError::Ir(source) => WeaveError::Ir {
                phase,
                target: target.to_string(),
                source,
            },
            source => WeaveError::Coder {
                phase,
                target: target.to_string(),
                source,
            },
        })
    }
}
