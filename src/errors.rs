use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-automod-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-automod-config-2 Version not available")]
    VersionNotAvailable,

    #[error("error-automod-config-3 Invalid listen address: {value}")]
    InvalidListenAddress { value: String },

    #[error("error-automod-config-4 Invalid value for {var_name}: {details}")]
    InvalidValue { var_name: String, details: String },

    #[error("error-automod-config-5 Invalid duration value: {value}")]
    InvalidDuration { value: String },

    #[error("error-automod-config-6 Invalid DID: {did}")]
    InvalidDid { did: String },

    #[error("error-automod-config-7 Unknown ruleset: {name}")]
    UnknownRuleset { name: String },

    #[error("error-automod-config-8 Failed to load static sets from {path}: {details}")]
    StaticSetsLoadFailed { path: String, details: String },

    #[error("error-automod-config-9 Ruleset {ruleset} requires static set {set_name}")]
    MissingStaticSet { ruleset: String, set_name: String },

    #[error("error-automod-config-10 Invalid reroute destination: {value}")]
    InvalidRerouteDestination { value: String },
}

#[derive(Error, Debug)]
pub enum FirehoseError {
    #[error("error-automod-firehose-1 Connection failed: {details}")]
    ConnectionFailed { details: String },

    #[error("error-automod-firehose-2 Transport error: {details}")]
    Transport { details: String },

    #[error("error-automod-firehose-3 Frame header decode failed: {details}")]
    HeaderDecode { details: String },

    #[error("error-automod-firehose-4 Frame payload decode failed (seq {seq:?}, type {message_type}): {details}")]
    PayloadDecode {
        seq: Option<i64>,
        message_type: String,
        details: String,
    },

    #[error("error-automod-firehose-5 CAR block parse failed: {details}")]
    CarParse { details: String },

    #[error("error-automod-firehose-6 Relay error frame: {error_type}: {message}")]
    ErrorFrame { error_type: String, message: String },

    #[error("error-automod-firehose-7 Read timed out after {seconds}s")]
    ReadTimeout { seconds: u64 },

    #[error("error-automod-firehose-8 Scheduler closed while handing off seq {seq}")]
    SchedulerClosed { seq: i64 },
}

impl FirehoseError {
    /// Transport errors end the current connection and trigger a reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FirehoseError::ConnectionFailed { .. }
                | FirehoseError::Transport { .. }
                | FirehoseError::ErrorFrame { .. }
                | FirehoseError::ReadTimeout { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("error-automod-scheduler-1 Scheduler is closed")]
    Closed,

    #[error("error-automod-scheduler-2 Invalid worker bounds: min {min}, max {max}")]
    InvalidWorkerBounds { min: usize, max: usize },
}

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("error-automod-rule-1 Rule {rule} failed: {details}")]
    EvaluationFailed { rule: String, details: String },

    #[error("error-automod-rule-2 Record in {collection} could not be read: {details}")]
    RecordShape { collection: String, details: String },

    #[error("error-automod-rule-3 Rule evaluation timed out after {millis}ms")]
    Timeout { millis: u64 },
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("error-automod-dispatch-1 HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("error-automod-dispatch-2 Request timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("error-automod-dispatch-3 Downstream server error: {status}: {body}")]
    Server { status: u16, body: String },

    #[error("error-automod-dispatch-4 Downstream rate limited request: {body}")]
    RateLimited { body: String },

    #[error("error-automod-dispatch-5 Downstream rejected request: {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("error-automod-dispatch-6 Effect not supported by {service}: {details}")]
    Unsupported { service: String, details: String },

    #[error("error-automod-dispatch-7 Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("error-automod-dispatch-8 Credentials check failed for {service}: {details}")]
    CredentialsRejected { service: String, details: String },
}

impl DispatchError {
    /// Network errors, timeouts, 5xx and 429 responses are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::Network(_)
                | DispatchError::Timeout { .. }
                | DispatchError::Server { .. }
                | DispatchError::RateLimited { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum CursorError {
    #[error("error-automod-cursor-1 Cursor store read failed for {key}: {details}")]
    ReadFailed { key: String, details: String },

    #[error("error-automod-cursor-2 Cursor store write failed for {key}: {details}")]
    WriteFailed { key: String, details: String },

    #[error("error-automod-cursor-3 Stored cursor for {key} is not a sequence: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("error-automod-identity-1 Invalid DID: {did}")]
    InvalidDid { did: String },

    #[error("error-automod-identity-2 DID document fetch failed for {did}: {details}")]
    DocumentFetchFailed { did: String, details: String },

    #[error("error-automod-identity-3 DID document for {did} is malformed: {details}")]
    DocumentMalformed { did: String, details: String },

    #[error("error-automod-identity-4 Handle resolution failed for {handle}: {details}")]
    HandleResolutionFailed { handle: String, details: String },

    #[error("error-automod-identity-5 Identity cache error: {details}")]
    CacheFailed { details: String },

    #[error("error-automod-identity-6 Not a DID or handle: {identifier}: {details}")]
    InvalidIdentifier { identifier: String, details: String },
}

#[derive(Error, Debug)]
pub enum OzoneError {
    #[error("error-automod-ozone-1 Moderation event query failed: {details}")]
    QueryFailed { details: String },

    #[error("error-automod-ozone-2 Moderation event page malformed: {details}")]
    MalformedPage { details: String },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("error-automod-capture-1 Invalid AT-URI: {uri}")]
    InvalidAtUri { uri: String },

    #[error("error-automod-capture-2 Account not found: {identifier}")]
    AccountNotFound { identifier: String },

    #[error("error-automod-capture-3 Account {did} has no PDS endpoint")]
    MissingPds { did: String },

    #[error("error-automod-capture-4 Record fetch failed: {details}")]
    FetchFailed { details: String },
}
