use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable fetching error: {0}")]
    EnvVar(#[from] dotenvy::Error),
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Unexpected HTTP status {status} from {url}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("Request body cannot be replayed for a retry")]
    RequestNotReplayable,
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Response is missing field `{0}`")]
    MissingField(&'static str),
    #[error("Giving up after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}
