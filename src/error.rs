#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("authorization: {0}")]
    Auth(String),

    #[error("credentials {}: {source}", .path.display())]
    Credentials {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Append(#[from] gsc_core::AppendError),
}
