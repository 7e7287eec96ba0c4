use crate::credentials::CredentialsError;
use crate::error::TransportFailure;

use super::Phase;

/// Failure talking to the session/message backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend rejected the token; stored credentials have been cleared.
    #[error("session expired, please sign in again")]
    Unauthorized,
    #[error("not signed in")]
    NotSignedIn,
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend unreachable ({failure}): {message}")]
    Network {
        failure: TransportFailure,
        message: String,
    },
    #[error("unexpected backend response: {0}")]
    Decode(String),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
}

impl BackendError {
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        BackendError::Network {
            failure: TransportFailure::from_reqwest(err),
            message: crate::error::error_chain_message(err),
        }
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BackendError::Unauthorized | BackendError::NotSignedIn)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Another guarded operation is in flight. Nothing is queued.
    #[error("busy: {0} in progress")]
    Busy(Phase),
    #[error("unknown session '{0}'")]
    UnknownSession(String),
    #[error("unknown message '{0}'")]
    UnknownMessage(String),
    #[error("no session is selected")]
    NoCurrentSession,
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Backend(#[from] BackendError),
}
