use axum::response::{IntoResponse, Response};
use http::StatusCode;
use kubetask_common::response;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("no trigger registered for {0}/{1}")]
    UnknownTrigger(String, String),

    #[error("malformed request body: {0}")]
    BadBody(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("filter evaluation failed: {0}")]
    Filter(String),

    #[error("template rendering failed: {0}")]
    Template(String),

    #[error("method not allowed")]
    MethodNotAllowed,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::UnknownTrigger(..) => response::not_found(self),
            Error::BadBody(_) | Error::Filter(_) | Error::Template(_) => {
                response::bad_request(self)
            }
            Error::Auth(_) => response::unauthorized(self),
            Error::MethodNotAllowed => {
                response::err_resp(self, StatusCode::METHOD_NOT_ALLOWED)
            }
            Error::Kube { .. } => response::internal_server_error(self),
        }
    }
}
