/*!

HTTP status inspection for errors coming back from the object store. Tests usually only need to
know whether a read missed or a create collided, and these helpers answer that without matching on
`kube::Error` variants.

!*/

pub use http::StatusCode;
use kube::Error;

/// Exposes the HTTP status a store error carries, so that tests can tell a missing object from a
/// conflict or a transport failure.
pub trait HttpStatusCode {
    /// The HTTP status the API server answered with, or `None` when no response was received.
    fn status_code(&self) -> Option<StatusCode>;

    fn is_status_code(&self, status_code: StatusCode) -> bool {
        self.status_code() == Some(status_code)
    }

    /// The object does not exist.
    fn is_not_found(&self) -> bool {
        self.is_status_code(StatusCode::NOT_FOUND)
    }

    /// An object with the same identity already exists.
    fn is_already_exists(&self) -> bool {
        self.is_status_code(StatusCode::CONFLICT)
    }
}

impl HttpStatusCode for kube::Error {
    fn status_code(&self) -> Option<StatusCode> {
        match self {
            Error::Api(response) => StatusCode::from_u16(response.code).ok(),
            _ => None,
        }
    }
}

impl<T, E> HttpStatusCode for std::result::Result<T, E>
where
    E: HttpStatusCode,
{
    fn status_code(&self) -> Option<StatusCode> {
        self.as_ref().err().and_then(|e| e.status_code())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "nope".to_string(),
            reason: "NotFound".to_string(),
            code,
        })
    }

    #[test]
    fn api_status_codes() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(404).is_already_exists());
        assert!(api_error(409).is_already_exists());
        assert_eq!(api_error(422).status_code(), Some(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn results() {
        let ok: std::result::Result<(), kube::Error> = Ok(());
        assert_eq!(ok.status_code(), None);
        let err: std::result::Result<(), kube::Error> = Err(api_error(404));
        assert!(err.is_not_found());
    }

    #[test]
    fn crate_errors() {
        let store = crate::Error::Store {
            method: "get".to_string(),
            what: "ConfigMap 'default/cm1'".to_string(),
            source: api_error(404),
        };
        assert!(store.is_not_found());
        let not_found = crate::Error::ClusterNotFound {
            name: "kind-1".to_string(),
        };
        assert_eq!(not_found.status_code(), None);
    }
}
