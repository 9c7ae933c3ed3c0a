//! Error type shared by every library crate.

/// Errors surfaced by a reconcile cycle. Drift is never an error; it is reported
/// through [`crate::ReconcileResult`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("platform: {0}")]
    Kube(#[from] kube::Error),
    #[error("management api: {0}")]
    Management(String),
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("restart: {0}")]
    Restart(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Innermost error, skipping stage wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Error::Kube(kube::Error::Api(resp)) if resp.reason == "AlreadyExists")
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Kube(kube::Error::Api(resp)) if resp.code == 409 && resp.reason != "AlreadyExists")
    }
}

/// Attach the failing stage to an error without changing its classification.
pub trait StageContext<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T> StageContext<T> for Result<T> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| Error::Stage { stage, source: Box::new(e) })
    }
}
