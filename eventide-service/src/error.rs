use eventide_core::error::CoreError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("core: {0}")]
    Core(#[from] CoreError),

    #[error("missing dependency: service={service}, dependency={dependency}")]
    MissingDependency { service: String, dependency: String },

    #[error("dependency cycle among services: {services}")]
    DependencyCycle { services: String },

    #[error("lifecycle error: service={service}, reason={reason}")]
    Lifecycle { service: String, reason: String },
}

pub type ServiceResult<T> = Result<T, ServiceError>;
