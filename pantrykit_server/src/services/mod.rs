pub mod artifact_cache;
pub mod auth_service;
pub mod camera;
pub mod circuit_breaker;
pub mod ordering;
pub mod retry;
pub mod session_registry;

pub use artifact_cache::{profile_fingerprint, ArtifactCache};
pub use auth_service::AuthService;
pub use camera::CameraClient;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use ordering::OrderingOrchestrator;
pub use retry::RetryPolicy;
pub use session_registry::{ExternalSessionRegistry, SessionStore};
