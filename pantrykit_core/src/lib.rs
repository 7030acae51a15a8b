pub mod contracts;
pub mod error;
pub mod models;
pub mod pkce;
pub mod token;

pub use contracts::RequestContext;
pub use error::{AuthFailureReason, CoreError};
pub use models::{
  AuditEvent, AuditEventType, AuthResult, GroceryItem, GroceryList, ListId, OAuthAccount, Session,
  SessionId, SessionInfo, User, UserId,
};
pub use pkce::PkceSession;
pub use token::{TokenClaims, TokenKind, TokenPair, TokenService};
