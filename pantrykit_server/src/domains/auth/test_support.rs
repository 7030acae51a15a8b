//! In-memory implementations of the storage contracts for service-level
//! tests. Kept simple on purpose: a Vec behind a mutex per table.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use pantrykit_core::contracts::{
  AuditRepository, NewSession, NewUser, SessionRepository, UserRepository,
};
use pantrykit_core::error::CoreError;
use pantrykit_core::models::{
  AuditEvent, AuditEventType, OAuthAccount, Session, SessionId, User, UserId,
};

#[derive(Default)]
pub struct InMemoryUsers {
  users: Mutex<Vec<User>>,
  next_id: AtomicI64,
}

impl InMemoryUsers {
  pub fn expire_lockout(&self, email: &str) {
    let mut users = self.users.lock().unwrap();
    if let Some(user) = users.iter_mut().find(|u| u.email == email) {
      user.locked_until = Some(Utc::now() - Duration::seconds(1));
    }
  }

  pub fn failed_attempts(&self, email: &str) -> i32 {
    let users = self.users.lock().unwrap();
    users
      .iter()
      .find(|u| u.email == email)
      .map(|u| u.failed_login_attempts)
      .unwrap_or(-1)
  }

  pub fn user_count(&self) -> usize {
    self.users.lock().unwrap().len()
  }
}

#[async_trait]
impl UserRepository for InMemoryUsers {
  async fn insert(&self, user: NewUser) -> Result<User, CoreError> {
    let mut users = self.users.lock().unwrap();
    if users.iter().any(|u| u.email == user.email) {
      return Err(CoreError::UserAlreadyExists(user.email));
    }
    let id = UserId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    let now = Utc::now();
    let row = User {
      id,
      email: user.email,
      email_verified: user.email_verified,
      auth_provider: user.auth_provider,
      password_hash: user.password_hash,
      oauth_accounts: Json(user.oauth_accounts),
      profile: user.profile,
      failed_login_attempts: 0,
      locked_until: None,
      last_login: None,
      last_password_change: None,
      password_reset_token: None,
      password_reset_expires: None,
      is_onboarded: false,
      created_at: now,
      updated_at: now,
    };
    users.push(row.clone());
    Ok(row)
  }

  async fn find_by_id(&self, id: UserId) -> Result<Option<User>, CoreError> {
    Ok(self.users.lock().unwrap().iter().find(|u| u.id == id).cloned())
  }

  async fn find_by_email(&self, email: &str) -> Result<Option<User>, CoreError> {
    Ok(
      self
        .users
        .lock()
        .unwrap()
        .iter()
        .find(|u| u.email == email)
        .cloned(),
    )
  }

  async fn exists_by_email(&self, email: &str) -> Result<bool, CoreError> {
    Ok(self.users.lock().unwrap().iter().any(|u| u.email == email))
  }

  async fn record_failed_login(
    &self,
    id: UserId,
    threshold: i32,
    lockout: Duration,
  ) -> Result<i32, CoreError> {
    let mut users = self.users.lock().unwrap();
    let user = users
      .iter_mut()
      .find(|u| u.id == id)
      .ok_or_else(|| CoreError::UserNotFound(id.to_string()))?;
    user.failed_login_attempts += 1;
    if user.failed_login_attempts >= threshold {
      user.locked_until = Some(Utc::now() + lockout);
    }
    Ok(user.failed_login_attempts)
  }

  async fn record_successful_login(&self, id: UserId) -> Result<(), CoreError> {
    let mut users = self.users.lock().unwrap();
    if let Some(user) = users.iter_mut().find(|u| u.id == id) {
      user.failed_login_attempts = 0;
      user.locked_until = None;
      user.last_login = Some(Utc::now());
    }
    Ok(())
  }

  async fn set_password_hash(&self, id: UserId, password_hash: &str) -> Result<(), CoreError> {
    let mut users = self.users.lock().unwrap();
    if let Some(user) = users.iter_mut().find(|u| u.id == id) {
      user.password_hash = Some(password_hash.to_string());
      user.last_password_change = Some(Utc::now());
      user.password_reset_token = None;
      user.password_reset_expires = None;
    }
    Ok(())
  }

  async fn set_reset_token(
    &self,
    id: UserId,
    token: &str,
    expires_at: DateTime<Utc>,
  ) -> Result<(), CoreError> {
    let mut users = self.users.lock().unwrap();
    if let Some(user) = users.iter_mut().find(|u| u.id == id) {
      user.password_reset_token = Some(token.to_string());
      user.password_reset_expires = Some(expires_at);
    }
    Ok(())
  }

  async fn clear_reset_token(&self, id: UserId) -> Result<(), CoreError> {
    let mut users = self.users.lock().unwrap();
    if let Some(user) = users.iter_mut().find(|u| u.id == id) {
      user.password_reset_token = None;
      user.password_reset_expires = None;
    }
    Ok(())
  }

  async fn link_oauth_account(&self, id: UserId, account: OAuthAccount) -> Result<(), CoreError> {
    let mut users = self.users.lock().unwrap();
    if let Some(user) = users.iter_mut().find(|u| u.id == id) {
      user.oauth_accounts.0.push(account);
    }
    Ok(())
  }
}

#[derive(Default)]
pub struct InMemorySessions {
  sessions: Mutex<Vec<Session>>,
  next_id: AtomicI64,
}

impl InMemorySessions {
  pub fn seed_session(&self, user_id: UserId) -> SessionId {
    let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    let now = Utc::now();
    self.sessions.lock().unwrap().push(Session {
      id,
      user_id,
      access_token_jti: format!("seed-access-{}", id),
      refresh_token_jti: format!("seed-refresh-{}", id),
      device_info: None,
      created_at: now,
      expires_at: now + Duration::days(30),
      last_activity: now,
      revoked: false,
    });
    id
  }

  pub fn revoked_user_count(&self, user_id: UserId) -> usize {
    self
      .sessions
      .lock()
      .unwrap()
      .iter()
      .filter(|s| s.user_id == user_id && s.revoked)
      .count()
  }

  pub fn session_count(&self) -> usize {
    self.sessions.lock().unwrap().len()
  }
}

#[async_trait]
impl SessionRepository for InMemorySessions {
  async fn create(&self, session: NewSession) -> Result<Session, CoreError> {
    let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    let now = Utc::now();
    let row = Session {
      id,
      user_id: session.user_id,
      access_token_jti: session.access_token_jti,
      refresh_token_jti: session.refresh_token_jti,
      device_info: session.device_info,
      created_at: now,
      expires_at: session.expires_at,
      last_activity: now,
      revoked: false,
    };
    self.sessions.lock().unwrap().push(row.clone());
    Ok(row)
  }

  async fn find_by_access_jti(&self, jti: &str) -> Result<Option<Session>, CoreError> {
    let now = Utc::now();
    Ok(
      self
        .sessions
        .lock()
        .unwrap()
        .iter()
        .find(|s| s.access_token_jti == jti && !s.revoked && s.expires_at > now)
        .cloned(),
    )
  }

  async fn find_by_refresh_jti(&self, jti: &str) -> Result<Option<Session>, CoreError> {
    let now = Utc::now();
    Ok(
      self
        .sessions
        .lock()
        .unwrap()
        .iter()
        .find(|s| s.refresh_token_jti == jti && !s.revoked && s.expires_at > now)
        .cloned(),
    )
  }

  async fn rotate(
    &self,
    id: SessionId,
    new_access_jti: &str,
    new_refresh_jti: &str,
    new_expires_at: DateTime<Utc>,
  ) -> Result<Session, CoreError> {
    let mut sessions = self.sessions.lock().unwrap();
    let session = sessions
      .iter_mut()
      .find(|s| s.id == id && !s.revoked)
      .ok_or(CoreError::SessionRevoked)?;
    session.access_token_jti = new_access_jti.to_string();
    session.refresh_token_jti = new_refresh_jti.to_string();
    session.expires_at = new_expires_at;
    session.last_activity = Utc::now();
    Ok(session.clone())
  }

  async fn touch_activity(&self, id: SessionId) -> Result<(), CoreError> {
    let mut sessions = self.sessions.lock().unwrap();
    if let Some(session) = sessions.iter_mut().find(|s| s.id == id) {
      session.last_activity = Utc::now();
    }
    Ok(())
  }

  async fn revoke_by_jti(&self, jti: &str) -> Result<u64, CoreError> {
    let mut sessions = self.sessions.lock().unwrap();
    let mut count = 0;
    for session in sessions
      .iter_mut()
      .filter(|s| !s.revoked && (s.access_token_jti == jti || s.refresh_token_jti == jti))
    {
      session.revoked = true;
      count += 1;
    }
    Ok(count)
  }

  async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64, CoreError> {
    let mut sessions = self.sessions.lock().unwrap();
    let mut count = 0;
    for session in sessions
      .iter_mut()
      .filter(|s| s.user_id == user_id && !s.revoked)
    {
      session.revoked = true;
      count += 1;
    }
    Ok(count)
  }

  async fn delete_expired(&self) -> Result<u64, CoreError> {
    let mut sessions = self.sessions.lock().unwrap();
    let before = sessions.len();
    let now = Utc::now();
    sessions.retain(|s| s.expires_at > now);
    Ok((before - sessions.len()) as u64)
  }
}

#[derive(Default)]
pub struct InMemoryAudit {
  events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAudit {
  pub fn has_event(&self, event_type: AuditEventType) -> bool {
    self
      .events
      .lock()
      .unwrap()
      .iter()
      .any(|e| e.event_type == event_type)
  }

  pub fn count(&self, event_type: AuditEventType) -> usize {
    self
      .events
      .lock()
      .unwrap()
      .iter()
      .filter(|e| e.event_type == event_type)
      .count()
  }
}

#[async_trait]
impl AuditRepository for InMemoryAudit {
  async fn append(&self, event: AuditEvent) -> Result<(), CoreError> {
    self.events.lock().unwrap().push(event);
    Ok(())
  }

  async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
    Ok(0)
  }
}
