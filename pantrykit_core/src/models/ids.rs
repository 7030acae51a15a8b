//! Newtype wrappers for the ID types in the system
//!
//! These types provide type safety and prevent mixing up different kinds of IDs

use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;

/// User ID newtype
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Session ID newtype
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct SessionId(pub i64);

/// Grocery list ID newtype
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct ListId(pub i64);

impl fmt::Display for UserId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Display for SessionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Display for ListId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<i64> for UserId {
  fn from(id: i64) -> Self {
    UserId(id)
  }
}

impl From<i64> for SessionId {
  fn from(id: i64) -> Self {
    SessionId(id)
  }
}

impl From<i64> for ListId {
  fn from(id: i64) -> Self {
    ListId(id)
  }
}

impl From<UserId> for i64 {
  fn from(id: UserId) -> Self {
    id.0
  }
}

impl From<SessionId> for i64 {
  fn from(id: SessionId) -> Self {
    id.0
  }
}

impl From<ListId> for i64 {
  fn from(id: ListId) -> Self {
    id.0
  }
}
