//! Error types for the coordinator surface.
//!
//! Provider seams ([`LlmClient`](crate::LlmClient),
//! [`CalendarClient`](crate::meetmesh::calendar::CalendarClient),
//! [`Store`](crate::Store)) return boxed errors so implementations can wrap
//! whatever their transport produces. The user-facing orchestrator and
//! approval surfaces translate those into [`CoordinatorError`], which carries
//! a plain-language reason and never leaks internals to the client transport.

use thiserror::Error;

/// Boxed error type used at provider trait seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Typed error returned by user-facing coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// No session matched the given thread or session ids.
    #[error("세션을 찾을 수 없습니다.")]
    SessionNotFound,

    /// Recoordination was requested but the prior participant set could not
    /// be recovered from the stored sessions.
    #[error("이전 대화의 참여자 정보를 찾을 수 없어 재조율을 진행할 수 없습니다.")]
    ParticipantsUnrecoverable,

    /// The persistence backend failed. The negotiation round that hit this is
    /// abandoned; the session stays `in_progress` and retry is a human concern.
    #[error("저장소 오류: {0}")]
    Store(String),

    /// The calendar provider rejected a request in a way that is not the
    /// usual per-user credential failure.
    #[error("캘린더 오류: {0}")]
    Calendar(String),
}

impl CoordinatorError {
    /// Wrap a store-layer error, keeping only its display text.
    pub fn store(err: BoxError) -> Self {
        CoordinatorError::Store(err.to_string())
    }
}
