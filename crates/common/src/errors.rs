//! Typed error metadata attached to `anyhow` error chains.
//!
//! An [`ErrorMetadata`] is attached with `.context(...)` at the point a
//! failure is classified and recovered downstream with
//! [`ErrorMetadataAnyhowExt`], so intermediate layers propagate errors with
//! plain `?`.

use std::borrow::Cow;

use crate::types::Timestamp;

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, stable across copy changes. Usable in
    /// tests for matching.
    pub short_msg: Cow<'static, str>,
    /// Human readable, developer facing.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The write was rejected before commit; surfaced to the caller.
    BadRequest,
    /// Serializability conflict. Carries the timestamp of the commit that
    /// invalidated the transaction's reads; callers retry with a begin
    /// timestamp at or above it.
    Occ { conflicting_ts: Timestamp },
    /// The requested timestamp is below the retention horizon.
    OutOfRetention,
    /// Durability failed; the commit did not publish. Not retried by the
    /// core.
    Overloaded,
    /// The transaction ran past its wall-clock deadline.
    Deadline,
}

impl ErrorMetadata {
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn occ(conflicting_ts: Timestamp, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Occ { conflicting_ts },
            short_msg: "OptimisticConcurrencyControlFailure".into(),
            msg: msg.into(),
        }
    }

    pub fn out_of_retention() -> Self {
        Self {
            code: ErrorCode::OutOfRetention,
            short_msg: "SnapshotTooOld".into(),
            msg: "Timestamp is outside the retention window; retry from a fresh snapshot".into(),
        }
    }

    pub fn persistence_unavailable(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: "PersistenceUnavailable".into(),
            msg: msg.into(),
        }
    }

    pub fn transaction_timeout() -> Self {
        Self {
            code: ErrorCode::Deadline,
            short_msg: "TransactionTimeout".into(),
            msg: "Transaction exceeded its deadline before commit submission".into(),
        }
    }

    pub fn invalid_write(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::bad_request("InvalidWrite", msg)
    }

    pub fn schema_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::bad_request("SchemaError", msg)
    }

    pub fn pagination_limit(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::bad_request(short_msg, msg)
    }
}

/// Downcasting helpers for `anyhow::Error` chains carrying [`ErrorMetadata`].
pub trait ErrorMetadataAnyhowExt {
    fn metadata(&self) -> Option<&ErrorMetadata>;

    fn is_occ(&self) -> bool {
        matches!(
            self.metadata(),
            Some(ErrorMetadata {
                code: ErrorCode::Occ { .. },
                ..
            })
        )
    }

    /// The commit timestamp that conflicted, if this is an OCC abort.
    fn occ_conflicting_ts(&self) -> Option<Timestamp> {
        match self.metadata() {
            Some(ErrorMetadata {
                code: ErrorCode::Occ { conflicting_ts },
                ..
            }) => Some(*conflicting_ts),
            _ => None,
        }
    }

    fn is_out_of_retention(&self) -> bool {
        matches!(
            self.metadata(),
            Some(ErrorMetadata {
                code: ErrorCode::OutOfRetention,
                ..
            })
        )
    }

    fn is_bad_request(&self) -> bool {
        matches!(
            self.metadata(),
            Some(ErrorMetadata {
                code: ErrorCode::BadRequest,
                ..
            })
        )
    }

    fn is_overloaded(&self) -> bool {
        matches!(
            self.metadata(),
            Some(ErrorMetadata {
                code: ErrorCode::Overloaded,
                ..
            })
        )
    }

    fn is_deadline_exceeded(&self) -> bool {
        matches!(
            self.metadata(),
            Some(ErrorMetadata {
                code: ErrorCode::Deadline,
                ..
            })
        )
    }

    fn short_msg(&self) -> Option<&str> {
        self.metadata().map(|m| m.short_msg.as_ref())
    }
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn metadata(&self) -> Option<&ErrorMetadata> {
        // `downcast_ref` sees through context layers, so metadata attached
        // anywhere in the chain is found.
        self.downcast_ref::<ErrorMetadata>()
    }
}
