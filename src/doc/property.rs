//! Read/modify/wait-for-change client for document metadata.

use std::{rc::Rc, time::Duration};

use calliope_client_api_proto::{PropertyDelta, PropertyOp};
use derive_more::{Display, From};
use serde_json::Value;
use tokio::time::Instant;
use tracerr::Traced;

use crate::{
    doc::session::{DocSession, SessionError},
    rpc::SessionProxy,
};

/// Smallest deadline [`PropertyClient::get_update`] accepts.
const MIN_UPDATE_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest deadline [`PropertyClient::get_update`] accepts.
const MAX_UPDATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors raised by [`PropertyClient`] operations.
#[derive(Clone, Debug, Display, From, PartialEq)]
pub enum PropertyError {
    /// The underlying session failed.
    #[display(fmt = "{}", _0)]
    Session(SessionError),

    /// The wait-for-change deadline expired.
    #[display(fmt = "timed out waiting for a property change")]
    #[from(ignore)]
    TimedOut,
}

/// Thin client for document properties keyed by name.
///
/// Every operation is a read-modify-write over the property snapshot of
/// the underlying session.
pub struct PropertyClient {
    /// Session the property calls ride on.
    session: Rc<DocSession>,
}

impl PropertyClient {
    /// Creates a new [`PropertyClient`] over the given session.
    #[must_use]
    pub fn new(session: Rc<DocSession>) -> Self {
        Self { session }
    }

    /// Indicates whether the property `name` is currently set.
    ///
    /// # Errors
    ///
    /// With [`PropertyError::Session`] if the snapshot cannot be fetched.
    pub async fn has(&self, name: &str) -> Result<bool, Traced<PropertyError>> {
        Ok(self.get(name).await?.is_some())
    }

    /// Returns the current value of the property `name`, if set.
    ///
    /// # Errors
    ///
    /// With [`PropertyError::Session`] if the snapshot cannot be fetched.
    pub async fn get(
        &self,
        name: &str,
    ) -> Result<Option<Value>, Traced<PropertyError>> {
        let proxy = self.proxy().await?;
        let snapshot = proxy
            .property_get_snapshot()
            .await
            .map_err(wrap_session_error)?;
        Ok(snapshot.properties.get(name).cloned())
    }

    /// Binds the property `name` to `value`.
    ///
    /// # Errors
    ///
    /// With [`PropertyError::Session`] if the snapshot or the update call
    /// fails.
    pub async fn set(
        &self,
        name: &str,
        value: Value,
    ) -> Result<(), Traced<PropertyError>> {
        self.apply(PropertyDelta::set(name, value)).await
    }

    /// Removes the binding of the property `name`.
    ///
    /// # Errors
    ///
    /// With [`PropertyError::Session`] if the snapshot or the update call
    /// fails.
    pub async fn delete(
        &self,
        name: &str,
    ) -> Result<(), Traced<PropertyError>> {
        self.apply(PropertyDelta::delete(name)).await
    }

    /// Waits until the value of the property `name` differs from
    /// `current` (deep equality), returning the new value, or [`None`]
    /// when the property got deleted.
    ///
    /// The deadline is clamped into `1 s ‥ 5 min` and enforced client-side
    /// across however many server polls it takes.
    ///
    /// # Errors
    ///
    /// - [`PropertyError::TimedOut`] when the deadline expires;
    /// - [`PropertyError::Session`] if a call fails.
    pub async fn get_update(
        &self,
        name: &str,
        current: Option<&Value>,
        timeout: Duration,
    ) -> Result<Option<Value>, Traced<PropertyError>> {
        let budget = timeout.clamp(MIN_UPDATE_TIMEOUT, MAX_UPDATE_TIMEOUT);
        let deadline = Instant::now() + budget;

        let proxy = self.proxy().await?;
        let snapshot = proxy
            .property_get_snapshot()
            .await
            .map_err(wrap_session_error)?;
        let observed = snapshot.properties.get(name);
        if observed != current {
            return Ok(observed.cloned());
        }
        let mut rev_num = snapshot.rev_num;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(tracerr::new!(PropertyError::TimedOut));
            }

            let change = match proxy
                .property_get_change_after(
                    rev_num,
                    remaining.as_millis() as u64,
                )
                .await
            {
                Ok(change) => change,
                Err(e) if e.as_ref().is_timed_out() => continue,
                Err(e) => return Err(wrap_session_error(e)),
            };
            rev_num = change.rev_num;

            for op in change.delta.0 {
                match op {
                    PropertyOp::Set { name: n, value } if n == name => {
                        if Some(&value) != current {
                            return Ok(Some(value));
                        }
                    }
                    PropertyOp::Delete { name: n } if n == name => {
                        if current.is_some() {
                            return Ok(None);
                        }
                    }
                    PropertyOp::Set { .. } | PropertyOp::Delete { .. } => (),
                }
            }
        }
    }

    /// Submits one [`PropertyDelta`] against the current snapshot revision.
    async fn apply(
        &self,
        delta: PropertyDelta,
    ) -> Result<(), Traced<PropertyError>> {
        let proxy = self.proxy().await?;
        let snapshot = proxy
            .property_get_snapshot()
            .await
            .map_err(wrap_session_error)?;
        drop(
            proxy
                .property_update(snapshot.rev_num, &delta)
                .await
                .map_err(wrap_session_error)?,
        );
        Ok(())
    }

    /// Resolves the session proxy for the next operation.
    async fn proxy(&self) -> Result<SessionProxy, Traced<PropertyError>> {
        self.session
            .get_session_proxy()
            .await
            .map_err(tracerr::map_from_and_wrap!(=> PropertyError))
    }
}

/// Maps a failed call into a [`PropertyError`].
fn wrap_session_error(
    error: Traced<crate::rpc::CallError>,
) -> Traced<PropertyError> {
    let to_session = tracerr::map_from_and_wrap!(=> SessionError);
    let to_property = tracerr::map_from_and_wrap!(=> PropertyError);
    to_property(to_session(error))
}
