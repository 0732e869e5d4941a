//! Array Session and Mutation Serializer
//!
//! The driver talks to the array through a single authenticated session. That
//! session, together with the array's LUN and host allocation state, is shared
//! by every control-plane call, so all mutating operations run one at a time
//! behind [`MutationSerializer`]. The lock is held for the whole operation and
//! callers wait for it; there is no timeout.

use crate::domain::ports::{ArrayClient, ArrayClientRef, ArrayCredentials};
use crate::error::Result;
use std::ops::Deref;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Address and user of the currently authenticated session
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionIdentity {
    address: String,
    username: String,
}

/// The array client plus the identity it is logged in as
struct ArraySession {
    client: ArrayClientRef,
    current: Option<SessionIdentity>,
}

impl ArraySession {
    fn new(client: ArrayClientRef) -> Self {
        Self {
            client,
            current: None,
        }
    }

    /// Log in again unless the session already targets this address as this user
    async fn ensure(&mut self, credentials: &ArrayCredentials) -> Result<()> {
        let wanted = SessionIdentity {
            address: credentials.address.clone(),
            username: credentials.username.clone(),
        };

        debug!(address = %wanted.address, "using array API");
        if self.current.as_ref() == Some(&wanted) {
            debug!("array client is already configured for this API, skipping login");
            return Ok(());
        }

        info!(address = %wanted.address, username = %wanted.username, "logging into array");
        self.current = None;
        match self.client.login(credentials).await {
            Ok(()) => {
                info!("login was successful");
                self.current = Some(wanted);
                Ok(())
            }
            // refusals arrive as Unauthenticated, transport failures stay Unavailable
            Err(e) => {
                warn!(
                    address = %wanted.address,
                    username = %wanted.username,
                    error = %e,
                    code = %e.code(),
                    "array login failed"
                );
                Err(e)
            }
        }
    }
}

// =============================================================================
// Mutation Serializer
// =============================================================================

/// System-wide exclusion domain for mutating control-plane operations
pub struct MutationSerializer {
    session: Mutex<ArraySession>,
}

impl MutationSerializer {
    pub fn new(client: ArrayClientRef) -> Self {
        Self {
            session: Mutex::new(ArraySession::new(client)),
        }
    }

    /// Wait for exclusive access, then configure the session for `credentials`
    ///
    /// The returned guard keeps every other mutating operation out until it is
    /// dropped, at which point idle connections to the array are closed.
    pub async fn acquire(&self, credentials: &ArrayCredentials) -> Result<SessionGuard<'_>> {
        let waiting = Instant::now();
        let mut guard = self.session.lock().await;
        debug!(
            waited_ms = waiting.elapsed().as_millis() as u64,
            "mutation lock acquired"
        );

        if let Err(e) = guard.ensure(credentials).await {
            guard.client.close_idle_connections();
            return Err(e);
        }

        Ok(SessionGuard { guard })
    }

    /// Configure the session for a read-only operation without holding the
    /// lock for the rest of the call
    pub async fn reader(&self, credentials: &ArrayCredentials) -> Result<ReadSession> {
        let mut guard = self.session.lock().await;
        if let Err(e) = guard.ensure(credentials).await {
            guard.client.close_idle_connections();
            return Err(e);
        }
        Ok(ReadSession {
            client: guard.client.clone(),
        })
    }
}

/// Exclusive, configured session for one mutating operation
pub struct SessionGuard<'a> {
    guard: MutexGuard<'a, ArraySession>,
}

impl Deref for SessionGuard<'_> {
    type Target = dyn ArrayClient;

    fn deref(&self) -> &Self::Target {
        self.guard.client.as_ref()
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.guard.client.close_idle_connections();
        debug!("mutation lock released");
    }
}

/// Configured session handle for a read-only operation
pub struct ReadSession {
    client: ArrayClientRef,
}

impl Deref for ReadSession {
    type Target = dyn ArrayClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        self.client.close_idle_connections();
    }
}
