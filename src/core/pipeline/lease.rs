//! Background execution leases
//! A lease asks the host to keep the process running while a request is in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u64);

impl LeaseToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Runs when the host is about to revoke a lease.
pub type ExpirationHandler = Box<dyn FnOnce() + Send>;

/// The host facility granting background time.
pub trait BackgroundExecution: Send + Sync {
    fn begin(&self, name: &str, on_expire: ExpirationHandler) -> LeaseToken;

    fn end(&self, token: LeaseToken);
}

/// Scoped lease; ended exactly once, by `release` or on drop.
pub struct BackgroundLease {
    host: Arc<dyn BackgroundExecution>,
    token: Option<LeaseToken>,
}

impl BackgroundLease {
    pub fn acquire(host: Arc<dyn BackgroundExecution>, name: &str, on_expire: ExpirationHandler) -> Self {
        let token = host.begin(name, on_expire);
        debug!("Background lease {} acquired for {}", token.id(), name);
        Self {
            host,
            token: Some(token),
        }
    }

    pub fn token(&self) -> Option<LeaseToken> {
        self.token
    }

    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    /// Ends the lease. Returns false if it was already released.
    pub fn release(&mut self) -> bool {
        match self.token.take() {
            Some(token) => {
                self.host.end(token);
                debug!("Background lease {} released", token.id());
                true
            }
            None => false,
        }
    }
}

impl Drop for BackgroundLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Host for platforms without a background budget of their own: each lease is
/// revoked once `budget` has elapsed.
pub struct TimedBackground {
    budget: Duration,
    next: Mutex<u64>,
    timers: Arc<Mutex<HashMap<LeaseToken, CancellationToken>>>,
}

impl TimedBackground {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            next: Mutex::new(0),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<LeaseToken, CancellationToken>> {
        self.timers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl BackgroundExecution for TimedBackground {
    fn begin(&self, name: &str, on_expire: ExpirationHandler) -> LeaseToken {
        let token = {
            let mut next = self.next.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            LeaseToken::new(*next)
        };

        let cancel = CancellationToken::new();
        self.timers().insert(token, cancel.clone());

        let budget = self.budget;
        let timers = self.timers.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(budget) => {
                    let expired = timers
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .remove(&token)
                        .is_some();
                    if expired {
                        warn!("Background time for {} expired after {:?}", name, budget);
                        on_expire();
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
        token
    }

    fn end(&self, token: LeaseToken) {
        match self.timers().remove(&token) {
            Some(cancel) => cancel.cancel(),
            None => info!("Background lease {} already expired", token.id()),
        }
    }
}
