//! Maps auth state to the page a signed-in (or signed-out) user belongs on.
//!
//! [`destination`] is a plain lookup. [`AuthStateRouter`] applies it to a
//! stream of [`AuthEvent`]s and emits a [`Route`] whenever the destination
//! changes.

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Login,
    Onboarding,
    Home,
    Dashboard,
}

impl Route {
    pub fn path(self) -> &'static str {
        match self {
            Route::Login => "/login",
            Route::Onboarding => "/onboarding",
            Route::Home => "/",
            Route::Dashboard => "/dashboard",
        }
    }
}

/// What the router needs to know about a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub role: Role,
    /// Child accounts only: a guardian has linked this child.
    pub has_guardian_link: bool,
    /// Guardian accounts only: onboarding has not been completed yet.
    pub first_visit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSnapshot {
    SignedOut,
    SignedIn(SessionInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(SessionInfo),
    /// Metadata or link state changed for the current session.
    Updated(SessionInfo),
    SignedOut,
}

impl AuthEvent {
    pub fn snapshot(&self) -> AuthSnapshot {
        match self {
            AuthEvent::SignedIn(s) | AuthEvent::Updated(s) => AuthSnapshot::SignedIn(*s),
            AuthEvent::SignedOut => AuthSnapshot::SignedOut,
        }
    }
}

pub fn destination(snapshot: &AuthSnapshot) -> Route {
    match snapshot {
        AuthSnapshot::SignedOut => Route::Login,
        AuthSnapshot::SignedIn(s) => match (s.role, s.has_guardian_link, s.first_visit) {
            (Role::Child, false, _) => Route::Onboarding,
            (Role::Child, true, _) => Route::Home,
            (Role::Guardian, _, true) => Route::Onboarding,
            (Role::Guardian, _, false) => Route::Dashboard,
        },
    }
}

pub struct AuthStateRouter {
    events: broadcast::Receiver<AuthEvent>,
    routes: mpsc::Sender<Route>,
    shutdown: CancellationToken,
}

impl AuthStateRouter {
    pub fn new(events: broadcast::Receiver<AuthEvent>, routes: mpsc::Sender<Route>, shutdown: CancellationToken) -> Self {
        Self { events, routes, shutdown }
    }

    /// Run until the event sender closes, the route receiver is dropped, or
    /// `shutdown` fires.
    pub async fn run(mut self) {
        let mut current: Option<Route> = None;
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("auth router: shutdown");
                    return;
                }
                event = self.events.recv() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "auth router lagged behind auth events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            let route = destination(&event.snapshot());
            if current == Some(route) {
                continue;
            }
            info!(route = route.path(), "auth state redirect");
            if self.routes.send(route).await.is_err() {
                return;
            }
            current = Some(route);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(has_guardian_link: bool) -> AuthSnapshot {
        AuthSnapshot::SignedIn(SessionInfo { role: Role::Child, has_guardian_link, first_visit: false })
    }

    fn guardian(first_visit: bool) -> SessionInfo {
        SessionInfo { role: Role::Guardian, has_guardian_link: false, first_visit }
    }

    #[test]
    fn child_without_link_goes_to_onboarding() {
        assert_eq!(destination(&child(false)).path(), "/onboarding");
    }

    #[test]
    fn child_with_link_goes_home() {
        assert_eq!(destination(&child(true)).path(), "/");
    }

    #[test]
    fn guardian_onboards_once_then_dashboard() {
        assert_eq!(destination(&AuthSnapshot::SignedIn(guardian(true))), Route::Onboarding);
        assert_eq!(destination(&AuthSnapshot::SignedIn(guardian(false))), Route::Dashboard);
        assert_eq!(destination(&AuthSnapshot::SignedOut), Route::Login);
    }

    #[tokio::test]
    async fn router_emits_on_change_only() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let (routes_tx, mut routes_rx) = mpsc::channel(8);
        let handle = tokio::spawn(AuthStateRouter::new(events_rx, routes_tx, CancellationToken::new()).run());

        let kid = SessionInfo { role: Role::Child, has_guardian_link: false, first_visit: true };
        events_tx.send(AuthEvent::SignedIn(kid)).unwrap();
        events_tx.send(AuthEvent::Updated(kid)).unwrap();
        events_tx.send(AuthEvent::Updated(SessionInfo { has_guardian_link: true, ..kid })).unwrap();
        events_tx.send(AuthEvent::SignedOut).unwrap();
        drop(events_tx);

        handle.await.unwrap();
        let mut seen = Vec::new();
        while let Some(route) = routes_rx.recv().await {
            seen.push(route);
        }
        assert_eq!(seen, vec![Route::Onboarding, Route::Home, Route::Login]);
    }

    #[tokio::test]
    async fn router_stops_on_cancel() {
        let (_events_tx, events_rx) = broadcast::channel::<AuthEvent>(1);
        let (routes_tx, _routes_rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let handle = tokio::spawn(AuthStateRouter::new(events_rx, routes_tx, token.clone()).run());
        token.cancel();
        handle.await.unwrap();
    }
}
