use std::time::{
    Duration,
    SystemTime,
};

use async_trait::async_trait;

/// Fire a proactive refresh this long before the token expires.
const REFRESH_LEEWAY: Duration = Duration::from_secs(2);

/// A credential from the application's auth provider, with its expiry if the
/// provider reports one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: Option<SystemTime>,
}

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }
}

/// Capability for acquiring credentials, typically wrapping an auth
/// provider's SDK. Returning `None` means the user is not signed in.
///
/// Implemented for `FnMut(bool) -> impl Future<Output = Option<AuthToken>>`
/// closures, where the bool asks the provider to discard any cached token.
#[async_trait]
pub trait AuthTokenFetcher: Send + 'static {
    async fn fetch_token(&mut self, force_refresh: bool) -> Option<AuthToken>;
}

#[async_trait]
impl<F, Fut> AuthTokenFetcher for F
where
    F: FnMut(bool) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Option<AuthToken>> + Send,
{
    async fn fetch_token(&mut self, force_refresh: bool) -> Option<AuthToken> {
        self(force_refresh).await
    }
}

/// Observer for authenticated/unauthenticated transitions.
pub type AuthChangeCallback = Box<dyn FnMut(bool) + Send>;

/// What the connection worker must do after an auth state change.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub enum AuthAction {
    /// Present this token inside a transport pause, so the rotation never
    /// interleaves with other traffic.
    Rotate(String),
    /// Tell the server the client is now anonymous.
    Unauthenticate,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AuthState {
    Unauthenticated,
    /// A token has been presented; awaiting the first transition that
    /// confirms the server accepted it.
    Pending,
    Authenticated,
}

/// Tracks the credential lifecycle: initial fetch, confirmation by the first
/// post-auth transition, reactive refresh on `AuthError`, and proactive
/// refresh ahead of a known expiry.
pub struct AuthenticationManager {
    state: AuthState,
    fetcher: Option<Box<dyn AuthTokenFetcher>>,
    on_change: Option<AuthChangeCallback>,
    last_token: Option<String>,
    refresh_deadline: Option<tokio::time::Instant>,
}

impl AuthenticationManager {
    pub fn new() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            fetcher: None,
            on_change: None,
            last_token: None,
            refresh_deadline: None,
        }
    }

    /// Install a fetcher and acquire the initial token.
    pub async fn set_fetcher(
        &mut self,
        fetcher: Box<dyn AuthTokenFetcher>,
        on_change: Option<AuthChangeCallback>,
    ) -> AuthAction {
        self.fetcher = Some(fetcher);
        self.on_change = on_change;
        match self.fetch(false).await {
            Some(token) => self.rotate_to(token),
            None => {
                self.notify(false);
                self.reset();
                AuthAction::Unauthenticate
            },
        }
    }

    /// The server rejected our credential. Retry once with a forced refresh;
    /// if the provider hands back the same token, presenting it again can
    /// only fail the same way, so report permanent failure instead.
    pub async fn on_auth_error(&mut self, auth_update_attempted: bool) -> AuthAction {
        if self.fetcher.is_none() {
            // Statically-set (admin) credentials have no refresh path.
            tracing::warn!("Authentication failed and no token fetcher is set");
            self.reset();
            return AuthAction::Unauthenticate;
        }
        if !auth_update_attempted && self.state == AuthState::Unauthenticated {
            // Stale error from before we cleared auth.
            return AuthAction::None;
        }
        match self.fetch(true).await {
            Some(token) if Some(&token.value) != self.last_token.as_ref() => {
                self.rotate_to(token)
            },
            _ => {
                tracing::error!("Failed to refresh authentication token; clearing auth");
                self.notify(false);
                self.reset();
                AuthAction::Unauthenticate
            },
        }
    }

    /// A transition arrived: any pending credential is now confirmed.
    pub fn observe_transition(&mut self) {
        if self.state == AuthState::Pending {
            self.state = AuthState::Authenticated;
            self.notify(true);
        }
    }

    /// Proactive refresh, driven by the worker when the deadline passes.
    pub async fn refresh(&mut self) -> AuthAction {
        self.refresh_deadline = None;
        if self.fetcher.is_none() {
            return AuthAction::None;
        }
        match self.fetch(true).await {
            Some(token) => self.rotate_to(token),
            None => {
                self.notify(false);
                self.reset();
                AuthAction::Unauthenticate
            },
        }
    }

    /// Stop managing credentials. The caller clears auth with the server.
    pub fn clear(&mut self) {
        self.reset();
    }

    pub fn refresh_deadline(&self) -> Option<tokio::time::Instant> {
        self.refresh_deadline
    }

    async fn fetch(&mut self, force_refresh: bool) -> Option<AuthToken> {
        let fetcher = self.fetcher.as_mut()?;
        fetcher.fetch_token(force_refresh).await
    }

    fn rotate_to(&mut self, token: AuthToken) -> AuthAction {
        self.last_token = Some(token.value.clone());
        self.state = AuthState::Pending;
        self.refresh_deadline = token.expires_at.map(|expires_at| {
            let until_refresh = expires_at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
                .saturating_sub(REFRESH_LEEWAY);
            tokio::time::Instant::now() + until_refresh
        });
        AuthAction::Rotate(token.value)
    }

    fn reset(&mut self) {
        self.state = AuthState::Unauthenticated;
        self.fetcher = None;
        self.on_change = None;
        self.last_token = None;
        self.refresh_deadline = None;
    }

    fn notify(&mut self, authenticated: bool) {
        if let Some(on_change) = &mut self.on_change {
            on_change(authenticated);
        }
    }
}
