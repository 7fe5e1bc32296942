//! Route access decisions.

use crate::provider::IdentityProvider;
use crate::session::SessionManager;
use crate::store::KeyValueStore;
use crate::types::{ROLE_CHILD, ROLE_PARENT};

/// Outcome of a navigation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    /// Navigate here instead.
    Redirect(String),
}

impl GuardDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Where the guard sends users it turns away.
#[derive(Debug, Clone, Copy)]
pub struct GuardPaths<'a> {
    pub login: &'a str,
    pub home: &'a str,
}

/// Decide whether navigation to `target_url` may proceed.
///
/// - Not logged in: redirect to login, with `returnUrl` set to the target.
/// - Logged in, role required but not held: redirect home.
/// - Otherwise: allow.
///
/// `has_role` is only called when a role is required.
pub fn decide(
    logged_in: bool,
    required_role: Option<&str>,
    has_role: impl FnOnce(&str) -> bool,
    target_url: &str,
    paths: GuardPaths<'_>,
) -> GuardDecision {
    if !logged_in {
        return GuardDecision::Redirect(login_redirect(paths.login, target_url));
    }
    match required_role {
        Some(role) if !has_role(role) => GuardDecision::Redirect(paths.home.to_owned()),
        _ => GuardDecision::Allow,
    }
}

fn login_redirect(login_path: &str, return_url: &str) -> String {
    format!("{login_path}?returnUrl={}", urlencoding::encode(return_url))
}

impl<P: IdentityProvider, S: KeyValueStore> SessionManager<P, S> {
    /// Guard a navigation with the live session state.
    pub fn can_activate(&self, required_role: Option<&str>, target_url: &str) -> GuardDecision {
        let config = self.config();
        decide(
            self.is_logged_in(),
            required_role,
            |role| self.has_role(role),
            target_url,
            GuardPaths {
                login: config.login_path(),
                home: config.home_path(),
            },
        )
    }
}

/// Access rule for one top-level route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAccess {
    Public,
    Authenticated,
    Role(String),
    /// Path that only forwards elsewhere.
    RedirectTo(String),
}

#[derive(Debug, Clone)]
pub struct Route {
    pub path: String,
    pub access: RouteAccess,
}

impl Route {
    #[must_use]
    pub fn new(path: impl Into<String>, access: RouteAccess) -> Self {
        Self {
            path: path.into(),
            access,
        }
    }
}

/// Top-level route map, matched on the first path segment.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
    fallback: String,
}

impl RouteTable {
    /// Routes not in `routes` redirect to `fallback`.
    #[must_use]
    pub fn new(routes: Vec<Route>, fallback: impl Into<String>) -> Self {
        Self {
            routes,
            fallback: fallback.into(),
        }
    }

    /// The ActivityHub application routes.
    #[must_use]
    pub fn activityhub() -> Self {
        Self::new(
            vec![
                Route::new("", RouteAccess::RedirectTo("/home".into())),
                Route::new("home", RouteAccess::Public),
                Route::new("login", RouteAccess::Public),
                Route::new("register", RouteAccess::Public),
                Route::new("challenges", RouteAccess::Authenticated),
                Route::new("submissions", RouteAccess::Role(ROLE_CHILD.into())),
                Route::new("children", RouteAccess::Role(ROLE_PARENT.into())),
                Route::new("leaderboard", RouteAccess::Public),
            ],
            "/home",
        )
    }

    #[must_use]
    pub fn route(&self, url: &str) -> Option<&Route> {
        let segment = first_segment(url);
        self.routes.iter().find(|route| route.path == segment)
    }

    /// Resolve navigation to `url` against the session.
    pub fn navigate<P: IdentityProvider, S: KeyValueStore>(
        &self,
        session: &SessionManager<P, S>,
        url: &str,
    ) -> GuardDecision {
        let Some(route) = self.route(url) else {
            return GuardDecision::Redirect(self.fallback.clone());
        };
        match &route.access {
            RouteAccess::Public => GuardDecision::Allow,
            RouteAccess::RedirectTo(target) => GuardDecision::Redirect(target.clone()),
            RouteAccess::Authenticated => session.can_activate(None, url),
            RouteAccess::Role(role) => session.can_activate(Some(role.as_str()), url),
        }
    }
}

fn first_segment(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    path.trim_start_matches('/').split('/').next().unwrap_or_default()
}
