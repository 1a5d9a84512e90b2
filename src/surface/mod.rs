//! Page surfaces hosting the trading interface, and how requests reach them.
//!
//! A surface is a browser page. The coordinator never holds on to one: it keeps
//! the id of the last surface that answered and re-resolves it against the live
//! surface list before every order.

mod cdp;
mod local;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::protocol::{Request, Response};

pub use cdp::CdpSurfaceHost;
pub use local::LocalSurfaceHost;
#[cfg(test)]
pub use local::SENT_LOG_CAPACITY;

/// URL fragment identifying the trading venue.
pub const TARGET_URL_FRAGMENT: &str = "variational.io";

/// True when a page URL belongs to the trading venue.
pub fn is_target_url(url: &str) -> bool {
    url.contains(TARGET_URL_FRAGMENT)
}

/// Opaque identifier of a page surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A page currently known to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceInfo {
    pub id: SurfaceId,
    pub url: String,
    pub title: String,
    /// The page is the focused one in its window
    pub active: bool,
}

impl SurfaceInfo {
    pub fn is_eligible(&self) -> bool {
        is_target_url(&self.url)
    }
}

/// Transport-level failures talking to surfaces.
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// The page exists but its message channel could not be established.
    #[error("could not establish connection to page {0}: {1}")]
    Unreachable(SurfaceId, String),

    /// The page is no longer listed.
    #[error("page {0} is gone")]
    Gone(SurfaceId),

    /// The browser itself could not be queried.
    #[error("surface discovery failed: {0}")]
    Discovery(String),
}

/// Something that can enumerate pages and deliver requests to their automator.
#[async_trait]
pub trait SurfaceHost: Send + Sync {
    async fn list_surfaces(&self) -> Result<Vec<SurfaceInfo>, SurfaceError>;

    /// Deliver a request and wait for the automator's reply. No timeout is
    /// applied: the call only fails when the transport does.
    async fn send(&self, surface: &SurfaceId, request: Request) -> Result<Response, SurfaceError>;
}

/// Pick the surface to talk to.
///
/// Order of preference: the last active surface if it is still listed and
/// eligible, then the focused eligible surface, then any eligible surface.
pub async fn resolve_surface(
    host: &dyn SurfaceHost,
    last_active: Option<&SurfaceId>,
) -> Result<Option<SurfaceInfo>, SurfaceError> {
    let surfaces = host.list_surfaces().await?;
    Ok(pick_surface(surfaces, last_active))
}

fn pick_surface(surfaces: Vec<SurfaceInfo>, last_active: Option<&SurfaceId>) -> Option<SurfaceInfo> {
    let mut eligible: Vec<SurfaceInfo> = surfaces.into_iter().filter(SurfaceInfo::is_eligible).collect();

    if let Some(last) = last_active {
        if let Some(pos) = eligible.iter().position(|s| &s.id == last) {
            return Some(eligible.swap_remove(pos));
        }
        debug!(surface = %last, "Last active surface no longer available");
    }

    if let Some(pos) = eligible.iter().position(|s| s.active) {
        return Some(eligible.swap_remove(pos));
    }

    eligible.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(id: &str, url: &str, active: bool) -> SurfaceInfo {
        SurfaceInfo {
            id: SurfaceId::new(id),
            url: url.to_string(),
            title: String::new(),
            active,
        }
    }

    #[test]
    fn test_target_url_predicate() {
        assert!(is_target_url("https://omni.variational.io/perpetual/BTC"));
        assert!(!is_target_url("https://example.com/?q=variational"));
    }

    #[test]
    fn test_prefers_last_active_surface() {
        let surfaces = vec![
            surface("a", "https://omni.variational.io/", true),
            surface("b", "https://omni.variational.io/", false),
        ];
        let picked = pick_surface(surfaces, Some(&SurfaceId::new("b"))).unwrap();
        assert_eq!(picked.id.as_str(), "b");
    }

    #[test]
    fn test_falls_back_to_focused_then_any() {
        let surfaces = vec![
            surface("docs", "https://docs.rs/", true),
            surface("x", "https://omni.variational.io/", false),
            surface("y", "https://omni.variational.io/", true),
        ];
        let picked = pick_surface(surfaces.clone(), Some(&SurfaceId::new("closed"))).unwrap();
        assert_eq!(picked.id.as_str(), "y");

        let unfocused = vec![surfaces[0].clone(), surfaces[1].clone()];
        assert_eq!(pick_surface(unfocused, None).unwrap().id.as_str(), "x");
    }

    #[test]
    fn test_never_picks_ineligible_surface() {
        let surfaces = vec![surface("docs", "https://docs.rs/", true)];
        assert!(pick_surface(surfaces, Some(&SurfaceId::new("docs"))).is_none());
    }
}
