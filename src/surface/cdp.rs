//! Surfaces backed by tabs of a browser started with remote debugging.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::automator::PageAutomator;
use crate::cdp::{self, CdpConnection, CdpPage, PageInfo};
use crate::protocol::{Request, Response};

use super::{SurfaceError, SurfaceHost, SurfaceId, SurfaceInfo};

/// Browser tabs reached through the DevTools HTTP and WebSocket endpoints.
pub struct CdpSurfaceHost {
    http: reqwest::Client,
    endpoint: String,
}

impl CdpSurfaceHost {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn pages(&self) -> Result<Vec<PageInfo>, SurfaceError> {
        let targets = cdp::list_targets(&self.http, &self.endpoint)
            .await
            .map_err(|e| SurfaceError::Discovery(e.to_string()))?;
        Ok(targets.into_iter().filter(PageInfo::is_page).collect())
    }
}

#[async_trait]
impl SurfaceHost for CdpSurfaceHost {
    /// DevTools lists the most recently focused tab first; that one is
    /// reported as active.
    async fn list_surfaces(&self) -> Result<Vec<SurfaceInfo>, SurfaceError> {
        let pages = self.pages().await?;
        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(i, page)| SurfaceInfo {
                id: SurfaceId::new(page.id),
                url: page.url,
                title: page.title,
                active: i == 0,
            })
            .collect())
    }

    async fn send(&self, surface: &SurfaceId, request: Request) -> Result<Response, SurfaceError> {
        let page = self
            .pages()
            .await?
            .into_iter()
            .find(|p| p.id == surface.as_str())
            .ok_or_else(|| SurfaceError::Gone(surface.clone()))?;

        let ws_url = page.web_socket_debugger_url.ok_or_else(|| {
            SurfaceError::Unreachable(surface.clone(), "page is already attached to another debugger".to_string())
        })?;

        let conn = CdpConnection::connect(&ws_url)
            .await
            .map_err(|e| SurfaceError::Unreachable(surface.clone(), e.to_string()))?;

        debug!(surface = %surface, action = request.action(), "Delivering request to page");
        let automator = PageAutomator::new(Arc::new(CdpPage::new(conn)));
        automator
            .handle(&request)
            .await
            .map_err(|e| SurfaceError::Unreachable(surface.clone(), e.to_string()))
    }
}
