//! Surfaces living in this process, each wrapping a [`PageAutomator`].
//!
//! Backs `run --simulate` and the coordinator tests. Reachability can be
//! toggled per surface and individual requests can be intercepted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::automator::{Page, PageAutomator};
use crate::protocol::{Request, Response};

use super::{SurfaceError, SurfaceHost, SurfaceId, SurfaceInfo};

/// Most recent delivered requests kept for inspection.
pub const SENT_LOG_CAPACITY: usize = 256;

/// Hook consulted before a request is delivered. Returning `Some` short-circuits delivery.
pub type Intercept = Box<dyn Fn(&SurfaceId, &Request) -> Option<Result<Response, SurfaceError>> + Send + Sync>;

struct LocalSurface {
    info: SurfaceInfo,
    automator: Arc<PageAutomator>,
    reachable: bool,
}

#[derive(Default)]
struct Registry {
    surfaces: Vec<LocalSurface>,
    sent: VecDeque<(SurfaceId, Request)>,
}

/// In-process surface host.
#[derive(Default)]
pub struct LocalSurfaceHost {
    registry: Mutex<Registry>,
    intercept: Mutex<Option<Intercept>>,
}

impl LocalSurfaceHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_surface(&self, id: &str, url: &str, active: bool, page: Arc<dyn Page>) {
        self.registry().surfaces.push(LocalSurface {
            info: SurfaceInfo {
                id: SurfaceId::new(id),
                url: url.to_string(),
                title: String::new(),
                active,
            },
            automator: Arc::new(PageAutomator::new(page)),
            reachable: true,
        });
    }

    pub fn remove_surface(&self, id: &str) {
        self.registry().surfaces.retain(|s| s.info.id.as_str() != id);
    }

    /// An unreachable surface is still listed but refuses every request.
    pub fn set_reachable(&self, id: &str, reachable: bool) {
        if let Some(surface) = self.registry().surfaces.iter_mut().find(|s| s.info.id.as_str() == id) {
            surface.reachable = reachable;
        }
    }

    pub fn set_intercept(&self, intercept: Option<Intercept>) {
        *self.intercept.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = intercept;
    }

    /// The last [`SENT_LOG_CAPACITY`] requests handed to [`SurfaceHost::send`], oldest first.
    pub fn sent_requests(&self) -> Vec<(SurfaceId, Request)> {
        self.registry().sent.iter().cloned().collect()
    }
}

#[async_trait]
impl SurfaceHost for LocalSurfaceHost {
    async fn list_surfaces(&self) -> Result<Vec<SurfaceInfo>, SurfaceError> {
        Ok(self.registry().surfaces.iter().map(|s| s.info.clone()).collect())
    }

    async fn send(&self, surface: &SurfaceId, request: Request) -> Result<Response, SurfaceError> {
        {
            let mut registry = self.registry();
            if registry.sent.len() == SENT_LOG_CAPACITY {
                registry.sent.pop_front();
            }
            registry.sent.push_back((surface.clone(), request.clone()));
        }

        let intercepted = {
            let intercept = self.intercept.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            intercept.as_ref().and_then(|hook| hook(surface, &request))
        };
        if let Some(outcome) = intercepted {
            return outcome;
        }

        let automator = {
            let registry = self.registry();
            let target = registry
                .surfaces
                .iter()
                .find(|s| &s.info.id == surface)
                .ok_or_else(|| SurfaceError::Gone(surface.clone()))?;
            if !target.reachable {
                return Err(SurfaceError::Unreachable(
                    surface.clone(),
                    "receiving end does not exist".to_string(),
                ));
            }
            target.automator.clone()
        };

        automator
            .handle(&request)
            .await
            .map_err(|e| SurfaceError::Unreachable(surface.clone(), e.to_string()))
    }
}
