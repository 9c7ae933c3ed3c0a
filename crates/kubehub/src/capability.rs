use butler_core::Result;
use tokio::sync::OnceCell;
use tracing::info;

use crate::Platform;

/// Memoized probe for the OpenShift route API. A successful probe is cached
/// for the lifetime of the value; failed probes are retried on the next call.
#[derive(Debug, Default)]
pub struct RouteCapability {
    cell: OnceCell<bool>,
}

impl RouteCapability {
    pub const GROUP_VERSION: &'static str = "route.openshift.io/v1";

    pub fn new() -> Self { Self::default() }

    /// Pre-resolved probe, skipping the platform entirely.
    pub fn fixed(available: bool) -> Self { Self { cell: OnceCell::new_with(Some(available)) } }

    pub async fn available<P: Platform>(&self, platform: &P) -> Result<bool> {
        let v = self
            .cell
            .get_or_try_init(|| async {
                let available = platform.supports_api(Self::GROUP_VERSION).await?;
                info!(available, api = Self::GROUP_VERSION, "route api probed");
                Ok::<_, butler_core::Error>(available)
            })
            .await?;
        Ok(*v)
    }
}
