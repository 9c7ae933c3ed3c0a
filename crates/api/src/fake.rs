//! In-process management API for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use butler_core::{DesiredState, Error, Plugin, Result};

use crate::{ClientFactory, ManagementClient};

/// Records executed payloads; payloads containing a configured marker fail.
#[derive(Default)]
pub struct FakeManagementClient {
    plugins: Mutex<Vec<Plugin>>,
    executed: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
    plugin_fetches: AtomicUsize,
}

impl FakeManagementClient {
    pub fn new() -> Self { Self::default() }

    pub fn with_plugins(self, plugins: Vec<Plugin>) -> Self {
        self.set_plugins(plugins);
        self
    }

    pub fn set_plugins(&self, plugins: Vec<Plugin>) { *self.plugins.lock().unwrap() = plugins; }

    /// Any payload whose content contains `marker` fails until [`Self::heal`] is called.
    pub fn fail_when_contains(&self, marker: &str) { self.failing.lock().unwrap().push(marker.to_string()); }
    pub fn heal(&self) { self.failing.lock().unwrap().clear(); }

    /// Content of every payload that was submitted, failed ones included.
    pub fn executed(&self) -> Vec<String> { self.executed.lock().unwrap().clone() }
    pub fn plugin_fetches(&self) -> usize { self.plugin_fetches.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl ManagementClient for FakeManagementClient {
    async fn fetch_all_plugins(&self) -> Result<Vec<Plugin>> {
        self.plugin_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.plugins.lock().unwrap().clone())
    }

    async fn execute_payload(&self, content: &str) -> Result<()> {
        self.executed.lock().unwrap().push(content.to_string());
        let failing = self.failing.lock().unwrap();
        match failing.iter().find(|m| content.contains(m.as_str())) {
            Some(m) => Err(Error::Management(format!("script failed on '{}'", m))),
            None => Ok(()),
        }
    }
}

/// Hands out one shared [`FakeManagementClient`].
pub struct FakeClientFactory {
    client: Arc<FakeManagementClient>,
    unreachable: bool,
    connects: AtomicUsize,
}

impl FakeClientFactory {
    pub fn new(client: Arc<FakeManagementClient>) -> Self { Self { client, unreachable: false, connects: AtomicUsize::new(0) } }

    /// Every acquisition fails, as when the API never answers.
    pub fn unreachable() -> Self { Self { unreachable: true, ..Self::new(Arc::new(FakeManagementClient::new())) } }

    pub fn connects(&self) -> usize { self.connects.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl ClientFactory for FakeClientFactory {
    async fn connect(&self, desired: &DesiredState) -> Result<Arc<dyn ManagementClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(Error::Management(format!("{} is unreachable", desired.name)));
        }
        Ok(self.client.clone())
    }
}
