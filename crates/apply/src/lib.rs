//! Butler apply: pushes named configuration payloads to a live instance.
//!
//! Every accepted payload is digested and compared with its checksum record;
//! unchanged payloads are skipped, changed ones are executed and recorded on
//! success. A failing payload never stops the rest of the batch.

#![forbid(unsafe_code)]

use std::time::Instant;

use butler_api::ManagementClient;
use butler_core::{Payload, Result};
use butler_persist::{digest, ChecksumStore};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

/// Tally of one pass over a payload batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub skipped: usize,
    /// Names of payloads still out of sync after the pass.
    pub failed: Vec<String>,
    /// One line per failure, `<name>: <error>`.
    pub messages: Vec<String>,
}

impl ApplyOutcome {
    /// The next cycle must retry the failed subset.
    pub fn requeue(&self) -> bool { !self.failed.is_empty() }
}

/// Content checks and rewrites applied before a payload is sent.
pub type Transform = fn(&Payload) -> std::result::Result<String, String>;

pub fn identity(p: &Payload) -> std::result::Result<String, String> { Ok(p.content.clone()) }

/// Configuration-as-code document wrapped into a script that loads it.
/// Documents that are not valid YAML are rejected before they reach the instance.
pub fn casc_script(p: &Payload) -> std::result::Result<String, String> {
    serde_yaml::from_str::<serde_yaml::Value>(&p.content).map_err(|e| format!("invalid yaml: {}", e))?;
    let escaped = p.content.replace('\\', "\\\\").replace("'''", "\\'\\'\\'");
    Ok(format!(
        "import io.jenkins.plugins.casc.ConfigurationAsCode\n\
         import io.jenkins.plugins.casc.yaml.YamlSource\n\n\
         def config = '''{}'''\n\
         def stream = new ByteArrayInputStream(config.getBytes('UTF-8'))\n\
         def source = YamlSource.of(stream)\n\
         ConfigurationAsCode.get().configureWith(source)\n",
        escaped
    ))
}

pub fn has_suffix<'a>(suffixes: &'a [&'a str]) -> impl Fn(&str) -> bool + 'a {
    move |name| suffixes.iter().any(|s| name.ends_with(s))
}

/// Applies payloads from one source (`base-groovy`, `user-groovy`, `user-casc`).
pub struct Applier<'a> {
    client: &'a dyn ManagementClient,
    store: &'a dyn ChecksumStore,
    source: &'a str,
}

impl<'a> Applier<'a> {
    pub fn new(client: &'a dyn ManagementClient, store: &'a dyn ChecksumStore, source: &'a str) -> Self { Self { client, store, source } }

    /// Fold over `payloads` in order. Checksum store errors abort the pass;
    /// execution errors are collected in the outcome.
    pub async fn ensure<F>(&self, payloads: &[Payload], accept: F, transform: Transform) -> Result<ApplyOutcome>
    where
        F: Fn(&str) -> bool,
    {
        let t0 = Instant::now();
        let mut out = ApplyOutcome::default();
        for payload in payloads.iter().filter(|p| accept(&p.name)) {
            let hash = digest(&payload.content);
            if self.store.get(&payload.name).await?.as_deref() == Some(hash.as_str()) {
                debug!(source = %self.source, payload = %payload.name, "unchanged, skipping");
                counter!("payload_skipped_total", 1u64, "source" => self.source.to_string());
                out.skipped += 1;
                continue;
            }
            let executed = match transform(payload) {
                Ok(script) => self.client.execute_payload(&script).await.map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };
            match executed {
                Ok(()) => {
                    self.store.put(&payload.name, &hash).await?;
                    info!(source = %self.source, payload = %payload.name, "payload applied");
                    counter!("payload_applied_total", 1u64, "source" => self.source.to_string());
                    out.applied += 1;
                }
                Err(e) => {
                    warn!(source = %self.source, payload = %payload.name, error = %e, "payload failed");
                    counter!("payload_failed_total", 1u64, "source" => self.source.to_string());
                    out.messages.push(format!("{}: {}", payload.name, e));
                    out.failed.push(payload.name.clone());
                }
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}
