//! Plugin drift between the desired list and what the instance reports.

use std::collections::HashMap;

use butler_core::Plugin;

/// One message per desired plugin that is missing or installed at another
/// version. Order does not matter, and plugins installed beyond the desired
/// set (transitive dependencies) are not drift.
pub fn drift(desired: &[Plugin], installed: &[Plugin]) -> Vec<String> {
    let installed: HashMap<&str, &str> = installed.iter().map(|p| (p.name.as_str(), p.version.as_str())).collect();
    desired
        .iter()
        .filter_map(|want| match installed.get(want.name.as_str()) {
            None => Some(format!("plugin {}:{} is not installed", want.name, want.version)),
            Some(v) if *v != want.version => Some(format!("plugin {} is installed at {}, want {}", want.name, v, want.version)),
            Some(_) => None,
        })
        .collect()
}
