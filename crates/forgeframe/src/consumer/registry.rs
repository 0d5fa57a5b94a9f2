//! Process-wide instance registry.
//!
//! Maps `uid → instance` so peers and user code can look components up by
//! uid, and so `destroy_all` can sweep everything. Registration happens on
//! `render` entry; unregistration on reaching `Closed`. This is the only
//! module-level mutable state in the crate.

use std::sync::LazyLock;

use dashmap::DashMap;

use super::Instance;

static REGISTRY: LazyLock<DashMap<String, Instance>> = LazyLock::new(DashMap::new);

pub(super) fn register(instance: &Instance) {
    REGISTRY.insert(instance.uid().to_string(), instance.clone());
}

pub(super) fn unregister(uid: &str) {
    REGISTRY.remove(uid);
}

/// Look up a live component instance by uid.
pub fn get_component(uid: &str) -> Option<Instance> {
    REGISTRY.get(uid).map(|i| i.clone())
}

/// Number of live (rendered, not yet closed) instances.
pub fn live_count() -> usize {
    REGISTRY.len()
}

/// Close every live instance. Errors during individual closes are logged
/// and do not stop the sweep.
pub async fn destroy_all() {
    let instances: Vec<Instance> = REGISTRY.iter().map(|e| e.value().clone()).collect();
    for instance in instances {
        if let Err(e) = instance.close().await {
            tracing::warn!(uid = %instance.uid(), error = %e, "destroy_all: close failed");
        }
    }
}
