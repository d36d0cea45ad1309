//! Package-registry lookups that feed the dynamic canonical dictionary.
//!
//! When an entity name resolves to a real package on crates.io, npm, or
//! PyPI, the registry's spelling becomes the canonical name and the input
//! is recorded as an alias. Lookups use a 5 second timeout and fail
//! silently; the resolver works fine without them.

use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::ontology::extend_canonical_names;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct CratesIoResponse {
    #[serde(rename = "crate")]
    krate: CratesIoCrate,
}

#[derive(Debug, Deserialize)]
struct CratesIoCrate {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NpmResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PypiResponse {
    info: PypiInfo,
}

#[derive(Debug, Deserialize)]
struct PypiInfo {
    name: String,
}

/// Resolves package names against public registries.
pub struct RegistryLookup {
    http: Client,
}

impl RegistryLookup {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Option<T> {
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<T>().await.ok()
    }

    /// The registry's canonical spelling for `name`, if any registry
    /// knows it. Checked in order: crates.io, npm, PyPI.
    pub async fn canonical_package_name(&self, name: &str) -> Option<String> {
        let slug = name.trim().to_lowercase().replace(' ', "-");
        if slug.is_empty() {
            return None;
        }

        if let Some(r) = self
            .get_json::<CratesIoResponse>(&format!("https://crates.io/api/v1/crates/{slug}"))
            .await
        {
            return Some(r.krate.name);
        }
        if let Some(r) = self
            .get_json::<NpmResponse>(&format!("https://registry.npmjs.org/{slug}"))
            .await
        {
            return Some(r.name);
        }
        if let Some(r) = self
            .get_json::<PypiResponse>(&format!("https://pypi.org/pypi/{slug}/json"))
            .await
        {
            return Some(r.info.name);
        }
        None
    }

    /// Refresh the dynamic canonical dictionary for a batch of names.
    /// Every failure is silent; returns how many mappings were learned.
    pub async fn refresh_canonical_names(&self, names: &[String]) -> usize {
        let mut learned: HashMap<String, String> = HashMap::new();
        for name in names {
            if let Some(canonical) = self.canonical_package_name(name).await {
                if !canonical.eq_ignore_ascii_case(name) || canonical != *name {
                    learned.insert(name.to_lowercase(), canonical);
                }
            }
        }
        let count = learned.len();
        if count > 0 {
            debug!(count, "learned canonical names from package registries");
            extend_canonical_names(learned);
        }
        count
    }
}

impl Default for RegistryLookup {
    fn default() -> Self {
        Self::new()
    }
}
