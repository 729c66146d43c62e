//! Script selection

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{AgiChannel, AgiRequest};
use crate::error::AgiResult;

/// Handler for one FastAGI session.
///
/// The channel is passed explicitly; scripts that call helpers pass it on.
#[async_trait]
pub trait AgiScript: Send + Sync {
    async fn service(&self, request: &AgiRequest, channel: &mut AgiChannel) -> AgiResult<()>;
}

/// Picks the script for an incoming request.
pub trait ScriptMapper: Send + Sync {
    fn determine_script(&self, request: &AgiRequest) -> Option<Arc<dyn AgiScript>>;
}

/// In-memory map from script path (`agi://host/<path>`) to script.
#[derive(Default, Clone)]
pub struct SimpleMappingStrategy {
    scripts: HashMap<String, Arc<dyn AgiScript>>,
}

impl std::fmt::Debug for SimpleMappingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut paths: Vec<&String> = self
            .scripts
            .keys()
            .collect();
        paths.sort();
        f.debug_struct("SimpleMappingStrategy")
            .field("scripts", &paths)
            .finish()
    }
}

impl SimpleMappingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_script(mut self, path: &str, script: impl AgiScript + 'static) -> Self {
        self.insert(path, Arc::new(script));
        self
    }

    /// Map `path`; a leading `/` is ignored. Replaces any previous mapping.
    pub fn insert(&mut self, path: &str, script: Arc<dyn AgiScript>) {
        self.scripts
            .insert(normalize_path(path), script);
    }

    pub fn len(&self) -> usize {
        self.scripts
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts
            .is_empty()
    }
}

impl ScriptMapper for SimpleMappingStrategy {
    fn determine_script(&self, request: &AgiRequest) -> Option<Arc<dyn AgiScript>> {
        let path = request.script()?;
        self.scripts
            .get(&normalize_path(path))
            .cloned()
    }
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/')
        .to_string()
}
