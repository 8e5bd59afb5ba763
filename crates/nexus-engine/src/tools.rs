//! Tool-server registry.
//!
//! Holds the configured external tool servers, a process-lifetime cache
//! of each server's advertised tools, and computes the effective
//! tool-exposure set for a request. Cache entries are tagged with a
//! fingerprint of `(transport, url)` at cache time; editing either field
//! invalidates the entry, so a stale tool list is never shown against a
//! changed endpoint. Server configs persist, caches do not.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use nexus_common::{new_id, ToolDescriptor, ToolMode, ToolServerConfig, Transport};

use crate::storage::{keys, KvStore};

/// Group label for tool names without a `server.tool` prefix.
pub const UNGROUPED: &str = "(other)";

const DEFAULT_SERVER_NAME: &str = "Local Proxy";

fn fingerprint(transport: Transport, url: &str) -> String {
    format!("{}:{}", transport.as_str(), url.trim())
}

struct ToolCacheEntry {
    fingerprint: String,
    tools: Vec<ToolDescriptor>,
}

pub struct ToolRegistry {
    servers: Vec<ToolServerConfig>,
    active_server: Option<String>,
    /// Keyed by server id. Never persisted.
    cache: HashMap<String, ToolCacheEntry>,
    storage: Arc<dyn KvStore>,
}

impl ToolRegistry {
    /// Load persisted server configs. An empty or unreadable record
    /// seeds one default server.
    pub async fn load(storage: Arc<dyn KvStore>) -> Self {
        let mut servers = match storage.get(keys::TOOL_SERVERS).await {
            Ok(Some(value)) => match serde_json::from_value::<Vec<ToolServerConfig>>(value) {
                Ok(servers) => servers,
                Err(e) => {
                    warn!("discarding unreadable tool-server records: {e}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("failed to read tool servers: {e}");
                Vec::new()
            }
        };
        if servers.is_empty() {
            servers.push(Self::default_server(true));
        }

        let active_server = match storage.get(keys::ACTIVE_TOOL_SERVER).await {
            Ok(Some(value)) => value.as_str().map(String::from),
            _ => None,
        };
        let active_server = active_server
            .filter(|id| servers.iter().any(|s| &s.id == id))
            .or_else(|| servers.first().map(|s| s.id.clone()));

        Self {
            servers,
            active_server,
            cache: HashMap::new(),
            storage,
        }
    }

    /// Template for a freshly added server.
    pub fn default_server(enabled: bool) -> ToolServerConfig {
        ToolServerConfig {
            id: new_id(),
            name: DEFAULT_SERVER_NAME.to_string(),
            transport: Transport::Sse,
            url: Self::default_url_for(Transport::Sse).to_string(),
            enabled,
            tool_mode: ToolMode::All,
            enabled_tools: Default::default(),
        }
    }

    pub fn default_url_for(transport: Transport) -> &'static str {
        match transport {
            Transport::Sse => "http://127.0.0.1:3006/sse",
            Transport::StreamableHttp => "http://127.0.0.1:3006/mcp",
            Transport::Websocket => "ws://127.0.0.1:3006/mcp",
        }
    }

    /// Add or replace a server config. Replacing with a changed
    /// transport or url drops that server's cached tool list.
    pub async fn upsert_server(&mut self, config: ToolServerConfig) {
        if let Some(existing) = self.servers.iter_mut().find(|s| s.id == config.id) {
            let old_fp = fingerprint(existing.transport, &existing.url);
            let new_fp = fingerprint(config.transport, &config.url);
            if old_fp != new_fp {
                debug!(server = %config.id, "endpoint changed, invalidating tool cache");
                self.cache.remove(&config.id);
            }
            *existing = config;
        } else {
            if self.active_server.is_none() {
                self.active_server = Some(config.id.clone());
            }
            self.servers.push(config);
        }
        self.persist().await;
    }

    /// Remove a server. The registry never goes empty: removing the
    /// last server re-seeds one disabled default.
    pub async fn remove_server(&mut self, id: &str) {
        self.servers.retain(|s| s.id != id);
        self.cache.remove(id);

        if self.servers.is_empty() {
            self.servers.push(Self::default_server(false));
        }
        if self.active_server.as_deref() == Some(id) || self.active_server.is_none() {
            self.active_server = self.servers.first().map(|s| s.id.clone());
        }
        self.persist().await;
    }

    pub async fn set_active(&mut self, id: &str) {
        if self.servers.iter().any(|s| s.id == id) {
            self.active_server = Some(id.to_string());
            self.persist().await;
        }
    }

    pub fn active_server(&self) -> Option<&str> {
        self.active_server.as_deref()
    }

    pub fn servers(&self) -> &[ToolServerConfig] {
        &self.servers
    }

    pub fn get_server(&self, id: &str) -> Option<&ToolServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Cache a freshly fetched tool list, tagged with the endpoint it
    /// came from.
    pub fn set_tool_list(
        &mut self,
        server_id: &str,
        transport: Transport,
        url: &str,
        tools: Vec<ToolDescriptor>,
    ) {
        self.cache.insert(
            server_id.to_string(),
            ToolCacheEntry {
                fingerprint: fingerprint(transport, url),
                tools,
            },
        );
    }

    /// The cached advertised tools for a server, only while the cache
    /// entry still matches the live config's endpoint.
    pub fn cached_tools(&self, server_id: &str) -> Option<&[ToolDescriptor]> {
        let server = self.get_server(server_id)?;
        let entry = self.cache.get(server_id)?;
        if entry.fingerprint != fingerprint(server.transport, &server.url) {
            return None;
        }
        Some(&entry.tools)
    }

    /// Aggregate tool exposure across all enabled servers: every
    /// advertised tool in `All` mode, only selected names in `Selected`
    /// mode. A selected name the server no longer advertises is
    /// silently dropped.
    pub fn effective_tool_set(&self) -> Vec<ToolDescriptor> {
        let mut tools = Vec::new();
        for server in &self.servers {
            if !server.enabled {
                continue;
            }
            let Some(advertised) = self.cached_tools(&server.id) else {
                continue;
            };
            for tool in advertised {
                let include = match server.tool_mode {
                    ToolMode::All => true,
                    ToolMode::Selected => server.enabled_tools.contains(&tool.name),
                };
                if include {
                    tools.push(tool.clone());
                }
            }
        }
        tools
    }

    /// Select every currently advertised tool on one server. Switches
    /// the server to `Selected` mode. No-op without a valid cache.
    pub async fn enable_all(&mut self, server_id: &str) {
        let Some(advertised) = self.cached_tools(server_id) else {
            return;
        };
        let names: std::collections::BTreeSet<String> =
            advertised.iter().map(|t| t.name.clone()).collect();
        if let Some(server) = self.servers.iter_mut().find(|s| s.id == server_id) {
            server.tool_mode = ToolMode::Selected;
            server.enabled_tools = names;
            self.persist().await;
        }
    }

    /// Deselect every tool on one server. Switches to `Selected` mode
    /// with an empty selection.
    pub async fn disable_all(&mut self, server_id: &str) {
        if let Some(server) = self.servers.iter_mut().find(|s| s.id == server_id) {
            server.tool_mode = ToolMode::Selected;
            server.enabled_tools.clear();
            self.persist().await;
        }
    }

    /// Group a server's advertised tools by their `server.tool` name
    /// prefix for display. Names without a separator land in the
    /// [`UNGROUPED`] bucket, which sorts last.
    pub fn grouped(&self, server_id: &str) -> Vec<(String, Vec<ToolDescriptor>)> {
        let Some(advertised) = self.cached_tools(server_id) else {
            return Vec::new();
        };

        let mut groups: Vec<(String, Vec<ToolDescriptor>)> = Vec::new();
        for tool in advertised {
            let group = match tool.name.find('.') {
                Some(dot) if dot > 0 => tool.name[..dot].to_string(),
                _ => UNGROUPED.to_string(),
            };
            match groups.iter_mut().find(|(name, _)| *name == group) {
                Some((_, tools)) => tools.push(tool.clone()),
                None => groups.push((group, vec![tool.clone()])),
            }
        }

        groups.sort_by(|(a, _), (b, _)| {
            if a == UNGROUPED {
                std::cmp::Ordering::Greater
            } else if b == UNGROUPED {
                std::cmp::Ordering::Less
            } else {
                a.cmp(b)
            }
        });
        groups
    }

    async fn persist(&self) {
        if let Err(e) = self.flush().await {
            warn!("tool-server persist failed, in-memory copy remains authoritative: {e}");
        }
    }

    /// Write server configs and the active pointer to durable storage.
    pub async fn flush(&self) -> Result<(), nexus_common::StorageError> {
        let value = serde_json::to_value(&self.servers)
            .map_err(|e| nexus_common::StorageError::Serialize(e.to_string()))?;
        self.storage.set(keys::TOOL_SERVERS, value).await?;
        self.storage
            .set(
                keys::ACTIVE_TOOL_SERVER,
                serde_json::json!(self.active_server),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn empty_registry() -> ToolRegistry {
        ToolRegistry::load(Arc::new(MemoryStore::new())).await
    }

    fn server(id: &str, url: &str) -> ToolServerConfig {
        ToolServerConfig {
            id: id.into(),
            name: "test".into(),
            transport: Transport::Sse,
            url: url.into(),
            enabled: true,
            tool_mode: ToolMode::All,
            enabled_tools: Default::default(),
        }
    }

    fn tools(names: &[&str]) -> Vec<ToolDescriptor> {
        names.iter().map(|n| ToolDescriptor::named(*n)).collect()
    }

    #[tokio::test]
    async fn fresh_registry_seeds_one_default_server() {
        let registry = empty_registry().await;
        assert_eq!(registry.servers().len(), 1);
        assert_eq!(registry.servers()[0].name, DEFAULT_SERVER_NAME);
        assert!(registry.active_server().is_some());
    }

    #[tokio::test]
    async fn selected_mode_filters_advertised_tools() {
        let mut registry = empty_registry().await;
        let mut config = server("s1", "http://h/sse");
        config.tool_mode = ToolMode::Selected;
        config.enabled_tools.insert("a".into());
        registry.upsert_server(config).await;
        registry.set_tool_list("s1", Transport::Sse, "http://h/sse", tools(&["a", "b"]));

        let names: Vec<_> = registry
            .effective_tool_set()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a"]);

        // Switching to All keeps enabled_tools but exposes everything.
        let mut config = registry.get_server("s1").unwrap().clone();
        config.tool_mode = ToolMode::All;
        registry.upsert_server(config).await;

        let names: Vec<_> = registry
            .effective_tool_set()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.get_server("s1").unwrap().enabled_tools.contains("a"));
    }

    #[tokio::test]
    async fn selected_name_no_longer_advertised_is_dropped() {
        let mut registry = empty_registry().await;
        let mut config = server("s1", "http://h/sse");
        config.tool_mode = ToolMode::Selected;
        config.enabled_tools.insert("gone".into());
        config.enabled_tools.insert("b".into());
        registry.upsert_server(config).await;
        registry.set_tool_list("s1", Transport::Sse, "http://h/sse", tools(&["a", "b"]));

        let names: Vec<_> = registry
            .effective_tool_set()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[tokio::test]
    async fn url_edit_invalidates_cache() {
        let mut registry = empty_registry().await;
        registry.upsert_server(server("s1", "http://old/sse")).await;
        registry.set_tool_list("s1", Transport::Sse, "http://old/sse", tools(&["a"]));
        assert_eq!(registry.effective_tool_set().len(), 1);

        registry.upsert_server(server("s1", "http://new/sse")).await;
        assert!(registry.cached_tools("s1").is_none());
        assert!(registry.effective_tool_set().is_empty());

        // A fresh list against the new endpoint restores exposure.
        registry.set_tool_list("s1", Transport::Sse, "http://new/sse", tools(&["a"]));
        assert_eq!(registry.effective_tool_set().len(), 1);
    }

    #[tokio::test]
    async fn disabled_server_contributes_nothing() {
        let mut registry = empty_registry().await;
        let mut config = server("s1", "http://h/sse");
        config.enabled = false;
        registry.upsert_server(config).await;
        registry.set_tool_list("s1", Transport::Sse, "http://h/sse", tools(&["a"]));
        assert!(registry.effective_tool_set().is_empty());
    }

    #[tokio::test]
    async fn enable_all_and_disable_all_scope_to_one_server() {
        let mut registry = empty_registry().await;
        registry.upsert_server(server("s1", "http://a/sse")).await;
        registry.upsert_server(server("s2", "http://b/sse")).await;
        registry.set_tool_list("s1", Transport::Sse, "http://a/sse", tools(&["x", "y"]));
        registry.set_tool_list("s2", Transport::Sse, "http://b/sse", tools(&["z"]));

        registry.enable_all("s1").await;
        let s1 = registry.get_server("s1").unwrap();
        assert_eq!(s1.tool_mode, ToolMode::Selected);
        assert_eq!(s1.enabled_tools.len(), 2);
        // Other server untouched.
        assert_eq!(registry.get_server("s2").unwrap().tool_mode, ToolMode::All);

        registry.disable_all("s1").await;
        let s1 = registry.get_server("s1").unwrap();
        assert_eq!(s1.tool_mode, ToolMode::Selected);
        assert!(s1.enabled_tools.is_empty());
    }

    #[tokio::test]
    async fn removing_last_server_reseeds_disabled_default() {
        let mut registry = empty_registry().await;
        let only = registry.servers()[0].id.clone();
        registry.remove_server(&only).await;

        assert_eq!(registry.servers().len(), 1);
        assert_ne!(registry.servers()[0].id, only);
        assert!(!registry.servers()[0].enabled);
        assert_eq!(registry.active_server(), Some(registry.servers()[0].id.as_str()));
    }

    #[tokio::test]
    async fn grouping_tolerates_separator_less_names() {
        let mut registry = empty_registry().await;
        registry.upsert_server(server("s1", "http://h/sse")).await;
        registry.set_tool_list(
            "s1",
            Transport::Sse,
            "http://h/sse",
            tools(&["fs.read", "fs.write", "ping", "web.fetch", ".weird"]),
        );

        let groups = registry.grouped("s1");
        let names: Vec<_> = groups.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["fs", "web", UNGROUPED]);
        assert_eq!(groups[0].1.len(), 2);
        // "ping" and ".weird" both land in the ungrouped bucket.
        assert_eq!(groups[2].1.len(), 2);
    }

    #[tokio::test]
    async fn configs_persist_and_reload_without_caches() {
        let storage: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut registry = ToolRegistry::load(Arc::clone(&storage)).await;
        registry.upsert_server(server("s1", "http://h/sse")).await;
        registry.set_active("s1").await;
        registry.set_tool_list("s1", Transport::Sse, "http://h/sse", tools(&["a"]));

        let reloaded = ToolRegistry::load(storage).await;
        assert!(reloaded.get_server("s1").is_some());
        assert_eq!(reloaded.active_server(), Some("s1"));
        // Tool caches are process-lifetime only.
        assert!(reloaded.cached_tools("s1").is_none());
    }
}
