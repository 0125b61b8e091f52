//! The aggregated capability index.
//!
//! The registry maps globally unique exposed names to the upstream that
//! owns each tool, resource, and prompt. A rebuild walks the connected
//! sessions in configuration order, computes namespaced exposed names,
//! resolves collisions, and then publishes the three maps in one atomic
//! swap. Readers hold a snapshot for the duration of a call and never
//! observe a half-built index.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use serde::Serialize;

use crate::manager::ConnectedUpstream;
use crate::model::{PromptArgument, PromptDef, ResourceDef, ToolDef};

/// One aggregated capability, generic over its kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedEntry<P> {
    /// Globally unique name seen by the downstream client.
    pub exposed_name: String,
    /// Name as known to the owning upstream.
    pub original_name: String,
    /// Id of the owning upstream.
    pub upstream_id: String,
    /// Namespace the exposed name was derived with, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Description supplied by the upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub payload: P,
}

/// Tool-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolPayload {
    /// JSON schema of the tool arguments.
    pub input_schema: serde_json::Value,
}

/// Resource-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourcePayload {
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MIME type of the contents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Prompt-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptPayload {
    /// Declared prompt arguments.
    pub arguments: Vec<PromptArgument>,
}

/// An aggregated tool.
pub type AggregatedTool = AggregatedEntry<ToolPayload>;
/// An aggregated resource.
pub type AggregatedResource = AggregatedEntry<ResourcePayload>;
/// An aggregated prompt.
pub type AggregatedPrompt = AggregatedEntry<PromptPayload>;

/// Per-kind switches for collision renaming.
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolution {
    /// Rename colliding tools instead of dropping them.
    pub tools: bool,
    /// Rename colliding resources instead of dropping them.
    pub resources: bool,
    /// Rename colliding prompts instead of dropping them.
    pub prompts: bool,
}

impl Default for ConflictResolution {
    fn default() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
        }
    }
}

/// An immutable published index. Insertion order is configuration
/// order, so listings are stable across rebuilds.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    /// Tools by exposed name.
    pub tools: IndexMap<String, Arc<AggregatedTool>>,
    /// Resources by exposed URI.
    pub resources: IndexMap<String, Arc<AggregatedResource>>,
    /// Prompts by exposed name.
    pub prompts: IndexMap<String, Arc<AggregatedPrompt>>,
}

/// Aggregate counts for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Total exposed tools.
    pub tools: usize,
    /// Total exposed resources.
    pub resources: usize,
    /// Total exposed prompts.
    pub prompts: usize,
    /// Tool counts per upstream id.
    pub tools_by_upstream: HashMap<String, usize>,
}

/// The capability registry.
///
/// `refresh` is the only mutation; it builds the next snapshot off to
/// the side and swaps it in atomically. Reads are lock-free.
#[derive(Debug)]
pub struct CapabilityRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    conflicts: ConflictResolution,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(conflicts: ConflictResolution) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            conflicts,
        }
    }

    /// The currently published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Looks up a tool by exposed name.
    #[must_use]
    pub fn find_tool(&self, exposed_name: &str) -> Option<Arc<AggregatedTool>> {
        self.snapshot.load().tools.get(exposed_name).cloned()
    }

    /// Looks up a resource by exposed URI.
    #[must_use]
    pub fn find_resource(&self, exposed_uri: &str) -> Option<Arc<AggregatedResource>> {
        self.snapshot.load().resources.get(exposed_uri).cloned()
    }

    /// Looks up a prompt by exposed name.
    #[must_use]
    pub fn find_prompt(&self, exposed_name: &str) -> Option<Arc<AggregatedPrompt>> {
        self.snapshot.load().prompts.get(exposed_name).cloned()
    }

    /// Counts for the current snapshot.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let snapshot = self.snapshot.load();
        let mut tools_by_upstream: HashMap<String, usize> = HashMap::new();
        for entry in snapshot.tools.values() {
            *tools_by_upstream.entry(entry.upstream_id.clone()).or_default() += 1;
        }
        RegistryStats {
            tools: snapshot.tools.len(),
            resources: snapshot.resources.len(),
            prompts: snapshot.prompts.len(),
            tools_by_upstream,
        }
    }

    /// Rebuilds the index from the given connected sessions and
    /// publishes the result atomically.
    ///
    /// Sessions are scanned in the order given (configuration order),
    /// which makes collision handling deterministic. A session whose
    /// `list*` call fails contributes nothing for that kind but still
    /// contributes the others.
    pub async fn refresh(&self, upstreams: &[ConnectedUpstream]) -> RegistryStats {
        let mut next = RegistrySnapshot::default();

        for upstream in upstreams {
            if upstream.capabilities.has_tools {
                match upstream.session.list_tools().await {
                    Ok(tools) => self.index_tools(&mut next, upstream, tools),
                    Err(err) => {
                        tracing::warn!(id = %upstream.id(), error = %err, "tools/list failed during refresh");
                    }
                }
            }
        }
        for upstream in upstreams {
            if upstream.capabilities.has_resources {
                match upstream.session.list_resources().await {
                    Ok(resources) => self.index_resources(&mut next, upstream, resources),
                    Err(err) => {
                        tracing::warn!(id = %upstream.id(), error = %err, "resources/list failed during refresh");
                    }
                }
            }
        }
        for upstream in upstreams {
            if upstream.capabilities.has_prompts {
                match upstream.session.list_prompts().await {
                    Ok(prompts) => self.index_prompts(&mut next, upstream, prompts),
                    Err(err) => {
                        tracing::warn!(id = %upstream.id(), error = %err, "prompts/list failed during refresh");
                    }
                }
            }
        }

        self.snapshot.store(Arc::new(next));
        let stats = self.stats();
        tracing::info!(
            tools = stats.tools,
            resources = stats.resources,
            prompts = stats.prompts,
            "registry refreshed"
        );
        stats
    }

    fn index_tools(
        &self,
        next: &mut RegistrySnapshot,
        upstream: &ConnectedUpstream,
        tools: Vec<ToolDef>,
    ) {
        for tool in tools {
            let base = prefixed_name(upstream.namespace(), &tool.name);
            let Some(exposed) =
                unique_name(&next.tools, base, upstream.id(), self.conflicts.tools)
            else {
                continue;
            };
            next.tools.insert(
                exposed.clone(),
                Arc::new(AggregatedEntry {
                    exposed_name: exposed,
                    original_name: tool.name,
                    upstream_id: upstream.id().to_owned(),
                    namespace: upstream.namespace().map(ToOwned::to_owned),
                    description: tool.description,
                    payload: ToolPayload {
                        input_schema: tool.input_schema,
                    },
                }),
            );
        }
    }

    fn index_resources(
        &self,
        next: &mut RegistrySnapshot,
        upstream: &ConnectedUpstream,
        resources: Vec<ResourceDef>,
    ) {
        for resource in resources {
            let base = namespaced_uri(upstream.namespace(), &resource.uri);
            let Some(exposed) =
                unique_name(&next.resources, base, upstream.id(), self.conflicts.resources)
            else {
                continue;
            };
            next.resources.insert(
                exposed.clone(),
                Arc::new(AggregatedEntry {
                    exposed_name: exposed,
                    original_name: resource.uri,
                    upstream_id: upstream.id().to_owned(),
                    namespace: upstream.namespace().map(ToOwned::to_owned),
                    description: resource.description,
                    payload: ResourcePayload {
                        name: resource.name,
                        mime_type: resource.mime_type,
                    },
                }),
            );
        }
    }

    fn index_prompts(
        &self,
        next: &mut RegistrySnapshot,
        upstream: &ConnectedUpstream,
        prompts: Vec<PromptDef>,
    ) {
        for prompt in prompts {
            let base = prefixed_name(upstream.namespace(), &prompt.name);
            let Some(exposed) =
                unique_name(&next.prompts, base, upstream.id(), self.conflicts.prompts)
            else {
                continue;
            };
            next.prompts.insert(
                exposed.clone(),
                Arc::new(AggregatedEntry {
                    exposed_name: exposed,
                    original_name: prompt.name,
                    upstream_id: upstream.id().to_owned(),
                    namespace: upstream.namespace().map(ToOwned::to_owned),
                    description: prompt.description,
                    payload: PromptPayload {
                        arguments: prompt.arguments,
                    },
                }),
            );
        }
    }
}

/// `namespace ? "ns:name" : name` — exposed names for tools and prompts.
fn prefixed_name(namespace: Option<&str>, original: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}:{original}"),
        None => original.to_owned(),
    }
}

/// Exposed URIs for resources.
///
/// A URI with a scheme gets the namespace inserted as the leading path
/// segment (`file:///tmp/x` → `file://ns/tmp/x` style); anything else
/// gets the plain `ns:` prefix. No namespace leaves the URI unchanged.
fn namespaced_uri(namespace: Option<&str>, uri: &str) -> String {
    let Some(ns) = namespace else {
        return uri.to_owned();
    };
    match uri.split_once("://") {
        Some((scheme, rest)) if is_uri_scheme(scheme) => {
            format!("{scheme}://{ns}/{rest}")
        }
        _ => format!("{ns}:{uri}"),
    }
}

fn is_uri_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
}

/// Picks a unique exposed name for a colliding entry.
///
/// With renaming enabled the later entry gets `@<upstream-id>`, then
/// ordinal suffixes (`@id#2`, `@id#3`, …) until unique. Disabled, the
/// first entry wins and the later one is dropped with a warning.
fn unique_name<P>(
    existing: &IndexMap<String, Arc<AggregatedEntry<P>>>,
    base: String,
    upstream_id: &str,
    rename: bool,
) -> Option<String> {
    if !existing.contains_key(&base) {
        return Some(base);
    }
    if !rename {
        tracing::warn!(
            name = %base,
            upstream = %upstream_id,
            "dropping duplicate capability (conflict resolution disabled)"
        );
        return None;
    }
    let mut candidate = format!("{base}@{upstream_id}");
    let mut ordinal = 2;
    while existing.contains_key(&candidate) {
        candidate = format!("{base}@{upstream_id}#{ordinal}");
        ordinal += 1;
    }
    Some(candidate)
}
