//! Federation tree-walker.
//!
//! A background task drains the `newsubordinate` queue and runs a
//! breadth-first discovery from each entry: fetch and self-verify the
//! entity, record it, classify it, then follow `federation_list_endpoint`
//! downwards and `authority_hints` upwards. Per-node failures are logged
//! and skipped; rediscovery of a visited node is a loop warning, never a
//! recursion. The walker only ever writes cache projections.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cache::EntityKind;
use crate::error::Result;
use crate::server::AppState;

/// How long the drain loop sleeps when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(5);

/// Drain the walk queue forever. Spawned once at startup.
pub async fn run(state: Arc<AppState>) {
    loop {
        match state.cache.pop_walk().await {
            Ok(Some(entityid)) => {
                tracing::info!(entity = %entityid, "tree walk starting");
                match walk(&state, &entityid).await {
                    Ok(visited) => {
                        tracing::info!(entity = %entityid, visited = visited.len(), "tree walk finished");
                    }
                    Err(e) => {
                        tracing::error!(entity = %entityid, "tree walk failed: {e}");
                    }
                }
            }
            Ok(None) => tokio::time::sleep(IDLE_POLL).await,
            Err(e) => {
                tracing::warn!("walk queue unavailable: {e}");
                tokio::time::sleep(IDLE_POLL).await;
            }
        }
    }
}

/// Breadth-first discovery from `root`. Returns the set of entities that
/// were successfully visited.
pub async fn walk(state: &AppState, root: &str) -> Result<HashSet<String>> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::from([root.to_string()]);

    while let Some(entityid) = queue.pop_front() {
        if visited.contains(&entityid) {
            tracing::warn!(entity = %entityid, "loop detected: entity already visited");
            continue;
        }
        let entity = match state.fetcher.fetch_self_verified(&entityid).await {
            Ok(entity) => entity,
            Err(e) => {
                tracing::error!(entity = %entityid, "failed to validate entity: {e}");
                continue;
            }
        };
        visited.insert(entityid.clone());
        state.cache.record_entity(&entityid, &entity.raw).await?;

        // Upwards: pull our subordinate statements from the authorities.
        if let Some(hints) = entity.claims.get("authority_hints").and_then(Value::as_array) {
            let hints: Vec<String> = hints
                .iter()
                .filter_map(|h| h.as_str().map(str::to_string))
                .collect();
            fetch_subordinate_statements(state, &hints, &entityid).await;
        }

        // Downwards: classify, and follow list endpoints of authorities.
        let metadata = entity.claims.get("metadata").cloned().unwrap_or_default();
        let kind = EntityKind::classify(&metadata);
        state.cache.add_entity_kind(kind, &entityid).await?;
        if kind != EntityKind::Authority {
            continue;
        }

        let list_endpoint = metadata
            .get("federation_entity")
            .and_then(|fe| fe.get("federation_list_endpoint"))
            .and_then(Value::as_str);
        let Some(list_endpoint) = list_endpoint else {
            tracing::warn!(entity = %entityid, "authority has no list endpoint");
            continue;
        };
        match state.fetcher.get_json(list_endpoint).await {
            Ok(Value::Array(subordinates)) => {
                for subordinate in subordinates.iter().filter_map(Value::as_str) {
                    if visited.contains(subordinate) {
                        tracing::warn!(entity = %subordinate, "loop detected: subordinate already visited");
                        continue;
                    }
                    tracing::info!(entity = %subordinate, "discovered subordinate");
                    queue.push_back(subordinate.to_string());
                }
            }
            Ok(_) => tracing::warn!(entity = %entityid, "list endpoint did not return an array"),
            Err(e) => tracing::warn!(entity = %entityid, "list endpoint fetch failed: {e}"),
        }
    }
    Ok(visited)
}

/// For each authority hint, locate its fetch endpoint and pull the
/// subordinate statement for `entityid`, caching it by fetch URL.
/// Failures are per-hint: logged and skipped.
async fn fetch_subordinate_statements(state: &AppState, hints: &[String], entityid: &str) {
    for hint in hints {
        let authority = match state.fetcher.fetch_self_verified(hint).await {
            Ok(entity) => entity,
            Err(e) => {
                tracing::error!(entity = %entityid, authority = %hint, "failed to validate authority: {e}");
                continue;
            }
        };
        let fetch_endpoint = authority
            .claims
            .get("metadata")
            .and_then(|m| m.get("federation_entity"))
            .and_then(|fe| fe.get("federation_fetch_endpoint"))
            .and_then(Value::as_str);
        let Some(fetch_endpoint) = fetch_endpoint else {
            continue;
        };
        let url = format!("{fetch_endpoint}?sub={entityid}");
        tracing::info!(url = %url, "fetching subordinate statement");
        match state.fetcher.get_text(&url).await {
            Ok(statement) if !statement.is_empty() => {
                if let Err(e) = state.cache.record_subordinate_query(&url, &statement).await {
                    tracing::warn!(url = %url, "could not cache subordinate statement: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(url = %url, "subordinate statement fetch failed: {e}");
            }
        }
    }
}
