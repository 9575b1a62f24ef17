// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service registry: the call graph learned from gRPC request logs.
//!
//! Nodes form a four-level tree (gate → service → gRPC service → method) backed
//! by five tables. Edges are `(caller, called)` method pairs, materialized into a
//! `calls` and a `called_by` view on every method during [`ServiceRegistry::reload`].
//!
//! Readers work on an immutable [`ServiceTree`] snapshot. Writers serialize on one
//! lock around "write rows, then rebuild and swap the snapshot", so readers never
//! see a half-built tree.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use khaleesi_core::error::Result;
use khaleesi_proto::common_proto::GrpcCaller;
use khaleesi_proto::sawmill_proto::{CallData, ServiceCallData};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db;

/// Full naming coordinate of a gRPC method.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodKey {
    /// Gate.
    pub gate: String,
    /// Service within the gate.
    pub service: String,
    /// gRPC service within the service.
    pub grpc_service: String,
    /// Method within the gRPC service.
    pub grpc_method: String,
}

impl MethodKey {
    /// The coordinate of `caller`, or `None` if any part is empty.
    pub fn from_caller(caller: &GrpcCaller) -> Option<Self> {
        let parts = [
            &caller.khaleesi_gate,
            &caller.khaleesi_service,
            &caller.grpc_service,
            &caller.grpc_method,
        ];
        if parts.iter().any(|part| part.is_empty()) {
            return None;
        }
        Some(Self {
            gate: caller.khaleesi_gate.clone(),
            service: caller.khaleesi_service.clone(),
            grpc_service: caller.grpc_service.clone(),
            grpc_method: caller.grpc_method.clone(),
        })
    }

    /// Caller identity without request or pod.
    pub fn to_caller(&self) -> GrpcCaller {
        GrpcCaller {
            request_id: String::new(),
            khaleesi_gate: self.gate.clone(),
            khaleesi_service: self.service.clone(),
            grpc_service: self.grpc_service.clone(),
            grpc_method: self.grpc_method.clone(),
            pod_id: String::new(),
        }
    }
}

impl std::fmt::Display for MethodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.gate, self.service, self.grpc_service, self.grpc_method
        )
    }
}

/// A method and its edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodNode {
    /// Method row id.
    pub id: i64,
    /// Methods this method calls.
    pub calls: BTreeSet<MethodKey>,
    /// Methods calling this method.
    pub called_by: BTreeSet<MethodKey>,
}

type GrpcServiceNode = BTreeMap<String, MethodNode>;
type ServiceNode = BTreeMap<String, GrpcServiceNode>;
type GateNode = BTreeMap<String, ServiceNode>;

/// Immutable snapshot of the call graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTree {
    gates: BTreeMap<String, GateNode>,
}

impl ServiceTree {
    /// The method at `key`.
    pub fn method(&self, key: &MethodKey) -> Option<&MethodNode> {
        self.gates
            .get(&key.gate)?
            .get(&key.service)?
            .get(&key.grpc_service)?
            .get(&key.grpc_method)
    }

    fn method_mut(&mut self, key: &MethodKey) -> &mut MethodNode {
        self.gates
            .entry(key.gate.clone())
            .or_default()
            .entry(key.service.clone())
            .or_default()
            .entry(key.grpc_service.clone())
            .or_default()
            .entry(key.grpc_method.clone())
            .or_default()
    }

    /// Whether the method at `key` exists.
    pub fn contains(&self, key: &MethodKey) -> bool {
        self.method(key).is_some()
    }

    /// Every `(gate, service)` pair.
    pub fn services(&self) -> Vec<(String, String)> {
        self.gates
            .iter()
            .flat_map(|(gate, services)| {
                services
                    .keys()
                    .map(move |service| (gate.clone(), service.clone()))
            })
            .collect()
    }

    /// Every method of `(gate, service)` with its node.
    pub fn methods_of(&self, gate: &str, service: &str) -> Vec<(MethodKey, &MethodNode)> {
        let Some(grpc_services) = self.gates.get(gate).and_then(|services| services.get(service))
        else {
            return Vec::new();
        };
        grpc_services
            .iter()
            .flat_map(|(grpc_service, methods)| {
                methods.iter().map(move |(grpc_method, node)| {
                    (
                        MethodKey {
                            gate: gate.to_string(),
                            service: service.to_string(),
                            grpc_service: grpc_service.clone(),
                            grpc_method: grpc_method.clone(),
                        },
                        node,
                    )
                })
            })
            .collect()
    }

    /// Number of methods.
    pub fn method_count(&self) -> usize {
        self.gates
            .values()
            .flat_map(|services| services.values())
            .flat_map(|grpc_services| grpc_services.values())
            .map(|methods| methods.len())
            .sum()
    }
}

/// The call graph, persisted and cached.
pub struct ServiceRegistry {
    pool: SqlitePool,
    cache: RwLock<Arc<ServiceTree>>,
    write: Mutex<()>,
}

impl ServiceRegistry {
    /// An empty registry over `pool`; call [`reload`](Self::reload) to load it.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: RwLock::new(Arc::new(ServiceTree::default())),
            write: Mutex::new(()),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<ServiceTree> {
        // A poisoned lock still holds a complete snapshot.
        self.cache
            .read()
            .map(|tree| tree.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Make sure the method of `caller` exists. Incomplete callers are ignored.
    pub async fn add_service(&self, caller: &GrpcCaller) -> Result<()> {
        let Some(key) = MethodKey::from_caller(caller) else {
            return Ok(());
        };
        if self.snapshot().contains(&key) {
            return Ok(());
        }

        let _guard = self.write.lock().await;
        if self.snapshot().contains(&key) {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        ensure_method(&mut tx, &key).await?;
        tx.commit().await?;
        debug!(method = %key, "Service registered");
        self.reload_locked().await
    }

    /// Record that `caller` called `called`. Incomplete callers are ignored.
    pub async fn add_call(&self, caller: &GrpcCaller, called: &GrpcCaller) -> Result<()> {
        let (Some(caller), Some(called)) =
            (MethodKey::from_caller(caller), MethodKey::from_caller(called))
        else {
            return Ok(());
        };
        if is_known_call(&self.snapshot(), &caller, &called) {
            return Ok(());
        }

        let _guard = self.write.lock().await;
        let tree = self.snapshot();
        if is_known_call(&tree, &caller, &called) {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let (caller_id, caller_created) = ensure_method(&mut tx, &caller).await?;
        let (called_id, called_created) = ensure_method(&mut tx, &called).await?;
        let is_new = caller_created
            || called_created
            || tree
                .method(&caller)
                .is_none_or(|node| !node.calls.contains(&called));
        if is_new {
            db::get_or_create_call(&mut tx, caller_id, called_id).await?;
        }
        tx.commit().await?;

        if is_new {
            debug!(%caller, %called, "Call registered");
            self.reload_locked().await?;
        }
        Ok(())
    }

    /// Rebuild the cache from the database and swap it in.
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.write.lock().await;
        self.reload_locked().await
    }

    async fn reload_locked(&self) -> Result<()> {
        let methods = db::load_methods(&self.pool).await?;
        let calls = db::load_calls(&self.pool).await?;

        let mut tree = ServiceTree::default();
        let mut keys = HashMap::with_capacity(methods.len());
        for method in methods {
            let key = MethodKey {
                gate: method.gate,
                service: method.service,
                grpc_service: method.grpc_service,
                grpc_method: method.grpc_method,
            };
            tree.method_mut(&key).id = method.id;
            keys.insert(method.id, key);
        }
        for call in &calls {
            let (Some(caller), Some(called)) = (keys.get(&call.caller_id), keys.get(&call.called_id))
            else {
                continue;
            };
            tree.method_mut(caller).calls.insert(called.clone());
            tree.method_mut(called).called_by.insert(caller.clone());
        }

        info!(
            methods = keys.len(),
            calls = calls.len(),
            "Service registry reloaded"
        );
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cache = Arc::new(tree);
        Ok(())
    }

    /// Call data of every method `owner`'s service exposes.
    pub async fn get_call_data(&self, owner: &GrpcCaller) -> Result<ServiceCallData> {
        self.add_service(owner).await?;
        let tree = self.snapshot();
        let call_list = tree
            .methods_of(&owner.khaleesi_gate, &owner.khaleesi_service)
            .into_iter()
            .map(|(key, node)| CallData {
                call: Some(key.to_caller()),
                calls: node.calls.iter().map(MethodKey::to_caller).collect(),
                called_by: node.called_by.iter().map(MethodKey::to_caller).collect(),
            })
            .collect();
        Ok(ServiceCallData { call_list })
    }
}

fn is_known_call(tree: &ServiceTree, caller: &MethodKey, called: &MethodKey) -> bool {
    tree.contains(called)
        && tree
            .method(caller)
            .is_some_and(|node| node.calls.contains(called))
}

/// Create whatever part of the method's path is missing.
async fn ensure_method(conn: &mut SqliteConnection, key: &MethodKey) -> Result<(i64, bool)> {
    let (gate_id, gate_created) = db::get_or_create_gate(conn, &key.gate).await?;
    let (service_id, service_created) =
        db::get_or_create_service(conn, gate_id, &key.service).await?;
    let (grpc_service_id, grpc_service_created) =
        db::get_or_create_grpc_service(conn, service_id, &key.grpc_service).await?;
    let (method_id, method_created) =
        db::get_or_create_grpc_method(conn, grpc_service_id, &key.grpc_method).await?;
    Ok((
        method_id,
        gate_created || service_created || grpc_service_created || method_created,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn registry() -> ServiceRegistry {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::run(&pool).await.unwrap();
        ServiceRegistry::new(pool)
    }

    fn caller(gate: &str, service: &str, grpc_service: &str, grpc_method: &str) -> GrpcCaller {
        GrpcCaller {
            request_id: "r1".to_string(),
            khaleesi_gate: gate.to_string(),
            khaleesi_service: service.to_string(),
            grpc_service: grpc_service.to_string(),
            grpc_method: grpc_method.to_string(),
            pod_id: "pod".to_string(),
        }
    }

    #[tokio::test]
    async fn test_incomplete_callers_are_ignored() {
        let registry = registry().await;

        registry.add_service(&GrpcCaller::default()).await.unwrap();
        registry
            .add_call(&GrpcCaller::default(), &caller("core", "sawmill", "Lumberjack", "LogEvent"))
            .await
            .unwrap();

        assert_eq!(registry.snapshot().method_count(), 0);
    }

    #[tokio::test]
    async fn test_add_call_is_idempotent() {
        let registry = registry().await;
        let front = caller("gw", "front", "Front", "Hit");
        let sink = caller("core", "sawmill", "Lumberjack", "LogEvent");

        registry.add_call(&front, &sink).await.unwrap();
        let first = registry.snapshot();
        registry.add_call(&front, &sink).await.unwrap();
        registry.add_service(&front).await.unwrap();

        assert_eq!(*registry.snapshot(), *first);
        let front_key = MethodKey::from_caller(&front).unwrap();
        let sink_key = MethodKey::from_caller(&sink).unwrap();
        assert!(first.method(&front_key).unwrap().calls.contains(&sink_key));
        assert!(first.method(&sink_key).unwrap().called_by.contains(&front_key));
    }

    #[tokio::test]
    async fn test_call_data_lists_both_directions() {
        let registry = registry().await;
        let front = caller("gw", "front", "Front", "Hit");
        let sink = caller("core", "sawmill", "Lumberjack", "LogEvent");
        let other = caller("core", "sawmill", "Sawyer", "GetEvents");
        registry.add_call(&front, &sink).await.unwrap();

        let call_data = registry.get_call_data(&other).await.unwrap();

        assert_eq!(call_data.call_list.len(), 2);
        let log_event = call_data
            .call_list
            .iter()
            .find(|entry| entry.call.as_ref().unwrap().grpc_method == "LogEvent")
            .unwrap();
        assert!(log_event.calls.is_empty());
        assert_eq!(log_event.called_by[0].khaleesi_service, "front");
        assert_eq!(log_event.called_by[0].request_id, "");
    }
}
