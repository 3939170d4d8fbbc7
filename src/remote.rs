// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote connection and protocol version handling.
//!
//! Every session and admin operation starts here: open the remote through
//! the host, then make sure the remote speaks a protocol version this engine
//! understands.
//!
//! # Version Check
//!
//! ```text
//! remote version doc      result
//! ------------------      ------------------------------------------
//! absent                  create with VER, pass
//! wrong type / garbage    fail
//! version < VER           migrate, bump to VER, pass
//! version == VER          pass
//! version > VER           fail (remote written by a newer engine)
//! ```

use crate::config::RemoteDbSettings;
use crate::error::{ReplicationError, Result};
use crate::model::{NodeInfo, VersionInfo, NODEINFO_DOCID, VERSIONING_DOCID};
use crate::store::{put_typed, ConnectRequest, Database, RemoteConnection, ReplicatorEnv};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Build the connection request for `settings`.
pub fn connect_request(
    settings: &RemoteDbSettings,
    is_mobile: bool,
    perform_setup: bool,
    skip_info: bool,
) -> ConnectRequest {
    ConnectRequest {
        uri: settings.remote_uri(),
        username: settings.couchdb_user.clone(),
        password: settings.couchdb_password.clone(),
        disable_request_uri: settings.disable_request_uri || is_mobile,
        passphrase: settings.encrypt.then(|| settings.passphrase.clone()),
        use_dynamic_iteration_count: settings.use_dynamic_iteration_count,
        perform_setup,
        skip_info,
        enable_compression: settings.enable_compression,
    }
}

/// Open the remote described by `settings`.
///
/// Refuses an empty passphrase while encryption is on unless explicitly
/// permitted.
pub async fn connect_remote_with_setting<E: ReplicatorEnv + ?Sized>(
    env: &E,
    settings: &RemoteDbSettings,
    perform_setup: bool,
    skip_info: bool,
) -> Result<RemoteConnection> {
    if settings.encrypt && settings.passphrase.is_empty() && !settings.permit_empty_passphrase {
        return Err(ReplicationError::EmptyPassphrase);
    }
    let request = connect_request(settings, env.is_mobile(), perform_setup, skip_info);
    let uri = request.uri.clone();
    env.connect_remote(request)
        .await
        .map_err(|e| ReplicationError::Connection {
            uri,
            message: e.to_string(),
        })
}

/// Check (and if needed, bump) the remote protocol version.
///
/// Returns `Ok(false)` when the remote is newer than `barrier` or its
/// version document is unreadable.
pub async fn check_remote_version(db: &dyn Database, barrier: u32) -> Result<bool> {
    let doc = match db.get(VERSIONING_DOCID).await {
        Ok(doc) => doc,
        Err(e) if e.is_not_found() => {
            put_typed(db, &VersionInfo::new(barrier))
                .await
                .map_err(|e| ReplicationError::store("create version info", e))?;
            debug!(version = barrier, "Remote version initialized");
            return Ok(true);
        }
        Err(e) => return Err(ReplicationError::store("get version info", e)),
    };

    if doc.get("type").and_then(Value::as_str) != Some("versioninfo") {
        return Ok(false);
    }
    let Ok(mut version_info) = serde_json::from_value::<VersionInfo>(doc) else {
        return Ok(false);
    };

    let version = version_info.version;
    if version < barrier {
        migrate(version, barrier);
        version_info.version = barrier;
        put_typed(db, &version_info)
            .await
            .map_err(|e| ReplicationError::store("update version info", e))?;
        return Ok(true);
    }
    Ok(version == barrier)
}

fn migrate(from: u32, to: u32) {
    info!(from, to, "Database updated from {} to {}", from, to);
}

/// Read this replica's node id, creating it on first use.
///
/// A record that cannot be parsed is replaced. Store failures are returned
/// as they are: a replaced id would lose the node's place in
/// `accepted_nodes`.
pub async fn ensure_node_id(local: &dyn Database) -> Result<String> {
    let replaced_rev = match local.get(NODEINFO_DOCID).await {
        Ok(doc) => match serde_json::from_value::<NodeInfo>(doc.clone()) {
            Ok(node) if node.doc_type == "nodeinfo" && !node.nodeid.is_empty() => return Ok(node.nodeid),
            Ok(_) | Err(_) => {
                warn!("Node info unreadable, generating a new node id");
                doc.get("_rev").and_then(Value::as_str).map(str::to_string)
            }
        },
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(ReplicationError::store("read node info", e)),
    };

    let node = NodeInfo {
        rev: replaced_rev,
        ..NodeInfo::generate()
    };
    put_typed(local, &node)
        .await
        .map_err(|e| ReplicationError::store("create node info", e))?;
    info!(node_id = %node.nodeid, "Node id initialized");
    Ok(node.nodeid)
}
