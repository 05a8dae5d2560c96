//! Role startup and lifecycle.
//!
//! Each role builds its component from the shared config, runs until a
//! shutdown signal arrives, then stops it cleanly.

use std::sync::Arc;

use tracing::info;

use meridian_dispatcher::{Dispatcher, DispatcherConfig};
use meridian_entity::{AttrVisibility, EntityTypeDef, EntityTypeRegistry, ServerId};
use meridian_gate::{GateConfig, GateNode};
use meridian_proto::{GateId, Value};
use meridian_server::{ServerConfig, ServerNode};
use meridian_storage::{KvStore, MemoryBackend};

use crate::cli::Role;
use crate::config::AppConfig;
use crate::signals;

/// Runs the selected role until shutdown.
pub async fn run(role: Role, config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    match role {
        Role::Dispatcher => run_dispatcher(config).await,
        Role::Server => run_server(config).await,
        Role::Gate => run_gate(config).await,
    }
}

async fn run_dispatcher(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let handle = Dispatcher::start(DispatcherConfig {
        bind_address: config.dispatcher.address.parse()?,
    })
    .await?;
    info!(address = %handle.local_addr(), "dispatcher running");

    signals::wait_for_shutdown().await;
    handle.stop().await;
    Ok(())
}

async fn run_server(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let types = Arc::new(builtin_types());
    let storage = Arc::new(KvStore::open(Arc::new(MemoryBackend::new())).await?);

    let mut server_config = ServerConfig::new(
        ServerId(config.server.id),
        config.dispatcher.address.parse()?,
    );
    server_config.account_entity_type = config.server.account_entity_type.clone();
    server_config.save_interval = config.save_interval();

    let handle = ServerNode::start(server_config, types, Some(storage));
    info!(server = config.server.id, "entity server running");

    signals::wait_for_shutdown().await;
    handle.stop().await;
    Ok(())
}

async fn run_gate(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let handle = GateNode::start(GateConfig {
        gate_id: GateId(config.gate.id),
        dispatcher_addr: config.dispatcher.address.parse()?,
        client_bind_address: config.gate.client_bind_address.parse()?,
    })
    .await?;
    info!(clients = %handle.client_addr(), "gate running");

    signals::wait_for_shutdown().await;
    handle.stop().await;
    Ok(())
}

// The baseline type set every server ships with. Game content registers its
// own types on top when embedding the server crate directly.
fn builtin_types() -> EntityTypeRegistry {
    let types = EntityTypeRegistry::new();
    types.register(
        EntityTypeDef::new("Account")
            .persistent(true)
            .visibility("profile", AttrVisibility::OwnClient)
            .method("Login", |entity, _ctx, args| {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("anonymous")
                    .to_string();
                entity.attrs.set(&[], "profile", Value::Str(name))?;
                Ok(())
            })
            .observe_attr("profile", |_entity, _ctx, _change| {}),
    );
    types
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_types_register_account() {
        let types = builtin_types();
        let account = types.get("Account").expect("account type");
        assert!(account.is_persistent());
        assert!(account.method_named("Login").is_some());
        assert_eq!(
            account.visibility_of("profile"),
            AttrVisibility::OwnClient
        );
    }
}
