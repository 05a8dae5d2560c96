//! Cluster-level behavior: two servers and a dispatcher over real sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use meridian_dispatcher::{Dispatcher, DispatcherConfig};
use meridian_entity::{EntityId, EntityTypeDef, EntityTypeRegistry, ServerId};
use meridian_proto::Value;
use meridian_server::{ServerConfig, ServerHandle, ServerNode};

/// A call trace shared across both servers: (hosting server label, value).
type Trace = Arc<Mutex<Vec<(&'static str, i64)>>>;

fn avatar_types(label: &'static str, trace: Trace, notify: mpsc::UnboundedSender<()>) -> Arc<EntityTypeRegistry> {
    let types = EntityTypeRegistry::new();
    types.register(
        EntityTypeDef::new("Avatar")
            .method("Foo", move |_entity, _ctx, args| {
                if let Some(Value::Int(v)) = args.first() {
                    trace.lock().unwrap().push((label, *v));
                }
                let _ = notify.send(());
                Ok(())
            })
            .method("Enter", |_entity, ctx, args| {
                if let Some(Value::Str(space)) = args.first() {
                    if let Ok(space) = EntityId::parse(space) {
                        ctx.enter_space(space);
                    }
                }
                Ok(())
            }),
    );
    types.register(EntityTypeDef::new("Plains").space_kind(3));
    Arc::new(types)
}

async fn await_hosted(server: &ServerHandle, entity: EntityId, hosted: bool) {
    for _ in 0..200 {
        let entities = server.hosted_entities().await.expect("hosted");
        if entities.iter().any(|(id, _)| *id == entity) == hosted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("entity {entity} hosted={hosted} never became true");
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_routed_through_dispatcher_run_in_order() {
    let dispatcher = Dispatcher::start(DispatcherConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
    })
    .await
    .expect("dispatcher");
    let addr = dispatcher.local_addr();

    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();

    let server_a = ServerNode::start(
        ServerConfig::new(ServerId(1), addr),
        avatar_types("A", Arc::clone(&trace), notify_tx.clone()),
        None,
    );
    let server_b = ServerNode::start(
        ServerConfig::new(ServerId(2), addr),
        avatar_types("B", Arc::clone(&trace), notify_tx),
        None,
    );

    let avatar = server_a.create_entity("Avatar").await.expect("create");
    await_hosted(&server_a, avatar, true).await;
    // Give the registration time to reach the dispatcher.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Submitted through one source (server B's link), executed on A.
    for v in [1i64, 2, 3] {
        server_b
            .call_entity(avatar, "Foo", vec![Value::Int(v)])
            .await
            .expect("call");
    }
    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(10), notify_rx.recv())
            .await
            .expect("call delivered")
            .expect("channel open");
    }

    let observed = trace.lock().unwrap().clone();
    assert_eq!(
        observed,
        vec![("A", 1), ("A", 2), ("A", 3)],
        "execution order equals submission order"
    );

    server_a.stop().await;
    server_b.stop().await;
    dispatcher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn migration_preserves_order_across_servers() {
    let dispatcher = Dispatcher::start(DispatcherConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
    })
    .await
    .expect("dispatcher");
    let addr = dispatcher.local_addr();

    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();

    let server_a = ServerNode::start(
        ServerConfig::new(ServerId(1), addr),
        avatar_types("A", Arc::clone(&trace), notify_tx.clone()),
        None,
    );
    let server_b = ServerNode::start(
        ServerConfig::new(ServerId(2), addr),
        avatar_types("B", Arc::clone(&trace), notify_tx),
        None,
    );

    // The destination space lives on B; the avatar starts on A.
    let space = server_b.create_entity("Plains").await.expect("space");
    let avatar = server_a.create_entity("Avatar").await.expect("avatar");
    await_hosted(&server_b, space, true).await;
    await_hosted(&server_a, avatar, true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Kick off the cross-server enter, then immediately submit a stream of
    // calls through one source. Early ones run on A, the rest are buffered
    // by the dispatcher during the handover and flushed to B.
    server_a
        .call_entity(avatar, "Enter", vec![Value::Str(space.to_string())])
        .await
        .expect("enter");
    const CALLS: i64 = 20;
    for v in 1..=CALLS {
        server_b
            .call_entity(avatar, "Foo", vec![Value::Int(v)])
            .await
            .expect("call");
    }

    for _ in 0..CALLS {
        tokio::time::timeout(Duration::from_secs(30), notify_rx.recv())
            .await
            .expect("call delivered")
            .expect("channel open");
    }
    await_hosted(&server_b, avatar, true).await;
    await_hosted(&server_a, avatar, false).await;

    let observed = trace.lock().unwrap().clone();
    let values: Vec<i64> = observed.iter().map(|(_, v)| *v).collect();
    assert_eq!(
        values,
        (1..=CALLS).collect::<Vec<_>>(),
        "submission order survives the handover"
    );

    // The handler trace is a run at A followed by a run at B: once a call
    // executes on the target, nothing executes on the source again.
    let first_b = observed.iter().position(|(label, _)| *label == "B");
    if let Some(first_b) = first_b {
        assert!(
            observed[first_b..].iter().all(|(label, _)| *label == "B"),
            "no call runs at the source after the handover: {observed:?}"
        );
    }

    server_a.stop().await;
    server_b.stop().await;
    dispatcher.stop().await;
}
