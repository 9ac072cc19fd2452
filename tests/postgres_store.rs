use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use lacquer::transport::{
    Collection, DocumentStore, DocumentWrite, FieldFilter, Fields, SubscriptionOptions,
};
use lacquer::codec::Entity;
use lacquer::live::LiveCollection;
use lacquer::{Client, NewAppointment, NewDesign, OwnerId, Store, SyncConfig, SyncManager};
use serde_json::{Value, json};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use tokio::time::{Duration, timeout};
use uuid::Uuid;

async fn postgres() -> Result<(ContainerAsync<GenericImage>, Store)> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    let store = Store::connect(&url).await?;
    lacquer::testing::migrate_core_schema(store.pool()).await?;
    Ok((container, store))
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[tokio::test]
async fn document_semantics() -> Result<()> {
    let (_container, store) = postgres().await?;
    let docs = store.docs(&OwnerId::new("tech-1"));

    // merge never clobbers unlisted fields
    docs.write(
        Collection::Clients,
        "c1",
        DocumentWrite::set(fields(json!({"name": "Sarah", "designImageNames": ["a"]}))),
    )
    .await?;
    docs.write(
        Collection::Clients,
        "c1",
        DocumentWrite::merge(fields(json!({"name": "Sarah M.", "phone": "555-1234"}))),
    )
    .await?;
    let doc = docs.get(Collection::Clients, "c1").await?.unwrap();
    assert_eq!(
        doc,
        json!({"name": "Sarah M.", "phone": "555-1234", "designImageNames": ["a"]})
    );

    // set replaces
    docs.write(
        Collection::Clients,
        "c1",
        DocumentWrite::set(fields(json!({"name": "Sarah M."}))),
    )
    .await?;
    let doc = docs.get(Collection::Clients, "c1").await?.unwrap();
    assert_eq!(doc, json!({"name": "Sarah M."}));

    // union on a missing field, with duplicates in and across calls
    docs.array_union(
        Collection::Clients,
        "c1",
        "designImageNames",
        vec![json!("x"), json!("y"), json!("x")],
    )
    .await?;
    docs.array_union(Collection::Clients, "c1", "designImageNames", vec![json!("y")])
        .await?;
    let doc = docs.get(Collection::Clients, "c1").await?.unwrap();
    assert_eq!(doc["designImageNames"], json!(["x", "y"]));

    let err = docs
        .array_union(Collection::Clients, "nope", "designImageNames", vec![json!("x")])
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = docs
        .write(
            Collection::Appointments,
            "nope",
            DocumentWrite::update(fields(json!({"service": "GelX"}))),
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(docs.get(Collection::Appointments, "nope").await?.is_none());

    assert!(docs.delete(Collection::Clients, "c1").await?);
    assert!(!docs.delete(Collection::Clients, "c1").await?);
    Ok(())
}

#[tokio::test]
async fn server_timestamps_and_filters() -> Result<()> {
    let (_container, store) = postgres().await?;
    let docs = store.docs(&OwnerId::new("tech-1"));

    for (id, client) in [("a1", json!("c1")), ("a2", Value::Null), ("a3", json!("c2"))] {
        docs.write(
            Collection::Appointments,
            id,
            DocumentWrite::merge(fields(json!({"clientId": client, "createdAt": "bogus"})))
                .server_timestamp("createdAt"),
        )
        .await?;
    }

    let matched = docs
        .fetch(Collection::Appointments, Some(&FieldFilter::eq("clientId", "c1")))
        .await?;
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id, "a1");
    assert!(lacquer::codec::decode_timestamp(&matched[0].fields["createdAt"]).is_some());

    let all = docs.fetch(Collection::Appointments, None).await?;
    let ids: Vec<_> = all.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["a1", "a2", "a3"]);
    Ok(())
}

#[tokio::test]
async fn owners_are_isolated() -> Result<()> {
    let (_container, store) = postgres().await?;
    let alice = store.docs(&OwnerId::new("alice"));
    let bob = store.docs(&OwnerId::new("bob"));

    alice
        .write(
            Collection::Designs,
            "d1",
            DocumentWrite::set(fields(json!({"prompt": "pink hearts"}))),
        )
        .await?;
    assert!(bob.fetch(Collection::Designs, None).await?.is_empty());
    assert!(!bob.delete(Collection::Designs, "d1").await?);
    assert_eq!(alice.fetch(Collection::Designs, None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn subscription_delivers_full_snapshots() -> Result<()> {
    let (_container, store) = postgres().await?;
    let docs = store.docs(&OwnerId::new("tech-1"));

    let mut sub = docs
        .subscribe(
            Collection::Clients,
            None,
            SubscriptionOptions {
                poll_interval: Duration::from_millis(50),
                ..SubscriptionOptions::default()
            },
        )
        .await?;
    let first = timeout(Duration::from_secs(5), sub.snapshots.recv())
        .await?
        .expect("initial snapshot");
    assert!(first.documents.is_empty());

    for id in ["c1", "c2"] {
        docs.write(
            Collection::Clients,
            id,
            DocumentWrite::merge(fields(json!({"name": id}))),
        )
        .await?;
    }

    let full = timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = sub.snapshots.recv().await.expect("feed ended");
            if snapshot.documents.len() == 2 {
                break snapshot;
            }
        }
    })
    .await?;
    assert_eq!(full.collection, Collection::Clients);
    assert!(full.revision >= 2);

    sub.handle.cancel().await;
    sub.handle.cancel().await;
    assert!(!sub.handle.is_active());
    Ok(())
}

#[tokio::test]
async fn session_over_postgres() -> Result<()> {
    let (_container, store) = postgres().await?;
    let session = SyncManager::start(
        Arc::new(store.docs(&OwnerId::new("tech-1"))),
        SyncConfig {
            poll_interval: Duration::from_millis(50),
            ..SyncConfig::default()
        },
    )
    .await?;
    timeout(Duration::from_secs(5), session.ready()).await?;

    let client = session.add_client("Sarah M.", Some("555-1234")).await?;
    session
        .add_appointment(NewAppointment {
            client_id: Some(client.id),
            client_name: "Sarah M.".into(),
            service: "GelX".into(),
            date: Utc::now(),
            notes: None,
        })
        .await?;
    session
        .attach_design(
            NewDesign {
                prompt: "pink hearts".into(),
                image_base64: "cGluayBoZWFydHM=".into(),
            },
            Some(&client),
        )
        .await?;

    let designs = timeout(
        Duration::from_secs(5),
        session
            .designs()
            .wait_for(|d| d.len() == 1 && d[0].created_at.is_some()),
    )
    .await?;
    assert_eq!(designs[0].client_id, Some(client.id));
    timeout(
        Duration::from_secs(5),
        session
            .clients()
            .wait_for(|c| c.len() == 1 && c[0].design_image_names.len() == 1),
    )
    .await?;

    let report = session.delete_client_cascade(client.id).await?;
    assert!(report.client_deleted);
    timeout(
        Duration::from_secs(5),
        session.appointments().wait_for(|a| a.is_empty()),
    )
    .await?;
    assert!(session.list_appointments_for_client(client.id).is_empty());
    assert!(session.list_designs_for_client(Uuid::nil()).is_empty());

    session.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_unions_keep_every_value() -> Result<()> {
    let (_container, store) = postgres().await?;
    let docs = store.docs(&OwnerId::new("tech-1"));
    docs.write(
        Collection::Clients,
        "c1",
        DocumentWrite::merge(fields(json!({"name": "Sarah M."}))),
    )
    .await?;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let docs = docs.clone();
        tasks.push(tokio::spawn(async move {
            docs.array_union(
                Collection::Clients,
                "c1",
                "designImageNames",
                vec![json!(format!("img-{i}"))],
            )
            .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    let doc = docs.get(Collection::Clients, "c1").await?.unwrap();
    let mut names: Vec<_> = doc["designImageNames"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    names.sort();
    let mut expected: Vec<_> = (0..20).map(|i| format!("img-{i}")).collect();
    expected.sort();
    assert_eq!(names, expected);
    Ok(())
}

#[tokio::test]
async fn non_object_rows_are_skipped() -> Result<()> {
    let (_container, store) = postgres().await?;
    let docs = store.docs(&OwnerId::new("tech-1"));
    let sarah = Client::new("Sarah M.", None);
    docs.write(
        Collection::Clients,
        &sarah.id.to_string(),
        DocumentWrite::merge(sarah.encode()),
    )
    .await?;
    sqlx::query(
        "insert into owner_documents (owner, collection, id, doc) values ($1, $2, $3, 'null'::jsonb)",
    )
    .bind("tech-1")
    .bind(Collection::Clients.as_str())
    .bind("legacy")
    .execute(store.pool())
    .await?;

    let fetched = docs.fetch(Collection::Clients, None).await?;
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id, sarah.id.to_string());

    let mirror = LiveCollection::<Client>::new();
    mirror
        .start(
            &docs,
            SubscriptionOptions {
                poll_interval: Duration::from_millis(50),
                ..SubscriptionOptions::default()
            },
        )
        .await?;
    let clients = timeout(Duration::from_secs(5), mirror.ready()).await?;
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].name, "Sarah M.");
    mirror.stop().await;
    Ok(())
}
