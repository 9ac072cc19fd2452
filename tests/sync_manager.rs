use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, TimeZone, Utc};
use lacquer::generator::ImageGenerator;
use lacquer::testing::{FaultOp, FaultyStore};
use lacquer::transport::{Collection, DocumentBackend, DocumentStore};
use lacquer::{
    CascadeReport, Error, MemoryStore, NewAppointment, NewDesign, OwnerId, SyncConfig,
    SyncManager,
};
use serde_json::json;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

const PINK_HEARTS: &str = "cGluayBoZWFydHM=";
const WAIT: Duration = Duration::from_secs(5);

fn config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(20),
        ..SyncConfig::default()
    }
}

async fn started(store: Arc<dyn DocumentStore>) -> Result<SyncManager> {
    let session = SyncManager::start(store, config()).await?;
    timeout(WAIT, session.ready()).await?;
    Ok(session)
}

#[tokio::test]
async fn sarah_m_scenario() -> Result<()> {
    let store = MemoryStore::new();
    let owner = OwnerId::new("tech-1");
    let session = started(store.for_owner(&owner)).await?;

    let c1 = session.add_client("Sarah M.", Some("555-1234")).await?;
    let t1 = Utc.with_ymd_and_hms(2025, 3, 14, 15, 30, 0).unwrap();
    let a1 = session
        .add_appointment(NewAppointment {
            client_id: Some(c1.id),
            client_name: "Sarah M.".into(),
            service: "GelX".into(),
            date: t1,
            notes: None,
        })
        .await?;
    let d1 = session
        .attach_design(
            NewDesign {
                prompt: "pink hearts".into(),
                image_base64: PINK_HEARTS.into(),
            },
            Some(&c1),
        )
        .await?;

    let clients = timeout(
        WAIT,
        session
            .clients()
            .wait_for(|cs| cs.iter().any(|c| c.design_image_names == [PINK_HEARTS])),
    )
    .await?;
    assert_eq!(clients[0].phone.as_deref(), Some("555-1234"));
    timeout(WAIT, session.appointments().wait_for(|a| a.len() == 1)).await?;
    let designs = timeout(
        WAIT,
        session
            .designs()
            .wait_for(|d| d.len() == 1 && d[0].created_at.is_some()),
    )
    .await?;
    assert_eq!(designs[0].id, d1.id);
    assert_eq!(designs[0].owner_uid, "tech-1");
    assert_eq!(session.list_appointments_for_client(c1.id)[0].id, a1.id);
    assert_eq!(session.list_designs_for_client(c1.id).len(), 1);

    let report = session.delete_client_cascade(c1.id).await?;
    assert_eq!(
        report,
        CascadeReport {
            appointments_deleted: 1,
            designs_deleted: 1,
            client_deleted: true,
        }
    );

    timeout(WAIT, session.clients().wait_for(|c| c.is_empty())).await?;
    timeout(WAIT, session.appointments().wait_for(|a| a.is_empty())).await?;
    timeout(WAIT, session.designs().wait_for(|d| d.is_empty())).await?;
    assert!(session.list_clients().iter().all(|c| c.id != c1.id));
    assert!(session.list_appointments_for_client(c1.id).is_empty());
    assert!(session.list_designs().iter().all(|d| d.client_id != Some(c1.id)));

    session.stop().await;
    Ok(())
}

#[tokio::test]
async fn blank_client_name_is_rejected_without_writing() -> Result<()> {
    let store = MemoryStore::new();
    let faulty = FaultyStore::new(store.for_owner(&OwnerId::new("o")));
    let session = SyncManager::new(faulty.clone(), config());

    for name in ["", "   "] {
        let err = session.add_client(name, None).await.unwrap_err();
        assert!(err.is_validation(), "{err}");
    }
    assert_eq!(faulty.mutation_attempts(), 0);
    assert_eq!(store.write_count(), 0);
    Ok(())
}

#[tokio::test]
async fn client_name_is_trimmed_and_blank_phone_dropped() -> Result<()> {
    let store = MemoryStore::new();
    let owner = OwnerId::new("o");
    let session = SyncManager::new(store.for_owner(&owner), config());

    let client = session.add_client("  Lina R. ", Some("  ")).await?;
    assert_eq!(client.name, "Lina R.");
    assert_eq!(client.phone, None);

    let raw = store
        .get(&owner, Collection::Clients, &client.id.to_string())
        .unwrap();
    assert_eq!(raw["name"], json!("Lina R."));
    assert_eq!(raw["designImageNames"], json!([]));
    Ok(())
}

#[tokio::test]
async fn appending_the_same_image_twice_keeps_one() -> Result<()> {
    let store = MemoryStore::new();
    let owner = OwnerId::new("o");
    let session = SyncManager::new(store.for_owner(&owner), config());
    let client = session.add_client("Sarah M.", None).await?;

    session.append_design_image(client.id, PINK_HEARTS).await?;
    session.append_design_image(client.id, PINK_HEARTS).await?;

    let raw = store
        .get(&owner, Collection::Clients, &client.id.to_string())
        .unwrap();
    assert_eq!(raw["designImageNames"], json!([PINK_HEARTS]));
    Ok(())
}

#[tokio::test]
async fn update_client_never_rewrites_design_images() -> Result<()> {
    let store = MemoryStore::new();
    let owner = OwnerId::new("o");
    let session = SyncManager::new(store.for_owner(&owner), config());
    let mut client = session.add_client("Sarah", None).await?;
    session.append_design_image(client.id, PINK_HEARTS).await?;

    client.name = "Sarah M.".into();
    client.notes = Some("prefers almond shape".into());
    // Stale local copy without the appended image.
    client.design_image_names.clear();
    session.update_client(&client).await?;

    let raw = store
        .get(&owner, Collection::Clients, &client.id.to_string())
        .unwrap();
    assert_eq!(raw["name"], json!("Sarah M."));
    assert_eq!(raw["notes"], json!("prefers almond shape"));
    assert_eq!(raw["designImageNames"], json!([PINK_HEARTS]));
    Ok(())
}

#[tokio::test]
async fn updates_of_missing_records_are_not_found() -> Result<()> {
    let store = MemoryStore::new();
    let session = SyncManager::new(store.for_owner(&OwnerId::new("o")), config());

    let ghost = lacquer::Client::new("Ghost", None);
    assert!(session.update_client(&ghost).await.unwrap_err().is_not_found());

    let appointment = lacquer::Appointment {
        id: Uuid::new_v4(),
        client_id: None,
        client_name: "Walk-in".into(),
        service: "Manicure".into(),
        date: Utc::now(),
        notes: None,
        created_at: None,
    };
    assert!(
        session
            .update_appointment(&appointment)
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert_eq!(store.write_count(), 0);
    Ok(())
}

#[tokio::test]
async fn deleting_a_missing_appointment_succeeds() -> Result<()> {
    let store = MemoryStore::new();
    let session = SyncManager::new(store.for_owner(&OwnerId::new("o")), config());
    session.delete_appointment(Uuid::new_v4()).await?;
    Ok(())
}

#[tokio::test]
async fn appointment_validation() -> Result<()> {
    let store = MemoryStore::new();
    let session = started(store.for_owner(&OwnerId::new("o"))).await?;

    let blank_service = session
        .add_appointment(NewAppointment {
            client_name: "Walk-in".into(),
            service: "  ".into(),
            date: Utc::now(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(blank_service.is_validation());

    let client = session.add_client("Michaela T.", None).await?;
    timeout(WAIT, session.clients().wait_for(|c| c.len() == 1)).await?;

    let unselected = session
        .add_appointment(NewAppointment {
            client_name: "Michaela T.".into(),
            service: "PolyGel".into(),
            date: Utc::now(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(unselected.is_validation());

    // Name is filled from the selected client.
    let booked = session
        .add_appointment(NewAppointment {
            client_id: Some(client.id),
            service: "PolyGel".into(),
            date: Utc::now(),
            ..Default::default()
        })
        .await?;
    assert_eq!(booked.client_name, "Michaela T.");

    let appointments = timeout(
        WAIT,
        session
            .appointments()
            .wait_for(|a| a.len() == 1 && a[0].created_at.is_some()),
    )
    .await?;
    assert_eq!(appointments[0].client_name, "Michaela T.");
    session.stop().await;
    Ok(())
}

#[tokio::test]
async fn unlinked_appointments_never_match_a_client() -> Result<()> {
    let store = MemoryStore::new();
    let owner = OwnerId::new("o");
    let session = started(store.for_owner(&owner)).await?;

    session
        .add_appointment(NewAppointment {
            client_name: "Walk-in".into(),
            service: "Manicure".into(),
            date: Utc::now(),
            ..Default::default()
        })
        .await?;
    let client = session.add_client("Sarah M.", None).await?;
    store.insert_raw(
        &owner,
        Collection::Appointments,
        "legacy",
        serde_json::from_value(json!({
            "id": Uuid::new_v4().to_string(),
            "clientId": null,
            "clientName": "Legacy",
            "service": "GelX",
            "date": "2024-05-01T10:00:00Z",
        }))?,
    );

    timeout(WAIT, session.appointments().wait_for(|a| a.len() == 2)).await?;
    assert!(session.list_appointments_for_client(client.id).is_empty());
    assert!(
        session
            .list_appointments_for_client(Uuid::new_v4())
            .is_empty()
    );
    assert!(
        session
            .list_appointments_for_client(Uuid::nil())
            .is_empty()
    );
    session.stop().await;
    Ok(())
}

#[tokio::test]
async fn client_lookups_degrade_when_the_client_is_gone() -> Result<()> {
    let store = MemoryStore::new();
    let owner = OwnerId::new("o");
    let docs = store.for_owner(&owner);
    let session = started(docs.clone()).await?;

    let mut client = session.add_client("Sarah", None).await?;
    let appointment = session
        .add_appointment(NewAppointment {
            client_id: Some(client.id),
            client_name: "Sarah".into(),
            service: "GelX".into(),
            date: Utc::now(),
            notes: None,
        })
        .await?;

    client.name = "Sarah M.".into();
    session.update_client(&client).await?;
    timeout(
        WAIT,
        session
            .clients()
            .wait_for(|c| c.first().is_some_and(|c| c.name == "Sarah M.")),
    )
    .await?;
    assert_eq!(session.display_client_name(&appointment), "Sarah M.");

    docs.delete(Collection::Clients, &client.id.to_string())
        .await?;
    timeout(WAIT, session.clients().wait_for(|c| c.is_empty())).await?;
    assert!(session.client_for(&appointment).is_none());
    assert_eq!(session.display_client_name(&appointment), "Sarah");
    session.stop().await;
    Ok(())
}

#[tokio::test]
async fn appointments_on_uses_the_given_calendar() -> Result<()> {
    let store = MemoryStore::new();
    let session = started(store.for_owner(&OwnerId::new("o"))).await?;

    // 23:30 UTC on the 14th is already the 15th at UTC+2.
    let late = Utc.with_ymd_and_hms(2025, 3, 14, 23, 30, 0).unwrap();
    let next = Utc.with_ymd_and_hms(2025, 3, 15, 9, 0, 0).unwrap();
    for (name, date) in [("Sarah M.", late), ("Lina R.", next)] {
        session
            .add_appointment(NewAppointment {
                client_name: name.into(),
                service: "GelX".into(),
                date,
                ..Default::default()
            })
            .await?;
    }
    timeout(WAIT, session.appointments().wait_for(|a| a.len() == 2)).await?;

    let day = NaiveDate::from_ymd_opt(2025, 3, 15).unwrap();
    let utc = FixedOffset::east_opt(0).unwrap();
    let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
    assert_eq!(session.appointments_on(day, utc).len(), 1);
    let both = session.appointments_on(day, plus_two);
    assert_eq!(both.len(), 2);
    assert_eq!(both[0].client_name, "Sarah M.");
    session.stop().await;
    Ok(())
}

#[tokio::test]
async fn partial_attach_recovers_with_append() -> Result<()> {
    let store = MemoryStore::new();
    let owner = OwnerId::new("o");
    let faulty = FaultyStore::new(store.for_owner(&owner));
    let session = SyncManager::new(faulty.clone(), config());
    let client = session.add_client("Sarah M.", None).await?;

    faulty.fail_next(FaultOp::ArrayUnion, Collection::Clients, 1);
    let err = session
        .attach_design(
            NewDesign {
                prompt: "pink hearts".into(),
                image_base64: PINK_HEARTS.into(),
            },
            Some(&client),
        )
        .await
        .unwrap_err();
    let Error::PartialAttach {
        design_id,
        client_id,
        ..
    } = err
    else {
        panic!("expected PartialAttach, got {err:?}");
    };
    assert_eq!(client_id, client.id);
    assert!(
        store
            .get(&owner, Collection::Designs, &design_id.to_string())
            .is_some()
    );

    session.append_design_image(client_id, PINK_HEARTS).await?;
    let raw = store
        .get(&owner, Collection::Clients, &client.id.to_string())
        .unwrap();
    assert_eq!(raw["designImageNames"], json!([PINK_HEARTS]));
    Ok(())
}

#[tokio::test]
async fn design_input_is_validated_before_writing() -> Result<()> {
    let store = MemoryStore::new();
    let session = SyncManager::new(store.for_owner(&OwnerId::new("o")), config());

    let no_prompt = session
        .attach_design(
            NewDesign {
                prompt: " ".into(),
                image_base64: PINK_HEARTS.into(),
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(no_prompt.is_validation());

    let bad_image = session
        .attach_design(
            NewDesign {
                prompt: "pink hearts".into(),
                image_base64: "%%%".into(),
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(bad_image.is_validation());
    assert_eq!(store.write_count(), 0);
    Ok(())
}

struct CannedGenerator;

#[async_trait]
impl ImageGenerator for CannedGenerator {
    async fn generate(&self, _prompt: &str) -> lacquer::Result<String> {
        Ok(PINK_HEARTS.to_string())
    }
}

struct OfflineGenerator;

#[async_trait]
impl ImageGenerator for OfflineGenerator {
    async fn generate(&self, _prompt: &str) -> lacquer::Result<String> {
        Err(Error::Transport("image service unreachable".into()))
    }
}

#[tokio::test]
async fn generated_designs_are_saved_and_linked() -> Result<()> {
    let store = MemoryStore::new();
    let owner = OwnerId::new("o");
    let session = SyncManager::new(store.for_owner(&owner), config());
    let client = session.add_client("Sarah M.", None).await?;

    let design = session
        .generate_design(&CannedGenerator, "pink hearts", Some(&client))
        .await?;
    assert_eq!(design.image_url, PINK_HEARTS);
    assert_eq!(design.client_id, Some(client.id));

    let writes = store.write_count();
    let err = session
        .generate_design(&OfflineGenerator, "yellow french", None)
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert_eq!(store.write_count(), writes);
    Ok(())
}

#[tokio::test]
async fn client_appointment_mirror_follows_new_bookings() -> Result<()> {
    let store = MemoryStore::new();
    let session = started(store.for_owner(&OwnerId::new("o"))).await?;
    let sarah = session.add_client("Sarah M.", None).await?;
    let lina = session.add_client("Lina R.", None).await?;
    timeout(WAIT, session.clients().wait_for(|c| c.len() == 2)).await?;

    let mirror = session.open_client_appointments(sarah.id).await?;
    assert!(timeout(WAIT, mirror.ready()).await?.is_empty());

    for (client, service) in [(&sarah, "GelX"), (&lina, "Pedicure"), (&sarah, "Fill")] {
        session
            .add_appointment(NewAppointment {
                client_id: Some(client.id),
                client_name: client.name.clone(),
                service: service.into(),
                date: Utc::now(),
                notes: None,
            })
            .await?;
    }

    let mine = timeout(WAIT, mirror.wait_for(|a| a.len() == 2)).await?;
    assert!(mine.iter().all(|a| a.client_id == Some(sarah.id)));
    mirror.stop().await;
    session.stop().await;
    Ok(())
}
