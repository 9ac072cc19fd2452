//! Per-owner synchronization session.
//!
//! [`SyncManager`] mirrors the three collections of one owner and routes every
//! command through the codec into the store. Mirrors only ever show what the
//! store delivered; a failed write never appears locally.
//!
//! [`SessionSupervisor`] follows the signed-in identity and replaces the whole
//! session whenever the owner changes.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{FixedOffset, NaiveDate};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    Error, OwnerId, Result, WithContext,
    cascade::{CascadeReport, run_cascade},
    codec::{Entity, fields},
    config::SyncConfig,
    generator::ImageGenerator,
    live::LiveCollection,
    metrics,
    models::{Appointment, Client, Design, NewAppointment, NewDesign},
    transport::{Collection, DocumentBackend, DocumentStore, DocumentWrite, FieldFilter},
};

pub struct SyncManager {
    store: Arc<dyn DocumentStore>,
    config: SyncConfig,
    clients: LiveCollection<Client>,
    appointments: LiveCollection<Appointment>,
    designs: LiveCollection<Design>,
}

impl SyncManager {
    /// Build a session without subscribing; call [`SyncManager::start_listening`].
    pub fn new(store: Arc<dyn DocumentStore>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            clients: LiveCollection::new(),
            appointments: LiveCollection::new(),
            designs: LiveCollection::new(),
        }
    }

    /// Build a session and start all three mirrors.
    pub async fn start(store: Arc<dyn DocumentStore>, config: SyncConfig) -> Result<Self> {
        let manager = Self::new(store, config);
        manager.start_listening().await?;
        Ok(manager)
    }

    /// (Re)subscribe every mirror. On failure no mirror is left running.
    pub async fn start_listening(&self) -> Result<()> {
        let opts = self.config.subscription_options();
        let store = self.store.as_ref();
        let started = async {
            self.clients.start(store, opts.clone()).await?;
            self.appointments.start(store, opts.clone()).await?;
            self.designs.start(store, opts).await
        }
        .await;
        if let Err(err) = started {
            self.stop().await;
            return Err(err).context(format!("starting session for {}", self.owner()));
        }
        tracing::info!(target: "lacquer::sync", owner = %self.owner(), "session started");
        Ok(())
    }

    /// Stop every mirror. Idempotent.
    pub async fn stop(&self) {
        self.clients.stop().await;
        self.appointments.stop().await;
        self.designs.stop().await;
        tracing::debug!(target: "lacquer::sync", owner = %self.owner(), "session stopped");
    }

    /// Wait until every mirror has delivered its first snapshot.
    pub async fn ready(&self) {
        self.clients.ready().await;
        self.appointments.ready().await;
        self.designs.ready().await;
    }

    pub fn owner(&self) -> &OwnerId {
        self.store.owner()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn clients(&self) -> &LiveCollection<Client> {
        &self.clients
    }

    pub fn appointments(&self) -> &LiveCollection<Appointment> {
        &self.appointments
    }

    pub fn designs(&self) -> &LiveCollection<Design> {
        &self.designs
    }

    // ---- clients ----

    #[instrument(skip(self), fields(owner = %self.owner()), err)]
    pub async fn add_client(&self, name: &str, phone: Option<&str>) -> Result<Client> {
        let name = required(name, "client name")?;
        let phone = phone
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_owned);
        let client = Client::new(name, phone);
        self.store
            .write(
                Collection::Clients,
                &client.id.to_string(),
                DocumentWrite::merge(client.encode()),
            )
            .await?;
        Ok(client)
    }

    /// Merge the client's editable fields. The design image list is left alone;
    /// it only grows through [`SyncManager::append_design_image`].
    #[instrument(skip(self, client), fields(owner = %self.owner(), client_id = %client.id), err)]
    pub async fn update_client(&self, client: &Client) -> Result<()> {
        let name = required(&client.name, "client name")?;
        let mut payload = Client {
            name: name.to_owned(),
            ..client.clone()
        }
        .encode();
        payload.remove(fields::DESIGN_IMAGE_NAMES);
        self.store
            .write(
                Collection::Clients,
                &client.id.to_string(),
                DocumentWrite::update(payload),
            )
            .await
    }

    /// Delete a client's appointments, then designs, then the client.
    ///
    /// Safe to re-run after any failure. With [`crate::CascadeRetry::Automatic`]
    /// the whole cascade is re-run before an error is returned.
    #[instrument(skip(self), fields(owner = %self.owner()), err)]
    pub async fn delete_client_cascade(&self, client_id: Uuid) -> Result<CascadeReport> {
        let runs = self.config.cascade_retry.max_runs();
        let mut report = CascadeReport::default();
        let mut run = 1;
        loop {
            match run_cascade(self.store.as_ref(), client_id, &mut report).await {
                Ok(()) => {
                    metrics::record_cascade(true);
                    tracing::info!(
                        target: "lacquer::cascade",
                        %client_id,
                        %report,
                        runs = run,
                        "client deleted"
                    );
                    return Ok(report);
                }
                Err(err) if run < runs => {
                    tracing::warn!(
                        target: "lacquer::cascade",
                        %client_id,
                        run,
                        error = %err,
                        "cascade interrupted; retrying"
                    );
                    run += 1;
                }
                Err(err) => {
                    metrics::record_cascade(false);
                    return Err(err);
                }
            }
        }
    }

    // ---- appointments ----

    #[instrument(skip(self, new), fields(owner = %self.owner(), client_id = ?new.client_id), err)]
    pub async fn add_appointment(&self, new: NewAppointment) -> Result<Appointment> {
        let service = required(&new.service, "service")?.to_owned();
        let known = self.clients.current();
        if new.client_id.is_none() && !known.is_empty() {
            return Err(Error::validation("select a client for the appointment"));
        }

        let mut client_name = new.client_name.trim().to_owned();
        if client_name.is_empty() {
            if let Some(client) = new
                .client_id
                .and_then(|id| known.iter().find(|c| c.id == id))
            {
                client_name = client.name.clone();
            }
        }
        if client_name.is_empty() {
            return Err(Error::validation("client name is required"));
        }

        let appointment = Appointment {
            id: Uuid::new_v4(),
            client_id: new.client_id,
            client_name,
            service,
            date: new.date,
            notes: new.notes.filter(|n| !n.trim().is_empty()),
            created_at: None,
        };
        self.store
            .write(
                Collection::Appointments,
                &appointment.id.to_string(),
                DocumentWrite::merge(appointment.encode()).server_timestamp(fields::CREATED_AT),
            )
            .await?;
        Ok(appointment)
    }

    #[instrument(skip(self, appointment), fields(owner = %self.owner(), id = %appointment.id), err)]
    pub async fn update_appointment(&self, appointment: &Appointment) -> Result<()> {
        required(&appointment.service, "service")?;
        let mut payload = appointment.encode();
        // Keep the creation stamp the store assigned.
        payload.remove(fields::CREATED_AT);
        self.store
            .write(
                Collection::Appointments,
                &appointment.id.to_string(),
                DocumentWrite::update(payload),
            )
            .await
    }

    /// Deleting an appointment that is already gone succeeds.
    #[instrument(skip(self), fields(owner = %self.owner()), err)]
    pub async fn delete_appointment(&self, id: Uuid) -> Result<()> {
        let existed = self
            .store
            .delete(Collection::Appointments, &id.to_string())
            .await?;
        if !existed {
            tracing::debug!(target: "lacquer::sync", %id, "appointment already deleted");
        }
        Ok(())
    }

    // ---- designs ----

    /// Save a design, then link its image to `client`.
    ///
    /// If the link step fails the design still exists and the error is
    /// [`Error::PartialAttach`]; retry the link with
    /// [`SyncManager::append_design_image`].
    #[instrument(skip(self, new, client), fields(owner = %self.owner(), client_id = ?client.map(|c| c.id)), err)]
    pub async fn attach_design(&self, new: NewDesign, client: Option<&Client>) -> Result<Design> {
        let prompt = required(&new.prompt, "design prompt")?.to_owned();
        let image = validate_image(&new.image_base64)?;

        let design = Design {
            id: Uuid::new_v4(),
            owner_uid: self.owner().to_string(),
            client_id: client.map(|c| c.id),
            prompt,
            image_url: image.to_owned(),
            created_at: None,
        };
        self.store
            .write(
                Collection::Designs,
                &design.id.to_string(),
                DocumentWrite::set(design.encode()).server_timestamp(fields::CREATED_AT),
            )
            .await
            .context("saving design")?;

        if let Some(client) = client {
            self.link_image(client.id, image)
                .await
                .map_err(|source| Error::PartialAttach {
                    design_id: design.id,
                    client_id: client.id,
                    source: Box::new(source),
                })?;
        }
        Ok(design)
    }

    /// Union-append an image payload to a client's design list. Appending an
    /// image the client already has changes nothing.
    #[instrument(skip(self, image), fields(owner = %self.owner()), err)]
    pub async fn append_design_image(&self, client_id: Uuid, image: &str) -> Result<()> {
        let image = validate_image(image)?;
        self.link_image(client_id, image).await
    }

    async fn link_image(&self, client_id: Uuid, image: &str) -> Result<()> {
        self.store
            .array_union(
                Collection::Clients,
                &client_id.to_string(),
                fields::DESIGN_IMAGE_NAMES,
                vec![Value::String(image.to_owned())],
            )
            .await
    }

    /// Generate an image for `prompt` and save it as a design.
    #[instrument(skip(self, generator, client), fields(owner = %self.owner()), err)]
    pub async fn generate_design(
        &self,
        generator: &dyn ImageGenerator,
        prompt: &str,
        client: Option<&Client>,
    ) -> Result<Design> {
        let prompt = required(prompt, "design prompt")?;
        let image = generator
            .generate(prompt)
            .await
            .context("generating design image")?;
        self.attach_design(
            NewDesign {
                prompt: prompt.to_owned(),
                image_base64: image,
            },
            client,
        )
        .await
    }

    // ---- read side ----

    pub fn list_clients(&self) -> Arc<[Client]> {
        self.clients.current()
    }

    pub fn list_appointments(&self) -> Arc<[Appointment]> {
        self.appointments.current()
    }

    pub fn list_designs(&self) -> Arc<[Design]> {
        self.designs.current()
    }

    pub fn list_appointments_for_client(&self, client_id: Uuid) -> Vec<Appointment> {
        self.appointments
            .current()
            .iter()
            .filter(|a| a.belongs_to(client_id))
            .cloned()
            .collect()
    }

    pub fn list_designs_for_client(&self, client_id: Uuid) -> Vec<Design> {
        self.designs
            .current()
            .iter()
            .filter(|d| d.belongs_to(client_id))
            .cloned()
            .collect()
    }

    pub fn client(&self, id: Uuid) -> Option<Client> {
        self.clients.current().iter().find(|c| c.id == id).cloned()
    }

    /// The appointment's client, if it still exists.
    pub fn client_for(&self, appointment: &Appointment) -> Option<Client> {
        appointment.client_id.and_then(|id| self.client(id))
    }

    /// Current name of the appointment's client, or the name captured at booking.
    pub fn display_client_name(&self, appointment: &Appointment) -> String {
        self.client_for(appointment)
            .map(|c| c.name)
            .unwrap_or_else(|| appointment.client_name.clone())
    }

    /// Appointments falling on `day` in the calendar of `offset`.
    pub fn appointments_on(&self, day: NaiveDate, offset: FixedOffset) -> Vec<Appointment> {
        self.appointments
            .current()
            .iter()
            .filter(|a| a.date.with_timezone(&offset).date_naive() == day)
            .cloned()
            .collect()
    }

    /// Start a mirror of one client's appointments. The caller owns it and stops it.
    pub async fn open_client_appointments(
        &self,
        client_id: Uuid,
    ) -> Result<LiveCollection<Appointment>> {
        let mirror = LiveCollection::filtered(FieldFilter::eq(
            fields::CLIENT_ID,
            client_id.to_string(),
        ));
        mirror
            .start(self.store.as_ref(), self.config.subscription_options())
            .await?;
        Ok(mirror)
    }
}

fn required<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(format!("{what} must not be empty")));
    }
    Ok(trimmed)
}

fn validate_image(image: &str) -> Result<&str> {
    let image = required(image, "design image")?;
    STANDARD
        .decode(image)
        .map_err(|err| Error::validation(format!("design image is not valid base64: {err}")))?;
    Ok(image)
}

/// Keeps one [`SyncManager`] alive for whoever is signed in.
///
/// Every change of the resolved owner stops the old session's mirrors before the
/// new session starts, so no snapshot of one owner reaches the next. A session
/// that fails to start is retried every `poll_interval` until it runs or the
/// owner changes.
pub struct SessionSupervisor {
    sessions: watch::Receiver<Option<Arc<SyncManager>>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SessionSupervisor {
    /// Follow `identity`; `None` means signed out and maps to the fallback owner.
    pub fn spawn(
        backend: Arc<dyn DocumentBackend>,
        identity: watch::Receiver<Option<OwnerId>>,
        config: SyncConfig,
    ) -> Self {
        let (tx, sessions) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(backend, identity, config, tx, shutdown_rx));
        Self {
            sessions,
            shutdown,
            task: Some(task),
        }
    }

    /// The active session, if one is running.
    pub fn current(&self) -> Option<Arc<SyncManager>> {
        self.sessions.borrow().clone()
    }

    /// Receiver that sees every session change.
    pub fn sessions(&self) -> watch::Receiver<Option<Arc<SyncManager>>> {
        self.sessions.clone()
    }

    /// Wait for the session of `owner` to be running.
    pub async fn session_for(&self, owner: &OwnerId) -> Option<Arc<SyncManager>> {
        let mut rx = self.sessions.clone();
        let found = rx
            .wait_for(|s| s.as_ref().is_some_and(|s| s.owner() == owner))
            .await
            .ok()?;
        found.clone()
    }

    /// Stop the active session and the supervisor. Idempotent.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn supervise(
    backend: Arc<dyn DocumentBackend>,
    mut identity: watch::Receiver<Option<OwnerId>>,
    config: SyncConfig,
    sessions: watch::Sender<Option<Arc<SyncManager>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut active: Option<Arc<SyncManager>> = None;
    loop {
        let owner = {
            let signed_in = identity.borrow_and_update();
            OwnerId::resolve(signed_in.as_ref(), &config.fallback_owner)
        };

        if active.as_ref().map(|s| s.owner()) != Some(&owner) {
            if let Some(old) = active.take() {
                sessions.send_replace(None);
                old.stop().await;
                tracing::info!(target: "lacquer::sync", owner = %old.owner(), "session closed");
            }
            match SyncManager::start(backend.for_owner(&owner), config.clone()).await {
                Ok(session) => {
                    let session = Arc::new(session);
                    active = Some(session.clone());
                    sessions.send_replace(Some(session));
                }
                Err(err) => {
                    tracing::warn!(target: "lacquer::sync", %owner, error = %err, "session failed to start");
                }
            }
        }

        // With no running session, try again after the poll interval.
        tokio::select! {
            changed = identity.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(config.poll_interval), if active.is_none() => {}
        }
    }

    if let Some(old) = active.take() {
        sessions.send_replace(None);
        old.stop().await;
        tracing::info!(target: "lacquer::sync", owner = %old.owner(), "session closed");
    }
}
