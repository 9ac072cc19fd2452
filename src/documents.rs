use crate::{
    Error, OwnerId, Result, metrics,
    schema::{DOCUMENTS_TABLE, OWNERS_TABLE, REVISIONS_TABLE, qualified_name},
    subscriptions::{PollSignal, SnapshotSource, spawn_feed},
    transport::{
        Collection, DocumentStore, DocumentWrite, FieldFilter, RawDocument, Subscription,
        SubscriptionOptions, WriteMode, dedup_values,
    },
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

pub const DEFAULT_NOTIFY_CHANNEL: &str = "lacquer_changes";

/// Payload with every requested server-timestamp field set to the database clock.
const STAMPED_PAYLOAD: &str = "($4::jsonb || coalesce((select jsonb_object_agg(k, to_jsonb(now())) from unnest($5::text[]) as k), '{}'::jsonb))";

/// Owner-scoped document handle over Postgres.
#[derive(Clone)]
pub struct PgDocuments {
    pool: PgPool,
    owner: OwnerId,
    documents: String,
    owners: String,
    revisions: String,
    notify_channel: Option<String>,
}

impl PgDocuments {
    pub(crate) fn new(
        pool: PgPool,
        schema: &str,
        owner: OwnerId,
        notify_channel: Option<String>,
    ) -> Self {
        Self {
            pool,
            owner,
            documents: qualified_name(schema, DOCUMENTS_TABLE),
            owners: qualified_name(schema, OWNERS_TABLE),
            revisions: qualified_name(schema, REVISIONS_TABLE),
            notify_channel,
        }
    }

    /// Fetch one document's fields, if present.
    pub async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
        let doc: Option<Value> = sqlx::query_scalar(&format!(
            "select doc from {} where owner = $1 and collection = $2 and id = $3",
            self.documents
        ))
        .bind(self.owner.as_str())
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if doc.is_some() {
            metrics::record_doc_read(collection, 1);
        }
        Ok(doc)
    }

    /// Current change counter of a collection; 0 before the first write.
    pub async fn revision(&self, collection: Collection) -> Result<u64> {
        let revision: Option<i64> = sqlx::query_scalar(&format!(
            "select revision from {} where owner = $1 and collection = $2",
            self.revisions
        ))
        .bind(self.owner.as_str())
        .bind(collection.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(revision.unwrap_or(0).max(0) as u64)
    }

    async fn ensure_owner(&self, tx: &mut Transaction<'_, Postgres>) -> Result<()> {
        sqlx::query(&format!(
            "insert into {} (owner) values ($1) on conflict (owner) do nothing",
            self.owners
        ))
        .bind(self.owner.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Bump the collection revision and signal listeners; both land on commit.
    async fn touch(&self, tx: &mut Transaction<'_, Postgres>, collection: Collection) -> Result<()> {
        sqlx::query(&format!(
            r#"insert into {} as r (owner, collection, revision) values ($1, $2, 1)
               on conflict (owner, collection) do update set revision = r.revision + 1"#,
            self.revisions
        ))
        .bind(self.owner.as_str())
        .bind(collection.as_str())
        .execute(&mut **tx)
        .await?;

        if let Some(channel) = &self.notify_channel {
            sqlx::query("select pg_notify($1, $2)")
                .bind(channel)
                .bind(format!("{}/{}", self.owner, collection))
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocuments {
    fn owner(&self) -> &OwnerId {
        &self.owner
    }

    async fn write(&self, collection: Collection, id: &str, write: DocumentWrite) -> Result<()> {
        let payload = Value::Object(write.fields);
        let sql = match write.mode {
            WriteMode::Set => format!(
                r#"insert into {docs} as d (owner, collection, id, doc)
                   values ($1, $2, $3, {STAMPED_PAYLOAD})
                   on conflict (owner, collection, id) do update
                     set doc = excluded.doc, updated_at = now()"#,
                docs = self.documents
            ),
            WriteMode::Merge => format!(
                r#"insert into {docs} as d (owner, collection, id, doc)
                   values ($1, $2, $3, {STAMPED_PAYLOAD})
                   on conflict (owner, collection, id) do update
                     set doc = d.doc || excluded.doc, updated_at = now()"#,
                docs = self.documents
            ),
            WriteMode::Update => format!(
                r#"update {docs} as d
                      set doc = d.doc || {STAMPED_PAYLOAD}, updated_at = now()
                    where d.owner = $1 and d.collection = $2 and d.id = $3"#,
                docs = self.documents
            ),
        };

        let mut tx = self.pool.begin().await?;
        self.ensure_owner(&mut tx).await?;
        let result = sqlx::query(&sql)
            .bind(self.owner.as_str())
            .bind(collection.as_str())
            .bind(id)
            .bind(&payload)
            .bind(&write.server_timestamps)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            // Only `Update` can miss; dropping the transaction rolls back.
            return Err(Error::not_found(collection, id));
        }
        self.touch(&mut tx, collection).await?;
        tx.commit().await?;

        metrics::record_doc_write(collection);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&format!(
            "delete from {} where owner = $1 and collection = $2 and id = $3",
            self.documents
        ))
        .bind(self.owner.as_str())
        .bind(collection.as_str())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let existed = result.rows_affected() > 0;
        if existed {
            self.touch(&mut tx, collection).await?;
        }
        tx.commit().await?;

        if existed {
            metrics::record_doc_delete(collection);
        }
        Ok(existed)
    }

    async fn array_union(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<()> {
        let values = Value::Array(dedup_values(values));
        let current = r#"case when jsonb_typeof(d.doc -> $4::text) = 'array'
                               then d.doc -> $4::text else '[]'::jsonb end"#;
        let sql = format!(
            r#"update {docs} as d
                  set doc = jsonb_set(
                        d.doc,
                        array[$4::text],
                        {current} || coalesce(
                            (select jsonb_agg(v.value)
                               from jsonb_array_elements($5::jsonb) as v(value)
                              where not {current} @> jsonb_build_array(v.value)),
                            '[]'::jsonb),
                        true),
                      updated_at = now()
                where d.owner = $1 and d.collection = $2 and d.id = $3"#,
            docs = self.documents
        );

        let mut tx = self.pool.begin().await?;
        // Row lock first so concurrent unions serialise on the latest array.
        let locked: Option<(String,)> = sqlx::query_as(&format!(
            "select id from {} where owner = $1 and collection = $2 and id = $3 for update",
            self.documents
        ))
        .bind(self.owner.as_str())
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            return Err(Error::not_found(collection, id));
        }
        let result = sqlx::query(&sql)
            .bind(self.owner.as_str())
            .bind(collection.as_str())
            .bind(id)
            .bind(field)
            .bind(&values)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(collection, id));
        }
        self.touch(&mut tx, collection).await?;
        tx.commit().await?;

        metrics::record_doc_write(collection);
        Ok(())
    }

    async fn fetch(
        &self,
        collection: Collection,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<RawDocument>> {
        let rows: Vec<(String, Value)> = sqlx::query_as(&format!(
            r#"select id, doc from {}
                where owner = $1 and collection = $2
                  and ($3::text is null or doc -> $3::text = $4::jsonb)
                order by id"#,
            self.documents
        ))
        .bind(self.owner.as_str())
        .bind(collection.as_str())
        .bind(filter.map(|f| f.field.clone()))
        .bind(filter.map(|f| f.equals.clone()))
        .fetch_all(&self.pool)
        .await?;

        metrics::record_doc_read(collection, rows.len());
        let mut documents = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for (id, doc) in rows {
            match doc {
                Value::Object(fields) => documents.push(RawDocument { id, fields }),
                other => {
                    tracing::warn!(
                        target: "lacquer::documents",
                        owner = %self.owner,
                        %collection,
                        %id,
                        kind = json_kind(&other),
                        "skipping non-object document"
                    );
                    skipped += 1;
                }
            }
        }
        metrics::record_records_dropped(skipped);
        Ok(documents)
    }

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<FieldFilter>,
        opts: SubscriptionOptions,
    ) -> Result<Subscription> {
        let channel = opts
            .notify_channel
            .as_deref()
            .or(self.notify_channel.as_deref());
        let signal = PollSignal::connect(&self.pool, opts.poll_interval, channel).await;
        tracing::debug!(
            target: "lacquer::subscriptions",
            owner = %self.owner,
            %collection,
            filtered = filter.is_some(),
            "starting snapshot feed"
        );
        Ok(spawn_feed(self.clone(), collection, filter, &opts, signal))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl SnapshotSource for PgDocuments {
    async fn revision(&self, collection: Collection) -> Result<u64> {
        PgDocuments::revision(self, collection).await
    }

    async fn documents(
        &self,
        collection: Collection,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<RawDocument>> {
        self.fetch(collection, filter).await
    }
}
