use std::collections::HashSet;

use crate::Result;
use indoc::formatdoc;
use sqlx::PgPool;

pub const OWNERS_TABLE: &str = "owners";
pub const DOCUMENTS_TABLE: &str = "owner_documents";
pub const REVISIONS_TABLE: &str = "collection_revisions";
pub const UPDATED_AT_INDEX: &str = "owner_documents_updated_at_idx";

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let schema = config.base_schema.trim();

        if schema.is_empty() {
            plan.push_warning("schema name is empty; skipping".to_string());
            return Ok(plan);
        }

        let schema_exists = self.existing_schemas().await?.contains(schema);
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                formatdoc!(
                    "create schema if not exists {schema}",
                    schema = quote_ident(schema),
                ),
            );
        }

        let existing_tables = if schema_exists {
            self.existing_tables(schema).await?
        } else {
            HashSet::new()
        };

        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            OWNERS_TABLE,
            build_owners_table_sql,
        );
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            DOCUMENTS_TABLE,
            build_documents_table_sql,
        );
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            REVISIONS_TABLE,
            build_revisions_table_sql,
        );

        let existing_indexes = if schema_exists {
            self.existing_indexes(schema).await?
        } else {
            HashSet::new()
        };
        if !existing_indexes.contains(UPDATED_AT_INDEX) {
            plan.push_action(
                format!("create index {}", qualified_name(schema, UPDATED_AT_INDEX)),
                build_updated_at_index_sql(schema),
            );
        }

        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::query(action.sql()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sync(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let plan = self.plan(config).await?;
        if !plan.is_empty() {
            tracing::info!(
                target: "lacquer::schema",
                schema = %config.base_schema,
                actions = plan.actions().len(),
                "applying schema changes"
            );
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    async fn existing_schemas(&self) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_scalar::<_, String>("select schema_name from information_schema.schemata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_tables(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select table_name from information_schema.tables where table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_indexes(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select indexname from pg_indexes where schemaname = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    pub base_schema: String,
}

impl SchemaConfig {
    pub fn with_base_schema(schema: impl Into<String>) -> Self {
        Self {
            base_schema: schema.into(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self::with_base_schema("public")
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
    warnings: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn ensure_table<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_tables: &HashSet<String>,
    table: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_tables.contains(table) {
        plan.push_action(
            format!("create table {}", qualified_name(schema, table)),
            build_sql(schema),
        );
    }
}

fn build_owners_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            owner text primary key,
            created_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, OWNERS_TABLE),
    )
}

fn build_documents_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            owner text not null references {owners} (owner) on delete cascade,
            collection text not null,
            id text not null,
            doc jsonb not null,
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now(),
            primary key (owner, collection, id)
        )
        ",
        table = qualified_name(schema, DOCUMENTS_TABLE),
        owners = qualified_name(schema, OWNERS_TABLE),
    )
}

fn build_revisions_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            owner text not null,
            collection text not null,
            revision bigint not null default 0,
            primary key (owner, collection)
        )
        ",
        table = qualified_name(schema, REVISIONS_TABLE),
    )
}

fn build_updated_at_index_sql(schema: &str) -> String {
    formatdoc!(
        "
        create index if not exists {index}
            on {table} (owner, collection, updated_at)
        ",
        index = quote_ident(UPDATED_AT_INDEX),
        table = qualified_name(schema, DOCUMENTS_TABLE),
    )
}

pub fn qualified_name(schema: &str, object: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(object))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}
