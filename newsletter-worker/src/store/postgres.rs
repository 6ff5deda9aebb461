//! PostgreSQL-backed storage.
//!
//! Every trait method is a single statement addressed by primary key or by
//! one of the secondary indexes created in `migrations/`. The `verified`
//! column is a plain boolean; it is mapped to [`VerificationState`] here and
//! nowhere else.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::info;

use super::{BlobStore, ListRegistry, SubscriptionStore};
use crate::error::{Error, Result};
use crate::model::{Feed, List, ProcessedGuid, Subscription, VerificationState};

/// Storage for lists, subscriptions and content blobs on a Postgres pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct SubscriptionRow {
    list_name: String,
    email: String,
    verification_token: String,
    verified: bool,
    last_sent_verification: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            list: row.list_name,
            email: row.email,
            verification_token: row.verification_token,
            verification: if row.verified {
                VerificationState::Verified
            } else {
                VerificationState::Unverified
            },
            last_sent_verification: row.last_sent_verification,
        }
    }
}

#[derive(FromRow)]
struct ListRow {
    name: String,
    description: String,
    domain: String,
    from_address: String,
    reply_to_address: String,
}

#[derive(FromRow)]
struct FeedRow {
    list_name: String,
    url: String,
    last_updated: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct ProcessedRow {
    list_name: String,
    feed_url: String,
    guid: String,
    published_at: DateTime<Utc>,
}

const SUBSCRIPTION_COLUMNS: &str =
    "list_name, email, verification_token, verified, last_sent_verification";

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Transport(anyhow::Error::new(e).context(context))
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool of at most `max_connections` connections.
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("Failed to connect to Postgres")?;

        info!(max_connections = max_connections, "postgres_connected");

        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("postgres_migrations_applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn query_subscriptions(&self, filter: &str, value: &str) -> Result<Vec<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE {}",
            SUBSCRIPTION_COLUMNS, filter
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to query subscriptions"))?;

        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    /// Attach feeds and processed guids to a set of list rows.
    async fn hydrate_lists(&self, rows: Vec<ListRow>) -> Result<Vec<List>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let names: Vec<String> = rows.iter().map(|r| r.name.clone()).collect();

        let feed_rows: Vec<FeedRow> = sqlx::query_as(
            "SELECT list_name, url, last_updated FROM feeds \
             WHERE list_name = ANY($1) ORDER BY list_name, position, url",
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load feeds"))?;

        let processed_rows: Vec<ProcessedRow> = sqlx::query_as(
            "SELECT list_name, feed_url, guid, published_at FROM feed_processed_items \
             WHERE list_name = ANY($1) ORDER BY published_at",
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load processed items"))?;

        let mut processed: HashMap<(String, String), Vec<ProcessedGuid>> = HashMap::new();
        for row in processed_rows {
            processed
                .entry((row.list_name, row.feed_url))
                .or_default()
                .push(ProcessedGuid {
                    guid: row.guid,
                    published_at: row.published_at,
                });
        }

        let mut feeds: HashMap<String, Vec<Feed>> = HashMap::new();
        for row in feed_rows {
            let processed_guids = processed
                .remove(&(row.list_name.clone(), row.url.clone()))
                .unwrap_or_default();
            feeds.entry(row.list_name).or_default().push(Feed {
                url: row.url,
                last_updated: row.last_updated,
                processed_guids,
            });
        }

        Ok(rows
            .into_iter()
            .map(|row| List {
                feeds: feeds.remove(&row.name).unwrap_or_default(),
                name: row.name,
                description: row.description,
                domain: row.domain,
                from_address: row.from_address,
                reply_to_address: row.reply_to_address,
            })
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn get(&self, list: &str, email: &str) -> Result<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE list_name = $1 AND email = $2",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(list)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to fetch subscription"))?;

        Ok(row.map(Subscription::from))
    }

    async fn find_by_token(&self, token: &str) -> Result<Vec<Subscription>> {
        self.query_subscriptions("verification_token = $1", token)
            .await
    }

    async fn verified_for_list(&self, list: &str) -> Result<Vec<Subscription>> {
        self.query_subscriptions("list_name = $1 AND verified", list)
            .await
    }

    async fn find_by_email(&self, email: &str) -> Result<Vec<Subscription>> {
        self.query_subscriptions("email = $1", email).await
    }

    async fn put(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriptions \
                 (list_name, email, verification_token, verified, last_sent_verification) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (list_name, email) DO UPDATE SET \
                 verification_token = EXCLUDED.verification_token, \
                 verified = subscriptions.verified OR EXCLUDED.verified, \
                 last_sent_verification = EXCLUDED.last_sent_verification",
        )
        .bind(&subscription.list)
        .bind(&subscription.email)
        .bind(&subscription.verification_token)
        .bind(subscription.is_verified())
        .bind(subscription.last_sent_verification)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to store subscription"))?;

        Ok(())
    }

    async fn insert(&self, subscription: &Subscription) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO subscriptions \
                 (list_name, email, verification_token, verified, last_sent_verification) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (list_name, email) DO NOTHING",
        )
        .bind(&subscription.list)
        .bind(&subscription.email)
        .bind(&subscription.verification_token)
        .bind(subscription.is_verified())
        .bind(subscription.last_sent_verification)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to insert subscription"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, list: &str, email: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE list_name = $1 AND email = $2")
            .bind(list)
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to delete subscription"))?;

        if result.rows_affected() == 0 {
            return Err(Error::subscription_not_found(list, email));
        }
        Ok(())
    }

    async fn mark_verified(&self, list: &str, email: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET verified = TRUE WHERE list_name = $1 AND email = $2",
        )
        .bind(list)
        .bind(email)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to mark subscription verified"))?;

        if result.rows_affected() == 0 {
            return Err(Error::subscription_not_found(list, email));
        }
        Ok(())
    }

    async fn record_verification_sent(
        &self,
        list: &str,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET last_sent_verification = $3 \
             WHERE list_name = $1 AND email = $2",
        )
        .bind(list)
        .bind(email)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to record verification send"))?;

        if result.rows_affected() == 0 {
            return Err(Error::subscription_not_found(list, email));
        }
        Ok(())
    }
}

#[async_trait]
impl ListRegistry for PostgresStore {
    async fn get(&self, name: &str) -> Result<Option<List>> {
        let rows: Vec<ListRow> = sqlx::query_as(
            "SELECT name, description, domain, from_address, reply_to_address \
             FROM lists WHERE name = $1",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to fetch list"))?;

        Ok(self.hydrate_lists(rows).await?.into_iter().next())
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Vec<List>> {
        let rows: Vec<ListRow> = sqlx::query_as(
            "SELECT name, description, domain, from_address, reply_to_address \
             FROM lists WHERE domain = $1",
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to fetch lists by domain"))?;

        self.hydrate_lists(rows).await
    }

    async fn all(&self) -> Result<Vec<List>> {
        let rows: Vec<ListRow> = sqlx::query_as(
            "SELECT name, description, domain, from_address, reply_to_address \
             FROM lists ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to fetch lists"))?;

        self.hydrate_lists(rows).await
    }

    async fn set_watermark(&self, list: &str, feed_url: &str, at: DateTime<Utc>) -> Result<()> {
        let result =
            sqlx::query("UPDATE feeds SET last_updated = $3 WHERE list_name = $1 AND url = $2")
                .bind(list)
                .bind(feed_url)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(db_error("Failed to update feed watermark"))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                entity: "Feed",
                key: format!("{}/{}", list, feed_url),
            });
        }
        Ok(())
    }

    async fn mark_processed(
        &self,
        list: &str,
        feed_url: &str,
        guid: &str,
        published_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO feed_processed_items (list_name, feed_url, guid, published_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
        )
        .bind(list)
        .bind(feed_url)
        .bind(guid)
        .bind(published_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to mark item processed"))?;

        Ok(())
    }

    async fn prune_processed(
        &self,
        list: &str,
        feed_url: &str,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM feed_processed_items \
             WHERE list_name = $1 AND feed_url = $2 AND published_at < $3",
        )
        .bind(list)
        .bind(feed_url)
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to prune processed items"))?;

        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl BlobStore for PostgresStore {
    async fn put(&self, key: &str, body: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO content_blobs (hash, body) VALUES ($1, $2) ON CONFLICT (hash) DO NOTHING",
        )
        .bind(key)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to store content blob"))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT body FROM content_blobs WHERE hash = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to fetch content blob"))
    }
}
