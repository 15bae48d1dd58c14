//! Forum topics of the broadcast group, cached for a short TTL so a fan-out
//! does not hit the database every time. Every write forces a reload.
use crate::db::{self, Pool, Topic};
use crate::dispatch::DestinationSet;
use crate::model::TargetScope;
use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

struct Cached {
    topics: Vec<Topic>,
    loaded_at: Instant,
}

pub struct TopicRegistry {
    pool: Pool,
    chat_id: i64,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
}

impl TopicRegistry {
    pub fn new(pool: Pool, chat_id: i64, ttl: Duration) -> Self {
        Self {
            pool,
            chat_id,
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// Topics in registry order, served from cache while fresh.
    pub async fn topics(&self) -> Result<Vec<Topic>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.topics.clone());
            }
        }
        let topics = db::list_topics(&self.pool).await?;
        debug!(count = topics.len(), "loaded topics");
        *cache = Some(Cached {
            topics: topics.clone(),
            loaded_at: Instant::now(),
        });
        Ok(topics)
    }

    /// Drop the cache and reload from the database.
    pub async fn refresh(&self) -> Result<Vec<Topic>> {
        self.cache.lock().await.take();
        self.topics().await
    }

    pub async fn find(&self, name: &str) -> Result<Option<Topic>> {
        Ok(self
            .topics()
            .await?
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(name)))
    }

    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, thread_id: i32) -> Result<()> {
        db::create_topic(&self.pool, name, thread_id).await?;
        info!("topic created");
        self.refresh().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<bool> {
        let changed = db::rename_topic(&self.pool, old_name, new_name).await?;
        self.refresh().await?;
        Ok(changed)
    }

    #[instrument(skip(self))]
    pub async fn set_thread_id(&self, name: &str, thread_id: i32) -> Result<bool> {
        let changed = db::set_topic_thread_id(&self.pool, name, thread_id).await?;
        self.refresh().await?;
        Ok(changed)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let changed = db::delete_topic(&self.pool, name).await?;
        self.refresh().await?;
        Ok(changed)
    }

    /// Build the destinations for one dispatch.
    pub async fn destinations(&self, scope: &TargetScope) -> Result<DestinationSet> {
        match scope {
            TargetScope::All => Ok(DestinationSet::all(self.chat_id, &self.topics().await?)),
            TargetScope::General => Ok(DestinationSet::general(self.chat_id)),
            TargetScope::Topic(name) => {
                let topic = self
                    .find(name)
                    .await?
                    .ok_or_else(|| anyhow!("unknown topic {}", name))?;
                Ok(DestinationSet::topic(self.chat_id, &topic))
            }
        }
    }
}
