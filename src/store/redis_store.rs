//! Redis-backed store.
//!
//! Routines are sent as Lua scripts. `redis::Script` tries `EVALSHA` first and
//! falls back to `EVAL` when the server has not cached the script yet; Redis
//! runs each script to completion before serving any other command, which is
//! what makes an admission call atomic.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{IntoConnectionInfo, Script, Value};
use tracing::{info, trace};

use super::{Reply, Routine, Store, StoreError};

/// A store backed by a Redis server or cluster.
///
/// Generic over the async connection so the same store works with a
/// single-node [`ConnectionManager`] or a [`ClusterConnection`].
pub struct RedisStore<C = ConnectionManager> {
    connection: C,
    scripts: DashMap<&'static str, Arc<Script>>,
}

impl RedisStore<ConnectionManager> {
    /// Connect to a single Redis node.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self::new(connection))
    }
}

impl RedisStore<ClusterConnection> {
    /// Connect to a Redis Cluster through its seed nodes.
    pub async fn connect_cluster<T>(nodes: Vec<T>) -> Result<Self, StoreError>
    where
        T: IntoConnectionInfo,
    {
        let client = ClusterClient::new(nodes)?;
        let connection = client.get_async_connection().await?;
        info!("Connected to Redis Cluster");
        Ok(Self::new(connection))
    }
}

impl<C> RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    /// Wrap an existing connection.
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            scripts: DashMap::new(),
        }
    }

    fn script(&self, routine: &Routine) -> Arc<Script> {
        self.scripts
            .entry(routine.name())
            .or_insert_with(|| Arc::new(Script::new(routine.source())))
            .clone()
    }
}

#[async_trait]
impl<C> Store for RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn eval(&self, routine: &Routine, key: &str, argv: &[String]) -> Result<Reply, StoreError> {
        let script = self.script(routine);
        let mut connection = self.connection.clone();

        let mut invocation = script.key(key);
        for arg in argv {
            invocation.arg(arg.as_str());
        }

        trace!(key = %key, routine = routine.name(), "Invoking script");

        let value: Value = invocation.invoke_async(&mut connection).await?;
        Ok(reply_from_value(value))
    }
}

fn reply_from_value(value: Value) -> Reply {
    match value {
        Value::Int(n) => Reply::Integer(n),
        Value::Nil => Reply::Nil,
        Value::BulkString(bytes) => Reply::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Value::SimpleString(s) => Reply::Text(s),
        Value::Okay => Reply::Text("OK".to_string()),
        other => Reply::Other(format!("{:?}", other)),
    }
}
