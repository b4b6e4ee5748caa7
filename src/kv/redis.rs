use redis::{Client, Connection, RedisResult};
use std::sync::Mutex;
use tracing::warn;

use crate::error::ThrottlerError;
use crate::keys::validate_table_name;
use crate::kv::KvStore;

/// Atomically replaces a hash field when it still holds the expected value.
///
/// KEYS[1] = table hash, ARGV = field, expected, has_expected ("1"/"0"), value.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[3] == '1' then
    if current ~= ARGV[2] then return 0 end
elseif current then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
return 1
"#;

/// Networked backend: the table is a Redis hash and each row is one field.
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<Connection>>,
    table: String,
}

impl RedisStore {
    pub fn open(redis_url: &str, table: &str) -> Result<Self, ThrottlerError> {
        validate_table_name(table)?;

        let client = Client::open(redis_url)
            .map_err(|e| ThrottlerError::Store(format!("Failed to create Redis client: {}", e)))?;

        let store = Self {
            client,
            connection: Mutex::new(None),
            table: table.to_string(),
        };
        store.connect()?;
        store.ensure_table()?;

        Ok(store)
    }

    fn connect(&self) -> Result<(), ThrottlerError> {
        let conn = self.client.get_connection()
            .map_err(|e| ThrottlerError::Store(format!("Failed to connect to Redis: {}", e)))?;

        let mut connection_guard = self.connection.lock().map_err(|_| {
            ThrottlerError::Internal("Failed to acquire connection lock".into())
        })?;
        *connection_guard = Some(conn);

        Ok(())
    }

    /// The table key must be absent or a hash; anything else cannot hold rows.
    fn ensure_table(&self) -> Result<(), ThrottlerError> {
        let kind: String = self.query("TYPE", |conn| redis::cmd("TYPE").arg(&self.table).query(conn))?;

        match kind.as_str() {
            "none" | "hash" => Ok(()),
            other => Err(ThrottlerError::SchemaMismatch {
                table: self.table.clone(),
                detail: format!("key holds a Redis {}, expected a hash", other),
            }),
        }
    }

    /// Runs a command, reconnecting once if the connection was dropped.
    fn query<T>(
        &self,
        name: &str,
        run: impl Fn(&mut Connection) -> RedisResult<T>,
    ) -> Result<T, ThrottlerError> {
        let mut connection_guard = self.connection.lock().map_err(|_| {
            ThrottlerError::Internal("Failed to acquire connection lock".into())
        })?;

        if connection_guard.is_none() {
            *connection_guard = Some(self.client.get_connection()?);
        }

        let first = match connection_guard.as_mut() {
            Some(conn) => run(conn),
            None => return Err(ThrottlerError::Store("No Redis connection available".into())),
        };

        match first {
            Ok(value) => Ok(value),
            Err(e) if e.is_connection_dropped() || e.is_io_error() => {
                warn!(command = name, error = %e, "Redis connection lost, reconnecting");
                let mut conn = self.client.get_connection()
                    .map_err(|e| ThrottlerError::Store(format!("Failed to reconnect to Redis: {}", e)))?;
                let result = run(&mut conn)
                    .map_err(|e| ThrottlerError::Store(format!("{} failed: {}", name, e)));
                *connection_guard = Some(conn);
                result
            }
            Err(e) => Err(ThrottlerError::Store(format!("{} failed: {}", name, e))),
        }
    }

    fn eval_script<T>(&self, script: &str, keys: &[&str], args: &[&str]) -> Result<T, ThrottlerError>
    where
        T: redis::FromRedisValue,
    {
        self.query("EVAL", |conn| {
            let mut cmd = redis::cmd("EVAL");
            cmd.arg(script).arg(keys.len());

            for key in keys {
                cmd.arg(*key);
            }
            for arg in args {
                cmd.arg(*arg);
            }

            cmd.query(conn)
        })
    }
}

impl KvStore for RedisStore {
    fn table(&self) -> &str {
        &self.table
    }

    fn backend(&self) -> &'static str {
        "redis"
    }

    fn get(&self, key: &str) -> Result<Option<String>, ThrottlerError> {
        self.query("HGET", |conn| redis::cmd("HGET").arg(&self.table).arg(key).query(conn))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ThrottlerError> {
        self.query("HSET", |conn| {
            redis::cmd("HSET")
                .arg(&self.table)
                .arg(key)
                .arg(value)
                .query::<i64>(conn)
                .map(|_| ())
        })
    }

    fn delete(&self, key: &str) -> Result<bool, ThrottlerError> {
        self.query("HDEL", |conn| {
            redis::cmd("HDEL")
                .arg(&self.table)
                .arg(key)
                .query::<i32>(conn)
                .map(|deleted_count| deleted_count > 0)
        })
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, ThrottlerError> {
        let (has_expected, expected) = match expected {
            Some(expected) => ("1", expected),
            None => ("0", ""),
        };

        let written: i64 = self.eval_script(
            COMPARE_AND_SET_SCRIPT,
            &[&self.table],
            &[key, expected, has_expected, value],
        )?;

        Ok(written == 1)
    }

    fn ping(&self) -> Result<(), ThrottlerError> {
        let reply: String = self.query("PING", |conn| redis::cmd("PING").query(conn))?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(ThrottlerError::Store(format!("Unexpected PING reply: {}", reply)))
        }
    }
}
