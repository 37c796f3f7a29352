//! Shared counter store speaking the Redis protocol.
//!
//! Counters are fixed windows that start on their first hit. A batch of hits
//! runs as one Lua script, so it is applied atomically on the server or not at
//! all. Every call, including connecting, is bounded by a single timeout; any
//! failure surfaces as [`StoreError`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::{debug, warn};

use super::key::RateLimitKey;
use super::store::{window_end, CounterHit, CounterSource, CounterStore, WindowStats};
use crate::error::{Result, StoreError, TurnstileError};

/// KEYS are the counters. ARGV[1] is the amount, followed by one
/// (expiry ms, limit) pair per key. Returns a flat (count, pttl) list for
/// every key touched, stopping after the first count above its limit.
const INCR_SCRIPT: &str = r#"
local amount = tonumber(ARGV[1])
local result = {}
for i, key in ipairs(KEYS) do
    local current = redis.call('INCRBY', key, amount)
    if current == amount then
        redis.call('PEXPIRE', key, ARGV[i * 2])
    end
    result[#result + 1] = current
    result[#result + 1] = redis.call('PTTL', key)
    if current > tonumber(ARGV[i * 2 + 1]) then
        break
    end
end
return result
"#;

/// Keys fetched per SCAN round when resetting.
const SCAN_BATCH: usize = 500;

/// Counter store backed by a Redis-compatible server.
pub struct RedisStore {
    client: Client,
    /// Cached multiplexed connection; dropped after any failure. Never held
    /// while connecting.
    connection: Mutex<Option<MultiplexedConnection>>,
    timeout: Duration,
    incr_script: Script,
}

impl RedisStore {
    /// Create a store for `uri`. No connection is made until first use.
    pub fn new(uri: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(uri).map_err(|e| {
            TurnstileError::Config(format!("invalid storage uri {:?}: {}", uri, e))
        })?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            timeout,
            incr_script: Script::new(INCR_SCRIPT),
        })
    }

    async fn connection(&self) -> redis::RedisResult<MultiplexedConnection> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        debug!("Opening connection to rate limit storage");
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    fn forget_connection(&self) {
        self.connection.lock().take();
    }

    /// Connect if needed and run `op`, all within the configured timeout.
    /// The cached connection is dropped on failure so the next call
    /// reconnects.
    async fn run<T, F, Fut>(&self, op: F) -> std::result::Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let attempt = async {
            let conn = self.connection().await?;
            op(conn).await
        };

        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        if let Err(ref e) = result {
            warn!(error = %e, "Rate limit storage command failed");
            self.forget_connection();
        }
        result
    }
}

fn expiry_millis(expiry: Duration) -> i64 {
    i64::try_from(expiry.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    fn source(&self) -> CounterSource {
        CounterSource::Shared
    }

    async fn incr_many(
        &self,
        hits: &[CounterHit],
        amount: u64,
    ) -> std::result::Result<Vec<WindowStats>, StoreError> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut invocation = self.incr_script.prepare_invoke();
        invocation.arg(amount);
        for hit in hits {
            invocation
                .key(&hit.key)
                .arg(expiry_millis(hit.expiry))
                .arg(hit.limit);
        }
        let invocation = &invocation;

        let reply: Vec<i64> = self
            .run(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;

        if reply.len() % 2 != 0 {
            return Err(StoreError::Unavailable(format!(
                "malformed counter reply of length {}",
                reply.len()
            )));
        }

        let now = Utc::now();
        reply
            .chunks_exact(2)
            .map(|pair| {
                let count = u64::try_from(pair[0]).map_err(|_| {
                    StoreError::Unavailable(format!("malformed counter value {}", pair[0]))
                })?;
                // A missing expiry (-1) or vanished key (-2) means the window
                // is effectively over.
                let ttl = Duration::from_millis(pair[1].max(0) as u64);
                Ok(WindowStats {
                    count,
                    reset_at: window_end(now, ttl),
                })
            })
            .collect()
    }

    async fn check(&self) -> bool {
        let result: std::result::Result<String, StoreError> = self
            .run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await;
        result.is_ok()
    }

    /// Delete every limiter key, one SCAN batch at a time.
    async fn reset(&self) -> std::result::Result<(), StoreError> {
        let pattern = RateLimitKey::storage_pattern();
        let mut cursor: u64 = 0;
        let mut removed: usize = 0;

        loop {
            let pattern = &pattern;
            let (next, keys): (u64, Vec<String>) = self
                .run(|mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let keys = &keys;
                let _: i64 = self
                    .run(|mut conn| async move {
                        redis::cmd("DEL").arg(keys).query_async(&mut conn).await
                    })
                    .await?;
                removed += keys.len();
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(removed, "Rate limit storage reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Seen = Arc<Mutex<Vec<Vec<String>>>>;

    /// Split one RESP command array off the front of `buf`.
    fn parse_command(buf: &[u8]) -> Option<(Vec<String>, usize)> {
        fn line(buf: &[u8], at: usize) -> Option<(&[u8], usize)> {
            let end = buf[at..].windows(2).position(|w| w == b"\r\n")? + at;
            Some((&buf[at..end], end + 2))
        }

        let (header, mut at) = line(buf, 0)?;
        let count: usize = std::str::from_utf8(header.strip_prefix(b"*")?).ok()?.parse().ok()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let (len, start) = line(buf, at)?;
            let len: usize = std::str::from_utf8(len.strip_prefix(b"$")?).ok()?.parse().ok()?;
            let end = start + len;
            if buf.len() < end + 2 {
                return None;
            }
            args.push(String::from_utf8_lossy(&buf[start..end]).into_owned());
            at = end + 2;
        }
        Some((args, at))
    }

    fn bulk(value: &str) -> String {
        format!("${}\r\n{}\r\n", value.len(), value)
    }

    fn scan_page(cursor: &str, keys: &[&str]) -> String {
        let mut reply = format!("*2\r\n{}*{}\r\n", bulk(cursor), keys.len());
        for key in keys {
            reply.push_str(&bulk(key));
        }
        reply
    }

    /// Two SCAN pages holding three limiter keys.
    fn answer(args: &[String]) -> String {
        match args[0].to_ascii_uppercase().as_str() {
            "SCAN" if args[1] == "0" => scan_page(
                "17",
                &["LIMITER/a/1/1/second", "LIMITER/b/1/1/second"],
            ),
            "SCAN" => scan_page("0", &["LIMITER/c/1/1/second"]),
            "DEL" => format!(":{}\r\n", args.len() - 1),
            "PING" => "+PONG\r\n".to_string(),
            _ => "+OK\r\n".to_string(),
        }
    }

    /// A minimal Redis peer that records every command it receives.
    async fn scripted_store() -> (SocketAddr, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));

        let recorded = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some((args, used)) = parse_command(&buf) {
                            buf.drain(..used);
                            let reply = answer(&args);
                            recorded.lock().push(args);
                            if socket.write_all(reply.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        (addr, seen)
    }

    #[test]
    fn test_invalid_uri_is_configuration_error() {
        let result = RedisStore::new("not a uri", Duration::from_millis(100));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unavailable() {
        // Port 1 is reserved and nothing listens there.
        let store = RedisStore::new("redis://127.0.0.1:1/0", Duration::from_millis(200)).unwrap();

        let result = store.incr("k", Duration::from_secs(1), 1).await;
        assert!(matches!(
            result,
            Err(StoreError::Unavailable(_)) | Err(StoreError::Timeout(_))
        ));
        assert!(!store.check().await);
    }

    #[tokio::test]
    async fn test_silent_store_bounds_concurrent_latency() {
        // Accepts connections but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let timeout = Duration::from_millis(200);
        let store = Arc::new(RedisStore::new(&format!("redis://{}/0", addr), timeout).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let result = store.incr(&format!("k{}", i), Duration::from_secs(1), 1).await;
                (result, started.elapsed())
            }));
        }

        for handle in handles {
            let (result, elapsed) = handle.await.unwrap();
            assert!(result.is_err());
            assert!(
                elapsed < timeout * 3,
                "call took {:?} against a {:?} bound",
                elapsed,
                timeout
            );
        }
    }

    #[tokio::test]
    async fn test_reset_scans_in_batches() {
        let (addr, seen) = scripted_store().await;
        let store = RedisStore::new(&format!("redis://{}/0", addr), Duration::from_secs(2)).unwrap();

        store.reset().await.unwrap();

        let seen = seen.lock().clone();
        let named = |name: &str| -> Vec<Vec<String>> {
            seen.iter()
                .filter(|args| args[0].eq_ignore_ascii_case(name))
                .cloned()
                .collect()
        };

        assert!(named("KEYS").is_empty());
        assert!(named("EVAL").is_empty() && named("EVALSHA").is_empty());

        let scans = named("SCAN");
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0][1..], ["0", "MATCH", "LIMITER/*", "COUNT", "500"]);
        assert_eq!(scans[1][1], "17");

        let deleted: Vec<String> = named("DEL")
            .into_iter()
            .flat_map(|args| args.into_iter().skip(1))
            .collect();
        assert_eq!(
            deleted,
            vec!["LIMITER/a/1/1/second", "LIMITER/b/1/1/second", "LIMITER/c/1/1/second"]
        );
    }

    #[tokio::test]
    async fn test_health_check_pings() {
        let (addr, seen) = scripted_store().await;
        let store = RedisStore::new(&format!("redis://{}/0", addr), Duration::from_secs(2)).unwrap();

        assert!(store.check().await);
        assert!(seen.lock().iter().any(|args| args[0].eq_ignore_ascii_case("PING")));
    }

    #[test]
    fn test_expiry_millis_is_clamped() {
        assert_eq!(expiry_millis(Duration::ZERO), 1);
        assert_eq!(expiry_millis(Duration::from_secs(2)), 2000);
        assert_eq!(expiry_millis(Duration::MAX), i64::MAX);
    }

    #[test]
    fn test_source_is_shared() {
        let store = RedisStore::new("redis://127.0.0.1:6379/0", Duration::from_millis(100)).unwrap();
        assert_eq!(store.source(), CounterSource::Shared);
    }
}
