//! Authenticated API connections and the process-wide connection pool.
//!
//! The binary API protocol itself lives outside this crate; what comes
//! in here is a factory producing [`ApiConnection`] handles (long-lived
//! authenticated sockets) and the pool that multiplexes them across
//! worker threads. Commands and results are passed as JSON values, the
//! shape the server's responses decode into anyway.

use crate::error::{FailClass, NetError, Result};
use crate::net::pool::Pool;
use crate::settings::{self, APIPOOL_MAXACTIVE, APIPOOL_MAXIDLE, APIPOOL_MAXIDLE_SECS};
use crate::status;
use serde_json::Value;
use std::io;

/// One authenticated socket to the API service.
pub trait ApiConnection: Send {
    /// Whether the connection was established over TLS.
    fn is_ssl(&self) -> bool;

    /// Send one command and block for its result object.
    fn send_command(&mut self, cmd: &str, params: &Value) -> io::Result<Value>;
}

pub type ApiFactory = Box<dyn Fn() -> Option<Box<dyn ApiConnection>> + Send + Sync>;

pub struct ApiPool {
    pool: Pool<Box<dyn ApiConnection>>,
}

impl ApiPool {
    pub fn new(factory: ApiFactory) -> ApiPool {
        Self::with_limits(factory, APIPOOL_MAXIDLE, APIPOOL_MAXACTIVE, APIPOOL_MAXIDLE_SECS)
    }

    pub fn with_limits(
        factory: ApiFactory,
        max_idle: usize,
        max_active: usize,
        max_idle_secs: u64,
    ) -> ApiPool {
        ApiPool {
            pool: Pool::new(factory, Box::new(drop), max_idle, max_active, max_idle_secs),
        }
    }

    /// Take a connection whose TLS mode matches the current setting.
    /// Cached handles in the stale mode are discarded until the pool
    /// yields a matching one or has to build one fresh. A `None` from
    /// an empty pool signals a probable outage.
    pub fn get(&self) -> Option<Box<dyn ApiConnection>> {
        self.get_for_mode(settings::use_ssl())
    }

    fn get_for_mode(&self, ssl: bool) -> Option<Box<dyn ApiConnection>> {
        match self.pool.get() {
            Some(mut conn) => {
                while conn.is_ssl() != ssl {
                    self.pool.release_bad(conn);
                    match self.pool.get() {
                        Some(next) => conn = next,
                        None => return None,
                    }
                }
                Some(conn)
            }
            None => {
                status::notify_timer_exception();
                None
            }
        }
    }

    pub fn release(&self, conn: Box<dyn ApiConnection>) {
        self.pool.release(conn);
    }

    pub fn release_bad(&self, conn: Box<dyn ApiConnection>) {
        self.pool.release_bad(conn);
    }

    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }
}

/// Classify a nonzero server result code.
pub fn handle_api_result(call: &'static str, code: u64) -> NetError {
    let class = match code {
        2000 => {
            status::set_auth_bad(true);
            status::notify_timer_exception();
            FailClass::Temporary
        }
        2003 | 2005 | 2009 => FailClass::Permanent,
        2007 => {
            tracing::error!("server refused {}: attempt to touch the root folder", call);
            FailClass::Permanent
        }
        _ => FailClass::Temporary,
    };
    NetError::Api { call, code, class }
}

/// Run one command over a pooled connection. A transport failure marks
/// the connection bad and signals a timer exception; a clean exchange
/// returns the raw result object with its `result` code still unchecked.
pub fn api_send(pool: &ApiPool, cmd: &'static str, params: Value) -> Result<Value> {
    let mut conn = pool.get().ok_or(NetError::NoConnection)?;
    match conn.send_command(cmd, &params) {
        Ok(res) => {
            pool.release(conn);
            Ok(res)
        }
        Err(e) => {
            pool.release_bad(conn);
            status::notify_timer_exception();
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeConn {
        ssl: bool,
        fail: bool,
    }

    impl ApiConnection for FakeConn {
        fn is_ssl(&self) -> bool {
            self.ssl
        }

        fn send_command(&mut self, _cmd: &str, params: &Value) -> io::Result<Value> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            Ok(json!({ "result": 0, "echo": params.clone() }))
        }
    }

    fn fake_pool(ssl: bool, fail: bool) -> ApiPool {
        ApiPool::with_limits(
            Box::new(move || Some(Box::new(FakeConn { ssl, fail }) as Box<dyn ApiConnection>)),
            4,
            4,
            600,
        )
    }

    #[test]
    fn send_releases_the_connection_for_reuse() {
        let pool = fake_pool(false, false);
        let res = api_send(&pool, "listfolder", json!({ "folderid": 0 })).unwrap();
        assert_eq!(res["result"], 0);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.pool.idle_count(), 1);
    }

    #[test]
    fn transport_failure_discards_and_signals() {
        let pool = fake_pool(false, true);
        let before = status::timer_exceptions();
        let err = api_send(&pool, "listfolder", json!({})).unwrap_err();
        assert!(err.is_temporary());
        assert_eq!(pool.outstanding(), 0);
        assert!(status::timer_exceptions() > before);
    }

    #[test]
    fn stale_tls_mode_handles_are_discarded() {
        // The factory only builds plaintext handles, so asking for TLS
        // must discard every one it produces and give up when the
        // factory comes up empty; asking for plaintext works again.
        let made = Arc::new(AtomicUsize::new(0));
        let m = made.clone();
        let pool = ApiPool::with_limits(
            Box::new(move || {
                if m.fetch_add(1, Ordering::SeqCst) == 3 {
                    None
                } else {
                    Some(Box::new(FakeConn { ssl: false, fail: false }) as Box<dyn ApiConnection>)
                }
            }),
            4,
            4,
            600,
        );
        assert!(pool.get_for_mode(true).is_none());
        assert_eq!(made.load(Ordering::SeqCst), 4);
        assert_eq!(pool.outstanding(), 0);

        // The right mode still works.
        let conn = pool.get_for_mode(false).unwrap();
        assert!(!conn.is_ssl());
        pool.release(conn);
    }

    #[test]
    fn result_codes_map_to_classes() {
        assert_eq!(handle_api_result("t", 2000).class(), FailClass::Temporary);
        assert_eq!(handle_api_result("t", 2003).class(), FailClass::Permanent);
        assert_eq!(handle_api_result("t", 2005).class(), FailClass::Permanent);
        assert_eq!(handle_api_result("t", 2007).class(), FailClass::Permanent);
        assert_eq!(handle_api_result("t", 2009).class(), FailClass::Permanent);
        assert_eq!(handle_api_result("t", 5000).class(), FailClass::Temporary);
        assert!(status::auth_bad());
    }
}
