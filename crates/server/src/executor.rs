//! Command executor
//!
//! Runs a batch of parsed commands on their connection in arrival order:
//! auth gate, lookup, loading gate, arity, parse, read-only gate, then
//! instrumented execution.

use crate::commands::{self, Commander};
use crate::connection::Connection;
use crate::server::Server;
use bytes::Bytes;
use rocksdb::perf::{PerfContext, PerfStatsLevel};
use std::sync::Arc;
use std::time::Instant;
use storage::DEFAULT_NAMESPACE;
use tracing::error;

/// Commands accepted while restoring from a backup
fn in_command_allow_list(cmd_name: &str) -> bool {
    cmd_name == "auth"
}

pub fn execute_commands(srv: &Arc<Server>, conn: &mut Connection, commands: Vec<Vec<Bytes>>) {
    for cmd_tokens in commands {
        if conn.is_close_after_reply() {
            break;
        }
        let Some(first) = cmd_tokens.first() else {
            continue;
        };
        let cmd_name = String::from_utf8_lossy(first).to_lowercase();

        if conn.namespace().is_none() {
            let requirepass = srv.config.read().requirepass.clone();
            if !requirepass.is_empty() && cmd_name != "auth" {
                conn.reply(resp::error("NOAUTH Authentication required."));
                continue;
            }
            conn.become_admin();
            conn.set_namespace(DEFAULT_NAMESPACE);
        }

        let Some(mut cmd) = commands::lookup_command(&cmd_name) else {
            conn.reply(resp::error("ERR unknown command"));
            continue;
        };
        if srv.is_loading() && !in_command_allow_list(cmd.name()) {
            conn.reply(resp::error("ERR restoring the db from backup"));
            break;
        }

        let arity = cmd.arity();
        let tokens = cmd_tokens.len() as i32;
        if (arity > 0 && tokens != arity) || (arity < 0 && tokens < -arity) {
            conn.reply(resp::error("ERR wrong number of arguments"));
            continue;
        }
        if let Err(msg) = cmd.parse(&cmd_tokens) {
            conn.reply(resp::error(&format!("ERR {}", msg)));
            continue;
        }
        if srv.config.read().slave_readonly && srv.is_slave() && cmd.is_write() {
            conn.reply(resp::error(
                "READONLY You can't write against a read only slave.",
            ));
            continue;
        }

        conn.set_last_cmd(cmd.name());
        srv.stats.incr_calls(cmd.name());
        let start = Instant::now();
        let is_profiling = turn_on_profiling_if_need(srv, cmd.name());
        srv.incr_executing_commands();
        let result = cmd.execute(srv, conn);
        srv.decr_executing_commands();
        let duration_us = start.elapsed().as_micros() as u64;
        if is_profiling {
            record_profiling_sample_if_need(srv, cmd.name(), duration_us);
        }
        srv.slowlog_push_entry_if_needed(&cmd_tokens, duration_us);
        srv.stats.incr_latency(cmd.name(), duration_us);
        srv.feed_monitor_conns(conn, &cmd_tokens);

        match result {
            Err(msg) => {
                error!(
                    "[request] failed to execute command: {}, err: {}",
                    cmd.name(),
                    msg
                );
                conn.reply(resp::error(&format!("ERR {}", msg)));
            }
            Ok(reply) => {
                if !reply.is_empty() {
                    conn.reply(reply);
                }
            }
        }
    }
}

fn turn_on_profiling_if_need(srv: &Arc<Server>, cmd_name: &str) -> bool {
    let config = srv.config.read();
    let profiling = &config.profiling;
    if profiling.sample_ratio == 0 {
        return false;
    }
    if !profiling.sample_all_commands && !profiling.sample_commands.contains(cmd_name) {
        return false;
    }
    if profiling.sample_ratio == 100 || rand::random::<u32>() % 100 <= profiling.sample_ratio {
        rocksdb::perf::set_perf_stats(PerfStatsLevel::EnableTimeExceptForMutex);
        let mut context = PerfContext::default();
        context.reset();
        return true;
    }
    false
}

fn record_profiling_sample_if_need(srv: &Arc<Server>, cmd_name: &str, duration_us: u64) {
    let threshold_ms = srv.config.read().profiling.sample_record_threshold_ms;
    if threshold_ms > 0 && duration_us / 1000 < u64::from(threshold_ms) {
        rocksdb::perf::set_perf_stats(PerfStatsLevel::Disable);
        return;
    }

    let context = PerfContext::default();
    let perf_context = context.report(true);
    rocksdb::perf::set_perf_stats(PerfStatsLevel::Disable);
    // a command that issued no engine operation produces an empty report
    if perf_context.is_empty() {
        return;
    }
    srv.perf_log.push_entry(crate::perflog::PerfEntry {
        cmd_name: cmd_name.to_string(),
        duration_us,
        perf_context,
        iostats_context: String::new(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use storage::{Storage, MIB};

    fn test_server(configure: impl FnOnce(&mut Config)) -> (Arc<Server>, String) {
        let dir = format!("/tmp/redrock_executor_test_{}", rand::random::<u64>());
        let mut config = Config::default();
        config.storage.db_dir = format!("{}/db", dir).into();
        config.storage.backup_dir = format!("{}/backup", dir).into();
        config.storage.rocksdb.metadata_block_cache_size = 16 * MIB;
        config.storage.rocksdb.subkey_block_cache_size = 16 * MIB;
        config.storage.rocksdb.write_buffer_size = 16 * MIB;
        configure(&mut config);
        let storage = Arc::new(Storage::new(config.storage.clone()));
        storage.open().unwrap();
        (Server::new(config, storage), dir)
    }

    fn cleanup(srv: Arc<Server>, dir: &str) {
        srv.storage.close();
        let _ = std::fs::remove_dir_all(dir);
    }

    fn run(srv: &Arc<Server>, conn: &mut Connection, tokens: &[&str]) -> Vec<u8> {
        let cmd: Vec<Bytes> = tokens
            .iter()
            .map(|t| Bytes::from(t.to_string()))
            .collect();
        execute_commands(srv, conn, vec![cmd]);
        conn.take_reply()
    }

    #[test]
    fn test_ping_and_call_stats() {
        let (srv, dir) = test_server(|_| {});
        let mut conn = Connection::new("test".to_string());
        assert_eq!(run(&srv, &mut conn, &["PING"]), b"+PONG\r\n");
        assert_eq!(srv.stats.calls("ping"), 1);
        cleanup(srv, &dir);
    }

    #[test]
    fn test_unknown_command_and_arity() {
        let (srv, dir) = test_server(|_| {});
        let mut conn = Connection::new("test".to_string());
        assert_eq!(
            run(&srv, &mut conn, &["NOSUCH"]),
            b"-ERR unknown command\r\n"
        );
        assert_eq!(
            run(&srv, &mut conn, &["GET"]),
            b"-ERR wrong number of arguments\r\n"
        );
        assert_eq!(
            run(&srv, &mut conn, &["GET", "a", "b"]),
            b"-ERR wrong number of arguments\r\n"
        );
        cleanup(srv, &dir);
    }

    #[test]
    fn test_auth_gate() {
        let (srv, dir) = test_server(|c| c.requirepass = "x".to_string());
        let mut conn = Connection::new("test".to_string());
        let reply = run(&srv, &mut conn, &["GET", "a"]);
        assert!(reply.starts_with(b"-NOAUTH"));

        let reply = run(&srv, &mut conn, &["AUTH", "wrong"]);
        assert!(reply.starts_with(b"-ERR invalid password"));

        assert_eq!(run(&srv, &mut conn, &["AUTH", "x"]), b"+OK\r\n");
        assert!(conn.is_admin());
        assert_eq!(run(&srv, &mut conn, &["GET", "a"]), b"$-1\r\n");
        cleanup(srv, &dir);
    }

    #[test]
    fn test_auth_with_namespace_token() {
        let (srv, dir) = test_server(|c| {
            c.requirepass = "adminpass".to_string();
            c.tokens.insert("usertoken".to_string(), "ns1".to_string());
        });
        let mut conn = Connection::new("test".to_string());
        assert_eq!(run(&srv, &mut conn, &["AUTH", "usertoken"]), b"+OK\r\n");
        assert!(!conn.is_admin());
        assert_eq!(conn.namespace(), Some("ns1"));
        cleanup(srv, &dir);
    }

    #[test]
    fn test_loading_gate() {
        let (srv, dir) = test_server(|_| {});
        srv.set_loading(true);
        let mut conn = Connection::new("test".to_string());
        assert_eq!(
            run(&srv, &mut conn, &["GET", "a"]),
            b"-ERR restoring the db from backup\r\n"
        );
        srv.set_loading(false);
        assert_eq!(run(&srv, &mut conn, &["GET", "a"]), b"$-1\r\n");
        cleanup(srv, &dir);
    }

    #[test]
    fn test_readonly_slave_gate() {
        let (srv, dir) = test_server(|_| {});
        srv.set_slave(true);
        let mut conn = Connection::new("test".to_string());
        let reply = run(&srv, &mut conn, &["SET", "a", "1"]);
        assert!(reply.starts_with(b"-READONLY"));
        // reads still pass
        assert_eq!(run(&srv, &mut conn, &["GET", "a"]), b"$-1\r\n");
        cleanup(srv, &dir);
    }

    #[test]
    fn test_string_and_bitmap_interplay() {
        let (srv, dir) = test_server(|_| {});
        let mut conn = Connection::new("test".to_string());
        assert_eq!(run(&srv, &mut conn, &["SET", "foo", "bar"]), b"+OK\r\n");
        // MSB of 'b' (0x62) is 0
        assert_eq!(run(&srv, &mut conn, &["GETBIT", "foo", "0"]), b":0\r\n");
        assert_eq!(run(&srv, &mut conn, &["GETBIT", "foo", "1"]), b":1\r\n");
        assert_eq!(run(&srv, &mut conn, &["SETBIT", "foo", "7", "1"]), b":0\r\n");
        assert_eq!(run(&srv, &mut conn, &["GET", "foo"]), b"$3\r\ncar\r\n");
        cleanup(srv, &dir);
    }

    #[test]
    fn test_bitmap_commands() {
        let (srv, dir) = test_server(|_| {});
        let mut conn = Connection::new("test".to_string());
        assert_eq!(run(&srv, &mut conn, &["SETBIT", "b", "7", "1"]), b":0\r\n");
        assert_eq!(run(&srv, &mut conn, &["SETBIT", "b", "7", "1"]), b":1\r\n");
        assert_eq!(run(&srv, &mut conn, &["GETBIT", "b", "7"]), b":1\r\n");
        assert_eq!(run(&srv, &mut conn, &["BITCOUNT", "b"]), b":1\r\n");
        assert_eq!(run(&srv, &mut conn, &["BITPOS", "b", "1"]), b":7\r\n");
        assert_eq!(
            run(&srv, &mut conn, &["SETBIT", "b", "notanum", "1"]),
            b"-ERR bit offset is not an integer or out of range\r\n"
        );
        cleanup(srv, &dir);
    }

    #[test]
    fn test_keyspace_commands() {
        let (srv, dir) = test_server(|_| {});
        let mut conn = Connection::new("test".to_string());
        run(&srv, &mut conn, &["SET", "k1", "v"]);
        run(&srv, &mut conn, &["SET", "k2", "v"]);
        assert_eq!(run(&srv, &mut conn, &["EXISTS", "k1", "k2", "k3"]), b":2\r\n");
        assert_eq!(run(&srv, &mut conn, &["TYPE", "k1"]), b"+string\r\n");
        assert_eq!(run(&srv, &mut conn, &["TTL", "k1"]), b":-1\r\n");
        assert_eq!(run(&srv, &mut conn, &["EXPIRE", "k1", "100"]), b":1\r\n");
        assert_eq!(run(&srv, &mut conn, &["DEL", "k1"]), b":1\r\n");
        assert_eq!(run(&srv, &mut conn, &["EXISTS", "k1"]), b":0\r\n");
        assert_eq!(
            run(&srv, &mut conn, &["KEYS", "*"]),
            b"*1\r\n$2\r\nk2\r\n"
        );
        assert_eq!(run(&srv, &mut conn, &["DBSIZE"]), b":1\r\n");
        assert_eq!(run(&srv, &mut conn, &["FLUSHDB"]), b"+OK\r\n");
        assert_eq!(run(&srv, &mut conn, &["DBSIZE"]), b":0\r\n");
        cleanup(srv, &dir);
    }

    #[test]
    fn test_scan_pagination() {
        let (srv, dir) = test_server(|_| {});
        let mut conn = Connection::new("test".to_string());
        for key in ["a1", "a2", "a3"] {
            run(&srv, &mut conn, &["SET", key, "v"]);
        }
        let reply = run(&srv, &mut conn, &["SCAN", "0", "COUNT", "2"]);
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("a1") && text.contains("a2"));
        assert!(!text.contains("a3"));

        let reply = run(&srv, &mut conn, &["SCAN", "a2"]);
        let text = String::from_utf8(reply).unwrap();
        assert!(text.contains("a3"));
        cleanup(srv, &dir);
    }
}
