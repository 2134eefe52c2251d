//! String commands

use super::{parse_int, Commander};
use crate::connection::Connection;
use crate::server::Server;
use bytes::Bytes;
use std::sync::Arc;
use storage::metadata::now_secs;
use storage::string::RedisString;
use storage::Error;

fn redis_string(srv: &Arc<Server>, conn: &Connection) -> RedisString {
    RedisString::new(srv.storage.clone(), conn.namespace_or_default())
}

#[derive(Default)]
pub struct CommandGet {
    key: Bytes,
}

impl Commander for CommandGet {
    fn name(&self) -> &'static str {
        "get"
    }

    fn arity(&self) -> i32 {
        2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        match redis_string(srv, conn).get(&self.key) {
            Ok(Some(value)) => Ok(resp::bulk_string(&value)),
            Ok(None) => Ok(resp::null_bulk()),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// SET key value [EX seconds]
#[derive(Default)]
pub struct CommandSet {
    key: Bytes,
    value: Bytes,
    expire_seconds: Option<i64>,
}

impl Commander for CommandSet {
    fn name(&self) -> &'static str {
        "set"
    }

    fn arity(&self) -> i32 {
        -3
    }

    fn is_write(&self) -> bool {
        true
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        self.value = args[2].clone();
        match args.len() {
            3 => Ok(()),
            5 if args[3].eq_ignore_ascii_case(b"ex") => {
                let seconds = parse_int(&args[4])?;
                if seconds <= 0 {
                    return Err("invalid expire time".to_string());
                }
                self.expire_seconds = Some(seconds);
                Ok(())
            }
            _ => Err("syntax error".to_string()),
        }
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let string = redis_string(srv, conn);
        string
            .set(&self.key, &self.value)
            .map_err(|e| e.to_string())?;
        if let Some(seconds) = self.expire_seconds {
            let seconds = u32::try_from(seconds).unwrap_or(u32::MAX);
            let timestamp = now_secs().saturating_add(seconds);
            let db = storage::Database::new(srv.storage.clone(), conn.namespace_or_default());
            match db.expire(&self.key, timestamp) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(resp::simple_string("OK"))
    }
}
