//! Bitmap commands

use super::{parse_bit_offset, parse_int, Commander};
use crate::connection::Connection;
use crate::server::Server;
use bytes::Bytes;
use std::sync::Arc;
use storage::bitmap::Bitmap;

fn bitmap(srv: &Arc<Server>, conn: &Connection) -> Bitmap {
    Bitmap::new(srv.storage.clone(), conn.namespace_or_default())
}

#[derive(Default)]
pub struct CommandGetBit {
    key: Bytes,
    offset: u32,
}

impl Commander for CommandGetBit {
    fn name(&self) -> &'static str {
        "getbit"
    }

    fn arity(&self) -> i32 {
        3
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        self.offset = parse_bit_offset(&args[2])?;
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let bit = bitmap(srv, conn)
            .get_bit(&self.key, self.offset)
            .map_err(|e| e.to_string())?;
        Ok(resp::integer(i64::from(bit)))
    }
}

#[derive(Default)]
pub struct CommandSetBit {
    key: Bytes,
    offset: u32,
    bit: bool,
}

impl Commander for CommandSetBit {
    fn name(&self) -> &'static str {
        "setbit"
    }

    fn arity(&self) -> i32 {
        4
    }

    fn is_write(&self) -> bool {
        true
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        self.offset = parse_bit_offset(&args[2])?;
        self.bit = match args[3].as_ref() {
            b"0" => false,
            b"1" => true,
            _ => return Err("bit is not an integer or out of range".to_string()),
        };
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let old_bit = bitmap(srv, conn)
            .set_bit(&self.key, self.offset, self.bit)
            .map_err(|e| e.to_string())?;
        Ok(resp::integer(i64::from(old_bit)))
    }
}

/// BITCOUNT key [start stop]
#[derive(Default)]
pub struct CommandBitCount {
    key: Bytes,
    start: i64,
    stop: i64,
}

impl Commander for CommandBitCount {
    fn name(&self) -> &'static str {
        "bitcount"
    }

    fn arity(&self) -> i32 {
        -2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        match args.len() {
            2 => {
                self.start = 0;
                self.stop = -1;
                Ok(())
            }
            4 => {
                self.start = parse_int(&args[2])?;
                self.stop = parse_int(&args[3])?;
                Ok(())
            }
            _ => Err("syntax error".to_string()),
        }
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let count = bitmap(srv, conn)
            .bit_count(&self.key, self.start, self.stop)
            .map_err(|e| e.to_string())?;
        Ok(resp::integer(count as i64))
    }
}

/// BITPOS key bit [start [stop]]
#[derive(Default)]
pub struct CommandBitPos {
    key: Bytes,
    bit: bool,
    start: i64,
    stop: Option<i64>,
}

impl Commander for CommandBitPos {
    fn name(&self) -> &'static str {
        "bitpos"
    }

    fn arity(&self) -> i32 {
        -3
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        self.bit = match args[2].as_ref() {
            b"0" => false,
            b"1" => true,
            _ => return Err("bit is not an integer or out of range".to_string()),
        };
        self.start = 0;
        if args.len() > 3 {
            self.start = parse_int(&args[3])?;
        }
        if args.len() > 4 {
            self.stop = Some(parse_int(&args[4])?);
        }
        if args.len() > 5 {
            return Err("syntax error".to_string());
        }
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let pos = bitmap(srv, conn)
            .bit_pos(&self.key, self.bit, self.start, self.stop)
            .map_err(|e| e.to_string())?;
        Ok(resp::integer(pos))
    }
}
