//! Backing store peer
//!
//! Holds file contents on its own thread and answers length-prefixed
//! frames over a Unix socket. Request body: `[op: u8][cookie: u64 LE][data]`
//! with op `b'R'` (read) or `b'W'` (replace contents). The reply carries
//! the same correlation id; its body is the contents for a read and empty
//! for a write.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use umfs::{Cookie, FrameBuffer, LengthPrefixed};

pub const OP_READ: u8 = b'R';
pub const OP_WRITE: u8 = b'W';

/// Frame asking the store for the contents of `cookie`
pub fn read_request(id: u64, cookie: Cookie) -> FrameBuffer {
    let mut body = vec![OP_READ];
    body.extend_from_slice(&cookie.0.to_le_bytes());
    LengthPrefixed::frame(id, &body)
}

/// Frame replacing the contents of `cookie` with `data`
pub fn write_request(id: u64, cookie: Cookie, data: &[u8]) -> FrameBuffer {
    let mut body = vec![OP_WRITE];
    body.extend_from_slice(&cookie.0.to_le_bytes());
    body.extend_from_slice(data);
    LengthPrefixed::frame(id, &body)
}

/// Serve `stream` until the mount closes its end
pub fn spawn(stream: UnixStream) -> io::Result<JoinHandle<io::Result<usize>>> {
    thread::Builder::new()
        .name("backing-store".into())
        .spawn(move || serve(stream))
}

fn serve(mut stream: UnixStream) -> io::Result<usize> {
    let mut files: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut served = 0;
    loop {
        let mut head = [0u8; 12];
        match stream.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(served),
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let id = u64::from_le_bytes(head[4..12].try_into().unwrap_or([0; 8]));
        let mut body = vec![0u8; len.saturating_sub(head.len())];
        stream.read_exact(&mut body)?;

        if body.len() < 9 {
            tracing::warn!(id, len, "short backing request");
            continue;
        }
        let cookie = u64::from_le_bytes(body[1..9].try_into().unwrap_or([0; 8]));
        let answer = match body[0] {
            OP_READ => files.get(&cookie).cloned().unwrap_or_default(),
            OP_WRITE => {
                files.insert(cookie, body[9..].to_vec());
                Vec::new()
            }
            op => {
                tracing::warn!(id, op, "unknown backing op");
                continue;
            }
        };
        stream.write_all(LengthPrefixed::frame(id, &answer).as_bytes())?;
        served += 1;
    }
}
