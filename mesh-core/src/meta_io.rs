//! Meta I/O (C4), spec §4.1. Framing and buffering for the newline-delimited,
//! optionally symmetrically-encrypted TCP control stream — independent of
//! the actual socket, so it is unit-testable without a runtime. The reactor
//! (C10) owns the real `tokio::net::TcpStream` and feeds bytes in here.

use crate::error::{Error, Result};
use crate::model::connection::Connection;

pub const MAXBUFSIZE: usize = 128 * 1024;

/// A complete frame pulled off the inbound buffer: either a request line
/// destined for C5's parser, or the opaque payload of a `PACKET` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    Packet(Vec<u8>),
}

/// Append `bytes` to `conn`'s outbound buffer (spec §4.1 `send`), encrypting
/// in place first if `encrypt_out` is set. Never blocks — the reactor
/// decides when to call `flush`.
pub fn send(conn: &mut Connection, bytes: &[u8]) -> Result<()> {
    conn.queue_send(bytes)
}

/// Enqueue `bytes` to every connection in `targets` except `exclude_id`
/// (spec §4.1 `broadcast`).
pub fn broadcast<'a>(targets: impl Iterator<Item = &'a mut Connection>, exclude_id: u64, bytes: &[u8]) -> Result<()> {
    for c in targets {
        if c.id == exclude_id || !c.flags.active {
            continue;
        }
        c.queue_send(bytes)?;
    }
    Ok(())
}

/// Drain as much of the outbound ring buffer into `sink` as it accepts.
/// Returns the number of bytes actually written; a would-block leaves the
/// remainder queued for the next readiness (spec §4.1 `flush`).
pub fn flush<W: std::io::Write>(conn: &mut Connection, sink: &mut W) -> Result<usize> {
    if conn.outbound.is_empty() {
        return Ok(0);
    }
    let chunk: Vec<u8> = conn.outbound.iter().copied().collect();
    loop {
        match sink.write(&chunk) {
            Ok(n) => {
                for _ in 0..n {
                    conn.outbound.pop_front();
                }
                return Ok(n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Feed newly-read bytes into the inbound buffer, decrypting in place if
/// `decrypt_in` is set, then pull out as many complete frames as are
/// present (spec §4.1 `receive`). Returns the frames in arrival order.
///
/// Buffer discipline: exceeding `MAXBUFSIZE` without completing a frame is
/// fatal to the connection (spec §4.1, §8 property 7).
pub fn receive(conn: &mut Connection, new_bytes: &[u8]) -> Result<Vec<Frame>> {
    let plaintext = if conn.flags.encrypt_in {
        let cipher = conn.inbound_decrypt.as_ref().expect("encrypt_in set without a cipher installed");
        let pt = cipher.decrypt(conn.in_seq, new_bytes)?;
        conn.in_seq = conn.in_seq.wrapping_add(1);
        pt
    } else {
        new_bytes.to_vec()
    };

    conn.inbound.extend_from_slice(&plaintext);
    if conn.inbound.len() > MAXBUFSIZE {
        return Err(Error::BufferOverflow);
    }

    let mut frames = Vec::new();
    loop {
        if let Some(want) = conn.tcplen {
            if conn.inbound.len() - conn.inbound_read_pos < want {
                break;
            }
            let start = conn.inbound_read_pos;
            let payload = conn.inbound[start..start + want].to_vec();
            conn.inbound_read_pos += want;
            conn.tcplen = None;
            frames.push(Frame::Packet(payload));
        } else {
            let rest = &conn.inbound[conn.inbound_read_pos..];
            match rest.iter().position(|&b| b == b'\n') {
                None => break,
                Some(nl) => {
                    let line = String::from_utf8_lossy(&rest[..nl]).trim_end_matches('\r').to_string();
                    conn.inbound_read_pos += nl + 1;
                    frames.push(Frame::Line(line));
                }
            }
        }
    }

    compact(conn);
    Ok(frames)
}

/// Begin consuming `len` opaque bytes as a `PACKET` frame payload (spec
/// §4.1(b), §6 "PACKET is followed by a length...").
pub fn begin_tcp_packet(conn: &mut Connection, len: usize) {
    conn.tcplen = Some(len);
}

fn compact(conn: &mut Connection) {
    if conn.inbound_read_pos == 0 {
        return;
    }
    if conn.inbound_read_pos == conn.inbound.len() {
        conn.inbound.clear();
    } else {
        conn.inbound.drain(0..conn.inbound_read_pos);
    }
    conn.inbound_read_pos = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(1, "127.0.0.1:655".parse().unwrap(), true, 64 * 1024)
    }

    #[test]
    fn receive_splits_newline_framed_lines() {
        let mut c = conn();
        let frames = receive(&mut c, b"0 hello\n1 world\n").unwrap();
        assert_eq!(frames, vec![Frame::Line("0 hello".into()), Frame::Line("1 world".into())]);
    }

    #[test]
    fn receive_holds_partial_line_until_newline_arrives() {
        let mut c = conn();
        assert!(receive(&mut c, b"0 hel").unwrap().is_empty());
        let frames = receive(&mut c, b"lo\n").unwrap();
        assert_eq!(frames, vec![Frame::Line("0 hello".into())]);
    }

    #[test]
    fn tcp_packet_mode_consumes_exact_length_then_resumes_lines() {
        let mut c = conn();
        begin_tcp_packet(&mut c, 3);
        let frames = receive(&mut c, b"abc17 PING\n").unwrap();
        assert_eq!(frames, vec![Frame::Packet(b"abc".to_vec()), Frame::Line("17 PING".into())]);
    }

    #[test]
    fn overflow_without_frame_boundary_is_fatal() {
        let mut c = conn();
        let huge = vec![b'x'; MAXBUFSIZE + 1];
        assert!(matches!(receive(&mut c, &huge), Err(Error::BufferOverflow)));
    }

    #[test]
    fn broadcast_skips_source_and_inactive_connections() {
        let mut a = conn();
        a.id = 1;
        a.flags.active = true;
        let mut b = conn();
        b.id = 2;
        b.flags.active = true;
        let mut inactive = conn();
        inactive.id = 3;
        let mut conns = vec![a, b, inactive];
        broadcast(conns.iter_mut(), 1, b"10 PING\n").unwrap();
        assert!(conns[0].outbound.is_empty());
        assert_eq!(conns[1].outbound.len(), 9);
        assert!(conns[2].outbound.is_empty());
    }
}
