//! Remote session-negotiation server
//!
//! A length-free binary protocol over TCP: each command starts with a 4-byte
//! little-endian code. `0x01` (negotiate) carries width (i32), height (i32)
//! and frame rate (f32), and is acknowledged with a single byte once the
//! stream had time to start. `0xFF` ends the stream. `0x00` is reserved.
//!
//! Commands never touch capture state from the client thread; they post
//! closures onto the driver's [`TickQueue`].

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::dispatch::TickQueue;
use crate::{loge, logi};

pub const CMD_RESERVED: u32 = 0x00;
pub const CMD_NEGOTIATE_STREAM: u32 = 0x01;
pub const CMD_EXIT: u32 = 0xFF;

/// The driver-side operations the protocol can invoke. Implemented by the
/// application state that owns the [`StreamCapture`](crate::capture::StreamCapture).
pub trait StreamControl: Send + 'static {
    fn begin_stream(&mut self, width: u32, height: u32, frame_rate: f32);
    fn end_stream(&mut self);
}

pub struct ControlServer {
    listener: TcpListener,
    settle: Duration,
}

impl ControlServer {
    /// Bind the control port. `settle` is the delay between posting a
    /// negotiate command and acknowledging it (the encoder needs time to
    /// start before the peer begins relying on the stream).
    pub fn bind(port: u16, settle: Duration) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("failed to bind control port {port}"))?;
        Ok(Self { listener, settle })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("control listener has no local address")
    }

    /// Block until one client connects, then serve it on its own thread.
    pub fn accept_one<S: StreamControl>(&self, queue: TickQueue<S>) -> Result<JoinHandle<()>> {
        let (stream, peer) = self
            .listener
            .accept()
            .context("failed to accept control client")?;
        logi!("CONTROL", "control client connected from {peer}");

        let settle = self.settle;
        thread::Builder::new()
            .name("control_client".to_string())
            .spawn(move || client_loop(stream, queue, settle))
            .context("failed to spawn control client thread")
    }
}

fn client_loop<S: StreamControl>(mut stream: TcpStream, queue: TickQueue<S>, settle: Duration) {
    loop {
        let code = match read_u32_le(&mut stream) {
            Ok(code) => code,
            Err(_) => {
                logi!("CONTROL", "control client disconnected");
                return;
            }
        };

        match code {
            CMD_RESERVED => loge!("CONTROL", "received reserved command 0x00"),
            CMD_NEGOTIATE_STREAM => {
                if negotiate(&mut stream, &queue, settle).is_err() {
                    logi!("CONTROL", "control client lost during negotiation");
                    return;
                }
            }
            CMD_EXIT => queue.post(|s: &mut S| s.end_stream()),
            other => {
                // A stray value here means the previous read desynchronized
                // from the peer; there is no way to resynchronize a
                // length-free protocol, so drop the connection.
                loge!("CONTROL", "unknown command {other:#010x}; closing connection");
                return;
            }
        }
    }
}

fn negotiate<S: StreamControl>(
    stream: &mut TcpStream,
    queue: &TickQueue<S>,
    settle: Duration,
) -> io::Result<()> {
    let width = read_u32_le(stream)? as i32;
    let height = read_u32_le(stream)? as i32;
    let frame_rate = f32::from_le_bytes(read_exact_4(stream)?);
    logi!("CONTROL", "negotiate request: {width}x{height} @{frame_rate}");

    let (width, height) = (width.max(0) as u32, height.max(0) as u32);
    queue.post(move |s: &mut S| s.begin_stream(width, height, frame_rate));

    // Give the encoder process time to start before acknowledging.
    thread::sleep(settle);

    // The peer expects a single nonzero byte as the acknowledgement.
    stream.write_all(&[1])?;
    stream.flush()
}

fn read_u32_le(stream: &mut TcpStream) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact_4(stream)?))
}

fn read_exact_4(stream: &mut TcpStream) -> io::Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tick_queue;

    #[derive(Default)]
    struct Recorded {
        begins: Vec<(u32, u32, f32)>,
        ends: u32,
    }

    impl StreamControl for Recorded {
        fn begin_stream(&mut self, width: u32, height: u32, frame_rate: f32) {
            self.begins.push((width, height, frame_rate));
        }
        fn end_stream(&mut self) {
            self.ends += 1;
        }
    }

    #[test]
    fn negotiate_and_exit_round_trip() {
        let server = ControlServer::bind(0, Duration::from_millis(5)).unwrap();
        let addr = server.local_addr().unwrap();
        let (queue, runner) = tick_queue::<Recorded>();

        let accept = thread::spawn(move || server.accept_one(queue).unwrap());

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&CMD_NEGOTIATE_STREAM.to_le_bytes()).unwrap();
        client.write_all(&640i32.to_le_bytes()).unwrap();
        client.write_all(&360i32.to_le_bytes()).unwrap();
        client.write_all(&30.0f32.to_le_bytes()).unwrap();

        // The ack arrives only after the settle delay, and only after the
        // begin command was posted.
        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).unwrap();
        assert_eq!(ack[0], 1);

        let mut state = Recorded::default();
        runner.run_pending(&mut state);
        assert_eq!(state.begins, vec![(640, 360, 30.0)]);

        client.write_all(&CMD_EXIT.to_le_bytes()).unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(100));
        runner.run_pending(&mut state);
        assert_eq!(state.ends, 1);

        drop(client);
        accept.join().unwrap().join().unwrap();
    }

    #[test]
    fn unknown_command_drops_the_connection() {
        let server = ControlServer::bind(0, Duration::from_millis(1)).unwrap();
        let addr = server.local_addr().unwrap();
        let (queue, _runner) = tick_queue::<Recorded>();

        let accept = thread::spawn(move || server.accept_one(queue).unwrap());

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&0xDEADu32.to_le_bytes()).unwrap();

        // Server closes its end; the next read observes EOF.
        let client_thread = accept.join().unwrap();
        client_thread.join().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
