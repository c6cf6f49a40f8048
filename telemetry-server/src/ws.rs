use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Fixed GUID appended to the client key before hashing (RFC 6455 §4.2.2)
const WS_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the upgrade request head; anything larger is rejected
const MAX_HANDSHAKE_BYTES: usize = 8 * 1024;

/// Minimal WebSocket server for one-way telemetry fan-out.
///
/// Accepts TCP connections, performs the RFC 6455 upgrade handshake, and
/// broadcasts unmasked single text frames to every accepted client. Inbound
/// frames are never read; the engine takes no commands from clients.
pub struct WebSocketServer {
    port: u16,
    local_addr: Mutex<Option<SocketAddr>>,
    running: Arc<AtomicBool>,
    clients: Arc<Mutex<Vec<TcpStream>>>,
    accept_worker: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketServer {
    /// Port 0 binds an ephemeral port, reported by `local_addr`
    pub fn new(port: u16) -> Self {
        WebSocketServer {
            port,
            local_addr: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            clients: Arc::new(Mutex::new(Vec::new())),
            accept_worker: Mutex::new(None),
        }
    }

    /// Bind, listen, and spawn the accept thread. A second call while
    /// running is a no-op; bind/listen failure aborts the start.
    pub fn start(&self) -> io::Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let listener = match TcpListener::bind(("0.0.0.0", self.port)) {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        *self.local_addr.lock().unwrap() = Some(addr);

        let running = Arc::clone(&self.running);
        let clients = Arc::clone(&self.clients);
        *self.accept_worker.lock().unwrap() =
            Some(std::thread::spawn(move || accept_loop(listener, running, clients)));

        Ok(())
    }

    /// Stop accepting, join the accept thread, and close every client.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        // The accept thread blocks in the kernel; a loopback connection
        // wakes it so it can observe the cleared flag
        if let Some(addr) = *self.local_addr.lock().unwrap() {
            drop(TcpStream::connect(("127.0.0.1", addr.port())));
        }
        if let Some(worker) = self.accept_worker.lock().unwrap().take() {
            let _ = worker.join();
        }

        self.clients.lock().unwrap().clear();
    }

    /// Write one text frame carrying `payload` to every client. A client
    /// whose write fails is closed and forgotten in place.
    pub fn broadcast(&self, payload: &str) {
        let frame = text_frame(payload.as_bytes());

        let mut clients = self.clients.lock().unwrap();
        clients.retain_mut(|client| match client.write_all(&frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("dropping client after failed write: {}", e);
                false
            }
        });
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Actual bound address, available once `start` has succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    clients: Arc<Mutex<Vec<TcpStream>>>,
) {
    for stream in listener.incoming() {
        if !running.load(Ordering::Acquire) {
            break;
        }
        // Transient accept errors loop silently
        let Ok(stream) = stream else { continue };

        let clients = Arc::clone(&clients);
        let running = Arc::clone(&running);
        std::thread::spawn(move || {
            let mut stream = stream;
            match perform_handshake(&mut stream) {
                Ok(()) if running.load(Ordering::Acquire) => {
                    tracing::debug!("websocket client accepted");
                    clients.lock().unwrap().push(stream);
                }
                Ok(()) => {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                Err(e) => {
                    tracing::debug!("websocket handshake failed: {}", e);
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
        });
    }
}

/// Read the upgrade request head and answer `101 Switching Protocols`
fn perform_handshake(stream: &mut TcpStream) -> io::Result<()> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let read = stream.read(&mut buf)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            ));
        }
        request.extend_from_slice(&buf[..read]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if request.len() > MAX_HANDSHAKE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized upgrade request",
            ));
        }
    }

    let request = String::from_utf8_lossy(&request);
    let key = request
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("sec-websocket-key")
                .then(|| value.trim().to_string())
        })
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "missing Sec-WebSocket-Key header")
        })?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    );
    stream.write_all(response.as_bytes())
}

/// `base64(SHA1(client key + magic GUID))`
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build one server-to-client text frame: FIN set, opcode 1, no mask,
/// 7-bit / 16-bit / 64-bit length ladder
pub fn text_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 10);
    frame.push(0x81);
    if len <= 125 {
        frame.push(len as u8);
    } else if len <= 65_535 {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// Connect and upgrade, returning the raw post-handshake stream
    pub(crate) fn connect_client(server: &WebSocketServer) -> TcpStream {
        let addr = server.local_addr().expect("server not started");
        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        let request = format!(
            "GET / HTTP/1.1\r\n\
             Host: 127.0.0.1:{}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            addr.port()
        );
        stream.write_all(request.as_bytes()).unwrap();

        let response = read_until_blank_line(&mut stream);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        stream
    }

    fn read_until_blank_line(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut byte = [0u8; 1];
        while !data.windows(4).any(|w| w == b"\r\n\r\n") {
            let read = stream.read(&mut byte).unwrap();
            assert!(read > 0, "connection closed before handshake completed");
            data.push(byte[0]);
        }
        String::from_utf8(data).unwrap()
    }

    /// Read one text frame (7-bit or 16-bit length) from the stream
    pub(crate) fn read_text_frame(stream: &mut TcpStream) -> Option<String> {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).ok()?;
        assert_eq!(header[0], 0x81);
        let len = match header[1] {
            126 => {
                let mut ext = [0u8; 2];
                stream.read_exact(&mut ext).ok()?;
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                stream.read_exact(&mut ext).ok()?;
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).ok()?;
        Some(String::from_utf8(payload).unwrap())
    }

    pub(crate) fn wait_for_clients(server: &WebSocketServer, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.client_count() < n {
            assert!(Instant::now() < deadline, "timed out waiting for clients");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_frame_short_payload() {
        let frame = text_frame(b"hello");
        assert_eq!(&frame[..2], &[0x81, 0x05]);
        assert_eq!(&frame[2..], b"hello");
    }

    #[test]
    fn test_frame_extended_16bit_length() {
        let payload = vec![b'x'; 130];
        let frame = text_frame(&payload);
        assert_eq!(&frame[..4], &[0x81, 0x7E, 0x00, 0x82]);
        assert_eq!(&frame[4..], payload.as_slice());
        assert_eq!(frame.len(), 4 + 130);
    }

    #[test]
    fn test_frame_extended_64bit_length() {
        let payload = vec![b'x'; 70_000];
        let frame = text_frame(&payload);
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 127);
        assert_eq!(&frame[2..10], &70_000u64.to_be_bytes());
        assert_eq!(frame.len(), 10 + 70_000);
    }

    #[test]
    fn test_frame_boundary_lengths() {
        assert_eq!(text_frame(&[0u8; 125])[1], 125);
        assert_eq!(&text_frame(&[0u8; 126])[1..4], &[126, 0x00, 0x7E]);
        assert_eq!(&text_frame(&[0u8; 65_535])[1..4], &[126, 0xFF, 0xFF]);
        assert_eq!(text_frame(&[0u8; 65_536])[1], 127);
    }

    #[test]
    fn test_handshake_round_trip() {
        let server = WebSocketServer::new(0);
        server.start().unwrap();

        let _client = connect_client(&server);
        wait_for_clients(&server, 1);
        assert_eq!(server.client_count(), 1);

        server.stop();
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_handshake_rejects_missing_key() {
        let server = WebSocketServer::new(0);
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();

        // The server closes the socket without accepting the client
        let mut buf = [0u8; 64];
        let read = stream.read(&mut buf).unwrap_or(0);
        assert_eq!(read, 0);
        assert_eq!(server.client_count(), 0);

        server.stop();
    }

    #[test]
    fn test_broadcast_reaches_client() {
        let server = WebSocketServer::new(0);
        server.start().unwrap();

        let mut client = connect_client(&server);
        wait_for_clients(&server, 1);

        server.broadcast("hello");
        assert_eq!(read_text_frame(&mut client).unwrap(), "hello");

        server.stop();
    }

    #[test]
    fn test_broadcast_drops_dead_client() {
        let server = WebSocketServer::new(0);
        server.start().unwrap();

        let client = connect_client(&server);
        wait_for_clients(&server, 1);
        client.shutdown(Shutdown::Both).unwrap();
        drop(client);

        // The first write may land in the kernel buffer; keep broadcasting
        // until the failure is observed
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.client_count() > 0 {
            assert!(Instant::now() < deadline, "dead client never dropped");
            server.broadcast("ping");
            std::thread::sleep(Duration::from_millis(10));
        }

        server.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let server = WebSocketServer::new(0);
        server.start().unwrap();
        server.stop();
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn test_double_start_is_noop() {
        let server = WebSocketServer::new(0);
        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        server.start().unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        server.stop();
    }
}
