//! Shared fixtures for the integration tests: configuration planes on a
//! temporary directory, PEM material, a recording notifier and a one-shot
//! loopback HTTP server standing in for the update service.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use purser::device::Platform;
use purser::{ConfigPaths, Notifier};
use tempfile::TempDir;

/// Configuration planes rooted in a temporary directory.
pub struct Planes {
    pub dir: TempDir,
}

impl Planes {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn paths(&self) -> ConfigPaths {
        ConfigPaths {
            user: self.path("purser.ini"),
            defaults: self.path("purser-defaults.ini"),
            repos: self.path("repos.ini"),
            board_map: self.path("board-mappings.ini"),
        }
    }

    /// Write raw INI content to one of the planes.
    pub fn write(&self, name: &str, content: &str) {
        std::fs::write(self.path(name), content).unwrap();
    }

    /// Write a CA certificate PEM and return its path as a string.
    pub fn write_ca(&self) -> String {
        let path = self.path("ca.pem");
        std::fs::write(&path, ca_pem()).unwrap();
        path.to_str().unwrap().to_string()
    }
}

/// A self-signed certificate PEM usable as a trust root.
pub fn ca_pem() -> String {
    rcgen::generate_simple_self_signed(vec!["su.example".to_string()])
        .unwrap()
        .serialize_pem()
        .unwrap()
}

/// A certificate/key PEM pair as the update service would provision it.
pub fn device_pem_pair() -> (String, String) {
    let keypair = rcgen::generate_simple_self_signed(vec!["device".to_string()]).unwrap();
    (
        keypair.serialize_pem().unwrap(),
        keypair.serialize_private_key_pem(),
    )
}

/// Notifier recording every event it sees.
#[derive(Default)]
pub struct Recorder {
    events: Rc<RefCell<Vec<&'static str>>>,
}

impl Recorder {
    pub fn handle(&self) -> Rc<RefCell<Vec<&'static str>>> {
        Rc::clone(&self.events)
    }
}

impl Notifier for Recorder {
    fn on_registration_changed(&self) {
        self.events.borrow_mut().push("registration");
    }
    fn on_credentials_changed(&self) {
        self.events.borrow_mut().push("credentials");
    }
    fn on_flavour_changed(&self) {
        self.events.borrow_mut().push("flavour");
    }
    fn on_done(&self) {
        self.events.borrow_mut().push("done");
    }
}

/// Count occurrences of one event name.
pub fn count(events: &Rc<RefCell<Vec<&'static str>>>, name: &str) -> usize {
    events.borrow().iter().filter(|e| **e == name).count()
}

/// Platform fake with a stable unique device id and no modem.
pub struct BenchPlatform;

impl Platform for BenchPlatform {
    fn imei(&self) -> String {
        String::new()
    }
    fn model_name(&self) -> String {
        String::new()
    }
    fn unique_device_id(&self) -> String {
        "feedfacecafebeef".to_string()
    }
}

/// Serve exactly one HTTP request with a canned XML body, then exit.
///
/// Returns the base URL of the listener and the server thread handle.
pub fn serve_once(body: String) -> (String, thread::JoinHandle<()>) {
    serve_once_with_status(200, body)
}

/// Serve exactly one HTTP request with the given status code and body.
pub fn serve_once_with_status(status: u16, body: String) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            drain_request(&mut stream);
            let reason = if status == 200 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\n\
                 Content-Type: text/xml\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });

    (format!("http://{}", addr), handle)
}

/// Allocate a port with nothing listening on it.
pub fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Read the request head plus a Content-Length body, if any.
fn drain_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = headers_end(&buf) {
                    let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                    let content_length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    let mut body_read = buf.len() - (end + 4);
                    while body_read < content_length {
                        match stream.read(&mut chunk) {
                            Ok(0) | Err(_) => return,
                            Ok(n) => body_read += n,
                        }
                    }
                    return;
                }
            }
        }
    }
}

fn headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
