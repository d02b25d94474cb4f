use crate::{IsolatedFrame, PreviewSlot};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_PREVIEW_HOST: &str = "127.0.0.1";
pub const DEFAULT_PREVIEW_PORT: u16 = 4173;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewServerConfig {
    pub host: String,
    pub port: u16,
    pub frame: IsolatedFrame,
}

impl Default for PreviewServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PREVIEW_HOST.to_string(),
            port: DEFAULT_PREVIEW_PORT,
            frame: IsolatedFrame::default(),
        }
    }
}

#[derive(Debug)]
pub struct PreviewServer {
    addr: SocketAddr,
    url: String,
    stop_tx: mpsc::Sender<()>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl PreviewServer {
    pub fn start(config: &PreviewServerConfig, slot: PreviewSlot) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).with_context(|| {
            format!(
                "failed binding preview server on {}:{}",
                config.host, config.port
            )
        })?;
        listener
            .set_nonblocking(true)
            .context("failed setting listener nonblocking mode")?;
        let addr = listener
            .local_addr()
            .context("failed reading listener local address")?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let frame = config.frame;
        let join_handle = thread::Builder::new()
            .name("esai-preview".to_string())
            .spawn(move || serve(listener, stop_rx, slot, frame))
            .context("failed spawning preview server thread")?;

        let url = format!("http://{}:{}/", config.host, addr.port());
        info!("preview server listening on {url}");
        Ok(Self {
            addr,
            url,
            stop_tx,
            join_handle: Some(join_handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
            info!("preview server stopped ({})", self.url);
        }
    }
}

impl Drop for PreviewServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(
    listener: TcpListener,
    stop_rx: mpsc::Receiver<()>,
    slot: PreviewSlot,
    frame: IsolatedFrame,
) {
    loop {
        if stop_rx.try_recv().is_ok() {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_connection(stream, &slot, &frame) {
                    warn!("preview request from {peer} failed: {err:#}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(40));
            }
            Err(err) => {
                warn!("preview listener failed: {err}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn write_http_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
    head_only: bool,
) -> Result<()> {
    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");

    let mut bytes = response.into_bytes();
    if !head_only {
        bytes.extend_from_slice(body);
    }
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

fn handle_connection(mut stream: TcpStream, slot: &PreviewSlot, frame: &IsolatedFrame) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut buffer = [0_u8; 8_192];
    let read = stream.read(&mut buffer)?;
    if read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..read]);
    let Some(first_line) = request.lines().next() else {
        return Ok(());
    };
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let raw_path = parts.next().unwrap_or("/");
    let head_only = method.eq_ignore_ascii_case("HEAD");
    debug!("preview request {method} {raw_path}");

    if !method.eq_ignore_ascii_case("GET") && !head_only {
        return write_http_response(
            &mut stream,
            "405 Method Not Allowed",
            "text/plain; charset=utf-8",
            &[("Allow", "GET, HEAD")],
            b"Method Not Allowed",
            head_only,
        );
    }

    let path = raw_path.split('?').next().unwrap_or("/");
    match path {
        "/" | "/index.html" => write_http_response(
            &mut stream,
            "200 OK",
            "text/html; charset=utf-8",
            &[("Cache-Control", "no-store")],
            frame.host_page().as_bytes(),
            head_only,
        ),
        "/frame" => {
            let target = slot.current();
            let body = IsolatedFrame::frame_document(target.as_ref());
            write_http_response(
                &mut stream,
                "200 OK",
                "text/html; charset=utf-8",
                &IsolatedFrame::frame_headers(),
                body.as_bytes(),
                head_only,
            )
        }
        "/status" => {
            let target = slot.current();
            let body = IsolatedFrame::status_json(target.as_ref(), slot.revision());
            write_http_response(
                &mut stream,
                "200 OK",
                "application/json; charset=utf-8",
                &[("Cache-Control", "no-store")],
                body.as_bytes(),
                head_only,
            )
        }
        _ => write_http_response(
            &mut stream,
            "404 Not Found",
            "text/plain; charset=utf-8",
            &[],
            b"Not Found",
            head_only,
        ),
    }
}
