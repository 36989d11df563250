//! Minimal HTTP/1.1 responder built from a TCP handle and the framing parser.
//!
//! ```text
//! cargo run --example http_hello -- 127.0.0.1:8080
//! curl -v http://127.0.0.1:8080/anything
//! ```
//!
//! `RUST_LOG=uvwire=debug` shows the bridge's own events.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uvwire::http::{HandlerResult, HeadersInfo, MessageType, Parser, ParserHandler};
use uvwire::{
    AnyHandle, CapabilityToken, Completion, Handle, Listener, ReactorContext, ReadEvent, Readable,
    Reactor, ReactorConfig, TcpHandle, Writable,
};

/// Requests completed by the last `execute`, with their keep-alive flag.
#[derive(Default)]
struct Exchange {
    url: Option<String>,
    keep_alive: bool,
    ready: Vec<(String, bool)>,
}

impl ParserHandler for Exchange {
    fn on_headers_complete(&mut self, info: HeadersInfo) -> HandlerResult<bool> {
        self.url = info.url;
        self.keep_alive = info.should_keep_alive;
        Ok(false)
    }

    fn on_message_complete(&mut self) -> HandlerResult<()> {
        let url = self.url.take().unwrap_or_default();
        self.ready.push((url, self.keep_alive));
        Ok(())
    }
}

fn respond(conn: &TcpHandle, status: &str, body: &str, keep_alive: bool) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{body}",
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    let done = if keep_alive {
        Completion::discard()
    } else {
        let closer = conn.clone();
        Completion::new(move |_| closer.close_with(Completion::discard()))
    };
    if let Err(err) = conn.write_with(Bytes::from(response), done) {
        warn!(%err, "write failed");
    }
}

fn serve(conn: TcpHandle) {
    let mut parser = Parser::new(MessageType::Request);
    let mut exchange = Exchange::default();
    let handle = conn.clone();
    conn.on_read(move |event| {
        let data = match event {
            ReadEvent::Data(data) => data,
            ReadEvent::Eof => {
                if let Err(err) = parser.finish(&mut exchange) {
                    warn!(%err, "connection ended mid-request");
                }
                handle.close_with(Completion::discard());
                return;
            }
            ReadEvent::Error(err) => {
                warn!(%err, "read failed");
                handle.close_with(Completion::discard());
                return;
            }
        };

        let result = parser.execute(&mut exchange, &data);
        for (url, keep_alive) in exchange.ready.drain(..) {
            info!(%url, keep_alive, "request");
            respond(&handle, "200 OK", &format!("hello from {url}\n"), keep_alive);
        }
        if let Err(err) = result {
            warn!(%err, "bad request");
            respond(&handle, "400 Bad Request", "bad request\n", false);
        }
    });
}

fn start(ctx: &ReactorContext, addr: SocketAddr) -> uvwire::Result<()> {
    let server = TcpHandle::new(ctx, CapabilityToken::all())?;
    server.bind(addr)?;
    server.on_connection(|conn| match conn {
        Ok(AnyHandle::Tcp(conn)) => serve(conn),
        Ok(_) => {}
        Err(err) => warn!(%err, "accept failed"),
    });
    server.listen_default()?;
    info!(addr = %server.local_addr()?, "listening");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_owned())
        .parse()?;
    let mut reactor = Reactor::new(ReactorConfig::from_env()?)?;
    reactor.run(|ctx| {
        if let Err(err) = start(ctx, addr) {
            warn!(%err, "server failed to start");
        }
    })?;
    Ok(())
}
