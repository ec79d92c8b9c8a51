//! Length-prefixed transport and operation dispatch for the reward service.
//!
//! Every message on the wire is a 4-byte big-endian length followed by that
//! many bytes of CBOR-encoded [`Packet`]. A connection carries exactly one
//! request/response exchange; the server closes the stream after replying.
//!
//! Two serve loops are provided and dispatch identically: a blocking
//! thread-per-connection variant, and a non-blocking variant in which each
//! connection runs as a task on the tokio runtime's worker pool. In both,
//! a connection's write begins only after its read and dispatch complete,
//! while the accept loop re-arms immediately after each accept.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::Issuer;
use crate::cbor::{
    self, CborError, PID_AGGREGATE_VERIFY, PID_BLIND_SIGN, PID_FETCH_G1, PID_FETCH_G2,
    PID_FETCH_PUBLIC_KEY, PID_VERIFY, Packet,
};

/// Designed receive capacity: comfortably holds a batch of ~100 aggregated
/// receipts. Larger frames are still honored, but flagged.
pub const RECV_CAPACITY: usize = 32 * 1024;

/// Transport errors. Cryptographic invalidity is never an error here; it
/// travels back as the `isValid` flag of a successful response.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("codec: {0}")]
    Codec(#[from] CborError),
    /// Fatal for the connection: no response is defined for an unknown pid.
    #[error("unknown operation id {0}")]
    UnknownOperation(u32),
    #[error("connection closed before a response arrived")]
    Disconnected,
}

/// Authorization hook consulted before the main operations. Returning false
/// turns the request into a refused response without touching the engine.
pub type AuthHook = dyn Fn(&Packet) -> bool + Send + Sync;

/// The issuer-side server. Bind once, then drive it with either serve loop.
pub struct Server {
    listener: TcpListener,
    engine: Arc<Issuer>,
    auth: Option<Arc<AuthHook>>,
}

impl Server {
    /// Binds the listener. The engine is shared with the caller so the same
    /// ledger serves every connection.
    pub fn bind(addr: impl ToSocketAddrs, engine: Arc<Issuer>) -> io::Result<Self> {
        Ok(Server {
            listener: TcpListener::bind(addr)?,
            engine,
            auth: None,
        })
    }

    /// Installs the authorization hook.
    pub fn auth_hook(mut self, hook: impl Fn(&Packet) -> bool + Send + Sync + 'static) -> Self {
        self.auth = Some(Arc::new(hook));
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocking serve loop: one OS thread per accepted connection, running
    /// until the process exits. Accept failures are logged and the loop
    /// keeps going.
    pub fn serve_blocking(self) -> Result<(), Error> {
        let Server {
            listener,
            engine,
            auth,
        } = self;
        info!(addr = ?listener.local_addr().ok(), "reward server listening (blocking)");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let engine = Arc::clone(&engine);
                    let auth = auth.clone();
                    thread::spawn(move || {
                        if let Err(e) = serve_connection(stream, &engine, auth.as_deref()) {
                            error!(error = %e, "connection failed");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
        Ok(())
    }

    /// Non-blocking serve loop: each connection becomes a task on the tokio
    /// runtime's worker pool, so many exchanges are in flight while the
    /// accept loop keeps accepting.
    pub async fn serve(self) -> Result<(), Error> {
        let Server {
            listener,
            engine,
            auth,
        } = self;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        info!(addr = ?listener.local_addr().ok(), "reward server listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let engine = Arc::clone(&engine);
                    let auth = auth.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection_async(stream, &engine, auth.as_deref()).await
                        {
                            error!(%peer, error = %e, "connection failed");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    }
}

/// One-shot blocking exchange: connect, send the request, return the single
/// response. Retries are the caller's responsibility.
pub fn request(addr: impl ToSocketAddrs, packet: &Packet) -> Result<Packet, Error> {
    let mut stream = TcpStream::connect(addr)?;
    write_frame(&mut stream, &packet.to_cbor()?)?;
    let frame = read_frame(&mut stream)?.ok_or(Error::Disconnected)?;
    Ok(Packet::from_cbor(&frame)?)
}

/// One-shot async exchange.
pub async fn request_async(
    addr: impl tokio::net::ToSocketAddrs,
    packet: &Packet,
) -> Result<Packet, Error> {
    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    write_frame_async(&mut stream, &packet.to_cbor()?).await?;
    let frame = read_frame_async(&mut stream)
        .await?
        .ok_or(Error::Disconnected)?;
    Ok(Packet::from_cbor(&frame)?)
}

/// Maps a request packet to the engine call its pid names and builds the
/// response. Responses echo the request pid. Unknown pids are an error; the
/// serve loops tear the connection down without replying.
pub fn dispatch(engine: &Issuer, auth: Option<&AuthHook>, request: &Packet) -> Result<Packet, Error> {
    match request.pid {
        PID_BLIND_SIGN | PID_VERIFY | PID_AGGREGATE_VERIFY | PID_FETCH_PUBLIC_KEY
            if auth.is_some_and(|hook| !hook(request)) =>
        {
            Ok(Packet::refused())
        }
        PID_BLIND_SIGN => {
            let h = cbor::decode_g1(required(&request.e1)?)?;
            let psi = engine.blind_sign(&h);
            Ok(Packet {
                pid: request.pid,
                e1: Some(cbor::encode_g1(&psi)),
                ..Packet::default()
            })
        }
        PID_VERIFY => {
            let sigma = cbor::decode_g1(required(&request.e1)?)?;
            let serial = required(&request.e2)?;
            let y = cbor::decode_g2(required(&request.e3)?)?;
            let valid = engine.verifier().verify(&sigma, serial, &y);
            Ok(Packet {
                pid: request.pid,
                is_valid: Some(valid),
                ..Packet::default()
            })
        }
        PID_AGGREGATE_VERIFY => Ok(Packet {
            pid: request.pid,
            is_valid: Some(aggregate_verify(engine, request)?),
            ..Packet::default()
        }),
        PID_FETCH_PUBLIC_KEY => Ok(Packet {
            pid: request.pid,
            e1: Some(cbor::encode_g2(engine.public().y2())),
            e2: Some(cbor::encode_g1(engine.public().y1())),
            ..Packet::default()
        }),
        PID_FETCH_G1 => Ok(Packet {
            pid: request.pid,
            e1: Some(cbor::encode_g1(engine.params().g1())),
            ..Packet::default()
        }),
        PID_FETCH_G2 => Ok(Packet {
            pid: request.pid,
            e1: Some(cbor::encode_g2(engine.params().g2())),
            ..Packet::default()
        }),
        pid => Err(Error::UnknownOperation(pid)),
    }
}

fn aggregate_verify(engine: &Issuer, request: &Packet) -> Result<bool, Error> {
    let sigma_agg = cbor::decode_g1(required(&request.e1)?)?;
    let mut serials = Vec::new();
    for entry in request.e_list1.as_deref().unwrap_or(&[]) {
        match entry {
            Some(bytes) => serials.push(bytes.clone()),
            // A sparse entry is representable on the wire but names no
            // serial; the batch cannot verify.
            None => return Ok(false),
        }
    }
    let mut keys = Vec::new();
    for entry in request.e_list2.as_deref().unwrap_or(&[]) {
        match entry {
            Some(bytes) => keys.push(cbor::decode_g2(bytes)?),
            None => return Ok(false),
        }
    }
    Ok(engine.verifier().aggregate_verify(&sigma_agg, &serials, &keys))
}

fn required(field: &Option<Vec<u8>>) -> Result<&[u8], CborError> {
    field
        .as_deref()
        .ok_or(CborError::InvalidStructure("missing element field"))
}

fn serve_connection(
    mut stream: TcpStream,
    engine: &Issuer,
    auth: Option<&AuthHook>,
) -> Result<(), Error> {
    let Some(frame) = read_frame(&mut stream)? else {
        return Ok(());
    };
    let request = Packet::from_cbor(&frame)?;
    match dispatch(engine, auth, &request) {
        Ok(response) => write_frame(&mut stream, &response.to_cbor()?),
        Err(Error::UnknownOperation(pid)) => {
            error!(pid, "unexpected operation id, dropping connection");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn serve_connection_async(
    mut stream: tokio::net::TcpStream,
    engine: &Issuer,
    auth: Option<&AuthHook>,
) -> Result<(), Error> {
    let Some(frame) = read_frame_async(&mut stream).await? else {
        return Ok(());
    };
    let request = Packet::from_cbor(&frame)?;
    match dispatch(engine, auth, &request) {
        Ok(response) => write_frame_async(&mut stream, &response.to_cbor()?).await,
        Err(Error::UnknownOperation(pid)) => {
            error!(pid, "unexpected operation id, dropping connection");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn read_frame(stream: &mut impl Read) -> Result<Option<Vec<u8>>, Error> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    // A zero length means "no message"; nothing is handed to the codec.
    if len == 0 {
        return Ok(None);
    }
    if len > RECV_CAPACITY {
        warn!(len, capacity = RECV_CAPACITY, "frame exceeds designed receive capacity");
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame)?;
    Ok(Some(frame))
}

fn write_frame(stream: &mut impl Write, frame: &[u8]) -> Result<(), Error> {
    stream.write_all(&(frame.len() as u32).to_be_bytes())?;
    stream.write_all(frame)?;
    stream.flush()?;
    Ok(())
}

async fn read_frame_async<R>(stream: &mut R) -> Result<Option<Vec<u8>>, Error>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > RECV_CAPACITY {
        warn!(len, capacity = RECV_CAPACITY, "frame exceeds designed receive capacity");
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

async fn write_frame_async<W>(stream: &mut W, frame: &[u8]) -> Result<(), Error>
where
    W: AsyncWriteExt + Unpin,
{
    stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}
