//! Line-protocol server.
//!
//! A thin adapter over [`Caskdb`]: clients send one command per line
//! (`SET key value`, `GET key`, `DEL key`) and receive one line back
//! (`OK`, the value, or `ERR <message>`). Each connection gets its own
//! thread; all of them share one read-write store handle.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use log::{debug, error, info};

use crate::db::{Caskdb, ConfigOpt};
use crate::error::Result;

const ERR_ARGS: &str = "invalid number of arguments passed";

/// TCP server exposing the store over the line protocol.
pub struct Server {
    db: Arc<Caskdb>,
    listener: TcpListener,
}

impl Server {
    /// Opens the datastore at `path` read-write and binds the listening
    /// socket. Port 0 asks the OS for an ephemeral port.
    pub fn new(path: impl AsRef<Path>, port: u16) -> Result<Self> {
        let db = Caskdb::open(path, &[ConfigOpt::ReadWrite])?;
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Ok(Self {
            db: Arc::new(db),
            listener,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts clients until the process exits, one thread per
    /// connection.
    pub fn serve(&self) -> Result<()> {
        info!("listening on {}", self.listener.local_addr()?);
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let db = Arc::clone(&self.db);
                    thread::spawn(move || {
                        if let Err(e) = handle_client(&db, stream) {
                            debug!("client connection ended: {e}");
                        }
                    });
                }
                Err(e) => error!("accept failed: {e}"),
            }
        }
        Ok(())
    }
}

fn handle_client(db: &Caskdb, mut stream: TcpStream) -> Result<()> {
    debug!("client connected: {}", stream.peer_addr()?);
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let reply = respond(db, line.trim_end_matches(['\r', '\n']));
        stream.write_all(&reply)?;
    }
}

/// Executes one command line and renders the reply, newline included.
fn respond(db: &Caskdb, line: &str) -> Vec<u8> {
    let mut parts = line.splitn(3, ' ');
    let cmd = parts.next().unwrap_or_default().to_ascii_uppercase();
    let key = parts.next();
    let value = parts.next();

    let outcome = match cmd.as_str() {
        "SET" => match (key, value) {
            (Some(key), Some(value)) => db
                .put(key.as_bytes().to_vec(), value.as_bytes().to_vec())
                .map(|_| b"OK".to_vec()),
            _ => return err_line(ERR_ARGS),
        },
        "GET" => match (key, value) {
            (Some(key), None) => db.get(key.as_bytes()),
            _ => return err_line(ERR_ARGS),
        },
        "DEL" => match (key, value) {
            (Some(key), None) => db.delete(key.as_bytes().to_vec()).map(|_| b"OK".to_vec()),
            _ => return err_line(ERR_ARGS),
        },
        _ => return err_line(&format!("unknown command '{cmd}'")),
    };

    match outcome {
        Ok(mut reply) => {
            reply.push(b'\n');
            reply
        }
        Err(e) => err_line(&e.to_string()),
    }
}

fn err_line(msg: &str) -> Vec<u8> {
    format!("ERR {msg}\n").into_bytes()
}
