use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;

use super::{RpcRequest, RpcResponse};
use crate::constants::RPC_POLL_INTERVAL_MS;
use crate::error::{EngineError, Result};

/// Handler of one registered function
pub type RpcHandler = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

type FunctionTable = Arc<RwLock<HashMap<String, RpcHandler>>>;

/// RPC endpoint bound to an ephemeral loopback port.
///
/// Functions are registered before [`start_proxy`](Self::start_proxy)
/// begins serving. [`close`](Self::close) makes the serving loop and all
/// connection threads return so the serving thread can be joined.
pub struct RpcProxyServer {
    listener: TcpListener,
    port: u16,
    functions: FunctionTable,
    serving: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl RpcProxyServer {
    /// Binds a free port on the loopback interface
    pub fn open() -> Result<Self> {
        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listener = TcpListener::bind(address)
            .map_err(|e| EngineError::ProxyStart(format!("Unable to bind {}: {}", address, e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| EngineError::ProxyStart(e.to_string()))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|e| EngineError::ProxyStart(e.to_string()))?;

        debug!("RPC proxy bound to 127.0.0.1:{}", port);
        Ok(RpcProxyServer {
            listener,
            port,
            functions: Arc::new(RwLock::new(HashMap::new())),
            serving: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn listening_port(&self) -> u16 {
        self.port
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Registers a function; fails once the proxy has started serving
    pub fn register_function<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        if self.is_serving() {
            return Err(EngineError::ProxyStart(format!(
                "Unable to register {}: proxy already serving",
                name
            )));
        }
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        functions.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Serves requests until [`close`](Self::close) is called
    pub fn start_proxy(&self) -> Result<()> {
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(EngineError::ProxyStart("Proxy already serving".to_string()));
        }
        let poll = Duration::from_millis(RPC_POLL_INTERVAL_MS);

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("RPC connection from {} on port {}", peer, self.port);
                    let functions = self.functions.clone();
                    let shutdown = self.shutdown.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("rpc_connection_{}", self.port))
                        .spawn(move || serve_connection(stream, functions, shutdown));
                    if let Err(e) = spawned {
                        warn!("Unable to start RPC connection thread: {}", e);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("RPC proxy on port {} stopped accepting: {}", self.port, e);
                    break;
                }
            }
        }

        debug!("RPC proxy on port {} stopped", self.port);
        Ok(())
    }

    /// Starts serving on a named thread
    pub fn spawn(self: &Arc<Self>, thread_name: &str) -> Result<JoinHandle<()>> {
        let server = Arc::clone(self);
        thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                if let Err(e) = server.start_proxy() {
                    warn!("RPC proxy failed: {}", e);
                }
            })
            .map_err(|e| EngineError::ProxyStart(e.to_string()))
    }

    /// Stops the serving loop and every open connection
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for RpcProxyServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn serve_connection(stream: TcpStream, functions: FunctionTable, shutdown: Arc<AtomicBool>) {
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(Duration::from_millis(RPC_POLL_INTERVAL_MS))))
    {
        warn!("Unable to configure RPC connection: {}", e);
        return;
    }
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            warn!("Unable to clone RPC connection: {}", e);
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut pending = Vec::new();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match reader.read_until(b'\n', &mut pending) {
            Ok(0) => return,
            Ok(_) if pending.ends_with(b"\n") => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let response = dispatch(&functions, &pending);
                pending.clear();

                let mut line = match serde_json::to_vec(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Unable to serialize RPC response: {}", e);
                        return;
                    }
                };
                line.push(b'\n');
                if writer.write_all(&line).and_then(|_| writer.flush()).is_err() {
                    return;
                }
            }
            // Partial line at EOF
            Ok(_) => return,
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

fn dispatch(functions: &FunctionTable, line: &[u8]) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_slice(line) {
        Ok(request) => request,
        Err(e) => return RpcResponse::Fault(format!("Malformed request: {}", e)),
    };
    let handler = {
        let functions = functions.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        functions.get(&request.function).cloned()
    };
    match handler {
        Some(handler) => match handler(request.args) {
            Ok(value) => RpcResponse::Value(value),
            Err(fault) => RpcResponse::Fault(fault),
        },
        None => RpcResponse::Fault(format!("Unknown function: {}", request.function)),
    }
}
