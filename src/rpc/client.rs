use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use super::{RpcRequest, RpcResponse};
use crate::constants::DEFAULT_RPC_CALL_TIMEOUT_MS;
use crate::error::{EngineError, Result};

/// Client side of an [`RpcProxyServer`](super::RpcProxyServer).
///
/// The connection is opened on the first call and kept for later calls. A
/// failed call drops it so the next call reconnects.
pub struct RpcProxyClient {
    port: u16,
    timeout: Duration,
    connection: Mutex<Option<BufReader<TcpStream>>>,
}

impl RpcProxyClient {
    pub fn new(port: u16) -> Self {
        Self::with_timeout(port, Duration::from_millis(DEFAULT_RPC_CALL_TIMEOUT_MS))
    }

    pub fn with_timeout(port: u16, timeout: Duration) -> Self {
        RpcProxyClient {
            port,
            timeout,
            connection: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Invokes a registered function and returns its value
    pub fn call(&self, function: &str, args: Value) -> Result<Value> {
        let mut connection = self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let result = self.call_on(&mut connection, function, args);
        if result.is_err() {
            *connection = None;
        }
        match result? {
            RpcResponse::Value(value) => Ok(value),
            RpcResponse::Fault(fault) => Err(EngineError::rpc(function, fault)),
        }
    }

    fn call_on(
        &self,
        connection: &mut Option<BufReader<TcpStream>>,
        function: &str,
        args: Value,
    ) -> Result<RpcResponse> {
        if connection.is_none() {
            *connection = Some(self.connect().map_err(|e| EngineError::rpc(function, e))?);
        }
        let reader = connection
            .as_mut()
            .ok_or_else(|| EngineError::rpc(function, "not connected"))?;

        let request = RpcRequest { function: function.to_string(), args };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        let stream = reader.get_mut();
        stream
            .write_all(&line)
            .and_then(|_| stream.flush())
            .map_err(|e| EngineError::rpc(function, e))?;

        let mut response = String::new();
        let read = reader
            .read_line(&mut response)
            .map_err(|e| EngineError::rpc(function, e))?;
        if read == 0 {
            return Err(EngineError::rpc(function, "connection closed by proxy"));
        }
        Ok(serde_json::from_str(&response)?)
    }

    fn connect(&self) -> std::io::Result<BufReader<TcpStream>> {
        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let stream = TcpStream::connect_timeout(&address, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        Ok(BufReader::new(stream))
    }
}

impl std::fmt::Debug for RpcProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxyClient")
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}
