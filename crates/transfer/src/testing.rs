//! In-memory data-object server for tests.
//!
//! Objects are byte vectors keyed by logical path. Failures can be injected
//! per server, and every RPC is counted in [`ServerStats`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use irods_protocol::{
    EncryptionContext, FileHandle, OpenMode, RedirectionHandle, ReplicaAccessToken, Whence,
};

use crate::TransferError;
use crate::session::{Connector, DataObjectConnection, RpcFuture};

/// Counters of the RPCs a [`MemoryServer`] has served.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections: usize,
    pub opens: usize,
    pub token_opens: usize,
    pub closes: usize,
    pub replica_closes: usize,
    /// Replica handles still open when their main handle was closed.
    pub open_replicas_at_finalize: usize,
    /// Object position at the start of every read.
    pub read_offsets: Vec<i64>,
    pub replications: Vec<String>,
    pub redirection_requests: usize,
    /// Size passed with each redirection request.
    pub redirection_sizes: Vec<i64>,
    pub completed_redirections: usize,
}

struct OpenObject {
    path: String,
    position: i64,
    replica: bool,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Vec<u8>>,
    handles: HashMap<i32, OpenObject>,
    next_descriptor: i32,
    tokens: HashMap<String, String>,
    parallel_write: bool,
    fail_connect: bool,
    fail_replica_token: bool,
    fail_read_at: Option<i64>,
    /// Injected read failures left; `None` fails for as long as `fail_read_at` is set.
    read_failures_left: Option<usize>,
    connect_delay: Option<Duration>,
    max_read: Option<usize>,
    read_delay: Option<Duration>,
    redirection: Option<RedirectionHandle>,
    encryption: Option<EncryptionContext>,
    stats: ServerStats,
}

/// Shared fake server; clones see the same objects.
#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        let state = State {
            parallel_write: true,
            next_descriptor: 3,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    /// Opens a connection directly, bypassing any pool.
    pub fn connect(&self) -> MemoryConnection {
        self.state().stats.connections += 1;
        MemoryConnection {
            server: self.clone(),
        }
    }

    pub fn put_object(&self, path: &str, data: Vec<u8>) {
        self.state().objects.insert(path.to_string(), data);
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.state().objects.get(path).cloned()
    }

    pub fn stats(&self) -> ServerStats {
        self.state().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state().stats = ServerStats::default();
    }

    pub fn open_handles(&self) -> usize {
        self.state().handles.len()
    }

    pub fn set_parallel_write(&self, enabled: bool) {
        self.state().parallel_write = enabled;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn fail_replica_token(&self, fail: bool) {
        self.state().fail_replica_token = fail;
    }

    /// Fails any read whose span covers `offset`.
    pub fn fail_read_at(&self, offset: Option<i64>) {
        let mut s = self.state();
        s.fail_read_at = offset;
        s.read_failures_left = None;
    }

    /// Fails the next `times` reads whose span covers `offset`, then
    /// serves them normally.
    pub fn fail_read_at_times(&self, offset: i64, times: usize) {
        let mut s = self.state();
        s.fail_read_at = Some(offset);
        s.read_failures_left = Some(times);
    }

    /// Delays every new connection, as a slow dial would.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state().connect_delay = delay;
    }

    /// Caps the bytes returned by a single read.
    pub fn set_max_read(&self, max: Option<usize>) {
        self.state().max_read = max;
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state().read_delay = delay;
    }

    /// Redirection handle returned for both get and put requests.
    pub fn set_redirection(&self, handle: Option<RedirectionHandle>) {
        self.state().redirection = handle;
    }

    pub fn set_encryption(&self, ctx: Option<EncryptionContext>) {
        self.state().encryption = ctx;
    }
}

/// [`Connector`] dialing a [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn connect(&self) -> RpcFuture<'_, MemoryConnection> {
        Box::pin(async move {
            let delay = self.server.state().connect_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.server.state().fail_connect {
                return Err(TransferError::Transport("connection refused".into()));
            }
            Ok(self.server.connect())
        })
    }

    fn supports_parallel_write(&self) -> bool {
        self.server.state().parallel_write
    }
}

/// One connection to a [`MemoryServer`].
pub struct MemoryConnection {
    server: MemoryServer,
}

impl State {
    fn new_handle(&mut self, path: &str, resource: &str, mode: OpenMode, replica: bool) -> FileHandle {
        let descriptor = self.next_descriptor;
        self.next_descriptor += 1;
        let position = if matches!(mode, OpenMode::Append | OpenMode::AppendRead) {
            self.objects.get(path).map(|o| o.len() as i64).unwrap_or(0)
        } else {
            0
        };
        self.handles.insert(
            descriptor,
            OpenObject {
                path: path.to_string(),
                position,
                replica,
            },
        );
        FileHandle {
            descriptor,
            path: path.to_string(),
            resource: resource.to_string(),
            mode,
        }
    }

    fn handle(&mut self, handle: &FileHandle) -> Result<&mut OpenObject, TransferError> {
        self.handles
            .get_mut(&handle.descriptor)
            .ok_or_else(|| TransferError::Protocol(format!("bad descriptor {}", handle.descriptor)))
    }
}

impl DataObjectConnection for MemoryConnection {
    fn open<'a>(
        &'a mut self,
        path: &'a str,
        resource: &'a str,
        mode: OpenMode,
    ) -> RpcFuture<'a, (FileHandle, i64)> {
        Box::pin(async move {
            let mut s = self.server.state();
            s.stats.opens += 1;
            if mode.truncates() {
                s.objects.insert(path.to_string(), Vec::new());
            } else if !s.objects.contains_key(path) {
                if mode.is_write() {
                    s.objects.insert(path.to_string(), Vec::new());
                } else {
                    return Err(TransferError::NotFound(path.to_string()));
                }
            }
            let handle = s.new_handle(path, resource, mode, false);
            let position = s.handles.get(&handle.descriptor).map(|o| o.position).unwrap_or(0);
            Ok((handle, position))
        })
    }

    fn open_with_replica_token<'a>(
        &'a mut self,
        path: &'a str,
        token: &'a ReplicaAccessToken,
        mode: OpenMode,
    ) -> RpcFuture<'a, FileHandle> {
        Box::pin(async move {
            let mut s = self.server.state();
            match s.tokens.get(&token.token) {
                Some(p) if p == path => {}
                _ => return Err(TransferError::Protocol(format!("bad replica token for {path}"))),
            }
            s.stats.token_opens += 1;
            let resource = token.resource_hierarchy.clone();
            Ok(s.new_handle(path, &resource, mode, true))
        })
    }

    fn seek<'a>(
        &'a mut self,
        handle: &'a FileHandle,
        offset: i64,
        whence: Whence,
    ) -> RpcFuture<'a, i64> {
        Box::pin(async move {
            let mut s = self.server.state();
            let len = s
                .objects
                .get(&handle.path)
                .map(|o| o.len() as i64)
                .unwrap_or(0);
            let open = s.handle(handle)?;
            let position = match whence {
                Whence::Set => offset,
                Whence::Current => open.position + offset,
                Whence::End => len + offset,
            };
            if position < 0 {
                return Err(TransferError::Protocol("negative seek".into()));
            }
            open.position = position;
            Ok(position)
        })
    }

    fn read<'a>(&'a mut self, handle: &'a FileHandle, buf: &'a mut [u8]) -> RpcFuture<'a, usize> {
        Box::pin(async move {
            let delay = self.server.state().read_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut s = self.server.state();
            let max_read = s.max_read;
            let fail_at = s.fail_read_at;
            let position = s.handle(handle)?.position;
            let len = s.objects.get(&handle.path).map(|o| o.len()).unwrap_or(0);

            let available = (len as i64 - position).max(0) as usize;
            let mut n = buf.len().min(available);
            if let Some(max) = max_read {
                n = n.min(max);
            }
            if let Some(at) = fail_at {
                if at >= position && at < position + n.max(1) as i64 {
                    let inject = match s.read_failures_left.as_mut() {
                        Some(left) if *left == 0 => false,
                        Some(left) => {
                            *left -= 1;
                            true
                        }
                        None => true,
                    };
                    if inject {
                        return Err(TransferError::Transport(format!("injected read failure at {at}")));
                    }
                }
            }

            if n > 0 {
                let start = position as usize;
                if let Some(object) = s.objects.get(&handle.path) {
                    buf[..n].copy_from_slice(&object[start..start + n]);
                }
            }
            s.handle(handle)?.position += n as i64;
            s.stats.read_offsets.push(position);
            Ok(n)
        })
    }

    fn write<'a>(&'a mut self, handle: &'a FileHandle, data: &'a [u8]) -> RpcFuture<'a, ()> {
        Box::pin(async move {
            let mut s = self.server.state();
            let open = s.handle(handle)?;
            let start = open.position as usize;
            open.position += data.len() as i64;

            let object = s.objects.entry(handle.path.clone()).or_default();
            if object.len() < start + data.len() {
                object.resize(start + data.len(), 0);
            }
            object[start..start + data.len()].copy_from_slice(data);
            Ok(())
        })
    }

    fn close<'a>(&'a mut self, handle: &'a FileHandle) -> RpcFuture<'a, ()> {
        Box::pin(async move {
            let mut s = self.server.state();
            let closed = s
                .handles
                .remove(&handle.descriptor)
                .ok_or_else(|| TransferError::Protocol(format!("bad descriptor {}", handle.descriptor)))?;
            s.stats.closes += 1;

            if !closed.replica {
                let still_open = s
                    .handles
                    .values()
                    .filter(|o| o.replica && o.path == closed.path)
                    .count();
                s.stats.open_replicas_at_finalize += still_open;
                s.tokens.retain(|_, p| *p != closed.path);
            }
            Ok(())
        })
    }

    fn close_replica<'a>(&'a mut self, handle: &'a FileHandle) -> RpcFuture<'a, ()> {
        Box::pin(async move {
            let mut s = self.server.state();
            match s.handles.get(&handle.descriptor) {
                Some(o) if o.replica => {}
                _ => {
                    return Err(TransferError::Protocol(format!(
                        "descriptor {} is not a replica handle",
                        handle.descriptor
                    )));
                }
            }
            s.handles.remove(&handle.descriptor);
            s.stats.replica_closes += 1;
            Ok(())
        })
    }

    fn replicate<'a>(
        &'a mut self,
        path: &'a str,
        _resource: &'a str,
        _update: bool,
        _admin: bool,
    ) -> RpcFuture<'a, ()> {
        Box::pin(async move {
            self.server.state().stats.replications.push(path.to_string());
            Ok(())
        })
    }

    fn replica_access_info<'a>(
        &'a mut self,
        handle: &'a FileHandle,
    ) -> RpcFuture<'a, ReplicaAccessToken> {
        Box::pin(async move {
            let mut s = self.server.state();
            if s.fail_replica_token {
                return Err(TransferError::Protocol("replica token unavailable".into()));
            }
            s.handle(handle)?;
            let token = format!("token-{}", handle.descriptor);
            s.tokens.insert(token.clone(), handle.path.clone());
            Ok(ReplicaAccessToken {
                token,
                resource_hierarchy: format!("{};leaf", handle.resource),
            })
        })
    }

    fn redirection_for_get<'a>(
        &'a mut self,
        path: &'a str,
        resource: &'a str,
        size: i64,
    ) -> RpcFuture<'a, RedirectionHandle> {
        Box::pin(async move { Ok(self.redirection(path, resource, size)) })
    }

    fn redirection_for_put<'a>(
        &'a mut self,
        path: &'a str,
        resource: &'a str,
        size: i64,
    ) -> RpcFuture<'a, RedirectionHandle> {
        Box::pin(async move { Ok(self.redirection(path, resource, size)) })
    }

    fn complete_redirection<'a>(&'a mut self, _handle: &'a RedirectionHandle) -> RpcFuture<'a, ()> {
        Box::pin(async move {
            self.server.state().stats.completed_redirections += 1;
            Ok(())
        })
    }

    fn encryption(&self) -> Option<EncryptionContext> {
        self.server.state().encryption.clone()
    }
}

impl MemoryConnection {
    fn redirection(&self, path: &str, resource: &str, size: i64) -> RedirectionHandle {
        let mut s = self.server.state();
        s.stats.redirection_requests += 1;
        s.stats.redirection_sizes.push(size);
        s.redirection.clone().unwrap_or_else(|| RedirectionHandle {
            file_descriptor: 0,
            path: path.to_string(),
            resource: resource.to_string(),
            threads: 0,
            checksum: String::new(),
            redirection: None,
        })
    }
}

/// Deterministic test payload of `len` bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
