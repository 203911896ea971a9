//! Name resolution for DNS-based discovery

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};

/// Resolve a symbolic name to zero or more peer addresses
///
/// An empty list is a valid answer (no peers yet); errors are transient
/// lookup failures that the caller retries.
pub trait NameResolver: Send + Sync + 'static {
    fn resolve<'a>(
        &'a self,
        name: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<SocketAddr>>> + Send + 'a>>;
}

/// Resolver backed by the operating system (`getaddrinfo`)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn resolve<'a>(
        &'a self,
        name: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<SocketAddr>>> + Send + 'a>> {
        Box::pin(async move {
            let mut addrs: Vec<SocketAddr> = match tokio::net::lookup_host((name, port)).await {
                Ok(found) => found.collect(),
                // A headless service with no ready pods has no records yet
                Err(e) if is_missing_name(&e) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            addrs.sort();
            addrs.dedup();
            Ok(addrs)
        })
    }
}

/// Whether a lookup failed because the name has no records, as opposed to a
/// transient resolver failure worth retrying
///
/// `getaddrinfo` failures carry no portable error kind, so the resolver's
/// message (EAI_NONAME / EAI_NODATA on glibc, musl and macOS) is matched.
pub fn is_missing_name(err: &IoError) -> bool {
    if err.kind() == ErrorKind::NotFound {
        return true;
    }
    let message = err.to_string().to_ascii_lowercase();
    [
        "name or service not known",
        "no address associated with hostname",
        "nodename nor servname provided",
        "name does not resolve",
        "no such host is known",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

#[derive(Debug, Clone)]
enum StaticEntry {
    Addrs(Vec<SocketAddr>),
    /// Fail this many more lookups, then answer with the addresses
    FailThen(u32, Vec<SocketAddr>),
}

/// Fixed name table for tests; unknown names resolve to no addresses
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: RwLock<HashMap<String, StaticEntry>>,
    lookups: AtomicU32,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: impl Into<String>, addrs: Vec<SocketAddr>) -> Self {
        self.set(name, addrs);
        self
    }

    /// Fail the next `failures` lookups of `name` before answering
    pub fn flaky(self, name: impl Into<String>, failures: u32, addrs: Vec<SocketAddr>) -> Self {
        self.entries
            .write()
            .insert(name.into(), StaticEntry::FailThen(failures, addrs));
        self
    }

    pub fn set(&self, name: impl Into<String>, addrs: Vec<SocketAddr>) {
        self.entries.write().insert(name.into(), StaticEntry::Addrs(addrs));
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl NameResolver for StaticResolver {
    fn resolve<'a>(
        &'a self,
        name: &'a str,
        _port: u16,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<SocketAddr>>> + Send + 'a>> {
        Box::pin(async move {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            let mut entries = self.entries.write();
            match entries.get_mut(name) {
                None => Ok(Vec::new()),
                Some(StaticEntry::Addrs(addrs)) => Ok(addrs.clone()),
                Some(StaticEntry::FailThen(remaining, addrs)) => {
                    if *remaining == 0 {
                        Ok(addrs.clone())
                    } else {
                        *remaining -= 1;
                        Err(IoError::other(format!(
                            "simulated lookup failure for '{}'",
                            name
                        )))
                    }
                }
            }
        })
    }
}
