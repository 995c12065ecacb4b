use std::net::ToSocketAddrs;

use crate::dns::{Addrs, Name, Resolve, Resolving};
use crate::error::BoxError;

/// Resolver backed by the system's `getaddrinfo`, run on the blocking pool.
#[derive(Debug, Default)]
pub struct GaiResolver(());

impl GaiResolver {
    pub fn new() -> Self {
        GaiResolver(())
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_owned();
            let addrs = tokio::task::spawn_blocking(move || {
                // A port is required by ToSocketAddrs; the real port is
                // applied by the caller afterwards.
                (host.as_str(), 0u16).to_socket_addrs()
            })
            .await
            .map_err(|join| Box::new(join) as BoxError)?
            .map_err(|io| Box::new(io) as BoxError)?;

            Ok(Box::new(addrs) as Addrs)
        })
    }
}
