//! A DNS resolver that only ever hands reqwest public IPv4/IPv6 addresses.
//!
//! Defense in depth against DNS rebinding: the callback-URL hostname check
//! in `webhook-api::validation` runs once at registration time, but the
//! name could re-resolve to a private address by the time delivery
//! actually connects.

use std::error::Error as StdError;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use futures::FutureExt;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::task::spawn_blocking;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// Returns `true` if the address is not loopback, link-local, private,
/// multicast, unspecified, documentation, or broadcast.
fn is_global(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => {
            !(ip.octets()[0] == 0
                || ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_multicast()
                || ip.is_documentation())
        }
        IpAddr::V6(ip) => !(ip.is_loopback() || ip.is_multicast() || ip.is_unspecified()),
    }
}

/// DNS resolver using the stdlib resolver, filtering results to only
/// globally-routable addresses. Adapted from hyper/reqwest's `GaiResolver`.
pub struct PublicResolver {}

impl Resolve for PublicResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolve_host = move || (name.as_str(), 0).to_socket_addrs();

        let future_result = spawn_blocking(resolve_host).map(|result| match result {
            Ok(Ok(addrs)) => {
                let resolved: Vec<_> = addrs.collect();
                if resolved.is_empty() || !resolved.iter().all(is_global) {
                    let err: BoxError = Box::new(io::Error::new(
                        io::ErrorKind::Other,
                        "resolved address is not publicly routable",
                    ));
                    Err(err)
                } else {
                    let addrs: Addrs = Box::new(resolved.into_iter());
                    Ok(addrs)
                }
            }
            Ok(Err(err)) => {
                let err: BoxError = Box::new(err);
                Err(err)
            }
            Err(join_err) => {
                if join_err.is_cancelled() {
                    let err: BoxError =
                        Box::new(io::Error::new(io::ErrorKind::Interrupted, join_err));
                    Err(err)
                } else {
                    panic!("background DNS resolution task failed: {:?}", join_err)
                }
            }
        });

        Box::pin(future_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_private_and_loopback() {
        let private: SocketAddr = "10.0.0.5:443".parse().unwrap();
        let loopback: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let link_local: SocketAddr = "169.254.1.1:443".parse().unwrap();
        assert!(!is_global(&private));
        assert!(!is_global(&loopback));
        assert!(!is_global(&link_local));
    }

    #[test]
    fn accepts_public() {
        let public: SocketAddr = "93.184.216.34:443".parse().unwrap();
        assert!(is_global(&public));
    }
}
