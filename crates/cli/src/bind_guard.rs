use anyhow::{Context as AnyhowContext, Result};
use std::net::SocketAddr;

/// Resolves `listen` and refuses non-loopback addresses unless `public`.
/// The debug surface has no authentication.
pub(crate) async fn resolve_guarded_listen_addr(listen: &str, public: bool) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(listen)
        .await
        .with_context(|| format!("Failed to resolve listen address: {listen}"))?
        .collect();
    enforce_loopback(listen, &addrs, public)?;
    choose_preferred_addr(&addrs)
        .ok_or_else(|| anyhow::anyhow!("Listen address resolved to zero socket addrs: {listen}"))
}

fn choose_preferred_addr(addrs: &[SocketAddr]) -> Option<SocketAddr> {
    addrs
        .iter()
        .copied()
        .find(SocketAddr::is_ipv4)
        .or_else(|| addrs.first().copied())
}

fn enforce_loopback(listen: &str, addrs: &[SocketAddr], public: bool) -> Result<()> {
    if !public && addrs.iter().any(|addr| !addr.ip().is_loopback()) {
        anyhow::bail!(
            "Refusing to listen on non-loopback address without --public: {listen}. The debug endpoints are unauthenticated."
        )
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_loopback_requires_public() {
        resolve_guarded_listen_addr("127.0.0.1:0", false)
            .await
            .unwrap();
        assert!(resolve_guarded_listen_addr("0.0.0.0:0", false)
            .await
            .is_err());
        resolve_guarded_listen_addr("0.0.0.0:0", true).await.unwrap();
    }

    #[test]
    fn ipv4_is_preferred() {
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert_eq!(choose_preferred_addr(&[v6, v4]), Some(v4));
        assert_eq!(choose_preferred_addr(&[v6]), Some(v6));
        assert_eq!(choose_preferred_addr(&[]), None);
    }
}
