use std::net::Ipv4Addr;
use std::path::Path;

use tracing::{error, info};

/// Host resolver configuration file.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

const SEARCH_PREFIX: &str = "search ";
const NAMESERVER_PREFIX: &str = "nameserver ";

/// The parts of the host resolver configuration the guest network reuses.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostResolver {
    /// Domains from the first `search` line.
    pub search_domains: Vec<String>,
    /// IPv4 `nameserver` entries, in file order.
    pub nameservers: Vec<Ipv4Addr>,
}

impl HostResolver {
    pub fn parse(content: &str) -> Self {
        let search_domains = content
            .lines()
            .find_map(|line| line.strip_prefix(SEARCH_PREFIX))
            .map(|rest| rest.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let nameservers = content
            .lines()
            .filter_map(|line| line.strip_prefix(NAMESERVER_PREFIX))
            .filter_map(|rest| rest.trim().parse().ok())
            .collect();

        Self {
            search_domains,
            nameservers,
        }
    }

    /// Read and parse `path`.
    ///
    /// Never fails: an unsupported platform or unreadable file yields an
    /// empty resolver.
    pub async fn load(path: &Path) -> Self {
        if !cfg!(any(target_os = "linux", target_os = "macos")) {
            return Self::default();
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                error!(path = %path.display(), error = %e, "open file error");
                return Self::default();
            }
        };

        let resolver = Self::parse(&content);
        if !resolver.search_domains.is_empty() {
            info!(domains = ?resolver.search_domains, "using search domains");
        }
        resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_line() {
        let resolver = HostResolver::parse("nameserver 1.1.1.1\nsearch foo.local bar.local\n");
        assert_eq!(resolver.search_domains, vec!["foo.local", "bar.local"]);
    }

    #[test]
    fn only_first_search_line_counts() {
        let resolver = HostResolver::parse("search a.local\nsearch b.local\n");
        assert_eq!(resolver.search_domains, vec!["a.local"]);
    }

    #[test]
    fn no_search_line_is_empty() {
        let resolver = HostResolver::parse("# comment\nnameserver 10.0.0.1\noptions ndots:1\n");
        assert!(resolver.search_domains.is_empty());
    }

    #[test]
    fn search_must_start_the_line() {
        let resolver = HostResolver::parse("  search indented.local\n#search commented.local\n");
        assert!(resolver.search_domains.is_empty());
    }

    #[test]
    fn collects_ipv4_nameservers() {
        let resolver = HostResolver::parse(
            "nameserver 10.0.0.1\nnameserver fe80::1\nnameserver bogus\nnameserver 8.8.8.8 \n",
        );
        assert_eq!(
            resolver.nameservers,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(8, 8, 8, 8)]
        );
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "search foo.local bar.local\n").unwrap();
        let resolver = HostResolver::load(&path).await;
        assert_eq!(resolver.search_domains, vec!["foo.local", "bar.local"]);
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let resolver = HostResolver::load(Path::new("/nonexistent/resolv.conf")).await;
        assert_eq!(resolver, HostResolver::default());
    }

    #[tokio::test]
    async fn load_non_utf8_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, [0xff, 0xfe, b's', b'e']).unwrap();
        assert_eq!(HostResolver::load(&path).await, HostResolver::default());
    }
}
