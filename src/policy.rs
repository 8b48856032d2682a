// Copyright 2024 Raphael Peters
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the “Software”), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Allow and deny decisions for proxied connections.
//!
//! A hostname is allowed when it is on the domain whitelist, or when one of
//! its IPv4 addresses lies inside an allowed prefix. The IPv6 destination is
//! checked against the deny prefixes afterwards, and a deny always wins.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, PoisonError, RwLock};

use cidr::{Ipv4Cidr, Ipv6Cidr};
use regex::Regex;

use crate::resolve::Resolver;

#[derive(Debug, Default)]
pub struct DomainWhitelist {
    plain: HashSet<String>,
    regex: Vec<Regex>,
}

impl DomainWhitelist {
    pub fn new(plain: HashSet<String>, regex: Vec<Regex>) -> Self {
        Self { plain, regex }
    }

    /// Exact, case-sensitive membership or any regex match.
    pub fn matches(&self, name: &str) -> bool {
        self.plain.contains(name) || self.regex.iter().any(|regex| regex.is_match(name))
    }
}

#[derive(Debug, Default)]
pub struct AllowRule {
    pub ipv4_addr: Vec<Ipv4Cidr>,
    pub domain: DomainWhitelist,
}

impl AllowRule {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.ipv4_addr.iter().any(|prefix| prefix.contains(&addr))
    }
}

#[derive(Debug, Default)]
pub struct DenyRule {
    pub ipv6_addr: Vec<Ipv6Cidr>,
}

impl DenyRule {
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        self.ipv6_addr.iter().any(|prefix| prefix.contains(addr))
    }
}

/// Memoized whitelist results, keyed by the raw hostname.
///
/// Entries are never evicted or changed once written.
#[derive(Debug, Default)]
pub struct WhitelistCache {
    entries: RwLock<HashMap<String, bool>>,
}

impl WhitelistCache {
    pub fn get_or_insert_with(&self, name: &str, compute: impl FnOnce(&str) -> bool) -> bool {
        // a poisoned map is still consistent: every entry is a finished insert
        if let Some(&whitelisted) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return whitelisted;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        *entries
            .entry(name.to_owned())
            .or_insert_with(|| compute(name))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of the allow check, kept for logging.
#[derive(Debug)]
pub enum Allowance {
    Whitelisted,
    InPrefix(Ipv4Addr),
    OutsidePrefixes(Vec<Ipv4Addr>),
    LookupFailed(io::Error),
}

impl Allowance {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Allowance::Whitelisted | Allowance::InPrefix(_))
    }
}

pub struct Policy {
    allow: AllowRule,
    deny: DenyRule,
    cache: WhitelistCache,
    resolver: Arc<dyn Resolver>,
}

impl Policy {
    pub fn new(allow: AllowRule, deny: DenyRule, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            allow,
            deny,
            cache: WhitelistCache::default(),
            resolver,
        }
    }

    pub fn is_whitelisted(&self, name: &str) -> bool {
        self.cache
            .get_or_insert_with(name, |name| self.allow.domain.matches(name))
    }

    /// Fails closed: a lookup error never allows a connection.
    pub async fn check_allowed(&self, name: &str) -> Allowance {
        if self.is_whitelisted(name) {
            return Allowance::Whitelisted;
        }

        let addrs = match self.resolver.lookup_ipv4(name).await {
            Ok(addrs) => addrs,
            Err(error) => return Allowance::LookupFailed(error),
        };

        match addrs.iter().find(|addr| self.allow.contains(**addr)) {
            Some(addr) => Allowance::InPrefix(*addr),
            None => Allowance::OutsidePrefixes(addrs),
        }
    }

    pub async fn is_allowed(&self, name: &str) -> bool {
        self.check_allowed(name).await.is_allowed()
    }

    pub fn is_denied(&self, destination: &Ipv6Addr) -> bool {
        self.deny.contains(destination)
    }

    pub fn cache(&self) -> &WhitelistCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::StaticResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn whitelist() -> DomainWhitelist {
        DomainWhitelist::new(
            ["exact.test".to_owned()].into_iter().collect(),
            vec![Regex::new(r"^[a-z]+\.wild\.test$").unwrap()],
        )
    }

    fn policy(resolver: StaticResolver) -> Policy {
        Policy::new(
            AllowRule {
                ipv4_addr: vec!["192.0.2.0/24".parse().unwrap()],
                domain: whitelist(),
            },
            DenyRule {
                ipv6_addr: vec!["fc00::/7".parse().unwrap()],
            },
            Arc::new(resolver),
        )
    }

    #[test]
    fn whitelist_matching() {
        let whitelist = whitelist();
        assert!(whitelist.matches("exact.test"));
        assert!(!whitelist.matches("EXACT.test"));
        assert!(whitelist.matches("abc.wild.test"));
        assert!(!whitelist.matches("a.b.wild.test"));
        assert!(!whitelist.matches("other.test"));
    }

    #[tokio::test]
    async fn whitelisted_without_lookup() {
        // nothing resolves, so only the whitelist can allow
        let policy = policy(StaticResolver::default());

        assert!(matches!(
            policy.check_allowed("exact.test").await,
            Allowance::Whitelisted
        ));
        assert!(policy.is_allowed("foo.wild.test").await);
    }

    #[tokio::test]
    async fn allowed_by_prefix() {
        let policy = policy(
            StaticResolver::default()
                .with("multi.test", Ipv4Addr::new(203, 0, 113, 1))
                .with("multi.test", Ipv4Addr::new(192, 0, 2, 8))
                .with("outside.test", Ipv4Addr::new(203, 0, 113, 1))
                .with("v6only.test", "2001:db8::1".parse::<Ipv6Addr>().unwrap()),
        );

        assert!(matches!(
            policy.check_allowed("multi.test").await,
            Allowance::InPrefix(addr) if addr == Ipv4Addr::new(192, 0, 2, 8)
        ));
        assert!(matches!(
            policy.check_allowed("outside.test").await,
            Allowance::OutsidePrefixes(ref addrs) if addrs.len() == 1
        ));
        assert!(!policy.is_allowed("v6only.test").await);
    }

    #[tokio::test]
    async fn lookup_failure_is_not_allowed() {
        let policy = policy(StaticResolver::default());

        let allowance = policy.check_allowed("missing.test").await;
        assert!(matches!(allowance, Allowance::LookupFailed(_)));
        assert!(!allowance.is_allowed());
    }

    #[tokio::test]
    async fn repeated_checks_agree() {
        let policy = policy(StaticResolver::default());

        for name in ["exact.test", "nope.test"] {
            let first = policy.is_whitelisted(name);
            let second = policy.is_whitelisted(name);
            assert_eq!(first, second);
        }
        assert_eq!(policy.cache().len(), 2);
    }

    #[test]
    fn cache_computes_once() {
        let cache = WhitelistCache::default();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(cache.get_or_insert_with("a.test", |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                true
            }));
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_lookups_agree() {
        let policy = Arc::new(policy(StaticResolver::default()));

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let policy = Arc::clone(&policy);
                let name = if i % 2 == 0 { "x.wild.test" } else { "x.tame.test" };
                tokio::spawn(async move { (name, policy.is_whitelisted(name)) })
            })
            .collect();

        for task in tasks {
            let (name, whitelisted) = task.await.unwrap();
            assert_eq!(whitelisted, name == "x.wild.test");
        }
        assert_eq!(policy.cache().len(), 2);
    }

    #[test]
    fn deny_prefixes() {
        let policy = policy(StaticResolver::default());

        assert!(policy.is_denied(&"fd12::1".parse().unwrap()));
        assert!(!policy.is_denied(&"2001:db8::1".parse().unwrap()));
    }
}
