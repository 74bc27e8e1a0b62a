//! Host-bridge chain installation against a simulated iptables.
//!
//! The fake runner keeps actual chain state (create/flush/append/check)
//! per filter tool, so the idempotency property is exercised end to end
//! rather than by comparing call logs, and the v4/v6 chains stay in
//! their own namespaces exactly as the kernel keeps them.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use awf::enforce::host_chain::CommandOutput;
use awf::enforce::{EnforceError, HostChainInstaller, HostCommandRunner};
use awf::policy::firewall::{HostChainPlan, LOG_PREFIX_OTHER, LOG_PREFIX_UDP};

/// Minimal iptables state machine: named chains with rule lists plus the
/// two built-in hooks, kept separately for each filter tool.
#[derive(Default)]
struct FakeIptables {
    chains: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeIptables {
    fn new() -> Arc<Self> {
        let fake = Self::default();
        {
            let mut chains = fake.chains.lock().expect("test lock");
            for tool in ["iptables", "ip6tables"] {
                chains.insert(format!("{tool}:DOCKER-USER"), Vec::new());
                chains.insert(format!("{tool}:FORWARD"), Vec::new());
            }
        }
        Arc::new(fake)
    }

    fn chain(&self, tool: &str, name: &str) -> Option<Vec<String>> {
        self.chains
            .lock()
            .expect("test lock")
            .get(&format!("{tool}:{name}"))
            .cloned()
    }
}

#[async_trait]
impl HostCommandRunner for FakeIptables {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, EnforceError> {
        let mut chains = self.chains.lock().expect("test lock");
        let ok = CommandOutput { status: 0, stderr: String::new() };
        let fail = |msg: &str| CommandOutput { status: 1, stderr: msg.to_owned() };

        let verb = args.first().map(String::as_str);
        let chain = format!("{program}:{}", args.get(1).cloned().unwrap_or_default());
        let rule = args.get(2..).unwrap_or(&[]).join(" ");

        Ok(match verb {
            Some("-N") => {
                if chains.contains_key(&chain) {
                    fail("chain already exists")
                } else {
                    chains.insert(chain, Vec::new());
                    ok
                }
            }
            Some("-F") => match chains.get_mut(&chain) {
                Some(rules) => {
                    rules.clear();
                    ok
                }
                None => fail("no such chain"),
            },
            Some("-X") => {
                if chains.remove(&chain).is_some() {
                    ok
                } else {
                    fail("no such chain")
                }
            }
            Some("-A") => match chains.get_mut(&chain) {
                Some(rules) => {
                    rules.push(rule);
                    ok
                }
                None => fail("no such chain"),
            },
            Some("-I") => {
                // args: -I CHAIN 1 <rule...>
                let rule = args.get(3..).unwrap_or(&[]).join(" ");
                match chains.get_mut(&chain) {
                    Some(rules) => {
                        rules.insert(0, rule);
                        ok
                    }
                    None => fail("no such chain"),
                }
            }
            Some("-C") => match chains.get(&chain) {
                Some(rules) if rules.contains(&rule) => ok,
                Some(_) => fail("rule not found"),
                None => fail("no such chain"),
            },
            Some("-D") => match chains.get_mut(&chain) {
                Some(rules) => {
                    if let Some(pos) = rules.iter().position(|r| r == &rule) {
                        rules.remove(pos);
                        ok
                    } else {
                        fail("rule not found")
                    }
                }
                None => fail("no such chain"),
            },
            _ => fail("unsupported"),
        })
    }
}

fn plan() -> HostChainPlan {
    HostChainPlan {
        subnet: "10.129.0.0/24".parse().expect("net"),
        subnet_v6: Some("fd42:a81:81::/64".parse().expect("net")),
        proxy_ip: Ipv4Addr::new(10, 129, 0, 10),
        proxy_port: 3128,
        dns_v4: vec![Ipv4Addr::new(1, 1, 1, 1)],
        dns_v6: vec!["2606:4700:4700::1111".parse().expect("ip")],
    }
}

#[tokio::test]
async fn double_install_leaves_both_chains_byte_identical() {
    let fake = FakeIptables::new();
    let installer =
        HostChainInstaller::new(Arc::clone(&fake) as Arc<dyn HostCommandRunner>, plan());

    installer.install().await.expect("first install");
    let first_v4 = fake.chain("iptables", "AWF_EGRESS").expect("v4 chain");
    let first_v6 = fake.chain("ip6tables", "AWF_EGRESS").expect("v6 chain");

    installer.install().await.expect("second install");
    assert_eq!(fake.chain("iptables", "AWF_EGRESS").expect("v4 chain"), first_v4);
    assert_eq!(fake.chain("ip6tables", "AWF_EGRESS").expect("v6 chain"), first_v6);

    // The jump rules are not duplicated either.
    for tool in ["iptables", "ip6tables"] {
        let hook = fake.chain(tool, "DOCKER-USER").expect("hook exists");
        let jumps = hook.iter().filter(|r| r.contains("AWF_EGRESS")).count();
        assert_eq!(jumps, 1, "{tool} jump duplicated");
    }
}

#[tokio::test]
async fn chain_carries_both_log_prefixes_and_ends_in_reject() {
    let fake = FakeIptables::new();
    let installer =
        HostChainInstaller::new(Arc::clone(&fake) as Arc<dyn HostCommandRunner>, plan());
    installer.install().await.expect("install");

    for tool in ["iptables", "ip6tables"] {
        let rules = fake.chain(tool, "AWF_EGRESS").expect("chain exists");
        assert!(rules.iter().any(|r| r.contains(LOG_PREFIX_UDP.trim_end())));
        assert!(rules.iter().any(|r| r.contains(LOG_PREFIX_OTHER.trim_end())));
        assert!(rules.last().expect("rules").contains("REJECT"));
    }
    // Proxy bypass is the very first v4 rule; v6 has no proxy listener.
    let v4 = fake.chain("iptables", "AWF_EGRESS").expect("chain exists");
    assert!(v4.first().expect("rules").starts_with("-s 10.129.0.10"));
    let v6 = fake.chain("ip6tables", "AWF_EGRESS").expect("chain exists");
    assert!(!v6.iter().any(|r| r.contains("3128")));
}

#[tokio::test]
async fn remove_deletes_chains_and_jumps_in_both_families() {
    let fake = FakeIptables::new();
    let installer =
        HostChainInstaller::new(Arc::clone(&fake) as Arc<dyn HostCommandRunner>, plan());
    installer.install().await.expect("install");
    installer.remove().await;

    for tool in ["iptables", "ip6tables"] {
        assert!(fake.chain(tool, "AWF_EGRESS").is_none(), "{tool} chain left behind");
        let hook = fake.chain(tool, "DOCKER-USER").expect("hook exists");
        assert!(!hook.iter().any(|r| r.contains("AWF_EGRESS")));
    }
}

#[tokio::test]
async fn teardown_after_partial_state_is_safe() {
    // Removing without ever installing must not error out.
    let fake = FakeIptables::new();
    let installer = HostChainInstaller::new(fake as Arc<dyn HostCommandRunner>, plan());
    installer.remove().await;
}
