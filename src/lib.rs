//! AWF: egress-filtering firewall orchestrator for sandboxed AI agent
//! workloads.
//!
//! Given a command and a domain allowlist, AWF runs the command inside an
//! ephemeral three-container Docker sandbox where:
//!
//! - all HTTP(S) traffic is transparently redirected to a Squid forward
//!   proxy enforcing the allowlist (blocked entries win over allowed);
//! - every other egress protocol is rejected by a host-side iptables
//!   chain attached to the sandbox bridge, the security-critical layer
//!   that stays trustworthy even against an adversary inside the sandbox;
//! - nested `docker run` invocations are intercepted and rewritten onto
//!   the sandbox network;
//! - well-known credential variables become one-shot reads via an
//!   `LD_PRELOAD` shim (see the `awf-preload` crate).
//!
//! The crate splits along the defense rings: [`policy`] compiles inputs
//! into an immutable artifact, [`enforce`] installs the host chain and
//! judges nested launches, [`sandbox`] materializes and drives the
//! containers, and [`orchestrator`] sequences a run end to end.

pub mod config;
pub mod enforce;
pub mod logging;
pub mod orchestrator;
pub mod policy;
pub mod sandbox;
