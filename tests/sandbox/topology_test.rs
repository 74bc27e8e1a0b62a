//! Topology invariants: capabilities, users, addresses, environment.

use std::path::PathBuf;

use awf::policy::{compile, PolicyInputs};
use awf::sandbox::{
    scrub_environment, SandboxTopology, TopologyOptions, DEFAULT_COMMAND_IMAGE, PRELOAD_MOUNT_PATH,
    SHIM_MOUNT_PATH,
};

fn options() -> TopologyOptions {
    TopologyOptions {
        run_id: "ab12cd34".to_owned(),
        user_command: vec!["curl".to_owned(), "https://api.github.com/zen".to_owned()],
        command_image: DEFAULT_COMMAND_IMAGE.to_owned(),
        sidecar_image: Some("awf-credential-sidecar:latest".to_owned()),
        uid: 1000,
        gid: 1000,
        workspace: PathBuf::from("/tmp/ws"),
        mirror_home: Some(PathBuf::from("/home/user")),
        passthrough_env: vec!["TERM=xterm".to_owned(), "OTHER_VAR=def".to_owned()],
        preload_library: Some(PathBuf::from("/opt/awf/libawf_preload.so")),
        shim_binary: Some(PathBuf::from("/opt/awf/awf-docker-shim")),
        work_dir: PathBuf::from("/tmp/awf-run"),
    }
}

fn build(credential_isolation: bool) -> SandboxTopology {
    let artifact = compile(&PolicyInputs {
        allowed_domains: vec!["github.com".to_owned()],
        credential_isolation,
        ..PolicyInputs::default()
    })
    .expect("valid inputs");
    SandboxTopology::build(&artifact, &options())
}

#[test]
fn net_admin_is_exclusive_to_the_command_container() {
    let topo = build(true);
    assert_eq!(topo.command.cap_add, vec!["NET_ADMIN".to_owned()]);
    assert!(topo.proxy.cap_add.is_empty());
    assert!(topo.sidecar.as_ref().expect("sidecar").cap_add.is_empty());
}

#[test]
fn all_containers_share_the_one_bridge_at_fixed_addresses() {
    let topo = build(true);
    assert_eq!(topo.bridge.name, "awf-net-ab12cd34");
    assert_eq!(topo.bridge.subnet.to_string(), "10.129.0.0/24");
    assert_eq!(topo.proxy.fixed_ip.to_string(), "10.129.0.10");
    assert_eq!(topo.command.fixed_ip.to_string(), "10.129.0.20");
    assert_eq!(
        topo.sidecar.expect("sidecar").fixed_ip.to_string(),
        "10.129.0.30"
    );
}

#[test]
fn sidecar_exists_only_under_credential_isolation() {
    assert!(build(false).sidecar.is_none());
    assert!(build(true).sidecar.is_some());
}

#[test]
fn command_environment_carries_proxy_and_sandbox_variables() {
    let topo = build(false);
    let env = &topo.command.env;
    assert!(env.iter().any(|e| e == "HTTP_PROXY=http://10.129.0.10:3128"));
    assert!(env.iter().any(|e| e == "AWF_NETWORK=awf-net-ab12cd34"));
    assert!(env.iter().any(|e| e.starts_with("AWF_NAT_SCRIPT_B64=")));
    assert!(env.iter().any(|e| e == "AWF_UID=1000"));
    // Inherited variables survive.
    assert!(env.iter().any(|e| e == "OTHER_VAR=def"));
}

#[test]
fn protection_artifacts_are_mounted_read_only() {
    let topo = build(false);
    for path in [PRELOAD_MOUNT_PATH, SHIM_MOUNT_PATH] {
        let mount = topo
            .command
            .mounts
            .iter()
            .find(|m| m.container_path == path)
            .unwrap_or_else(|| panic!("{path} not mounted"));
        assert!(mount.read_only, "{path} must be read-only");
    }
}

#[test]
fn home_mirror_is_mounted_when_requested() {
    let topo = build(false);
    assert!(topo
        .command
        .mounts
        .iter()
        .any(|m| m.container_path == "/home/awf" && !m.read_only));
}

#[test]
fn scrub_removes_default_protected_names_from_inherited_env() {
    let protected = awf_preload::default_protected_names();
    let vars = vec![
        ("GITHUB_TOKEN".to_owned(), "abc".to_owned()),
        ("AWS_SECRET_ACCESS_KEY".to_owned(), "xyz".to_owned()),
        ("OTHER_VAR".to_owned(), "def".to_owned()),
    ];
    let scrubbed = scrub_environment(vars, &protected);
    assert_eq!(scrubbed, vec!["OTHER_VAR=def".to_owned()]);
}
