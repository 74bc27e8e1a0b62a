//! Work-directory materialization and entrypoint contents.

use std::path::PathBuf;

use awf::policy::{compile, PolicyInputs};
use awf::sandbox::materialize::{
    render_command_entrypoint, COMMAND_ENTRYPOINT, COMMAND_LOGS_DIR, PROXY_CONF, PROXY_ENTRYPOINT,
    PROXY_LOGS_DIR, TOPOLOGY_DESC,
};
use awf::sandbox::{SandboxTopology, TopologyOptions, WorkDir, DEFAULT_COMMAND_IMAGE};

fn artifact() -> awf::policy::PolicyArtifact {
    compile(&PolicyInputs {
        allowed_domains: vec!["github.com".to_owned()],
        dns_servers: vec!["1.1.1.1".parse().expect("ip")],
        ..PolicyInputs::default()
    })
    .expect("valid inputs")
}

fn options(work_dir: PathBuf) -> TopologyOptions {
    TopologyOptions {
        run_id: "ab12cd34".to_owned(),
        user_command: vec!["true".to_owned()],
        command_image: DEFAULT_COMMAND_IMAGE.to_owned(),
        sidecar_image: None,
        uid: 1000,
        gid: 1000,
        workspace: PathBuf::from("/tmp/ws"),
        mirror_home: None,
        passthrough_env: Vec::new(),
        preload_library: None,
        shim_binary: None,
        work_dir,
    }
}

#[test]
fn work_dir_layout_matches_the_documented_tree() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::create(tmp.path().join("run")).expect("create");
    let artifact = artifact();
    let topology = SandboxTopology::build(&artifact, &options(work.path().to_path_buf()));
    work.materialize(&artifact, &topology).expect("materialize");

    for file in [PROXY_CONF, TOPOLOGY_DESC, COMMAND_ENTRYPOINT, PROXY_ENTRYPOINT] {
        assert!(work.path().join(file).is_file(), "{file} missing");
    }
    for dir in [PROXY_LOGS_DIR, COMMAND_LOGS_DIR] {
        assert!(work.path().join(dir).is_dir(), "{dir} missing");
    }
}

#[cfg(unix)]
#[test]
fn entrypoints_are_executable() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::create(tmp.path().join("run")).expect("create");
    let artifact = artifact();
    let topology = SandboxTopology::build(&artifact, &options(work.path().to_path_buf()));
    work.materialize(&artifact, &topology).expect("materialize");

    for script in [COMMAND_ENTRYPOINT, PROXY_ENTRYPOINT] {
        let mode = std::fs::metadata(work.path().join(script))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111, "{script} must be executable");
    }
}

#[test]
fn proxy_conf_on_disk_equals_the_artifact_rendering() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::create(tmp.path().join("run")).expect("create");
    let artifact = artifact();
    let topology = SandboxTopology::build(&artifact, &options(work.path().to_path_buf()));
    work.materialize(&artifact, &topology).expect("materialize");

    let on_disk = std::fs::read_to_string(work.path().join(PROXY_CONF)).expect("read");
    assert_eq!(on_disk, artifact.squid_conf());
}

#[test]
fn command_entrypoint_sequences_nat_drop_exec() {
    let script = render_command_entrypoint(&artifact());

    let nat = script.find("iptables -t nat -N AWF_NAT").expect("nat present");
    let deny = script.find("iptables -A AWF_OUTPUT -p tcp -j DROP").expect("default deny present");
    let exec = script.rfind("exec setpriv").expect("final exec present");

    assert!(nat < deny && deny < exec, "rules install before the handoff");
    // The capability drop rides the same exec invocation.
    assert!(script.contains("--bounding-set -net_admin"));
    // DNS exemption for the configured server is present.
    assert!(script.contains("-d 1.1.1.1/32 -p udp --dport 53 -j RETURN"));
    // The user identity switch rides the same exec.
    assert!(script.contains("--reuid \"$AWF_UID\""));
    assert!(script.contains("LD_PRELOAD"));
}

#[test]
fn delete_removes_the_tree() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::create(tmp.path().join("run")).expect("create");
    assert!(work.path().exists());
    work.delete().expect("delete");
    assert!(!work.path().exists());
}
