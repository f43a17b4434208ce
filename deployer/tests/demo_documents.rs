//! The sample document tree under `demos/` must keep resolving.

use std::path::PathBuf;

use deployer::core::application::{DocumentSource, instantiate};
use deployer::core::types::{Scalar, Stage, TaskType, Values};
use deployer::deploy::{self, DeployRequest, Prepared};
use deployer::io::config::load_config;
use deployer::io::documents::FsDocuments;

fn demos() -> FsDocuments {
    FsDocuments::new(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../demos"))
}

fn request(application: &str, addons: &[&str], inputs: &[(&str, &str)]) -> DeployRequest {
    DeployRequest {
        application: application.to_string(),
        task: TaskType::Installation,
        addons: addons.iter().map(|a| (*a).to_string()).collect(),
        inputs: inputs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Scalar::text(*v)))
            .collect(),
    }
}

#[test]
fn docker_host_with_usb_addon_resolves_in_stage_order() {
    let docs = demos();
    let req = request(
        "docker-host",
        &["usb"],
        &[("hostname", "dock"), ("usb_bus", "001")],
    );
    let Prepared::Ready(plan) = deploy::prepare(&docs, &req, &Values::new()).expect("prepare")
    else {
        panic!("installation applies");
    };

    assert_eq!(
        plan.application.metadata.chain,
        ["docker-host", "alpine-base"]
    );
    let templates: Vec<&str> = plan
        .application
        .commands
        .iter()
        .map(|c| c.template.as_str())
        .collect();
    assert_eq!(
        templates,
        [
            "create-container.json",
            "usb-passthrough.json",
            "start-container.json",
            "apk-update.json",
            "install-docker.json",
            "install-compose.json",
        ]
    );
    assert_eq!(plan.application.commands[0].stage, Stage::PreStart);
    assert_eq!(plan.application.commands[5].guards, ["docker_compose"]);
    assert_eq!(
        plan.application.commands[5].command.execute_on.as_deref(),
        Some("lxc")
    );

    assert!(plan.missing_required().is_empty());
    assert_eq!(plan.context.defaults["memory"], Scalar::from(2048u64));
    assert_eq!(
        plan.context.defaults["template_storage"],
        Scalar::text("local-zfs")
    );
}

#[test]
fn uninstall_and_unknown_tasks() {
    let docs = demos();
    let mut req = request("docker-host", &[], &[]);
    req.task = TaskType::Uninstall;
    let Prepared::Ready(plan) = deploy::prepare(&docs, &req, &Values::new()).expect("prepare")
    else {
        panic!("uninstall is inherited from alpine-base");
    };
    assert_eq!(plan.application.commands.len(), 1);

    req.task = TaskType::Backup;
    assert!(matches!(
        deploy::prepare(&docs, &req, &Values::new()).expect("prepare"),
        Prepared::NotApplicable(_)
    ));
}

#[test]
fn framework_instantiates_onto_the_demo_chain() {
    let docs = demos();
    let framework = docs
        .framework("docker-compose")
        .expect("read")
        .expect("framework");
    let values = Values::from([
        ("hostname".to_string(), Scalar::text("wiki")),
        ("memory".to_string(), Scalar::from(4096u64)),
    ]);
    let app = instantiate(&framework, "wiki", "Wiki", &values);
    assert_eq!(app.extends.as_deref(), Some("docker-host"));
    let ids: Vec<&str> = app.properties.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["hostname", "memory", "compose_project"]);
}

#[test]
fn demo_config_parses() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../demos/deployer.toml");
    let config = load_config(&path).expect("config");
    assert_eq!(config.timeouts.command_secs, 120);
    assert_eq!(config.ssh.host, "pve.lan");
}
