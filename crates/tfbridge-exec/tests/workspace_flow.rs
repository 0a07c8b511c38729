//! End-to-end workspace flows against a scripted stand-in for the tool

use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tfbridge_core::ResourceId;
use tfbridge_exec::{
    FileContentProducer, NativeProviderConfig, OpContext, ProcessExecutor, ProviderHandle, Setup,
    SharedProviderScheduler, WorkspaceStore, native_runner_factory,
};

const FAKE_TOOL: &str = r#"#!/bin/sh
echo "$@" >> invocations.log
if [ -n "$TF_REATTACH_PROVIDERS" ]; then echo "$TF_REATTACH_PROVIDERS" > reattach.json; fi
state() {
  printf '{"version":4,"terraform_version":"1.5.7","serial":1,"lineage":"l","outputs":{},"resources":[{"mode":"managed","type":"aws_vpc","name":"example","provider":"provider[\\"registry.terraform.io/hashicorp/aws\\"]","instances":[{"schema_version":1,"attributes":{"id":"%s"}}]}]}' "$1" > terraform.tfstate
}
case "$1" in
  init)
    touch .terraform.lock.hcl
    echo "Terraform has been successfully initialized!"
    ;;
  plan)
    if [ -f terraform.tfstate ] && grep -q '"id"' terraform.tfstate; then
      echo '{"@level":"info","type":"change_summary","changes":{"add":0,"change":0,"import":0,"remove":0}}'
    else
      echo '{"@level":"info","type":"change_summary","changes":{"add":1,"change":0,"import":0,"remove":0}}'
    fi
    ;;
  apply)
    if [ "$2" = "-refresh-only" ]; then
      [ -f terraform.tfstate ] || echo '{"version":4,"serial":1,"lineage":"l","resources":[]}' > terraform.tfstate
    else
      state vpc-123
    fi
    echo '{"@level":"info","type":"apply_complete"}'
    ;;
  destroy)
    echo '{"version":4,"serial":2,"lineage":"l","resources":[]}' > terraform.tfstate
    ;;
  import)
    if [ "$5" = "vpc-missing" ]; then
      echo "Error: Cannot import non-existent remote object" >&2
      exit 1
    fi
    state "$5"
    ;;
esac
"#;

struct Fixture {
    _temp: TempDir,
    config: PathBuf,
    store: WorkspaceStore,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let tool = temp.path().join("terraform");
    std::fs::write(&tool, FAKE_TOOL).unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = temp.path().join("main.tf.json");
    std::fs::write(
        &config,
        r#"{"resource":{"aws_vpc":{"example":{"cidr_block":"10.0.0.0/16"}}}}"#,
    )
    .unwrap();

    let store = WorkspaceStore::new(temp.path().join("workspaces"), Arc::new(ProcessExecutor))
        .with_tool_path(tool.display().to_string());
    Fixture {
        _temp: temp,
        config,
        store,
    }
}

fn invocations(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("invocations.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
#[serial]
async fn test_create_observe_delete() {
    let fx = fixture();
    let id = ResourceId::new("vpc-example");
    let ctx = OpContext::background();
    let producer = FileContentProducer::new(&fx.config);

    let ws = fx
        .store
        .workspace(&ctx, &id, &producer, Setup::default())
        .await
        .unwrap();

    let plan = ws.plan(&ctx).await.unwrap();
    assert!(!plan.exists);

    let applied = ws.apply(&ctx).await.unwrap();
    assert_eq!(applied.state.id(), Some("vpc-123"));

    let plan = ws.plan(&ctx).await.unwrap();
    assert!(plan.exists);
    assert!(plan.up_to_date);

    ws.destroy(&ctx).await.unwrap();
    let refreshed = ws.refresh(&ctx).await.unwrap();
    assert!(!refreshed.exists);

    assert_eq!(
        invocations(ws.dir()),
        vec![
            "init -input=false",
            "plan -refresh=false -input=false -lock=false -json",
            "apply -auto-approve -input=false -lock=false -json",
            "plan -refresh=false -input=false -lock=false -json",
            "destroy -auto-approve -input=false -lock=false -json",
            "apply -refresh-only -auto-approve -input=false -lock=false -json",
        ]
    );

    let dir = ws.dir().to_path_buf();
    fx.store.remove(&id).await.unwrap();
    assert!(!dir.exists());
}

#[tokio::test]
#[serial]
async fn test_import_flow() {
    let fx = fixture();
    let ctx = OpContext::background();
    let producer = FileContentProducer::new(&fx.config);

    let ws = fx
        .store
        .workspace(&ctx, &ResourceId::new("imported"), &producer, Setup::default())
        .await
        .unwrap();
    let result = ws
        .import(&ctx, "aws_vpc", "example", Some("vpc-777"))
        .await
        .unwrap();
    assert!(result.exists);
    assert_eq!(result.state.unwrap().id(), Some("vpc-777"));

    let ws = fx
        .store
        .workspace(&ctx, &ResourceId::new("missing"), &producer, Setup::default())
        .await
        .unwrap();
    let result = ws
        .import(&ctx, "aws_vpc", "example", Some("vpc-missing"))
        .await
        .unwrap();
    assert!(!result.exists);
}

#[tokio::test]
#[serial]
async fn test_shared_native_provider_is_reattached() {
    let fx = fixture();
    let ctx = OpContext::background();
    let producer = FileContentProducer::new(&fx.config);

    let plugin = NativeProviderConfig::new("sh", "registry.terraform.io/hashicorp/aws")
        .with_args(["-c", "echo '1|5|unix|/tmp/tfbridge-it.sock|grpc|'; exec sleep 30"])
        .with_reattach_timeout(Duration::from_secs(10));
    let scheduler = Arc::new(SharedProviderScheduler::new(10, native_runner_factory(plugin)));
    let handle = ProviderHandle::from_configuration(&serde_json::json!({"region": "us-east-1"}));

    let mut descriptors = Vec::new();
    for name in ["a", "b"] {
        let setup = Setup {
            provider_handle: handle.clone(),
            scheduler: scheduler.clone(),
            ..Setup::default()
        };
        let ws = fx
            .store
            .workspace(&ctx, &ResourceId::new(name), &producer, setup)
            .await
            .unwrap();
        ws.apply(&ctx).await.unwrap();
        descriptors.push(std::fs::read_to_string(ws.dir().join("reattach.json")).unwrap());
    }

    assert_eq!(descriptors[0], descriptors[1]);
    let v: serde_json::Value = serde_json::from_str(descriptors[0].trim()).unwrap();
    assert_eq!(
        v["registry.terraform.io/hashicorp/aws"]["Addr"]["String"],
        "/tmp/tfbridge-it.sock"
    );

    // init and apply for each workspace, each borrowing once
    let stats = scheduler.entry_stats(&handle).unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.invocation_count, 4);
}
