use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::Machine;
use crate::config::SandboxDescriptor;
use crate::error::Result;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};

/// VirtualBox backend driven through `VBoxManage`.
pub struct VirtualBox {
    vboxmanage: String,
    name: String,
    vm: String,
    snapshot: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl VirtualBox {
    pub fn new(vboxmanage: &str, sandbox: &SandboxDescriptor, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            vboxmanage: vboxmanage.to_string(),
            name: sandbox.name.clone(),
            vm: sandbox.machine_id().to_string(),
            snapshot: sandbox.snapshot.clone(),
            runner,
        }
    }

    async fn manage(&self, args: &[&str]) -> Result<CommandOutput> {
        let spec = CommandSpec::new(&self.vboxmanage).args(args.iter().copied());
        debug!("{}", spec);
        self.runner.run(&spec).await?.into_result(&spec)
    }
}

#[async_trait]
impl Machine for VirtualBox {
    async fn start(&self) -> Result<()> {
        info!("Starting sandbox '{}'", self.name);
        self.manage(&["startvm", &self.vm, "--type", "headless"])
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("Powering off sandbox '{}'", self.name);
        self.manage(&["controlvm", &self.vm, "poweroff"]).await?;
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.manage(&["controlvm", &self.vm, "pause"]).await?;
        Ok(())
    }

    async fn revert(&self) -> Result<()> {
        match &self.snapshot {
            Some(snapshot) => {
                info!("Restoring sandbox '{}' to snapshot '{}'", self.name, snapshot);
                self.manage(&["snapshot", &self.vm, "restore", snapshot])
                    .await?;
            }
            None => {
                info!("Restoring sandbox '{}' to its current snapshot", self.name);
                self.manage(&["snapshot", &self.vm, "restorecurrent"])
                    .await?;
            }
        }
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        let output = self.manage(&["list", "runningvms"]).await?;
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing.lines().any(|line| lists_vm(line, &self.vm)))
    }

    async fn info(&self) -> Result<String> {
        let output = self.manage(&["showvminfo", &self.vm]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn memory_dump(&self, destination: &Path) -> Result<()> {
        info!(
            "Dumping memory of sandbox '{}' to {}",
            self.name,
            destination.display()
        );
        let filename = format!("--filename={}", destination.display());
        self.manage(&["debugvm", &self.vm, "dumpvmcore", &filename])
            .await?;
        Ok(())
    }
}

/// `list runningvms` prints one `"name" {uuid}` line per VM.
fn lists_vm(line: &str, vm: &str) -> bool {
    let line = line.trim();
    let name = line
        .strip_prefix('"')
        .and_then(|rest| rest.split_once('"'))
        .map(|(name, _)| name);
    let uuid = line
        .rsplit_once('{')
        .and_then(|(_, rest)| rest.strip_suffix('}'));
    name == Some(vm) || uuid == Some(vm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::exec::MockCommandRunner;
    use std::path::PathBuf;

    fn sandbox(snapshot: Option<&str>) -> SandboxDescriptor {
        SandboxDescriptor {
            name: "ubuntu".into(),
            uuid: None,
            snapshot: snapshot.map(String::from),
            address: "192.168.56.101:9001".into(),
            platform: "linux".into(),
            profile: None,
        }
    }

    fn expect_args(runner: &mut MockCommandRunner, args: &'static [&'static str], stdout: &'static str) {
        runner
            .expect_run()
            .withf(move |spec| spec.program == "VBoxManage" && spec.args == args)
            .times(1)
            .returning(move |_| Ok(CommandOutput::exited(0, stdout)));
    }

    #[tokio::test]
    async fn start_boots_headless() {
        let mut runner = MockCommandRunner::new();
        expect_args(&mut runner, &["startvm", "ubuntu", "--type", "headless"], "");

        let vm = VirtualBox::new("VBoxManage", &sandbox(None), Arc::new(runner));
        vm.start().await.unwrap();
    }

    #[tokio::test]
    async fn revert_uses_named_snapshot_when_configured() {
        let mut runner = MockCommandRunner::new();
        expect_args(&mut runner, &["snapshot", "ubuntu", "restore", "clean"], "");
        let vm = VirtualBox::new("VBoxManage", &sandbox(Some("clean")), Arc::new(runner));
        vm.revert().await.unwrap();

        let mut runner = MockCommandRunner::new();
        expect_args(&mut runner, &["snapshot", "ubuntu", "restorecurrent"], "");
        let vm = VirtualBox::new("VBoxManage", &sandbox(None), Arc::new(runner));
        vm.revert().await.unwrap();
    }

    #[tokio::test]
    async fn is_running_parses_vm_listing() {
        let mut runner = MockCommandRunner::new();
        expect_args(
            &mut runner,
            &["list", "runningvms"],
            "\"win7\" {0b6ad3b6-1111-2222-3333-444455556666}\n\"ubuntu\" {7c1f9a10-aaaa-bbbb-cccc-ddddeeeeffff}\n",
        );
        let vm = VirtualBox::new("VBoxManage", &sandbox(None), Arc::new(runner));
        assert!(vm.is_running().await.unwrap());

        let mut runner = MockCommandRunner::new();
        expect_args(&mut runner, &["list", "runningvms"], "\"ubuntu-old\" {0000}\n");
        let vm = VirtualBox::new("VBoxManage", &sandbox(None), Arc::new(runner));
        assert!(!vm.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn memory_dump_passes_destination() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.args
                    == [
                        "debugvm",
                        "ubuntu",
                        "dumpvmcore",
                        "--filename=/results/abc-123/memory.cap",
                    ]
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::exited(0, "")));

        let vm = VirtualBox::new("VBoxManage", &sandbox(None), Arc::new(runner));
        vm.memory_dump(&PathBuf::from("/results/abc-123/memory.cap"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failing_vboxmanage_surfaces_execution_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_| {
            Ok(CommandOutput {
                exit: crate::exec::Exit::Code(1),
                stdout: Vec::new(),
                stderr: b"VBoxManage: error: Could not find a registered machine named 'ubuntu'\n"
                    .to_vec(),
            })
        });

        let vm = VirtualBox::new("VBoxManage", &sandbox(None), Arc::new(runner));
        let err = vm.stop().await.unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
        assert!(err.to_string().contains("Could not find a registered machine"));
    }

    #[test]
    fn listing_matches_name_or_uuid() {
        assert!(lists_vm("\"ubuntu\" {abcd}", "ubuntu"));
        assert!(lists_vm("\"ubuntu\" {abcd}", "abcd"));
        assert!(!lists_vm("\"ubuntu-2\" {abcd}", "ubuntu"));
        assert!(!lists_vm("", "ubuntu"));
    }
}
