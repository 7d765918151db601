//! The container runtime, reached through its CLI.
//!
//! Volumes and containers live in the runtime's global namespace, keyed by
//! name. [`VolumeStore`], [`ContainerStore`] and [`ImageStore`] are the only
//! way the runner touches that namespace.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::Result;
use crate::limits::ResourceLimits;
use crate::shell::{CommandLine, ExecOutput, LogMode, Shell};
use crate::timeout::TimedOutput;

pub trait VolumeStore {
    fn volume_exists(&self, name: &str) -> Result<bool>;
    fn create_volume(&self, name: &str) -> Result<()>;
    fn remove_volume(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub volume: String,
    pub mount_point: String,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
}

/// One `sh -c` script issued into a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exec {
    pub user: Option<(u32, u32)>,
    pub interactive: bool,
    pub script: String,
}

impl Exec {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            user: None,
            interactive: false,
            script: script.into(),
        }
    }

    pub fn as_user(mut self, uid: u32, gid: u32) -> Self {
        self.user = Some((uid, gid));
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }
}

pub trait ContainerStore {
    /// Detached, `--init`, root, with `spec.volume` mounted read-write. The
    /// runtime creates a missing volume on the fly, so callers check it first.
    fn create_container(&self, spec: &ContainerSpec) -> Result<()>;

    fn remove_container(&self, name: &str) -> Result<()>;

    fn container_exists(&self, name: &str) -> Result<bool>;

    fn exec(
        &self,
        container: &str,
        exec: &Exec,
        stdin: Option<&[u8]>,
        log: LogMode,
    ) -> Result<ExecOutput>;

    /// Non-zero status is a command failure.
    fn assert_exec(&self, container: &str, exec: &Exec, stdin: Option<&[u8]>)
        -> Result<ExecOutput>;

    fn exec_timeout(
        &self,
        container: &str,
        exec: &Exec,
        stdin: Option<Vec<u8>>,
        max: Duration,
    ) -> Result<TimedOutput>;
}

pub trait ImageStore {
    /// Repository names of locally available images.
    fn image_names(&self) -> Result<Vec<String>>;

    fn pull_image(&self, image: &str) -> Result<ExecOutput>;
}

#[derive(Debug, Clone)]
pub struct Docker<S> {
    shell: S,
    bin: String,
}

impl<S: Shell> Docker<S> {
    pub fn new(shell: S, bin: impl Into<String>) -> Self {
        Self {
            shell,
            bin: bin.into(),
        }
    }

    fn cmd(&self) -> CommandLine {
        CommandLine::new(&self.bin)
    }

    pub fn run_command(&self, spec: &ContainerSpec) -> CommandLine {
        let mut cmd = self.cmd().arg("run").arg("--detach");
        for (k, v) in &spec.env {
            cmd = cmd.arg("--env").arg(format!("{k}={v}"));
        }
        cmd.arg("--init")
            .arg("--interactive")
            .arg(format!("--name={}", spec.name))
            .args(spec.limits.docker_args())
            .arg("--user=root")
            .arg("--volume")
            .arg(format!("{}:{}:rw", spec.volume, spec.mount_point))
            .arg(&spec.image)
            .arg("sh")
    }

    pub fn exec_command(&self, container: &str, exec: &Exec) -> CommandLine {
        let mut cmd = self.cmd().arg("exec");
        if let Some((uid, gid)) = exec.user {
            cmd = cmd.arg(format!("--user={uid}:{gid}"));
        }
        if exec.interactive {
            cmd = cmd.arg("--interactive");
        }
        cmd.arg(container).arg("sh").arg("-c").arg(&exec.script)
    }
}

impl<S: Shell> VolumeStore for Docker<S> {
    fn volume_exists(&self, name: &str) -> Result<bool> {
        let cmd = self
            .cmd()
            .args(["volume", "ls", "--quiet", "--filter"])
            .arg(format!("name={name}"));
        let out = self.shell.assert_exec(&cmd, None)?;
        // The filter is a substring match.
        Ok(out.stdout.lines().any(|line| line.trim() == name))
    }

    fn create_volume(&self, name: &str) -> Result<()> {
        let cmd = self.cmd().args(["volume", "create", "--name", name]);
        self.shell.assert_exec(&cmd, None)?;
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        let cmd = self.cmd().args(["volume", "rm", name]);
        self.shell.assert_exec(&cmd, None)?;
        Ok(())
    }
}

impl<S: Shell> ContainerStore for Docker<S> {
    fn create_container(&self, spec: &ContainerSpec) -> Result<()> {
        self.shell.assert_exec(&self.run_command(spec), None)?;
        Ok(())
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        let cmd = self.cmd().args(["rm", "--force", name]);
        self.shell.assert_exec(&cmd, None)?;
        Ok(())
    }

    fn container_exists(&self, name: &str) -> Result<bool> {
        let cmd = self
            .cmd()
            .args(["ps", "--all", "--quiet", "--filter"])
            .arg(format!("name=^/?{}$", regex::escape(name)));
        let out = self.shell.assert_exec(&cmd, None)?;
        Ok(!out.stdout.trim().is_empty())
    }

    fn exec(
        &self,
        container: &str,
        exec: &Exec,
        stdin: Option<&[u8]>,
        log: LogMode,
    ) -> Result<ExecOutput> {
        self.shell
            .exec(&self.exec_command(container, exec), stdin, log)
    }

    fn assert_exec(
        &self,
        container: &str,
        exec: &Exec,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput> {
        self.shell
            .assert_exec(&self.exec_command(container, exec), stdin)
    }

    fn exec_timeout(
        &self,
        container: &str,
        exec: &Exec,
        stdin: Option<Vec<u8>>,
        max: Duration,
    ) -> Result<TimedOutput> {
        self.shell
            .exec_timeout(&self.exec_command(container, exec), stdin, max)
    }
}

impl<S: Shell> ImageStore for Docker<S> {
    fn image_names(&self) -> Result<Vec<String>> {
        let cmd = self.cmd().args(["images", "--format", "{{.Repository}}"]);
        let out = self.shell.assert_exec(&cmd, None)?;
        let names: BTreeSet<&str> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|n| !n.is_empty() && *n != "<none>")
            .collect();
        Ok(names.into_iter().map(str::to_string).collect())
    }

    fn pull_image(&self, image: &str) -> Result<ExecOutput> {
        let cmd = self.cmd().args(["pull", image]);
        self.shell.exec(&cmd, None, LogMode::Quiet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::RESOURCE_LIMITS;
    use crate::testing::ScriptedShell;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "kr_A1B2C3D4E5_salmon".to_string(),
            image: "cyberdojofoundation/gcc_assert".to_string(),
            volume: "kr_A1B2C3D4E5".to_string(),
            mount_point: "/sandboxes".to_string(),
            env: vec![("CYBER_DOJO_KATA_ID".to_string(), "A1B2C3D4E5".to_string())],
            limits: RESOURCE_LIMITS,
        }
    }

    fn argv(cmd: &CommandLine) -> Vec<String> {
        std::iter::once(cmd.program().to_string())
            .chain(cmd.get_args().iter().cloned())
            .collect()
    }

    fn words(s: &str) -> Vec<String> {
        shell_words::split(s).unwrap()
    }

    #[test]
    fn run_command_mounts_volume_and_applies_limits() {
        let docker = Docker::new(ScriptedShell::new(), "docker");
        let argv = argv(&docker.run_command(&spec()));
        let head = words(
            "docker run --detach --env CYBER_DOJO_KATA_ID=A1B2C3D4E5 --init --interactive \
             --name=kr_A1B2C3D4E5_salmon --ulimit data=4294967296:4294967296",
        );
        let tail = words(
            "--security-opt=no-new-privileges --user=root \
             --volume kr_A1B2C3D4E5:/sandboxes:rw cyberdojofoundation/gcc_assert sh",
        );
        assert_eq!(argv[..head.len()], head[..], "{argv:?}");
        assert_eq!(argv[argv.len() - tail.len()..], tail[..], "{argv:?}");
    }

    #[test]
    fn exec_command_passes_the_script_as_one_word() {
        let docker = Docker::new(ScriptedShell::new(), "docker");
        let exec = Exec::new("[ -d /sandboxes/salmon ]");
        assert_eq!(
            argv(&docker.exec_command("box", &exec)),
            ["docker", "exec", "box", "sh", "-c", "[ -d /sandboxes/salmon ]"]
        );
        let exec = Exec::new("true").as_user(40045, 5000).interactive();
        assert_eq!(
            argv(&docker.exec_command("box", &exec)),
            words("docker exec --user=40045:5000 --interactive box sh -c true")
        );
    }

    #[test]
    fn volume_exists_requires_an_exact_line() {
        let shell = ScriptedShell::new();
        shell.mock_exec(
            "docker volume ls --quiet --filter name=kr_A1B2C3D4E5",
            "kr_A1B2C3D4E5_old\n",
            "",
            0,
        );
        shell.mock_exec(
            "docker volume ls --quiet --filter name=kr_A1B2C3D4E5",
            "kr_A1B2C3D4E5_old\nkr_A1B2C3D4E5\n",
            "",
            0,
        );
        let docker = Docker::new(&shell, "docker");
        assert!(!docker.volume_exists("kr_A1B2C3D4E5").unwrap());
        assert!(docker.volume_exists("kr_A1B2C3D4E5").unwrap());
    }

    #[test]
    fn image_names_are_unique_without_none() {
        let shell = ScriptedShell::new();
        shell.mock_exec(
            "docker images --format '{{.Repository}}'",
            "alpine\n<none>\nalpine\ncyberdojofoundation/gcc_assert\n",
            "",
            0,
        );
        let docker = Docker::new(&shell, "docker");
        assert_eq!(
            docker.image_names().unwrap(),
            vec!["alpine", "cyberdojofoundation/gcc_assert"]
        );
    }

    #[test]
    fn container_exists_filters_by_anchored_name() {
        let shell = ScriptedShell::new();
        shell.mock_exec(
            r"docker ps --all --quiet --filter 'name=^/?kr_A1B2C3D4E5_salmon$'",
            "",
            "",
            0,
        );
        let docker = Docker::new(&shell, "docker");
        assert!(!docker.container_exists("kr_A1B2C3D4E5_salmon").unwrap());
    }
}
