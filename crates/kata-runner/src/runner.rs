//! Kata, avatar and run operations over one container runtime.
//!
//! Every operation validates its arguments before touching the runtime. Work
//! inside a container happens in [`Runner::in_container`], which removes the
//! container on every exit path.
//!
//! Callers serialize operations per (kata, avatar): two concurrent ones share
//! a container name and the second `docker run` fails on the conflict.

use std::time::Duration;

use serde::Serialize;

use crate::colour::{Classifier, Colour, ExitStatusClassifier};
use crate::config::RunnerConfig;
use crate::docker::{ContainerSpec, ContainerStore, Docker, Exec, ImageStore, VolumeStore};
use crate::error::{Field, Reason, Result, ValidationError};
use crate::identity::{AvatarCatalog, AvatarName, ImageName, KataId};
use crate::limits::RESOURCE_LIMITS;
use crate::output::truncated;
use crate::shell::{HostShell, LogMode};
use crate::transfer::{self, Disk, Files, HostDisk};

pub const ENTRY_SCRIPT: &str = "sh ./cyber-dojo.sh";

/// Longest wall-clock limit a run accepts.
pub const MAX_SECONDS: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
    pub colour: Colour,
}

/// The file sets a client sends for one stateful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFiles {
    pub new_files: Files,
    pub deleted_files: Files,
    pub unchanged_files: Files,
    pub changed_files: Files,
}

/// Names and paths of one (kata, avatar) container.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub container: String,
    pub dir: String,
    pub uid: u32,
    pub gid: u32,
}

pub trait Runtime: VolumeStore + ContainerStore + ImageStore {}

impl<T: VolumeStore + ContainerStore + ImageStore> Runtime for T {}

pub struct Runner<D> {
    docker: D,
    config: RunnerConfig,
    catalog: AvatarCatalog,
    classifier: Box<dyn Classifier>,
    disk: Box<dyn Disk + Send + Sync>,
}

impl Runner<Docker<HostShell>> {
    /// Drives the docker CLI named in `config` on this host.
    pub fn host(config: RunnerConfig) -> Self {
        let shell = HostShell::new(config.max_output);
        let docker = Docker::new(shell, config.docker_bin.clone());
        Runner::new(docker, config)
    }
}

impl<D: Runtime> Runner<D> {
    pub fn new(docker: D, config: RunnerConfig) -> Self {
        Self {
            docker,
            config,
            catalog: AvatarCatalog::standard().clone(),
            classifier: Box::new(ExitStatusClassifier),
            disk: Box::new(HostDisk),
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_disk(mut self, disk: Box<dyn Disk + Send + Sync>) -> Self {
        self.disk = disk;
        self
    }

    pub fn docker(&self) -> &D {
        &self.docker
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    // image

    pub fn image_pulled(&self, image_name: &str) -> Result<bool> {
        let image = ImageName::parse(image_name)?;
        let names = self.docker.image_names()?;
        Ok(names.iter().any(|n| n == image.repository()))
    }

    /// `true` once pulled; `false` if the registry has no such image.
    pub fn image_pull(&self, image_name: &str) -> Result<bool> {
        let image = ImageName::parse(image_name)?;
        let out = self.docker.pull_image(image.as_str())?;
        if out.success() {
            return Ok(true);
        }
        // The wording varies between docker versions.
        if out.stderr.contains("not found") || out.stderr.contains("not exist") {
            tracing::debug!(image = %image, stderr = %out.stderr, "image not in registry");
            return Ok(false);
        }
        tracing::warn!(
            image = %image,
            status = out.status,
            stderr = %out.stderr,
            "docker pull failed"
        );
        Err(ValidationError::invalid(Field::ImageName).into())
    }

    // kata

    pub fn kata_exists(&self, kata_id: &str) -> Result<bool> {
        let kata = KataId::parse(kata_id)?;
        self.volume_exists(&kata)
    }

    pub fn kata_new(&self, image_name: &str, kata_id: &str) -> Result<()> {
        ImageName::parse(image_name)?;
        let kata = KataId::parse(kata_id)?;
        if self.volume_exists(&kata)? {
            return Err(ValidationError::new(Field::KataId, Reason::Exists).into());
        }
        let volume = self.config.volume_name(kata.as_str());
        self.docker.create_volume(&volume)?;
        tracing::info!(kata_id = %kata, volume = %volume, "kata created");
        Ok(())
    }

    /// Removes the kata's volume and every avatar dir in it.
    pub fn kata_old(&self, kata_id: &str) -> Result<()> {
        let kata = KataId::parse(kata_id)?;
        self.assert_kata_exists(&kata)?;
        let volume = self.config.volume_name(kata.as_str());
        self.docker.remove_volume(&volume)?;
        tracing::info!(kata_id = %kata, volume = %volume, "kata removed");
        Ok(())
    }

    // avatar

    pub fn avatar_exists(
        &self,
        image_name: &str,
        kata_id: &str,
        avatar_name: &str,
    ) -> Result<bool> {
        let (image, kata, avatar) = self.parse_target(image_name, kata_id, avatar_name)?;
        self.in_container(&image, &kata, &avatar, |sandbox| self.avatar_dir_exists(sandbox))
    }

    /// Creates the avatar's dir (and the shared dir if this is the first
    /// avatar) and fills it with `starting_files`, owned by the avatar.
    pub fn avatar_new(
        &self,
        image_name: &str,
        kata_id: &str,
        avatar_name: &str,
        starting_files: &Files,
    ) -> Result<()> {
        let (image, kata, avatar) = self.parse_target(image_name, kata_id, avatar_name)?;
        let archive = self.archive(starting_files)?;
        self.in_container(&image, &kata, &avatar, |sandbox| {
            if self.avatar_dir_exists(sandbox)? {
                return Err(ValidationError::new(Field::AvatarName, Reason::Exists).into());
            }
            self.make_and_chown_dirs(sandbox)?;
            if let Some(archive) = &archive {
                let exec = Exec::new(transfer::unpack_script(&sandbox.dir, "true"))
                    .as_user(sandbox.uid, sandbox.gid)
                    .interactive();
                self.docker
                    .assert_exec(&sandbox.container, &exec, Some(archive.as_slice()))?;
            }
            tracing::info!(
                kata_id = %kata,
                avatar = %avatar,
                files = starting_files.len(),
                "avatar created"
            );
            Ok(())
        })
    }

    pub fn avatar_old(&self, image_name: &str, kata_id: &str, avatar_name: &str) -> Result<()> {
        let (image, kata, avatar) = self.parse_target(image_name, kata_id, avatar_name)?;
        self.in_container(&image, &kata, &avatar, |sandbox| {
            self.assert_avatar_exists(sandbox)?;
            let exec = Exec::new(format!("rm -rf {}", shell_words::quote(&sandbox.dir)));
            self.docker.assert_exec(&sandbox.container, &exec, None)?;
            tracing::info!(kata_id = %kata, avatar = %avatar, "avatar removed");
            Ok(())
        })
    }

    // run

    /// The avatar's dir persists between runs, so unchanged files are not
    /// sent. A file both new and changed takes its changed content.
    pub fn run_cyber_dojo_sh(
        &self,
        image_name: &str,
        kata_id: &str,
        avatar_name: &str,
        files: RunFiles,
        max_seconds: u64,
    ) -> Result<RunResult> {
        let RunFiles {
            new_files,
            deleted_files,
            unchanged_files: _,
            changed_files,
        } = files;
        let mut sent = new_files;
        sent.extend(changed_files);
        let deleted: Vec<String> = deleted_files.into_keys().collect();
        self.run(image_name, kata_id, avatar_name, &deleted, &sent, max_seconds)
    }

    /// Deletes `deleted_filenames`, sends `changed_files`, then runs
    /// `cyber-dojo.sh` as the avatar with a `max_seconds` wall-clock limit.
    pub fn run(
        &self,
        image_name: &str,
        kata_id: &str,
        avatar_name: &str,
        deleted_filenames: &[String],
        changed_files: &Files,
        max_seconds: u64,
    ) -> Result<RunResult> {
        let (image, kata, avatar) = self.parse_target(image_name, kata_id, avatar_name)?;
        if !(1..=MAX_SECONDS).contains(&max_seconds) {
            return Err(ValidationError::invalid(Field::MaxSeconds).into());
        }
        for name in deleted_filenames {
            transfer::validate_filename(name)?;
        }
        let archive = self.archive(changed_files)?;
        let max = Duration::from_secs(max_seconds);

        self.in_container(&image, &kata, &avatar, |sandbox| {
            self.assert_avatar_exists(sandbox)?;
            for name in deleted_filenames {
                let path = format!("{}/{name}", sandbox.dir);
                let exec = Exec::new(format!("rm {}", shell_words::quote(&path)));
                self.docker.assert_exec(&sandbox.container, &exec, None)?;
            }

            let script = match &archive {
                Some(_) => transfer::unpack_script(&sandbox.dir, ENTRY_SCRIPT),
                None => format!("cd {} && {ENTRY_SCRIPT}", shell_words::quote(&sandbox.dir)),
            };
            let exec = Exec::new(script)
                .as_user(sandbox.uid, sandbox.gid)
                .interactive();
            let out = self
                .docker
                .exec_timeout(&sandbox.container, &exec, archive, max)?;

            let colour = if out.timed_out {
                Colour::TimedOut
            } else {
                self.colour(&out.stdout, &out.stderr, out.status)
            };
            tracing::debug!(
                kata_id = %kata,
                avatar = %avatar,
                status = out.status,
                colour = %colour,
                "run finished"
            );
            let max_output = self.config.max_output;
            Ok(RunResult {
                stdout: truncated(out.stdout, max_output),
                stderr: truncated(out.stderr, max_output),
                status: out.status,
                colour,
            })
        })
    }

    // container

    pub fn sandbox(&self, kata: &KataId, avatar: &AvatarName) -> Sandbox {
        Sandbox {
            container: self.config.container_name(kata.as_str(), avatar.as_str()),
            dir: self.config.sandbox_path(avatar.as_str()),
            uid: avatar.uid(),
            gid: self.config.gid,
        }
    }

    pub fn container_spec(
        &self,
        image: &ImageName,
        kata: &KataId,
        avatar: &AvatarName,
    ) -> ContainerSpec {
        let sandbox = self.sandbox(kata, avatar);
        let env = [
            ("AVATAR_NAME", avatar.as_str()),
            ("IMAGE_NAME", image.as_str()),
            ("KATA_ID", kata.as_str()),
            ("RUNNER", "stateful"),
            ("SANDBOX", sandbox.dir.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (format!("CYBER_DOJO_{k}"), v.to_string()))
        .collect();
        ContainerSpec {
            name: sandbox.container,
            image: image.as_str().to_string(),
            volume: self.config.volume_name(kata.as_str()),
            mount_point: self.config.sandboxes_root.clone(),
            env,
            limits: RESOURCE_LIMITS,
        }
    }

    /// Creates the (kata, avatar) container, runs `body` in it, then removes
    /// it. A body error wins over a removal error.
    pub fn in_container<T>(
        &self,
        image: &ImageName,
        kata: &KataId,
        avatar: &AvatarName,
        body: impl FnOnce(&Sandbox) -> Result<T>,
    ) -> Result<T> {
        // `docker run --volume` silently creates a missing volume.
        self.assert_kata_exists(kata)?;

        let spec = self.container_spec(image, kata, avatar);
        self.docker.create_container(&spec)?;
        let guard = ContainerGuard::new(&self.docker, &spec.name);

        let result = body(&self.sandbox(kata, avatar));
        let removed = guard.release();

        match (result, removed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(rm)) => {
                tracing::warn!(
                    container = %spec.name,
                    error = %rm,
                    "container removal failed after error"
                );
                Err(e)
            }
        }
    }

    // helpers

    fn parse_target(
        &self,
        image_name: &str,
        kata_id: &str,
        avatar_name: &str,
    ) -> Result<(ImageName, KataId, AvatarName)> {
        let image = ImageName::parse(image_name)?;
        let kata = KataId::parse(kata_id)?;
        let avatar = self.catalog.parse(avatar_name)?;
        Ok((image, kata, avatar))
    }

    fn archive(&self, files: &Files) -> Result<Option<Vec<u8>>> {
        for name in files.keys() {
            transfer::validate_filename(name)?;
        }
        if files.is_empty() {
            return Ok(None);
        }
        transfer::pack(self.disk.as_ref(), files).map(Some)
    }

    fn volume_exists(&self, kata: &KataId) -> Result<bool> {
        self.docker
            .volume_exists(&self.config.volume_name(kata.as_str()))
    }

    fn assert_kata_exists(&self, kata: &KataId) -> Result<()> {
        if self.volume_exists(kata)? {
            Ok(())
        } else {
            Err(ValidationError::new(Field::KataId, Reason::NotExists).into())
        }
    }

    /// Checks the avatar's dir in the volume, not its home dir, which the
    /// image already has.
    fn avatar_dir_exists(&self, sandbox: &Sandbox) -> Result<bool> {
        let exec = Exec::new(format!("[ -d {} ]", shell_words::quote(&sandbox.dir)));
        let out = self
            .docker
            .exec(&sandbox.container, &exec, None, LogMode::Quiet)?;
        Ok(out.success())
    }

    fn assert_avatar_exists(&self, sandbox: &Sandbox) -> Result<()> {
        if self.avatar_dir_exists(sandbox)? {
            Ok(())
        } else {
            Err(ValidationError::new(Field::AvatarName, Reason::NotExists).into())
        }
    }

    fn make_and_chown_dirs(&self, sandbox: &Sandbox) -> Result<()> {
        let shared = shell_words::quote(&self.config.shared_path()).into_owned();
        let dir = shell_words::quote(&sandbox.dir).into_owned();
        let group = &self.config.group;
        // The first avatar of a kata creates the shared dir.
        for script in [
            format!("mkdir -m 775 {shared} || true"),
            format!("mkdir -m 755 {dir}"),
            format!("chown root:{group} {shared}"),
            format!("chown {}:{} {dir}", sandbox.uid, sandbox.gid),
        ] {
            self.docker
                .assert_exec(&sandbox.container, &Exec::new(script), None)?;
        }
        Ok(())
    }

    fn colour(&self, stdout: &str, stderr: &str, status: i32) -> Colour {
        match self.classifier.classify(stdout, stderr, status) {
            Ok(colour) => colour,
            Err(e) => {
                tracing::warn!(error = %e, status, "classification failed; reporting amber");
                Colour::Amber
            }
        }
    }
}

/// Removes its container when dropped unless [`ContainerGuard::release`] ran
/// first. Covers a panicking body.
struct ContainerGuard<'a, C: ContainerStore> {
    store: &'a C,
    name: &'a str,
    armed: bool,
}

impl<'a, C: ContainerStore> ContainerGuard<'a, C> {
    fn new(store: &'a C, name: &'a str) -> Self {
        Self {
            store,
            name,
            armed: true,
        }
    }

    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.store.remove_container(self.name)
    }
}

impl<C: ContainerStore> Drop for ContainerGuard<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.store.remove_container(self.name) {
            tracing::warn!(container = %self.name, error = %e, "container removal failed");
        }
    }
}
