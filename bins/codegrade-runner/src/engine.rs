/// Docker Sandbox Engine
///
/// **Core Responsibility:**
/// Compile a Java submission once and run it against test inputs, each run in
/// its own throwaway container. Returns raw outputs; judging is the
/// evaluator's job.
///
/// **Isolation Model:**
/// - Compile container: source is written, `javac` runs, `/code` is archived out
/// - Test container: fresh per test case, receives only the `/code` archive
/// - No network (`network_disabled` + `network_mode=none`)
/// - All capabilities dropped, `no-new-privileges`, pids limit
/// - Memory limit with swap disabled; programs run as `nobody`
///
/// This container boundary is the security boundary of the whole pipeline.
/// The gateway's source filter only turns away obvious abuse early.
///
/// **Cleanup Guarantees:**
/// - Every container is force-removed and the removal awaited on normal,
///   error and timeout paths (force removal kills the whole pid namespace)
/// - If the future is dropped mid-flight (caller went away) the `ContainerGuard`
///   schedules the same removal from `Drop`
/// - Containers only `sleep` for a bounded time, so a container that somehow
///   escapes both paths still exits on its own

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SandboxSettings;
use crate::sandbox::{
    CappedBuffer, CompileOutcome, CompiledArtifact, Deadline, RunLimits, RunOutput, Sandbox,
    SandboxError,
};

const WORKDIR: &str = "/code";
const SANDBOX_USER: &str = "65534:65534";
const COMPILE_OUTPUT_LIMIT: usize = 64 * 1024;
/// Stays well under the kernel's 128 KiB single-argument limit
const SOURCE_CHUNK_BYTES: usize = 48 * 1024;
/// Extra lifetime given to a container's keepalive process beyond its job
const KEEPALIVE_MARGIN: Duration = Duration::from_secs(30);
const OOM_EXIT_CODE: i64 = 137;

/// Removes its container when released, or from `Drop` if never released.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id,
            armed: true,
        }
    }

    fn id(&self) -> &str {
        &self.container_id
    }

    /// Kill and remove the container, waiting until Docker confirms.
    async fn release(mut self) {
        self.armed = false;
        remove_container(&self.docker, &self.container_id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cannot await in Drop; hand the removal to the runtime
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_container(&docker, &container_id).await;
                });
            }
            Err(_) => warn!(container_id = %container_id, "No runtime to remove abandoned container"),
        }
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    match docker.remove_container(container_id, Some(options)).await {
        Ok(_) => debug!(container_id = %container_id, "Container removed"),
        Err(e) => warn!(container_id = %container_id, error = %e, "Failed to remove container"),
    }
}

/// Daemon-level failures make the whole backend unavailable; a response
/// error from a healthy daemon only fails the operation at hand.
fn classify(err: DockerError) -> SandboxError {
    match err {
        DockerError::DockerResponseServerError { status_code, message } => {
            SandboxError::Operation(format!("docker returned {}: {}", status_code, message))
        }
        other => SandboxError::Unavailable(other.to_string()),
    }
}

fn shell(command: String) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command]
}

/// Raw output of one exec inside a container
struct ExecCapture {
    stdout: CappedBuffer,
    stderr: CappedBuffer,
    exit_code: Option<i64>,
}

/// Docker-based sandbox for Java submissions
pub struct DockerEngine {
    docker: Docker,
    settings: SandboxSettings,
}

impl DockerEngine {
    pub fn connect(settings: SandboxSettings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker, settings })
    }

    pub fn image(&self) -> &str {
        &self.settings.image
    }

    /// Ensure the sandbox image is present, pulling it on a cache miss.
    pub async fn ensure_image(&self) -> Result<(), SandboxError> {
        let image = self.settings.image.as_str();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::Unavailable(format!("image pull failed: {}", e)))?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    fn host_config(&self, memory_mb: u64) -> HostConfig {
        let memory_bytes = (memory_mb as i64) * 1024 * 1024;
        HostConfig {
            memory: Some(memory_bytes),
            // Equal to memory: no swap on top of the limit
            memory_swap: Some(memory_bytes),
            nano_cpus: Some((self.settings.cpu_limit * 1_000_000_000.0) as i64),
            pids_limit: Some(self.settings.pids_limit),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(false),
            ..Default::default()
        }
    }

    /// Create and start a container that idles until the guard removes it.
    async fn start_container(
        &self,
        request_id: Uuid,
        label: &str,
        memory_mb: u64,
        lifetime: Duration,
    ) -> Result<ContainerGuard, SandboxError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("codegrade-{}-{}-{}", request_id.simple(), label, &suffix[..8]);
        let keepalive_secs = (lifetime + KEEPALIVE_MARGIN).as_secs().max(1);

        let config = Config {
            image: Some(self.settings.image.clone()),
            cmd: Some(vec!["sleep".to_string(), keepalive_secs.to_string()]),
            entrypoint: Some(vec![]),
            working_dir: Some(WORKDIR.to_string()),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(
                "codegrade.request".to_string(),
                request_id.to_string(),
            )])),
            host_config: Some(self.host_config(memory_mb)),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(classify)?;

        // Guard exists before start so a failed start still cleans up
        let guard = ContainerGuard::new(&self.docker, container.id);

        if let Err(e) = self
            .docker
            .start_container(guard.id(), None::<StartContainerOptions<String>>)
            .await
        {
            guard.release().await;
            return Err(classify(e));
        }

        debug!(container = %name, memory_mb, "Sandbox container started");
        Ok(guard)
    }

    /// Run a command in a container and collect capped stdout/stderr.
    async fn exec_collect(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        output_limit: usize,
        user: Option<&str>,
    ) -> Result<ExecCapture, DockerError> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            user: user.map(|u| u.to_string()),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, exec_config).await?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let mut stdout = CappedBuffer::new(output_limit);
        let mut stderr = CappedBuffer::new(output_limit);

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, Some(start_config)).await?
        {
            // Keep draining past the cap so the process is not blocked on a full pipe
            while let Some(msg) = output.next().await {
                match msg? {
                    LogOutput::StdOut { message } => stdout.push(&message),
                    LogOutput::StdErr { message } => stderr.push(&message),
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecCapture {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
        })
    }

    /// Write the submission to /code/Main.java in base64 chunks.
    async fn write_source(&self, container_id: &str, source_code: &str) -> Result<(), SandboxError> {
        let encoded = general_purpose::STANDARD.encode(source_code);

        // base64 output is ASCII, so byte chunks are valid str slices
        for chunk in encoded.as_bytes().chunks(SOURCE_CHUNK_BYTES) {
            let chunk = String::from_utf8_lossy(chunk);
            let cmd = shell(format!("printf '%s' '{}' >> {}/Main.b64", chunk, WORKDIR));
            let capture = self
                .exec_collect(container_id, cmd, 4096, None)
                .await
                .map_err(classify)?;
            if capture.exit_code != Some(0) {
                return Err(SandboxError::Operation("failed to stage source code".to_string()));
            }
        }

        let decode = shell(format!(
            "cd {dir} && base64 -d Main.b64 > Main.java && rm Main.b64",
            dir = WORKDIR
        ));
        let capture = self
            .exec_collect(container_id, decode, 4096, None)
            .await
            .map_err(classify)?;
        if capture.exit_code != Some(0) {
            return Err(SandboxError::Operation("failed to decode source code".to_string()));
        }
        Ok(())
    }

    async fn compile_in(
        &self,
        container_id: &str,
        source_code: &str,
    ) -> Result<CompileOutcome, SandboxError> {
        self.write_source(container_id, source_code).await?;

        let cmd = shell(format!(
            "cd {dir} && javac -J-Xmx384m -encoding UTF-8 -d {dir} Main.java 2>&1",
            dir = WORKDIR
        ));
        let capture = self
            .exec_collect(container_id, cmd, COMPILE_OUTPUT_LIMIT, None)
            .await
            .map_err(classify)?;

        if capture.exit_code != Some(0) {
            let mut diagnostics = capture.stdout.into_string();
            diagnostics.push_str(&capture.stderr.into_string());
            return Ok(CompileOutcome::Failed { diagnostics });
        }

        let mut archive = Vec::new();
        let mut stream = self.docker.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions { path: WORKDIR }),
        );
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.map_err(classify)?);
        }

        Ok(CompileOutcome::Success(CompiledArtifact { archive }))
    }

    fn run_command(input: &str, memory_mb: u64) -> Vec<String> {
        let encoded_input = general_purpose::STANDARD.encode(input);
        // Leave headroom under the container limit for JVM native memory
        let heap_mb = (memory_mb * 3 / 4).max(16);
        shell(format!(
            "printf '%s' '{input}' | base64 -d | java -Xmx{heap}m -XX:+UseSerialGC -XX:TieredStopAtLevel=1 -cp {dir} Main",
            input = encoded_input,
            heap = heap_mb,
            dir = WORKDIR
        ))
    }
}

#[async_trait]
impl Sandbox for DockerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    #[tracing::instrument(skip(self, source_code), fields(request_id = %request_id))]
    async fn compile(
        &self,
        request_id: Uuid,
        source_code: &str,
        deadline: Deadline,
    ) -> Result<CompileOutcome, SandboxError> {
        let started = Instant::now();
        self.ensure_image().await?;

        let guard = self
            .start_container(
                request_id,
                "compile",
                self.settings.compile_memory_mb,
                deadline.remaining(),
            )
            .await?;

        let outcome =
            tokio::time::timeout_at(deadline.instant(), self.compile_in(guard.id(), source_code))
                .await;
        guard.release().await;

        let compile_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(CompileOutcome::Success(artifact))) => {
                info!(compile_ms, artifact_bytes = artifact.archive.len(), "Compilation succeeded");
                Ok(CompileOutcome::Success(artifact))
            }
            Ok(Ok(failed)) => {
                info!(compile_ms, "Compilation failed");
                Ok(failed)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(compile_ms, "Compilation timed out");
                Ok(CompileOutcome::TimedOut { after_ms: compile_ms })
            }
        }
    }

    #[tracing::instrument(
        skip(self, artifact, input, limits),
        fields(request_id = %request_id, timeout_ms = limits.timeout.as_millis() as u64)
    )]
    async fn run_test(
        &self,
        request_id: Uuid,
        test_index: usize,
        artifact: &CompiledArtifact,
        input: &str,
        limits: &RunLimits,
    ) -> Result<RunOutput, SandboxError> {
        let guard = self
            .start_container(
                request_id,
                &format!("t{}", test_index),
                limits.memory_mb,
                limits.timeout,
            )
            .await?;

        let upload_options = UploadToContainerOptions {
            path: "/",
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .upload_to_container(guard.id(), Some(upload_options), artifact.archive.clone().into())
            .await
        {
            guard.release().await;
            return Err(classify(e));
        }

        let cmd = Self::run_command(input, limits.memory_mb);
        let started = Instant::now();
        let result = tokio::time::timeout(
            limits.timeout,
            self.exec_collect(guard.id(), cmd, limits.output_limit_bytes, Some(SANDBOX_USER)),
        )
        .await;
        let elapsed = started.elapsed();

        // Kills anything still running in the container before we report
        guard.release().await;

        match result {
            Err(_) => {
                warn!(execution_ms = elapsed.as_millis() as u64, "Test execution timed out");
                Ok(RunOutput::timed_out_after(elapsed))
            }
            Ok(Err(e)) => Err(classify(e)),
            Ok(Ok(capture)) => {
                let truncated = capture.stdout.is_truncated() || capture.stderr.is_truncated();
                let stdout = capture.stdout.into_string();
                let stderr = capture.stderr.into_string();
                let memory_exceeded = capture.exit_code == Some(OOM_EXIT_CODE)
                    || stderr.contains("java.lang.OutOfMemoryError");

                debug!(
                    execution_ms = elapsed.as_millis() as u64,
                    exit_code = ?capture.exit_code,
                    memory_exceeded,
                    truncated,
                    "Test execution finished"
                );

                Ok(RunOutput {
                    stdout,
                    stderr,
                    execution_ms: elapsed.as_millis() as u64,
                    exit_code: capture.exit_code,
                    timed_out: false,
                    memory_exceeded,
                    truncated,
                    sandbox_error: None,
                    skipped: false,
                })
            }
        }
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_pipes_encoded_input() {
        let cmd = DockerEngine::run_command("5\n", 256);
        assert_eq!(cmd[0], "sh");
        assert_eq!(cmd[1], "-c");
        let encoded = general_purpose::STANDARD.encode("5\n");
        assert!(cmd[2].contains(&encoded));
        assert!(cmd[2].contains("-Xmx192m"));
        assert!(cmd[2].ends_with("-cp /code Main"));
    }

    #[test]
    fn test_run_command_heap_floor() {
        let cmd = DockerEngine::run_command("", 16);
        assert!(cmd[2].contains("-Xmx16m"));
    }

    #[test]
    fn test_classify_server_error_is_operation() {
        let err = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "conflict".to_string(),
        };
        assert!(matches!(classify(err), SandboxError::Operation(_)));
    }
}
