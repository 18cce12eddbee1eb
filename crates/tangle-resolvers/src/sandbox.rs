//! Disposable container sandbox used for native-library discovery.
//!
//! Enrichment resolvers describe themselves with a [`DockerSetup`]; this
//! module turns that into an image (ubuntu:20.04 plus strace plus the
//! ecosystem's runtime) and runs package load probes inside it.

use crate::resolver::{DockerSetup, ResolverError};
use crate::util::{command_exists, run_command};
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{debug, info};

/// Pick the container runtime: docker when present, otherwise rootless
/// podman when its socket is discoverable under `XDG_RUNTIME_DIR`.
#[must_use]
pub fn container_runtime() -> Option<&'static str> {
    if command_exists("docker") {
        return Some("docker");
    }
    if command_exists("podman") && podman_socket().is_some() {
        return Some("podman");
    }
    None
}

fn podman_socket() -> Option<PathBuf> {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")?;
    let socket = PathBuf::from(runtime_dir).join("podman").join("podman.sock");
    socket.exists().then_some(socket)
}

fn render_dockerfile(setup: &DockerSetup) -> String {
    let packages = setup.apt_get_packages.join(" ");
    format!(
        "FROM ubuntu:20.04\n\
         \n\
         RUN mkdir -p /workdir\n\
         \n\
         RUN ln -fs /usr/share/zoneinfo/America/New_York /etc/localtime\n\
         \n\
         RUN DEBIAN_FRONTEND=noninteractive apt-get update && \
         apt-get install -y --no-install-recommends strace {packages}\n\
         \n\
         {post_install}\n\
         \n\
         WORKDIR /workdir\n\
         \n\
         COPY install.sh .\n\
         COPY run.sh .\n\
         COPY baseline.sh .\n\
         RUN chmod +x *.sh\n",
        post_install = setup.post_install,
    )
}

/// A built sandbox image that can run probe commands.
#[derive(Debug)]
pub struct DockerContainer {
    runtime: &'static str,
    image: String,
}

impl DockerContainer {
    /// Build the sandbox image for `name` from its setup scripts.
    pub async fn build(name: &str, setup: &DockerSetup) -> Result<Self, ResolverError> {
        let runtime = container_runtime().ok_or_else(|| ResolverError::NotAvailable {
            reason: "native dependency discovery needs docker or podman".to_string(),
        })?;
        let context = TempDir::new()
            .map_err(|e| ResolverError::failed(format!("failed to create build context: {e}")))?;
        let write = |file: &str, contents: &str| -> Result<(), ResolverError> {
            std::fs::write(context.path().join(file), contents)
                .map_err(|e| ResolverError::failed(format!("failed to write {file}: {e}")))
        };
        write("Dockerfile", &render_dockerfile(setup))?;
        write("install.sh", setup.install_package_script)?;
        write("run.sh", setup.load_package_script)?;
        write("baseline.sh", setup.baseline_script)?;

        let image = format!("tangle-{name}:{}", env!("CARGO_PKG_VERSION"));
        info!(image, runtime, "building sandbox image");
        let context_path = context.path().to_string_lossy().to_string();
        run_command(runtime, &["build", "-t", &image, &context_path], None).await?;
        Ok(Self { runtime, image })
    }

    /// Run a shell command inside the sandbox, capturing stdout.
    pub async fn run(&self, script: &str) -> Result<Vec<u8>, ResolverError> {
        debug!(image = self.image, script, "running in sandbox");
        run_command(
            self.runtime,
            &["run", "--rm", &self.image, "bash", "-c", script],
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dockerfile_includes_scripts_and_packages() {
        let setup = DockerSetup {
            apt_get_packages: vec!["python3", "python3-pip"],
            install_package_script: "#!/usr/bin/env bash\npip3 install $1==$2\n",
            load_package_script: "#!/usr/bin/env bash\npython3 -c \"import $1\"\n",
            baseline_script: "#!/usr/bin/env python3 -c \"\"\n",
            post_install: "",
        };
        let dockerfile = render_dockerfile(&setup);
        assert!(dockerfile.contains("strace python3 python3-pip"));
        assert!(dockerfile.contains("COPY install.sh ."));
        assert!(dockerfile.starts_with("FROM ubuntu:20.04"));
    }
}
